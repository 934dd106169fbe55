//! Distribution targets and how far a placement is from them.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{effective_backups, invalid_snapshot, MemberId, OwnershipSnapshot};
use crate::error::Result;

/// Number of primary and backup copies each member is expected to hold.
///
/// Members missing from the target are expected to hold nothing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DistributionTarget {
    pub primaries: BTreeMap<MemberId, u32>,
    pub backups: BTreeMap<MemberId, u32>,
}

/// Splits `copies` as evenly as possible, the remainder going to the lowest member ids
fn fair_share(copies: u32, members: &[MemberId]) -> BTreeMap<MemberId, u32> {
    let n = members.len() as u32;
    if n == 0 {
        return BTreeMap::new();
    }

    let (share, remainder) = (copies / n, copies % n);
    members
        .iter()
        .enumerate()
        .map(|(i, member)| (*member, share + u32::from((i as u32) < remainder)))
        .collect()
}

impl DistributionTarget {
    /// Even distribution across the storage enabled members of the snapshot.
    ///
    /// Each partition gets at most one copy per member, so the number of backups a partition can have is
    /// bounded by the number of other members. Fails if the total number of backup copies doesn't fit
    /// a `u32`.
    pub fn even(snapshot: &OwnershipSnapshot) -> Result<Self> {
        let mut members: Vec<MemberId> = snapshot
            .members
            .iter()
            .filter(|member| member.storage_enabled)
            .map(|member| member.id)
            .collect();
        members.sort();
        members.dedup();

        let backups_per_partition = snapshot
            .backup_count
            .min((members.len() as u32).saturating_sub(1));

        let backup_copies = snapshot
            .partition_count
            .checked_mul(backups_per_partition)
            .ok_or_else(|| {
                invalid_snapshot(format!(
                    "{} partitions with {} backups each is too many copies",
                    snapshot.partition_count, backups_per_partition
                ))
            })?;

        Ok(Self {
            primaries: fair_share(snapshot.partition_count, &members),
            backups: fair_share(backup_copies, &members),
        })
    }

    /// Number of copies (primary and backup) that have to move for `snapshot` to match this target
    pub fn unbalanced(&self, snapshot: &OwnershipSnapshot) -> u32 {
        let mut primaries: BTreeMap<MemberId, u32> = BTreeMap::new();
        let mut backups: BTreeMap<MemberId, u32> = BTreeMap::new();
        for record in snapshot.ownership.iter() {
            if let Some(primary) = record.primary {
                *primaries.entry(primary).or_default() += 1;
            }
            for backup in effective_backups(record) {
                *backups.entry(backup).or_default() += 1;
            }
        }

        let excess = |actual: &BTreeMap<MemberId, u32>, target: &BTreeMap<MemberId, u32>| -> u32 {
            actual
                .iter()
                .map(|(member, count)| {
                    count.saturating_sub(target.get(member).copied().unwrap_or_default())
                })
                .sum()
        };

        excess(&primaries, &self.primaries).saturating_add(excess(&backups, &self.backups))
    }
}
