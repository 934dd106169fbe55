//! StatusHA: how safe the current placement of a service's partitions is.
//!
//! Everything in here is a pure function of an [`OwnershipSnapshot`] supplied by whoever distributes
//! partitions amongst members. Nothing is locked and nothing is cached, so computing the same snapshot
//! twice always yields the same [`ServiceHaStatus`].
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::{event, instrument, Level};

use crate::{
    error::{Error, InvalidRequest, Result},
    partitioning::PartitionId,
};

pub mod balance;
pub mod report;

pub use balance::DistributionTarget;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u32);

fn storage_enabled_default() -> bool {
    true
}

/// A cluster member and where it runs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Member {
    pub id: MemberId,
    pub machine: String,
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default = "storage_enabled_default")]
    pub storage_enabled: bool,
}

impl Member {
    pub fn new(id: u32, machine: &str) -> Self {
        Self {
            id: MemberId(id),
            machine: machine.to_string(),
            rack: None,
            site: None,
            storage_enabled: true,
        }
    }

    pub fn with_rack(mut self, rack: &str) -> Self {
        self.rack = Some(rack.to_string());
        self
    }

    pub fn with_site(mut self, site: &str) -> Self {
        self.site = Some(site.to_string());
        self
    }

    /// Safety of keeping two copies of the same partition on `self` and `other`
    fn distance(&self, other: &Member) -> HaStatus {
        if self.site != other.site {
            HaStatus::SiteSafe
        } else if self.rack != other.rack {
            HaStatus::RackSafe
        } else if self.machine != other.machine {
            HaStatus::MachineSafe
        } else {
            HaStatus::NodeSafe
        }
    }
}

/// Who holds the primary and backup copies of a partition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PartitionOwnership {
    pub partition: PartitionId,
    pub primary: Option<MemberId>,
    #[serde(default)]
    pub backups: Vec<MemberId>,
}

/// Current placement of every partition of a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OwnershipSnapshot {
    pub service: String,
    pub partition_count: u32,
    /// Configured number of backups per partition
    pub backup_count: u32,
    pub members: Vec<Member>,
    /// Partitions missing from this list have no owner at all
    pub ownership: Vec<PartitionOwnership>,
}

/// Safety classification, from worst to best. `N/A` is reported when no backups are configured.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    EnumIter,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum HaStatus {
    #[strum(serialize = "N/A")]
    #[serde(rename = "N/A")]
    NotApplicable,
    #[strum(serialize = "ENDANGERED")]
    #[serde(rename = "ENDANGERED")]
    Endangered,
    #[strum(serialize = "NODE-SAFE")]
    #[serde(rename = "NODE-SAFE")]
    NodeSafe,
    #[strum(serialize = "MACHINE-SAFE")]
    #[serde(rename = "MACHINE-SAFE")]
    MachineSafe,
    #[strum(serialize = "RACK-SAFE")]
    #[serde(rename = "RACK-SAFE")]
    RackSafe,
    #[strum(serialize = "SITE-SAFE")]
    #[serde(rename = "SITE-SAFE")]
    SiteSafe,
}

impl HaStatus {
    /// Numeric code as reported by monitoring
    pub fn code(&self) -> i32 {
        match self {
            HaStatus::NotApplicable => -1,
            HaStatus::Endangered => 1,
            HaStatus::NodeSafe => 2,
            HaStatus::MachineSafe => 3,
            HaStatus::RackSafe => 4,
            HaStatus::SiteSafe => 5,
        }
    }

    /// Inverse of [`HaStatus::code`]
    pub fn from_code(code: i32) -> Option<Self> {
        HaStatus::iter().find(|status| status.code() == code)
    }
}

/// StatusHA of a single service
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ServiceHaStatus {
    pub service: String,
    pub storage_count: usize,
    pub status: HaStatus,
    pub partition_count: u32,
    pub backup_count: u32,
    /// partitions with fewer backups than configured
    pub endangered: u32,
    /// partitions with two copies on the same machine (or no backup at all)
    pub vulnerable: u32,
    /// partition copies that still have to move to reach the distribution target
    pub unbalanced: u32,
    pub message: String,
}

impl ServiceHaStatus {
    /// Whether a member can be safely stopped, eg: during a rolling restart.
    ///
    /// An endangered service is only considered safe if the caller allows it, or if losing a member
    /// can't make things worse (single member, no backups configured).
    pub fn is_safe(&self, allow_endangered: bool) -> bool {
        self.status != HaStatus::Endangered
            || allow_endangered
            || self.storage_count <= 1
            || self.backup_count == 0
    }
}

pub(crate) fn invalid_snapshot(reason: String) -> Error {
    Error::InvalidRequest(InvalidRequest::InvalidSnapshot { reason })
}

struct Validated<'a> {
    members: BTreeMap<MemberId, &'a Member>,
    ownership: BTreeMap<PartitionId, &'a PartitionOwnership>,
}

fn validate(snapshot: &OwnershipSnapshot) -> Result<Validated<'_>> {
    if snapshot.partition_count == 0 {
        return Err(invalid_snapshot("partition_count must be greater than 0".to_string()));
    }

    let mut members = BTreeMap::new();
    for member in snapshot.members.iter() {
        if members.insert(member.id, member).is_some() {
            return Err(invalid_snapshot(format!("duplicate member {}", member.id.0)));
        }
    }

    let known_storage_member = |id: &MemberId| -> Result<()> {
        match members.get(id) {
            Some(member) if member.storage_enabled => Ok(()),
            Some(_) => Err(invalid_snapshot(format!(
                "member {} is not storage enabled but owns partitions",
                id.0
            ))),
            None => Err(invalid_snapshot(format!("unknown member {}", id.0))),
        }
    };

    let mut ownership = BTreeMap::new();
    for record in snapshot.ownership.iter() {
        if record.partition >= snapshot.partition_count {
            return Err(invalid_snapshot(format!(
                "partition {} out of range for {} partitions",
                record.partition, snapshot.partition_count
            )));
        }
        if let Some(primary) = record.primary.as_ref() {
            known_storage_member(primary)?;
        }
        for backup in record.backups.iter() {
            known_storage_member(backup)?;
        }
        if ownership.insert(record.partition, record).is_some() {
            return Err(invalid_snapshot(format!(
                "duplicate ownership for partition {}",
                record.partition
            )));
        }
    }

    Ok(Validated { members, ownership })
}

/// Backup members of a partition, deduplicated and never including the primary
pub(crate) fn effective_backups(record: &PartitionOwnership) -> Vec<MemberId> {
    let mut seen = BTreeSet::new();
    record
        .backups
        .iter()
        .filter(|backup| Some(**backup) != record.primary && seen.insert(**backup))
        .copied()
        .collect()
}

fn message(status: HaStatus, unbalanced: u32, vulnerable: u32) -> String {
    if status == HaStatus::Endangered {
        format!("StatusHA is {}", status)
    } else if unbalanced > 0 {
        format!("{} partitions are unbalanced", unbalanced)
    } else if vulnerable > 0 {
        format!("{} partitions are vulnerable", vulnerable)
    } else if status == HaStatus::NotApplicable {
        "No backups configured".to_string()
    } else {
        "Safe".to_string()
    }
}

/// Computes the StatusHA of a service from the placement of its partitions.
///
/// `target` is the distribution the placement is compared against to count unbalanced partitions, see
/// [`DistributionTarget::even`] for the usual one.
#[instrument(level = "debug", skip_all, fields(service = %snapshot.service))]
pub fn compute_status(
    snapshot: &OwnershipSnapshot,
    target: &DistributionTarget,
) -> Result<ServiceHaStatus> {
    let validated = validate(snapshot)?;
    let storage_count = snapshot
        .members
        .iter()
        .filter(|member| member.storage_enabled)
        .count();

    let mut worst = HaStatus::SiteSafe;
    // every record is in range and unique, so this can't underflow
    let unowned = snapshot.partition_count - validated.ownership.len() as u32;
    let mut endangered = unowned;
    let mut vulnerable = unowned;
    if unowned > 0 {
        worst = HaStatus::Endangered;
    }
    for record in validated.ownership.values() {
        let Some(primary) = record.primary else {
            worst = HaStatus::Endangered;
            endangered += 1;
            vulnerable += 1;
            continue;
        };

        let backups = effective_backups(record);
        if (backups.len() as u32) < snapshot.backup_count {
            endangered += 1;
        }
        if backups.is_empty() {
            worst = HaStatus::Endangered;
            vulnerable += 1;
            continue;
        }

        let copies: Vec<&Member> = std::iter::once(primary)
            .chain(backups)
            .filter_map(|id| validated.members.get(&id).copied())
            .collect();
        let mut strength = HaStatus::SiteSafe;
        for (i, a) in copies.iter().enumerate() {
            for b in copies[i + 1..].iter() {
                strength = strength.min(a.distance(b));
            }
        }

        if strength == HaStatus::NodeSafe {
            vulnerable += 1;
        }
        worst = worst.min(strength);
    }

    let status = if storage_count == 0 {
        HaStatus::Endangered
    } else if snapshot.backup_count == 0 {
        vulnerable = 0;
        HaStatus::NotApplicable
    } else {
        worst
    };
    let unbalanced = target.unbalanced(snapshot);

    event!(
        Level::DEBUG,
        "{}: {} (endangered: {}, vulnerable: {}, unbalanced: {})",
        snapshot.service,
        status,
        endangered,
        vulnerable,
        unbalanced
    );

    Ok(ServiceHaStatus {
        service: snapshot.service.clone(),
        storage_count,
        status,
        partition_count: snapshot.partition_count,
        backup_count: snapshot.backup_count,
        endangered,
        vulnerable,
        unbalanced,
        message: message(status, unbalanced, vulnerable),
    })
}
