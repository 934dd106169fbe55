//! Plain text rendering of StatusHA, one row per service.
use super::ServiceHaStatus;

const HEADERS: [&str; 9] = [
    "Date/Time",
    "Service Name",
    "Storage Count",
    "StatusHA",
    "Partitions",
    "Endangered",
    "Vulnerable",
    "Unbalanced",
    "Status",
];

fn row(timestamp: &str, status: &ServiceHaStatus) -> [String; 9] {
    [
        timestamp.to_string(),
        status.service.clone(),
        status.storage_count.to_string(),
        status.status.to_string(),
        status.partition_count.to_string(),
        status.endangered.to_string(),
        status.vulnerable.to_string(),
        status.unbalanced.to_string(),
        status.message.clone(),
    ]
}

/// Renders a left aligned table with a header line, a separator line and one line per service.
///
/// Every row is stamped with the same `timestamp`, formatted by the caller.
pub fn render_table(timestamp: &str, statuses: &[ServiceHaStatus]) -> String {
    let rows: Vec<[String; 9]> = statuses.iter().map(|s| row(timestamp, s)).collect();

    let mut widths = HEADERS.map(str::len);
    for row in rows.iter() {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(" ")
            .trim_end()
            .to_string()
    };

    let mut out = Vec::with_capacity(rows.len() + 2);
    out.push(line(HEADERS.to_vec()));
    let separators: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push(line(separators.iter().map(String::as_str).collect()));
    for row in rows.iter() {
        out.push(line(row.iter().map(String::as_str).collect()));
    }

    out.join("\n")
}
