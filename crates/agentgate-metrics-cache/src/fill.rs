//! Gap filling for the DAU series

use agentgate_proto::DauEntry;
use chrono::Duration;

/// Insert zero-count entries for calendar days missing between rows
///
/// Rows must be sorted by date. The first row is always kept as-is and a
/// synthesized day copies the preceding entry with its count zeroed.
pub fn fill_empty_dau_days(rows: &[DauEntry]) -> Vec<DauEntry> {
    let day = Duration::days(1);
    let mut filled = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            let mut last = rows[i - 1].clone();
            let mut diff = row.date - last.date;
            while diff > day {
                last.date += day;
                last.daus = 0;
                filled.push(last.clone());
                diff -= day;
            }
        }
        filled.push(row.clone());
    }

    filled
}
