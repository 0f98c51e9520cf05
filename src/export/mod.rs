//! CSV export of a snapshot: one row per open slot.

use crate::models::Snapshot;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use tracing::info;

const HEADER: [&str; 6] = ["facility_id", "title", "location", "date", "time", "reservation_ref"];

pub fn write_csv<W: Write>(snapshot: &Snapshot, out: W) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(HEADER)?;

    let mut rows = 0usize;
    for slot in snapshot.slots() {
        let (title, location) = snapshot
            .facilities
            .get(&slot.facility_id)
            .map(|f| (f.title.as_str(), f.location.as_str()))
            .unwrap_or_default();

        writer.write_record([
            slot.facility_id.as_str(),
            title,
            location,
            slot.date.as_str(),
            slot.time_label.as_str(),
            slot.reservation_ref.as_deref().unwrap_or(""),
        ])?;
        rows += 1;
    }
    writer.flush()?;
    Ok(rows)
}

pub fn export_to_file(snapshot: &Snapshot, path: &Path) -> Result<usize> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Could not create {:?}", path))?;
    let rows = write_csv(snapshot, file)?;
    info!("{} slots written to {:?}", rows, path);
    Ok(rows)
}
