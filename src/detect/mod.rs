//! Change detection: which slots in a fresh snapshot have never been seen.

use crate::models::{NewSlotEvent, SeenSet, Snapshot};
use crate::utils::date_key;
use chrono::NaiveDate;
use tracing::{debug, info};

/// Compares `snapshot` against `seen` and returns one event per slot key not
/// already in it. Every key in the snapshot ends up in `seen`, new or not.
///
/// Baselines are not consulted here; they are per subscriber and applied when
/// matching alerts, so a slot suppressed for one subscriber can still reach
/// another.
pub fn detect_new(snapshot: &Snapshot, seen: &mut SeenSet) -> Vec<NewSlotEvent> {
    let mut events = Vec::new();

    for slot in snapshot.slots() {
        let key = slot.key();
        if !seen.insert(key.clone()) {
            continue;
        }

        let facility = snapshot.facilities.get(&slot.facility_id);
        events.push(NewSlotEvent {
            key,
            facility_title: facility.map(|f| f.title.clone()).unwrap_or_default(),
            location: facility.map(|f| f.location.clone()).unwrap_or_default(),
            reservation_ref: slot.reservation_ref.clone(),
        });
    }

    info!(
        new = events.len(),
        total = snapshot.slot_count(),
        seen = seen.len(),
        "change detection done"
    );
    events
}

/// Drops keys dated before `today`. Returns how many were removed.
pub fn prune_seen(seen: &mut SeenSet, today: NaiveDate) -> usize {
    let cutoff = date_key(today);
    let before = seen.len();
    seen.retain(|k| k.date >= cutoff);
    let removed = before - seen.len();
    if removed > 0 {
        debug!(removed, "pruned expired seen-set keys");
    }
    removed
}
