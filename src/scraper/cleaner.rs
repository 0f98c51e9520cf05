use crate::models::{Facility, RawFacilityRow, RawTimeSlot, Slot};
use std::collections::HashSet;
use tracing::debug;
use url::Url;

// ── Facilities ────────────────────────────────────────────────────────────────

/// `resveId` query parameter of a reservation-detail link, resolved against
/// `base_url` so relative hrefs work.
pub fn facility_id_from_href(href: &str, base_url: &str) -> Option<String> {
    let url = Url::parse(base_url).ok()?.join(href).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "resveId")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn clean_facility_rows(rows: Vec<RawFacilityRow>, base_url: &str) -> Vec<Facility> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row
                .href
                .as_deref()
                .and_then(|h| facility_id_from_href(h, base_url));
            let title = non_empty(row.title.as_deref());

            match (id, title) {
                (Some(id), Some(title)) => Some(Facility {
                    id,
                    title,
                    location: non_empty(row.location.as_deref()).unwrap_or_default(),
                }),
                (id, title) => {
                    debug!(?id, ?title, "skipping listing entry without id or title");
                    None
                }
            }
        })
        .collect()
}

/// Empty keyword accepts everything.
pub fn matches_category(facility: &Facility, keyword: &str) -> bool {
    keyword.is_empty() || facility.title.contains(keyword)
}

// ── Slots ─────────────────────────────────────────────────────────────────────

fn reservation_ref(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => non_empty(Some(s.as_str())),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Entries without a time label are dropped; repeated labels on one date
/// collapse to the first occurrence so slot keys stay unique.
pub fn clean_time_slots(facility_id: &str, date: &str, raw: Vec<RawTimeSlot>) -> Vec<Slot> {
    let mut labels = HashSet::new();
    raw.into_iter()
        .filter_map(|r| {
            let time_label = non_empty(r.time_content.as_deref())?;
            if !labels.insert(time_label.clone()) {
                return None;
            }
            Some(Slot {
                facility_id: facility_id.to_string(),
                date: date.to_string(),
                time_label,
                reservation_ref: r.reservation_id.as_ref().and_then(reservation_ref),
            })
        })
        .collect()
}
