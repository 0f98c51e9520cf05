use super::ReservationSource;
use super::cleaner::clean_time_slots;
use super::parsers::parse_time_table;
use crate::models::{DateSlots, Slot};
use crate::utils::{availability_window, date_key};
use chrono::NaiveDate;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Slots of one facility on one date. Any failure reads as "no openings".
async fn fetch_day<S>(source: &S, facility_id: &str, date: &str) -> Vec<Slot>
where
    S: ReservationSource + ?Sized,
{
    let body = match source.fetch_time_table(facility_id, date).await {
        Ok(body) => body,
        Err(e) => {
            warn!(facility_id, date, error = %e, "time table fetch failed");
            return vec![];
        }
    };
    match parse_time_table(&body) {
        Ok(raw) => clean_time_slots(facility_id, date, raw),
        Err(e) => {
            warn!(facility_id, date, error = %e, "time table unreadable");
            vec![]
        }
    }
}

/// Open slots of `facility_id` for every date from `today` through the end of
/// next month. One request per date, all in flight together; dates without
/// openings are left out of the result.
pub async fn fetch_availability<S>(source: Arc<S>, facility_id: &str, today: NaiveDate) -> DateSlots
where
    S: ReservationSource + ?Sized,
{
    let mut tasks = JoinSet::new();
    for date in availability_window(today) {
        let source = Arc::clone(&source);
        let facility_id = facility_id.to_string();
        let date = date_key(date);
        tasks.spawn(async move {
            let slots = fetch_day(&*source, &facility_id, &date).await;
            (date, slots)
        });
    }

    let mut by_date = DateSlots::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((date, slots)) if !slots.is_empty() => {
                by_date.insert(date, slots);
            }
            Ok(_) => {}
            Err(e) => warn!(facility_id, error = %e, "date task failed"),
        }
    }

    debug!(facility_id, dates = by_date.len(), "availability fetched");
    by_date
}
