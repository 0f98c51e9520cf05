use chrono::{Datelike, FixedOffset, NaiveDate, Offset, Utc};
use std::time::Instant;
use tracing::info;

/// A simple wall-clock timer for logging elapsed time.
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        info!("⏱  Starting: {}", label);
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        info!(
            "⏱  Finished: {} (took {:.2?})",
            self.label,
            self.start.elapsed()
        );
    }
}

// ── Dates ─────────────────────────────────────────────────────────────────────

/// Calendar date at the reservation site, `offset_hours` east of UTC.
pub fn today(offset_hours: i32) -> NaiveDate {
    let offset = FixedOffset::east_opt(offset_hours * 3600).unwrap_or_else(|| Utc.fix());
    Utc::now().with_timezone(&offset).date_naive()
}

/// Last day of the calendar month following `date`'s month.
pub fn end_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = (date.year(), date.month());
    // first day of the month after next, minus one day
    let (y, m) = match month {
        11 => (year + 1, 1),
        12 => (year + 1, 2),
        _ => (year, month + 2),
    };
    NaiveDate::from_ymd_opt(y, m, 1)
        .and_then(|d| d.pred_opt())
        .unwrap_or(NaiveDate::MAX)
}

/// Every date from `today` through the end of next month, inclusive.
pub fn availability_window(today: NaiveDate) -> Vec<NaiveDate> {
    let end = end_of_next_month(today);
    today.iter_days().take_while(|d| *d <= end).collect()
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

pub fn parse_date_key(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y%m%d").ok()
}

/// `YYYY-MM-DD` or `YYYYMMDD` → `YYYYMMDD`. Anything else is rejected.
pub fn normalize_date(s: &str) -> Option<String> {
    let s = s.trim();
    let date = match s.len() {
        8 if s.chars().all(|c| c.is_ascii_digit()) => parse_date_key(s)?,
        10 => NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?,
        _ => return None,
    };
    Some(date_key(date))
}

/// `20251222` → `12월 22일 (월)`. Unparseable keys are returned unchanged.
pub fn format_date_label(key: &str) -> String {
    const WEEKDAYS: [&str; 7] = ["월", "화", "수", "목", "금", "토", "일"];
    match parse_date_key(key) {
        Some(d) => format!(
            "{}월 {}일 ({})",
            d.month(),
            d.day(),
            WEEKDAYS[d.weekday().num_days_from_monday() as usize]
        ),
        None => key.to_string(),
    }
}
