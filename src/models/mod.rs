use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Facility ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Facility {
    pub id: String,
    pub title: String,
    pub location: String,
}

// ── Slot ──────────────────────────────────────────────────────────────────────

/// One reservable time window. `date` is always `YYYYMMDD`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub facility_id: String,
    pub date: String,
    pub time_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_ref: Option<String>,
}

impl Slot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            facility_id: self.facility_id.clone(),
            date: self.date.clone(),
            time_label: self.time_label.clone(),
        }
    }
}

/// Identity of a slot; `reservation_ref` deliberately excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub facility_id: String,
    pub date: String,
    pub time_label: String,
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// date → slots, sparse: dates without openings are absent.
pub type DateSlots = BTreeMap<String, Vec<Slot>>;

/// facility id → [`DateSlots`]
pub type Availability = BTreeMap<String, DateSlots>;

pub type Facilities = BTreeMap<String, Facility>;

pub type SeenSet = BTreeSet<SlotKey>;

/// subscriber id → slot keys that existed when they registered.
pub type Baselines = BTreeMap<String, BTreeSet<SlotKey>>;

/// Output of one crawl run. Rebuilt wholesale, never patched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub facilities: Facilities,
    pub availability: Availability,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.availability
            .values()
            .flat_map(|dates| dates.values())
            .flatten()
    }

    pub fn slot_count(&self) -> usize {
        self.slots().count()
    }

    pub fn slot_keys(&self) -> BTreeSet<SlotKey> {
        self.slots().map(Slot::key).collect()
    }
}

// ── Alerts ────────────────────────────────────────────────────────────────────

/// A subscriber's standing request. Unique per (subscriber, court group, date).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertCondition {
    pub subscriber_id: String,
    /// Case-sensitive substring of the facility title.
    pub court_group: String,
    /// `YYYYMMDD`
    pub date: String,
    pub created_at: DateTime<Utc>,
}

impl AlertCondition {
    pub fn same_target(&self, subscriber_id: &str, court_group: &str, date: &str) -> bool {
        self.subscriber_id == subscriber_id && self.court_group == court_group && self.date == date
    }
}

/// A slot seen for the first time, with the facility context needed to match
/// and describe it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSlotEvent {
    pub key: SlotKey,
    pub facility_title: String,
    pub location: String,
    pub reservation_ref: Option<String>,
}

// ── Raw scrape rows ───────────────────────────────────────────────────────────

/// One listing entry before cleaning.
#[derive(Debug, Clone, Default)]
pub struct RawFacilityRow {
    pub href: Option<String>,
    pub title: Option<String>,
    pub location: Option<String>,
}

/// One element of the time-table payload's `resveTmList`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTimeSlot {
    #[serde(rename = "timeContent", default)]
    pub time_content: Option<String>,
    #[serde(rename = "resveTmId", default)]
    pub reservation_id: Option<serde_json::Value>,
}
