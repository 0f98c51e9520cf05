//! Subscriber alert conditions and their registration-time baselines.

pub mod dispatch;

pub use dispatch::dispatch;

use crate::error::AlertError;
use crate::models::{AlertCondition, Baselines, Snapshot};
use crate::storage::{KEY_ALARMS, KEY_BASELINES, StateStore};
use crate::utils::{date_key, normalize_date};
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

/// Drops conditions dated before `today`; returns how many were dropped.
pub fn expire_conditions(conditions: &mut Vec<AlertCondition>, today: NaiveDate) -> usize {
    let cutoff = date_key(today);
    let before = conditions.len();
    conditions.retain(|c| c.date >= cutoff);
    before - conditions.len()
}

/// Drops baseline keys dated before `today` and subscribers left without any
/// condition. Returns how many keys were removed.
pub fn prune_baselines(
    baselines: &mut Baselines,
    conditions: &[AlertCondition],
    today: NaiveDate,
) -> usize {
    let cutoff = date_key(today);
    let mut removed = 0;
    baselines.retain(|subscriber, keys| {
        if !conditions.iter().any(|c| &c.subscriber_id == subscriber) {
            removed += keys.len();
            return false;
        }
        let before = keys.len();
        keys.retain(|k| k.date >= cutoff);
        removed += before - keys.len();
        true
    });
    removed
}

pub struct AlertRegistry {
    store: StateStore,
}

impl AlertRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Registers a condition and extends the subscriber's baseline with every
    /// slot in `current`, so only slots opening after now will match.
    pub async fn register(
        &self,
        subscriber_id: &str,
        court_group: &str,
        date: &str,
        today: NaiveDate,
        current: Option<&Snapshot>,
    ) -> Result<AlertCondition, AlertError> {
        let court_group = court_group.trim();
        if court_group.is_empty() {
            return Err(AlertError::EmptyCourtGroup);
        }
        let date = normalize_date(date).ok_or_else(|| AlertError::InvalidDate(date.to_string()))?;
        if date <= date_key(today) {
            return Err(AlertError::DateNotInFuture(date));
        }

        let _guard = self.store.exclusive().await;

        let mut conditions: Vec<AlertCondition> = self.store.load_or_default(KEY_ALARMS);
        if conditions
            .iter()
            .any(|c| c.same_target(subscriber_id, court_group, &date))
        {
            return Err(AlertError::Duplicate {
                court_group: court_group.to_string(),
                date,
            });
        }

        let mut baselines: Baselines = self.store.load_or_default(KEY_BASELINES);
        let baseline = baselines.entry(subscriber_id.to_string()).or_default();
        match current {
            Some(snapshot) => baseline.extend(snapshot.slot_keys()),
            None => warn!(subscriber_id, "no snapshot available, baseline left unchanged"),
        }
        let baseline_size = baseline.len();
        self.store
            .save(KEY_BASELINES, &baselines)
            .map_err(|e| AlertError::Storage(e.to_string()))?;

        let condition = AlertCondition {
            subscriber_id: subscriber_id.to_string(),
            court_group: court_group.to_string(),
            date,
            created_at: Utc::now(),
        };
        conditions.push(condition.clone());
        self.store
            .save(KEY_ALARMS, &conditions)
            .map_err(|e| AlertError::Storage(e.to_string()))?;

        info!(
            subscriber_id,
            court_group = %condition.court_group,
            date = %condition.date,
            baseline_size,
            "alert registered"
        );
        Ok(condition)
    }

    pub async fn remove(
        &self,
        subscriber_id: &str,
        court_group: &str,
        date: &str,
    ) -> Result<(), AlertError> {
        let date = normalize_date(date).ok_or_else(|| AlertError::InvalidDate(date.to_string()))?;

        let _guard = self.store.exclusive().await;
        let mut conditions: Vec<AlertCondition> = self.store.load_or_default(KEY_ALARMS);
        let before = conditions.len();
        conditions.retain(|c| !c.same_target(subscriber_id, court_group, &date));
        if conditions.len() == before {
            return Err(AlertError::NotFound {
                court_group: court_group.to_string(),
                date,
            });
        }
        self.store
            .save(KEY_ALARMS, &conditions)
            .map_err(|e| AlertError::Storage(e.to_string()))?;
        info!(subscriber_id, court_group, date = %date, "alert removed");
        Ok(())
    }

    pub fn list(&self, subscriber_id: Option<&str>) -> Vec<AlertCondition> {
        let conditions: Vec<AlertCondition> = self.store.load_or_default(KEY_ALARMS);
        conditions
            .into_iter()
            .filter(|c| subscriber_id.is_none_or(|s| c.subscriber_id == s))
            .collect()
    }

    /// Expires past conditions and prunes baselines to match. Returns the
    /// number of expired conditions and of dropped baseline keys.
    pub async fn cleanup_expired(&self, today: NaiveDate) -> Result<(usize, usize), AlertError> {
        let _guard = self.store.exclusive().await;
        let mut conditions: Vec<AlertCondition> = self.store.load_or_default(KEY_ALARMS);
        let expired = expire_conditions(&mut conditions, today);
        if expired > 0 {
            self.store
                .save(KEY_ALARMS, &conditions)
                .map_err(|e| AlertError::Storage(e.to_string()))?;
            info!(expired, "expired alerts removed");
        }

        let mut baselines: Baselines = self.store.load_or_default(KEY_BASELINES);
        let subscribers = baselines.len();
        let pruned = prune_baselines(&mut baselines, &conditions, today);
        if pruned > 0 || baselines.len() != subscribers {
            self.store
                .save(KEY_BASELINES, &baselines)
                .map_err(|e| AlertError::Storage(e.to_string()))?;
            info!(pruned, "baselines pruned");
        }
        Ok((expired, pruned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Availability, DateSlots, Facilities, Facility, Slot};

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn snapshot_with(date: &str, time: &str) -> Snapshot {
        let slot = Slot {
            facility_id: "10343".into(),
            date: date.into(),
            time_label: time.into(),
            reservation_ref: None,
        };
        let mut dates = DateSlots::new();
        dates.insert(date.into(), vec![slot]);
        let mut availability = Availability::new();
        availability.insert("10343".into(), dates);
        let mut facilities = Facilities::new();
        facilities.insert(
            "10343".into(),
            Facility {
                id: "10343".into(),
                title: "Pogok Tennis Court".into(),
                location: String::new(),
            },
        );
        Snapshot { facilities, availability, updated_at: Utc::now() }
    }

    #[tokio::test]
    async fn register_validates_and_rejects_duplicates() {
        let store = StateStore::in_memory();
        let registry = AlertRegistry::new(store.clone());
        let today = ymd(2025, 12, 20);

        let c = registry
            .register("U1", "Pogok", "2025-12-22", today, None)
            .await
            .unwrap();
        assert_eq!(c.date, "20251222");

        let dup = registry.register("U1", "Pogok", "20251222", today, None).await;
        assert!(matches!(dup, Err(AlertError::Duplicate { .. })));

        // same group and date for another subscriber is fine
        registry.register("U2", "Pogok", "20251222", today, None).await.unwrap();

        assert_eq!(
            registry.register("U1", "Pogok", "2025-12-20", today, None).await,
            Err(AlertError::DateNotInFuture("20251220".into()))
        );
        assert!(matches!(
            registry.register("U1", "Pogok", "next week", today, None).await,
            Err(AlertError::InvalidDate(_))
        ));
        assert_eq!(
            registry.register("U1", "  ", "20251223", today, None).await,
            Err(AlertError::EmptyCourtGroup)
        );

        assert_eq!(registry.list(None).len(), 2);
        assert_eq!(registry.list(Some("U2")).len(), 1);
    }

    #[tokio::test]
    async fn register_captures_baseline_from_snapshot() {
        let store = StateStore::in_memory();
        let registry = AlertRegistry::new(store.clone());
        let snap = snapshot_with("20251222", "18:00~20:00");

        registry
            .register("U1", "Pogok", "20251222", ymd(2025, 12, 20), Some(&snap))
            .await
            .unwrap();

        let baselines: Baselines = store.load_or_default(KEY_BASELINES);
        assert_eq!(baselines["U1"], snap.slot_keys());
        assert!(!baselines.contains_key("U2"));
    }

    #[tokio::test]
    async fn remove_and_expire() {
        let store = StateStore::in_memory();
        let registry = AlertRegistry::new(store);
        let today = ymd(2025, 12, 20);
        registry.register("U1", "Pogok", "20251221", today, None).await.unwrap();
        registry.register("U1", "Pogok", "20251230", today, None).await.unwrap();

        registry.remove("U1", "Pogok", "2025-12-30").await.unwrap();
        assert!(matches!(
            registry.remove("U1", "Pogok", "2025-12-30").await,
            Err(AlertError::NotFound { .. })
        ));

        assert_eq!(registry.cleanup_expired(ymd(2025, 12, 21)).await.unwrap(), (0, 0));
        assert_eq!(registry.cleanup_expired(ymd(2025, 12, 22)).await.unwrap(), (1, 0));
        assert!(registry.list(None).is_empty());
    }

    #[tokio::test]
    async fn cleanup_prunes_past_keys_and_idle_subscribers() {
        let store = StateStore::in_memory();
        let registry = AlertRegistry::new(store.clone());
        let today = ymd(2025, 12, 20);
        let snap = snapshot_with("20251222", "18:00~20:00");
        registry.register("U1", "Pogok", "20251222", today, Some(&snap)).await.unwrap();
        registry.register("U1", "Pogok", "20251230", today, Some(&snap)).await.unwrap();
        registry.register("U2", "Pogok", "20251222", today, Some(&snap)).await.unwrap();

        let (expired, pruned) = registry.cleanup_expired(ymd(2025, 12, 23)).await.unwrap();

        assert_eq!(expired, 2);
        // U1 loses its past key, U2 has no condition left and goes entirely
        assert_eq!(pruned, 2);
        let baselines: Baselines = store.load_or_default(KEY_BASELINES);
        assert!(baselines["U1"].is_empty());
        assert!(!baselines.contains_key("U2"));
    }

    #[test]
    fn prune_keeps_current_keys_of_active_subscribers() {
        let snap = snapshot_with("20251222", "18:00~20:00");
        let mut baselines = Baselines::new();
        baselines.insert("U1".into(), snap.slot_keys());
        let conditions = vec![AlertCondition {
            subscriber_id: "U1".into(),
            court_group: "Pogok".into(),
            date: "20251222".into(),
            created_at: Utc::now(),
        }];

        assert_eq!(prune_baselines(&mut baselines, &conditions, ymd(2025, 12, 22)), 0);
        assert_eq!(baselines["U1"].len(), 1);
        assert_eq!(prune_baselines(&mut baselines, &[], ymd(2025, 12, 22)), 1);
        assert!(baselines.is_empty());
    }
}
