use crate::models::{AlertCondition, Baselines, NewSlotEvent, SlotKey};
use crate::notify::Notifier;
use crate::utils::{date_key, format_date_label, normalize_date};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub notified: usize,
    pub failures: usize,
}

/// New slots each subscriber should hear about, keyed by subscriber.
///
/// A slot matches a condition when the dates agree and the condition's court
/// group is a case-sensitive substring of the facility title. Conditions dated
/// before `today` are ignored, as are slots in the subscriber's baseline. A slot
/// matched by several conditions of one subscriber appears once. Each
/// subscriber's slots are ordered by date, facility, then time.
pub fn match_alerts<'a>(
    events: &'a [NewSlotEvent],
    conditions: &[AlertCondition],
    baselines: &Baselines,
    today: NaiveDate,
) -> BTreeMap<String, Vec<&'a NewSlotEvent>> {
    let cutoff = date_key(today);
    let mut matched: BTreeMap<String, BTreeMap<&SlotKey, &NewSlotEvent>> = BTreeMap::new();

    for condition in conditions {
        let Some(date) = normalize_date(&condition.date) else {
            debug!(date = %condition.date, "skipping condition with unreadable date");
            continue;
        };
        if date < cutoff {
            continue;
        }
        let baseline = baselines.get(&condition.subscriber_id);

        for event in events {
            if event.key.date != date || !event.facility_title.contains(&condition.court_group) {
                continue;
            }
            if baseline.is_some_and(|b| b.contains(&event.key)) {
                continue;
            }
            matched
                .entry(condition.subscriber_id.clone())
                .or_default()
                .insert(&event.key, event);
        }
    }

    matched
        .into_iter()
        .map(|(subscriber, by_key)| {
            let mut slots: Vec<_> = by_key.into_values().collect();
            slots.sort_by(|a, b| {
                (&a.key.date, &a.key.facility_id, &a.key.time_label)
                    .cmp(&(&b.key.date, &b.key.facility_id, &b.key.time_label))
            });
            (subscriber, slots)
        })
        .collect()
}

/// Title and body of one subscriber's aggregated message.
pub fn compose_message(slots: &[&NewSlotEvent]) -> (String, String) {
    let title = format!("새로운 예약 가능 시간 {}건", slots.len());
    let body = slots
        .iter()
        .map(|e| {
            let place = if e.location.is_empty() {
                e.facility_title.clone()
            } else {
                format!("{} ({})", e.facility_title, e.location)
            };
            format!("{} · {} {}", place, format_date_label(&e.key.date), e.key.time_label)
        })
        .collect::<Vec<_>>()
        .join("\n");
    (title, body)
}

/// Sends one aggregated message per matched subscriber. A failed delivery is
/// logged and counted; the remaining subscribers are still notified.
pub async fn dispatch(
    events: &[NewSlotEvent],
    conditions: &[AlertCondition],
    baselines: &Baselines,
    notifier: &dyn Notifier,
    today: NaiveDate,
) -> DispatchReport {
    let mut report = DispatchReport::default();
    if events.is_empty() {
        return report;
    }

    for (subscriber, slots) in match_alerts(events, conditions, baselines, today) {
        let (title, body) = compose_message(&slots);
        match notifier.notify(&subscriber, &title, &body).await {
            Ok(()) => {
                info!(subscriber = %subscriber, slots = slots.len(), "subscriber notified");
                report.notified += 1;
            }
            Err(e) => {
                error!(subscriber = %subscriber, error = %e, "notification failed");
                report.failures += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::recording::RecordingNotifier;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    fn event(facility: &str, title: &str, date: &str, time: &str) -> NewSlotEvent {
        NewSlotEvent {
            key: SlotKey {
                facility_id: facility.into(),
                date: date.into(),
                time_label: time.into(),
            },
            facility_title: title.into(),
            location: String::new(),
            reservation_ref: None,
        }
    }

    fn condition(subscriber: &str, group: &str, date: &str) -> AlertCondition {
        AlertCondition {
            subscriber_id: subscriber.into(),
            court_group: group.into(),
            date: date.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn matches_on_date_and_title_substring() {
        let events = vec![
            event("1", "Pogok Tennis Court", "20250115", "18:00~20:00"),
            event("1", "Pogok Tennis Court", "20250116", "18:00~20:00"),
            event("2", "pogok annex", "20250115", "18:00~20:00"),
        ];
        let conds = vec![condition("U1", "Pogok", "20250115")];

        let matched = match_alerts(&events, &conds, &Baselines::new(), today());

        assert_eq!(matched.len(), 1);
        let slots = &matched["U1"];
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].key.date, "20250115");
        assert_eq!(slots[0].key.facility_id, "1");
    }

    #[test]
    fn dashed_condition_dates_still_match() {
        let events = vec![event("1", "Pogok Tennis Court", "20250115", "t")];
        let conds = vec![condition("U1", "Pogok", "2025-01-15")];
        assert_eq!(match_alerts(&events, &conds, &Baselines::new(), today()).len(), 1);
    }

    #[test]
    fn expired_conditions_never_match() {
        let events = vec![event("1", "Pogok Tennis Court", "20250109", "t")];
        let conds = vec![condition("U1", "Pogok", "20250109")];
        assert!(match_alerts(&events, &conds, &Baselines::new(), today()).is_empty());
    }

    #[test]
    fn baseline_suppresses_only_its_owner() {
        let e = event("1", "Pogok Tennis Court", "20250115", "18:00~20:00");
        let events = vec![e.clone()];
        let conds = vec![
            condition("U1", "Pogok", "20250115"),
            condition("U2", "Pogok", "20250115"),
        ];
        let mut baselines = Baselines::new();
        baselines.insert("U1".into(), BTreeSet::from([e.key.clone()]));

        let matched = match_alerts(&events, &conds, &baselines, today());

        assert!(!matched.contains_key("U1"));
        assert_eq!(matched["U2"].len(), 1);
    }

    #[test]
    fn slots_ordered_by_date_then_facility() {
        let events = vec![
            event("2", "Suji Tennis", "20250115", "06:00~08:00"),
            event("1", "Pogok Tennis", "20250116", "06:00~08:00"),
            event("1", "Pogok Tennis", "20250115", "18:00~20:00"),
        ];
        let conds = vec![
            condition("U1", "Tennis", "20250115"),
            condition("U1", "Tennis", "20250116"),
        ];

        let matched = match_alerts(&events, &conds, &Baselines::new(), today());

        let order: Vec<(&str, &str)> = matched["U1"]
            .iter()
            .map(|e| (e.key.date.as_str(), e.key.facility_id.as_str()))
            .collect();
        assert_eq!(order, vec![("20250115", "1"), ("20250115", "2"), ("20250116", "1")]);
    }

    #[tokio::test]
    async fn overlapping_conditions_notify_once() {
        let events = vec![event("1", "Pogok Tennis Court", "20250115", "18:00~20:00")];
        let conds = vec![
            condition("U1", "Pogok", "20250115"),
            condition("U1", "Tennis", "20250115"),
        ];
        let notifier = RecordingNotifier::default();

        let report = dispatch(&events, &conds, &Baselines::new(), &notifier, today()).await;

        assert_eq!(report, DispatchReport { notified: 1, failures: 0 });
        let calls = notifier.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "U1");
        assert_eq!(calls[0].2.lines().count(), 1);
        assert!(calls[0].2.contains("1월 15일 (수) 18:00~20:00"));
    }

    #[tokio::test]
    async fn failed_delivery_does_not_stop_others() {
        let events = vec![event("1", "Pogok Tennis Court", "20250115", "t")];
        let conds = vec![
            condition("A", "Pogok", "20250115"),
            condition("B", "Pogok", "20250115"),
        ];
        let notifier = RecordingNotifier {
            fail_for: vec!["A".into()],
            ..Default::default()
        };

        let report = dispatch(&events, &conds, &Baselines::new(), &notifier, today()).await;

        assert_eq!(report, DispatchReport { notified: 1, failures: 1 });
        assert_eq!(notifier.calls().len(), 2);
    }
}
