//! Fixed-capacity pool of live market-data subscriptions.
//!
//! Priorities: 1 = held position, 2 = watchlist, 3 = opportunistic.
//! Admission on a full pool evicts the oldest priority-3 slot; priority 1
//! and 2 slots are never evicted by admission. Priority-1 slots leave only
//! through `unsubscribe` or `sync_priority1` when the position closes.
//!
//! All mutations go through one mutex so live ticks, fill notifications and
//! scanner discoveries can call in from any task; readers get a copy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::collab::MarketFeed;
use crate::logging::{log, log_slot_change, log_slot_exhausted, obj, v_num, v_str, Domain, Level};
use crate::market::StreamKind;

pub const PRIORITY_HELD: u8 = 1;
pub const PRIORITY_WATCHLIST: u8 = 2;
pub const PRIORITY_OPPORTUNISTIC: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSlot {
    pub instrument_id: String,
    pub stream_kind: StreamKind,
    pub priority: u8,
    pub subscribed_at: u64,
    pub last_data_at: u64,
}

type SlotKey = (String, StreamKind);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Priority-3 instrument whose slot was taken to make room
    pub evicted: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Held instruments left without a slot
    pub missing: Vec<String>,
    pub evicted: Vec<String>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: BTreeMap<SlotKey, SubscriptionSlot>,
}

impl SlotTable {
    /// Oldest priority-3 slot; ties on `subscribed_at` break by key order.
    fn eviction_victim(&self) -> Option<SlotKey> {
        self.slots
            .values()
            .filter(|s| s.priority == PRIORITY_OPPORTUNISTIC)
            .min_by(|a, b| {
                a.subscribed_at
                    .cmp(&b.subscribed_at)
                    .then_with(|| a.instrument_id.cmp(&b.instrument_id))
                    .then_with(|| a.stream_kind.cmp(&b.stream_kind))
            })
            .map(|s| (s.instrument_id.clone(), s.stream_kind))
    }
}

pub struct SlotManager {
    capacity: usize,
    feed: Arc<dyn MarketFeed>,
    table: Mutex<SlotTable>,
}

impl SlotManager {
    pub fn new(capacity: usize, feed: Arc<dyn MarketFeed>) -> Self {
        Self { capacity, feed, table: Mutex::new(SlotTable::default()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a subscription. Returns false when the pool is full and no
    /// priority-3 slot can be evicted, or the transport refused it.
    pub fn subscribe(&self, instrument_id: &str, kind: StreamKind, priority: u8, now: u64) -> bool {
        self.admit(instrument_id, kind, priority, now).admitted
    }

    /// `subscribe`, also reporting which instrument lost its slot to make room.
    pub fn admit(&self, instrument_id: &str, kind: StreamKind, priority: u8, now: u64) -> Admission {
        let priority = priority.clamp(PRIORITY_HELD, PRIORITY_OPPORTUNISTIC);
        let mut table = self.lock();
        let key = (instrument_id.to_string(), kind);
        let mut evicted = None;

        if let Some(existing) = table.slots.get_mut(&key) {
            if priority < existing.priority {
                existing.priority = priority;
                let live = table.slots.len();
                log_slot_change("slot_upgraded", instrument_id, kind.as_str(), priority, live);
            }
            return Admission { admitted: true, evicted };
        }

        if table.slots.len() >= self.capacity {
            let Some(victim) = table.eviction_victim() else {
                if priority == PRIORITY_HELD {
                    log_slot_exhausted(instrument_id, priority, self.capacity);
                } else {
                    log_slot_change("slot_rejected", instrument_id, kind.as_str(), priority, table.slots.len());
                }
                return Admission { admitted: false, evicted };
            };
            if let Err(err) = self.feed.unsubscribe(&victim.0, victim.1) {
                log(
                    Level::Warn,
                    Domain::Slots,
                    "feed_unsubscribe_failed",
                    obj(&[("instrument_id", v_str(&victim.0)), ("msg", v_str(&format!("{:#}", err)))]),
                );
            }
            table.slots.remove(&victim);
            log_slot_change("slot_evicted", &victim.0, victim.1.as_str(), PRIORITY_OPPORTUNISTIC, table.slots.len());
            evicted = Some(victim.0);
        }

        if let Err(err) = self.feed.subscribe(instrument_id, kind) {
            log(
                Level::Warn,
                Domain::Slots,
                "feed_subscribe_failed",
                obj(&[("instrument_id", v_str(instrument_id)), ("msg", v_str(&format!("{:#}", err)))]),
            );
            return Admission { admitted: false, evicted };
        }

        table.slots.insert(
            key,
            SubscriptionSlot {
                instrument_id: instrument_id.to_string(),
                stream_kind: kind,
                priority,
                subscribed_at: now,
                last_data_at: now,
            },
        );
        log_slot_change("slot_admitted", instrument_id, kind.as_str(), priority, table.slots.len());
        Admission { admitted: true, evicted }
    }

    /// Release every stream of an instrument.
    pub fn unsubscribe(&self, instrument_id: &str) {
        let mut table = self.lock();
        let keys: Vec<SlotKey> = table
            .slots
            .keys()
            .filter(|(id, _)| id == instrument_id)
            .cloned()
            .collect();
        for key in keys {
            if let Err(err) = self.feed.unsubscribe(&key.0, key.1) {
                log(
                    Level::Warn,
                    Domain::Slots,
                    "feed_unsubscribe_failed",
                    obj(&[("instrument_id", v_str(&key.0)), ("msg", v_str(&format!("{:#}", err)))]),
                );
            }
            if let Some(slot) = table.slots.remove(&key) {
                log_slot_change("slot_released", &key.0, key.1.as_str(), slot.priority, table.slots.len());
            }
        }
    }

    /// Align priority-1 slots with the set of held instruments.
    pub fn sync_priority1(&self, held_ids: &HashSet<String>, now: u64) -> SyncReport {
        let stale: Vec<String> = {
            let table = self.lock();
            let mut ids: Vec<String> = table
                .slots
                .values()
                .filter(|s| s.priority == PRIORITY_HELD && !held_ids.contains(&s.instrument_id))
                .map(|s| s.instrument_id.clone())
                .collect();
            ids.dedup();
            ids
        };
        for id in &stale {
            self.unsubscribe(id);
        }

        let mut report = SyncReport::default();
        let mut held: Vec<&String> = held_ids.iter().collect();
        held.sort();
        for id in held {
            let admission = self.admit(id, StreamKind::Trade, PRIORITY_HELD, now);
            if !admission.admitted {
                report.missing.push(id.clone());
            }
            report.evicted.extend(admission.evicted);
        }
        report
    }

    /// Record inbound data on a slot. Unknown slots are ignored.
    pub fn touch(&self, instrument_id: &str, kind: StreamKind, ts: u64) -> bool {
        let mut table = self.lock();
        match table.slots.get_mut(&(instrument_id.to_string(), kind)) {
            Some(slot) => {
                slot.last_data_at = slot.last_data_at.max(ts);
                true
            }
            None => false,
        }
    }

    /// Transport reconnected: replay every held slot as-is.
    pub fn resubscribe_all(&self) -> usize {
        let table = self.lock();
        let mut ok = 0;
        for slot in table.slots.values() {
            match self.feed.subscribe(&slot.instrument_id, slot.stream_kind) {
                Ok(()) => ok += 1,
                Err(err) => log(
                    Level::Error,
                    Domain::Slots,
                    "resubscribe_failed",
                    obj(&[
                        ("instrument_id", v_str(&slot.instrument_id)),
                        ("stream", v_str(slot.stream_kind.as_str())),
                        ("msg", v_str(&format!("{:#}", err))),
                    ]),
                ),
            }
        }
        log(
            Level::Info,
            Domain::Slots,
            "resubscribed",
            obj(&[("count", v_num(ok as f64)), ("total", v_num(table.slots.len() as f64))]),
        );
        ok
    }

    /// Slots silent for longer than `max_silence_secs`.
    pub fn stale_slots(&self, now: u64, max_silence_secs: u64) -> Vec<SubscriptionSlot> {
        self.lock()
            .slots
            .values()
            .filter(|s| now.saturating_sub(s.last_data_at) > max_silence_secs)
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionSlot> {
        self.lock().slots.values().cloned().collect()
    }

    pub fn priority_of(&self, instrument_id: &str) -> Option<u8> {
        self.lock()
            .slots
            .values()
            .filter(|s| s.instrument_id == instrument_id)
            .map(|s| s.priority)
            .min()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Default)]
    pub(crate) struct RecordingFeed {
        pub calls: Mutex<Vec<(String, String, StreamKind)>>,
        pub fail_subscribe: Mutex<HashSet<String>>,
    }

    impl MarketFeed for RecordingFeed {
        fn subscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()> {
            if self.fail_subscribe.lock().unwrap().contains(instrument_id) {
                return Err(anyhow!("transport refused"));
            }
            self.calls.lock().unwrap().push(("sub".into(), instrument_id.into(), kind));
            Ok(())
        }

        fn unsubscribe(&self, instrument_id: &str, kind: StreamKind) -> Result<()> {
            self.calls.lock().unwrap().push(("unsub".into(), instrument_id.into(), kind));
            Ok(())
        }
    }

    fn manager(capacity: usize) -> (SlotManager, Arc<RecordingFeed>) {
        let feed = Arc::new(RecordingFeed::default());
        (SlotManager::new(capacity, feed.clone()), feed)
    }

    #[test]
    fn test_admits_until_capacity() {
        let (m, _) = manager(3);
        assert!(m.subscribe("A", StreamKind::Trade, 2, 1));
        assert!(m.subscribe("B", StreamKind::Trade, 2, 2));
        assert!(m.subscribe("C", StreamKind::Trade, 2, 3));
        assert!(!m.subscribe("D", StreamKind::Trade, 2, 4));
        assert_eq!(m.len(), 3);
    }

    #[test]
    fn test_evicts_oldest_opportunistic() {
        let (m, feed) = manager(3);
        m.subscribe("W", StreamKind::Trade, 2, 1);
        m.subscribe("OLD", StreamKind::Trade, 3, 2);
        m.subscribe("NEW", StreamKind::Trade, 3, 3);
        assert!(m.subscribe("H", StreamKind::Trade, 1, 4));
        let ids: Vec<String> = m.snapshot().into_iter().map(|s| s.instrument_id).collect();
        assert!(ids.contains(&"NEW".to_string()));
        assert!(!ids.contains(&"OLD".to_string()));
        assert!(feed
            .calls
            .lock()
            .unwrap()
            .contains(&("unsub".to_string(), "OLD".to_string(), StreamKind::Trade)));
    }

    #[test]
    fn test_admission_reports_evicted_instrument() {
        let (m, _) = manager(1);
        let first = m.admit("A", StreamKind::Trade, 3, 1);
        assert_eq!(first, Admission { admitted: true, evicted: None });
        let second = m.admit("B", StreamKind::Trade, 3, 2);
        assert_eq!(second, Admission { admitted: true, evicted: Some("A".to_string()) });
        assert_eq!(m.priority_of("A"), None);

        let held: HashSet<String> = ["H".to_string()].into_iter().collect();
        let report = m.sync_priority1(&held, 3);
        assert!(report.missing.is_empty());
        assert_eq!(report.evicted, vec!["B".to_string()]);
    }

    #[test]
    fn test_tie_breaks_by_instrument_id() {
        let (m, _) = manager(2);
        m.subscribe("Z", StreamKind::Trade, 3, 5);
        m.subscribe("M", StreamKind::Trade, 3, 5);
        assert!(m.subscribe("N", StreamKind::Trade, 3, 6));
        let ids: Vec<String> = m.snapshot().into_iter().map(|s| s.instrument_id).collect();
        assert_eq!(ids, vec!["N".to_string(), "Z".to_string()]);
    }

    #[test]
    fn test_priority1_never_evicts_watchlist() {
        let (m, _) = manager(2);
        m.subscribe("W1", StreamKind::Trade, 2, 1);
        m.subscribe("W2", StreamKind::Quote, 2, 2);
        assert!(!m.subscribe("H", StreamKind::Trade, 1, 3));
        assert_eq!(m.priority_of("W1"), Some(2));
        assert_eq!(m.priority_of("W2"), Some(2));
        assert_eq!(m.priority_of("H"), None);
    }

    #[test]
    fn test_resubscribe_upgrades_priority() {
        let (m, _) = manager(2);
        m.subscribe("A", StreamKind::Trade, 3, 1);
        assert!(m.subscribe("A", StreamKind::Trade, 1, 2));
        assert_eq!(m.priority_of("A"), Some(1));
        // downgrade requests leave the slot alone
        assert!(m.subscribe("A", StreamKind::Trade, 3, 3));
        assert_eq!(m.priority_of("A"), Some(1));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_unsubscribe_releases_all_streams() {
        let (m, _) = manager(5);
        m.subscribe("A", StreamKind::Trade, 2, 1);
        m.subscribe("A", StreamKind::Flow, 2, 1);
        m.subscribe("B", StreamKind::Trade, 2, 1);
        m.unsubscribe("A");
        assert_eq!(m.len(), 1);
        assert_eq!(m.priority_of("A"), None);
    }

    #[test]
    fn test_sync_priority1_adds_and_releases() {
        let (m, _) = manager(4);
        m.subscribe("GONE", StreamKind::Trade, 1, 1);
        m.subscribe("X", StreamKind::Trade, 3, 1);
        let held: HashSet<String> = ["X".to_string(), "Y".to_string()].into_iter().collect();
        let report = m.sync_priority1(&held, 2);
        assert!(report.missing.is_empty());
        assert!(report.evicted.is_empty());
        assert_eq!(m.priority_of("GONE"), None);
        assert_eq!(m.priority_of("X"), Some(1));
        assert_eq!(m.priority_of("Y"), Some(1));
    }

    #[test]
    fn test_sync_priority1_reports_exhaustion() {
        let (m, _) = manager(1);
        m.subscribe("W", StreamKind::Trade, 2, 1);
        let held: HashSet<String> = ["H".to_string()].into_iter().collect();
        assert_eq!(m.sync_priority1(&held, 2).missing, vec!["H".to_string()]);
        assert_eq!(m.priority_of("W"), Some(2));
    }

    #[test]
    fn test_transport_refusal_does_not_admit() {
        let (m, feed) = manager(2);
        feed.fail_subscribe.lock().unwrap().insert("BAD".into());
        assert!(!m.subscribe("BAD", StreamKind::Trade, 2, 1));
        assert!(m.is_empty());
    }

    #[test]
    fn test_touch_and_stale_report() {
        let (m, _) = manager(3);
        m.subscribe("A", StreamKind::Trade, 2, 0);
        m.subscribe("B", StreamKind::Trade, 2, 0);
        assert!(m.touch("A", StreamKind::Trade, 100));
        assert!(!m.touch("A", StreamKind::Quote, 100));
        let stale = m.stale_slots(150, 60);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].instrument_id, "B");
    }

    #[test]
    fn test_resubscribe_replays_every_slot_with_same_priority() {
        let (m, feed) = manager(3);
        m.subscribe("A", StreamKind::Trade, 1, 0);
        m.subscribe("B", StreamKind::Quote, 3, 0);
        feed.calls.lock().unwrap().clear();
        assert_eq!(m.resubscribe_all(), 2);
        assert_eq!(feed.calls.lock().unwrap().len(), 2);
        assert_eq!(m.priority_of("A"), Some(1));
        assert_eq!(m.priority_of("B"), Some(3));
    }

    #[test]
    fn test_random_sequences_respect_capacity_and_priority1() {
        let mut rng = StdRng::seed_from_u64(7);
        let (m, _) = manager(8);
        let mut held: HashSet<String> = HashSet::new();
        for step in 0..2000u64 {
            let id = format!("I{}", rng.gen_range(0..30));
            match rng.gen_range(0..10) {
                0..=5 => {
                    let p = rng.gen_range(1..=3u8);
                    if m.subscribe(&id, StreamKind::Trade, p, step) && p == 1 {
                        held.insert(id);
                    }
                }
                6 => {
                    m.unsubscribe(&id);
                    held.remove(&id);
                }
                _ => {}
            }
            assert!(m.len() <= m.capacity());
            for h in &held {
                assert_eq!(m.priority_of(h), Some(1), "held slot {} lost at step {}", h, step);
            }
        }
    }
}
