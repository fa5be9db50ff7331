//! Live market state folded from subscription ticks.
//!
//! Ticks arrive per `(instrument, stream)`; reference data (prior close,
//! average volume, long moving average, sector) and macro context (sector
//! moves, FX) are set out of band. `SnapshotCache::snapshot` copies the
//! current view for one instrument so pipeline stages never hold the lock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Executions (price, cumulative volume)
    Trade,
    /// Top-of-book depth
    Quote,
    /// Program and investor-class net flow
    Flow,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Trade => "trade",
            StreamKind::Quote => "quote",
            StreamKind::Flow => "flow",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trade" => Some(StreamKind::Trade),
            "quote" => Some(StreamKind::Quote),
            "flow" => Some(StreamKind::Flow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickPayload {
    Trade { price: f64, cum_volume: f64 },
    Quote { ask_qty: f64, bid_qty: f64 },
    Flow { program_net: f64, foreign_net: f64, institution_net: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub instrument_id: String,
    pub ts: u64,
    pub payload: TickPayload,
}

impl Tick {
    pub fn kind(&self) -> StreamKind {
        match self.payload {
            TickPayload::Trade { .. } => StreamKind::Trade,
            TickPayload::Quote { .. } => StreamKind::Quote,
            TickPayload::Flow { .. } => StreamKind::Flow,
        }
    }
}

/// Static per-session reference data for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentReference {
    pub prev_close: f64,
    /// Average full-session volume
    pub avg_volume: f64,
    /// Long moving average (e.g. 120-day)
    pub long_ma: f64,
    pub sector: String,
    pub session_start_ts: u64,
    pub session_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroContext {
    pub sector_change_pct: HashMap<String, f64>,
    pub fx_change_pct: f64,
}

/// Point-in-time view of one instrument handed through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub instrument_id: String,
    pub ts: u64,
    pub price: f64,
    pub prev_close: f64,
    pub open: f64,
    pub day_high: f64,
    pub volume: f64,
    /// Volume expected by now given the session's elapsed fraction
    pub expected_volume: f64,
    pub ask_qty: f64,
    pub bid_qty: f64,
    pub program_net: f64,
    /// Change of program net over the flow window
    pub program_net_delta: f64,
    pub foreign_net: f64,
    pub institution_net: f64,
    pub long_ma: f64,
    pub sector_change_pct: f64,
    pub fx_change_pct: f64,
    pub news_at: Option<u64>,
    pub post_news_peak: Option<f64>,
}

impl MarketSnapshot {
    fn pct(from: f64, to: f64) -> f64 {
        if from <= 0.0 {
            return 0.0;
        }
        (to - from) / from * 100.0
    }

    /// Opening gap against prior close, percent
    pub fn gap_pct(&self) -> f64 {
        Self::pct(self.prev_close, self.open)
    }

    /// Current move against prior close, percent
    pub fn change_pct(&self) -> f64 {
        Self::pct(self.prev_close, self.price)
    }

    pub fn volume_ratio(&self) -> f64 {
        if self.expected_volume <= 0.0 {
            return 1.0;
        }
        self.volume / self.expected_volume
    }

    /// Ask depth over bid depth; >1 means overhead supply
    pub fn book_ratio(&self) -> f64 {
        if self.bid_qty <= 0.0 {
            return if self.ask_qty > 0.0 { f64::INFINITY } else { 1.0 };
        }
        self.ask_qty / self.bid_qty
    }
}

#[derive(Debug, Clone, Default)]
struct InstrumentState {
    reference: Option<InstrumentReference>,
    last_ts: u64,
    price: f64,
    open: f64,
    day_high: f64,
    volume: f64,
    ask_qty: f64,
    bid_qty: f64,
    program_net: f64,
    foreign_net: f64,
    institution_net: f64,
    flow_history: VecDeque<(u64, f64)>,
    news_at: Option<u64>,
    post_news_peak: Option<f64>,
}

pub struct SnapshotCache {
    instruments: RwLock<HashMap<String, InstrumentState>>,
    macro_ctx: RwLock<MacroContext>,
    flow_window_secs: u64,
}

impl SnapshotCache {
    pub fn new(flow_window_secs: u64) -> Self {
        Self {
            instruments: RwLock::new(HashMap::new()),
            macro_ctx: RwLock::new(MacroContext::default()),
            flow_window_secs,
        }
    }

    /// Start of a session: resets intraday fields.
    pub fn set_reference(&self, instrument_id: &str, reference: InstrumentReference) {
        let mut map = self.instruments.write().unwrap_or_else(|e| e.into_inner());
        let st = map.entry(instrument_id.to_string()).or_default();
        *st = InstrumentState { reference: Some(reference), ..Default::default() };
    }

    pub fn set_macro(&self, ctx: MacroContext) {
        *self.macro_ctx.write().unwrap_or_else(|e| e.into_inner()) = ctx;
    }

    /// Marks a breaking-news hit; the post-news peak starts at the current price.
    pub fn record_news(&self, instrument_id: &str, ts: u64) {
        let mut map = self.instruments.write().unwrap_or_else(|e| e.into_inner());
        let st = map.entry(instrument_id.to_string()).or_default();
        st.news_at = Some(ts);
        st.post_news_peak = if st.price > 0.0 { Some(st.price) } else { None };
    }

    pub fn apply_tick(&self, tick: &Tick) {
        let mut map = self.instruments.write().unwrap_or_else(|e| e.into_inner());
        let st = map.entry(tick.instrument_id.clone()).or_default();
        st.last_ts = st.last_ts.max(tick.ts);
        match tick.payload {
            TickPayload::Trade { price, cum_volume } => {
                if st.open <= 0.0 {
                    st.open = price;
                }
                st.price = price;
                st.day_high = st.day_high.max(price);
                st.volume = st.volume.max(cum_volume);
                if st.news_at.is_some() {
                    st.post_news_peak = Some(st.post_news_peak.unwrap_or(price).max(price));
                }
            }
            TickPayload::Quote { ask_qty, bid_qty } => {
                st.ask_qty = ask_qty;
                st.bid_qty = bid_qty;
            }
            TickPayload::Flow { program_net, foreign_net, institution_net } => {
                st.program_net = program_net;
                st.foreign_net = foreign_net;
                st.institution_net = institution_net;
                st.flow_history.push_back((tick.ts, program_net));
                let cutoff = tick.ts.saturating_sub(self.flow_window_secs);
                while st.flow_history.len() > 1 {
                    match st.flow_history.front() {
                        Some((ts, _)) if *ts < cutoff => {
                            st.flow_history.pop_front();
                        }
                        _ => break,
                    }
                }
            }
        }
    }

    /// Drop everything known about an instrument whose live data has stopped.
    pub fn forget(&self, instrument_id: &str) -> bool {
        let mut map = self.instruments.write().unwrap_or_else(|e| e.into_inner());
        map.remove(instrument_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.instruments.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_price(&self, instrument_id: &str) -> Option<f64> {
        let map = self.instruments.read().unwrap_or_else(|e| e.into_inner());
        map.get(instrument_id).map(|s| s.price).filter(|p| *p > 0.0)
    }

    /// None until the instrument has reference data and at least one trade.
    pub fn snapshot(&self, instrument_id: &str) -> Option<MarketSnapshot> {
        let map = self.instruments.read().unwrap_or_else(|e| e.into_inner());
        let st = map.get(instrument_id)?;
        let reference = st.reference.as_ref()?;
        if st.price <= 0.0 {
            return None;
        }
        let macro_ctx = self.macro_ctx.read().unwrap_or_else(|e| e.into_inner());

        let elapsed = st.last_ts.saturating_sub(reference.session_start_ts) as f64;
        let fraction = if reference.session_secs == 0 {
            1.0
        } else {
            (elapsed / reference.session_secs as f64).clamp(0.05, 1.0)
        };
        let program_net_delta = match (st.flow_history.front(), st.flow_history.back()) {
            (Some((_, first)), Some((_, last))) => last - first,
            _ => 0.0,
        };

        Some(MarketSnapshot {
            instrument_id: instrument_id.to_string(),
            ts: st.last_ts,
            price: st.price,
            prev_close: reference.prev_close,
            open: st.open,
            day_high: st.day_high,
            volume: st.volume,
            expected_volume: reference.avg_volume * fraction,
            ask_qty: st.ask_qty,
            bid_qty: st.bid_qty,
            program_net: st.program_net,
            program_net_delta,
            foreign_net: st.foreign_net,
            institution_net: st.institution_net,
            long_ma: reference.long_ma,
            sector_change_pct: macro_ctx
                .sector_change_pct
                .get(&reference.sector)
                .copied()
                .unwrap_or(0.0),
            fx_change_pct: macro_ctx.fx_change_pct,
            news_at: st.news_at,
            post_news_peak: st.post_news_peak,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> InstrumentReference {
        InstrumentReference {
            prev_close: 10_000.0,
            avg_volume: 1_000_000.0,
            long_ma: 11_000.0,
            sector: "semis".to_string(),
            session_start_ts: 0,
            session_secs: 1000,
        }
    }

    fn trade(ts: u64, price: f64, vol: f64) -> Tick {
        Tick {
            instrument_id: "A".to_string(),
            ts,
            payload: TickPayload::Trade { price, cum_volume: vol },
        }
    }

    fn flow(ts: u64, program_net: f64) -> Tick {
        Tick {
            instrument_id: "A".to_string(),
            ts,
            payload: TickPayload::Flow { program_net, foreign_net: 0.0, institution_net: 0.0 },
        }
    }

    #[test]
    fn test_snapshot_requires_reference_and_trade() {
        let cache = SnapshotCache::new(300);
        cache.apply_tick(&trade(1, 10_100.0, 10.0));
        assert!(cache.snapshot("A").is_none());
        cache.set_reference("A", reference());
        assert!(cache.snapshot("A").is_none());
        cache.apply_tick(&trade(2, 10_350.0, 10.0));
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.open, 10_350.0);
        assert!((snap.gap_pct() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_forget_drops_reference_and_state() {
        let cache = SnapshotCache::new(300);
        cache.set_reference("A", reference());
        cache.apply_tick(&trade(2, 10_100.0, 10.0));
        assert!(cache.forget("A"));
        assert!(cache.is_empty());
        assert!(cache.snapshot("A").is_none());
        assert!(!cache.forget("A"));
    }

    #[test]
    fn test_open_and_high_tracking() {
        let cache = SnapshotCache::new(300);
        cache.set_reference("A", reference());
        cache.apply_tick(&trade(1, 10_200.0, 100.0));
        cache.apply_tick(&trade(2, 10_600.0, 200.0));
        cache.apply_tick(&trade(3, 10_400.0, 300.0));
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.open, 10_200.0);
        assert_eq!(snap.day_high, 10_600.0);
        assert_eq!(snap.price, 10_400.0);
        assert_eq!(snap.volume, 300.0);
    }

    #[test]
    fn test_program_delta_over_window() {
        let cache = SnapshotCache::new(300);
        cache.set_reference("A", reference());
        cache.apply_tick(&trade(1, 10_000.0, 1.0));
        cache.apply_tick(&flow(0, 100.0));
        cache.apply_tick(&flow(200, -50.0));
        cache.apply_tick(&flow(400, -300.0));
        // the sample at ts=0 fell out of the 300s window
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.program_net, -300.0);
        assert_eq!(snap.program_net_delta, -250.0);
    }

    #[test]
    fn test_post_news_peak_tracks_high_after_news() {
        let cache = SnapshotCache::new(300);
        cache.set_reference("A", reference());
        cache.apply_tick(&trade(1, 10_000.0, 1.0));
        cache.record_news("A", 5);
        cache.apply_tick(&trade(6, 10_500.0, 2.0));
        cache.apply_tick(&trade(7, 10_200.0, 3.0));
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.news_at, Some(5));
        assert_eq!(snap.post_news_peak, Some(10_500.0));
    }

    #[test]
    fn test_macro_context_joins_by_sector() {
        let cache = SnapshotCache::new(300);
        cache.set_reference("A", reference());
        cache.apply_tick(&trade(500, 10_000.0, 250_000.0));
        let mut sectors = HashMap::new();
        sectors.insert("semis".to_string(), -1.5);
        cache.set_macro(MacroContext { sector_change_pct: sectors, fx_change_pct: 0.4 });
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.sector_change_pct, -1.5);
        assert_eq!(snap.fx_change_pct, 0.4);
        // half the session elapsed, half the average volume expected
        assert!((snap.volume_ratio() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_book_ratio_edge_cases() {
        let mut snap = MarketSnapshot {
            instrument_id: "A".into(),
            ts: 0,
            price: 1.0,
            prev_close: 1.0,
            open: 1.0,
            day_high: 1.0,
            volume: 0.0,
            expected_volume: 0.0,
            ask_qty: 0.0,
            bid_qty: 0.0,
            program_net: 0.0,
            program_net_delta: 0.0,
            foreign_net: 0.0,
            institution_net: 0.0,
            long_ma: 0.0,
            sector_change_pct: 0.0,
            fx_change_pct: 0.0,
            news_at: None,
            post_news_peak: None,
        };
        assert_eq!(snap.book_ratio(), 1.0);
        snap.ask_qty = 10.0;
        assert!(snap.book_ratio().is_infinite());
        snap.bid_qty = 5.0;
        assert_eq!(snap.book_ratio(), 2.0);
    }
}
