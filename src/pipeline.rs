//! Decision pipeline: one run per instrument per trigger.
//!
//! Stages chain directly: snapshot → (held: trap emergency exit, position
//! evaluation) or (new: safety pre-check → AI score → trap detection →
//! fusion → consensus → commit re-check) → order. A run never overlaps
//! another run for the same instrument; the in-flight set is checked and set
//! under one lock. Position existence and the safety mode are checked again
//! right before an entry is committed, since either can change while the AI
//! or history calls are suspended.
//!
//! One order per instrument is outstanding at a time. An unfilled order
//! stops blocking the instrument once it has rested for `order_ttl_secs`
//! (it is cancelled), and a full exit always replaces a resting order of any
//! other kind, so loss mitigation never waits behind a stuck buy.
//!
//! Store failures never abort a run: they escalate the safety gate to SAFE
//! and the run carries on (exits stay allowed).

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collab::{
    AiError, AiScorer, AiVerdict, CandidateSummary, FillEvent, HistoryProvider, MarketFeed, OrderExecutor,
    OrderRequest, OrderType, QuantInput, Side,
};
use crate::config::Config;
use crate::consensus::{sizing, Candidate, ConsensusValidator, ValidationResult};
use crate::fusion::{FusionEngine, FusionReason, FusionResult, Recommendation};
use crate::logging::{
    agg_increment, log, log_decision, log_fill, log_fusion, log_order_submit, log_store_failure, obj, v_bool,
    v_num, v_str, Counter, Domain, Level, ProfileScope,
};
use crate::market::{MarketSnapshot, SnapshotCache, StreamKind, Tick};
use crate::position::{EntryPlan, FillIntent, FillOutcome, PositionAction, PositionBook};
use crate::retry::{retry_async, RetryConfig};
use crate::safety::{ActionKind, SafetyGate, SafetyMode, Transition};
use crate::schedule::{local_time, Trigger};
use crate::slots::{SlotManager, PRIORITY_OPPORTUNISTIC, PRIORITY_WATCHLIST};
use crate::storage::Store;
use crate::traps::learning::Outcome;
use crate::traps::{calendar::ReferenceCalendar, PatternId, Severity, TrapDetection, TrapDetector};

/// Outcome of one pipeline run. Everything except `Failed` is a normal result.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Another run for this instrument is in progress
    InFlight,
    /// No usable snapshot yet
    NoData,
    /// Last tick is older than the slot staleness limit
    StaleData { age_secs: u64 },
    /// Neither held nor a tracked candidate
    Untracked,
    /// An order for this instrument has not filled yet
    AwaitingFill,
    /// Held position, no trigger fired
    Hold,
    SafetyBlocked { mode: SafetyMode, action: ActionKind },
    TrapVeto { pattern: PatternId },
    NotBuy(FusionResult),
    Rejected(Box<ValidationResult>),
    /// Conditions changed between validation and commit
    Abandoned { reason: String },
    Submitted { order_id: String, intent: FillIntent, qty: u64 },
    EmergencyExit { order_id: String, pattern: PatternId, qty: u64 },
    Failed { stage: &'static str, error: String },
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::InFlight => "in_flight",
            Decision::NoData => "no_data",
            Decision::StaleData { .. } => "stale_data",
            Decision::Untracked => "untracked",
            Decision::AwaitingFill => "awaiting_fill",
            Decision::Hold => "hold",
            Decision::SafetyBlocked { .. } => "safety_blocked",
            Decision::TrapVeto { .. } => "trap_veto",
            Decision::NotBuy(_) => "not_buy",
            Decision::Rejected(_) => "rejected",
            Decision::Abandoned { .. } => "abandoned",
            Decision::Submitted { .. } => "submitted",
            Decision::EmergencyExit { .. } => "emergency_exit",
            Decision::Failed { .. } => "failed",
        }
    }

    fn detail(&self) -> String {
        match self {
            Decision::SafetyBlocked { mode, action } => format!("{} blocks {:?}", mode.as_str(), action),
            Decision::TrapVeto { pattern } => pattern.as_str().to_string(),
            Decision::NotBuy(f) => format!("{} fused={:.1} ({})", f.recommendation.as_str(), f.fused_score, f.reason.as_str()),
            Decision::Rejected(v) => format!("final={:.1}: {}", v.final_score, v.reason),
            Decision::StaleData { age_secs } => format!("last tick {age_secs}s ago"),
            Decision::Abandoned { reason } => reason.clone(),
            Decision::Submitted { order_id, intent, qty } => format!("{} {} x{}", order_id, intent.as_str(), qty),
            Decision::EmergencyExit { order_id, pattern, qty } => format!("{} {} x{}", order_id, pattern.as_str(), qty),
            Decision::Failed { stage, error } => format!("{stage}: {error}"),
            _ => String::new(),
        }
    }
}

/// Boundary implementations the orchestrator is wired to.
pub struct Collaborators {
    pub feed: Arc<dyn MarketFeed>,
    pub executor: Arc<dyn OrderExecutor>,
    pub scorer: Arc<dyn AiScorer>,
    pub history: Arc<dyn HistoryProvider>,
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Clone)]
struct PendingOrder {
    order_id: Option<String>,
    intent: FillIntent,
    requested: u64,
    filled: u64,
    plan: Option<EntryPlan>,
    submitted_at: u64,
}

impl PendingOrder {
    fn expired(&self, now: u64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.submitted_at) >= ttl_secs
    }

    fn matches(&self, order_id: &str) -> bool {
        self.order_id.as_deref().map_or(true, |o| o == order_id)
    }
}

/// Releases the in-flight mark when the run ends, however it ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    instrument_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, instrument_id: &str) -> Option<Self> {
        let mut s = set.lock().unwrap_or_else(|e| e.into_inner());
        if !s.insert(instrument_id.to_string()) {
            return None;
        }
        Some(Self { set, instrument_id: instrument_id.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.instrument_id);
    }
}

/// Predicted return when the scorer does not supply one: inverse of the
/// 0–100 return scale used by the consensus estimators.
pub fn implied_return_pct(ai_score: f64) -> f64 {
    (ai_score - 50.0) / 10.0
}

pub struct Orchestrator {
    cfg: Config,
    slots: SlotManager,
    market: SnapshotCache,
    fusion: FusionEngine,
    traps: TrapDetector,
    consensus: ConsensusValidator,
    positions: PositionBook,
    safety: SafetyGate,
    store: Arc<dyn Store>,
    executor: Arc<dyn OrderExecutor>,
    scorer: Arc<dyn AiScorer>,
    retry: RetryConfig,
    in_flight: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingOrder>>,
    candidates: Mutex<HashMap<String, QuantInput>>,
    seq: AtomicU64,
}

impl Orchestrator {
    pub fn new(cfg: Config, collab: Collaborators, now: u64) -> Self {
        let retry = RetryConfig { max_retries: cfg.pipeline.ai_max_retries, ..RetryConfig::default() };
        Self {
            slots: SlotManager::new(cfg.slots.capacity, collab.feed),
            market: SnapshotCache::new(cfg.traps.flow_window_secs),
            fusion: FusionEngine::new(cfg.fusion.clone()),
            traps: TrapDetector::new(cfg.traps.clone(), ReferenceCalendar::new(cfg.schedule.utc_offset_secs)),
            consensus: ConsensusValidator::new(cfg.consensus.clone(), collab.history),
            positions: PositionBook::new(),
            safety: SafetyGate::new(cfg.safety.clone(), now),
            store: collab.store,
            executor: collab.executor,
            scorer: collab.scorer,
            retry,
            in_flight: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            candidates: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            cfg,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn slots(&self) -> &SlotManager {
        &self.slots
    }

    pub fn market(&self) -> &SnapshotCache {
        &self.market
    }

    pub fn traps(&self) -> &TrapDetector {
        &self.traps
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn safety(&self) -> &SafetyGate {
        &self.safety
    }

    // =========================================================================
    // Startup and persistence
    // =========================================================================

    /// Reload weights, pending feedback, positions and safety state, then
    /// give every restored position its priority-1 slot.
    pub fn restore(&self, now: u64) -> Result<()> {
        let weights = self.store.load_pattern_weights()?;
        let feedback = self.store.load_pending_feedback()?;
        let positions = self.store.load_positions()?;
        let safety = self.store.load_safety()?;
        let (n_weights, n_feedback, n_positions) = (weights.len(), feedback.len(), positions.len());

        self.traps.restore(weights, feedback);
        self.positions.restore(positions);
        if let Some(state) = safety {
            self.safety.restore(state);
        }
        let report = self.slots.sync_priority1(&self.positions.held_ids(), now);
        for id in &report.evicted {
            self.forget_candidate(id, "evicted");
        }

        log(
            Level::Info,
            Domain::System,
            "state_restored",
            obj(&[
                ("pattern_weights", v_num(n_weights as f64)),
                ("pending_feedback", v_num(n_feedback as f64)),
                ("positions", v_num(n_positions as f64)),
                ("safety_mode", v_str(self.safety.mode().as_str())),
                ("unslotted_positions", v_num(report.missing.len() as f64)),
            ]),
        );
        Ok(())
    }

    fn persist<F>(&self, op: &str, now: u64, f: F)
    where
        F: FnOnce(&dyn Store) -> Result<()>,
    {
        if let Err(err) = f(self.store.as_ref()) {
            log_store_failure(op, &err);
            // Not persisted: the store just failed.
            self.safety.record_store_failure(now);
        }
    }

    fn note_transition(&self, transition: Option<Transition>, now: u64) {
        if transition.is_some() {
            let state = self.safety.snapshot();
            self.persist("put_safety", now, |s| s.put_safety(&state));
        }
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Track an instrument with its current quant input and give it a slot.
    /// An instrument that cannot get a slot is not tracked, since nothing
    /// would keep its snapshot fresh.
    pub fn watch(&self, input: QuantInput, priority: u8, now: u64) -> bool {
        let id = input.instrument_id.clone();
        if !self.positions.contains(&id) {
            let admission = self.slots.admit(&id, StreamKind::Trade, priority, now);
            if let Some(victim) = &admission.evicted {
                self.forget_candidate(victim, "evicted");
            }
            if !admission.admitted {
                self.candidates.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                return false;
            }
        }
        self.candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, input);
        true
    }

    pub fn unwatch(&self, instrument_id: &str) {
        self.candidates.lock().unwrap_or_else(|e| e.into_inner()).remove(instrument_id);
        if !self.positions.contains(instrument_id) {
            self.slots.unsubscribe(instrument_id);
            self.market.forget(instrument_id);
        }
    }

    /// Stop scanning an instrument that lost its slot, along with its cached
    /// snapshot. Held instruments are left alone.
    fn forget_candidate(&self, instrument_id: &str, reason: &str) {
        if self.positions.contains(instrument_id) {
            return;
        }
        let tracked = self
            .candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instrument_id)
            .is_some();
        self.market.forget(instrument_id);
        log(
            Level::Info,
            Domain::Pipeline,
            "candidate_dropped",
            obj(&[
                ("instrument_id", v_str(instrument_id)),
                ("reason", v_str(reason)),
                ("was_tracked", v_bool(tracked)),
            ]),
        );
    }

    fn candidate(&self, instrument_id: &str) -> Option<QuantInput> {
        self.candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(instrument_id)
            .cloned()
    }

    /// Tracked candidates plus held positions, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut ids: HashSet<String> = self
            .candidates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.extend(self.positions.held_ids());
        let mut v: Vec<String> = ids.into_iter().collect();
        v.sort();
        v
    }

    pub fn ingest_tick(&self, tick: &Tick) {
        self.market.apply_tick(tick);
        self.slots.touch(&tick.instrument_id, tick.kind(), tick.ts);
    }

    /// Operator reset of the safety gate, persisted immediately.
    pub fn manual_reset(&self, now: u64) {
        self.safety.manual_reset(now);
        let state = self.safety.snapshot();
        self.persist("put_safety", now, |s| s.put_safety(&state));
    }

    pub fn on_reconnect(&self) -> usize {
        self.slots.resubscribe_all()
    }

    /// Non-scheduled triggers. Scheduled scans call `run` per instrument.
    pub async fn handle(&self, trigger: Trigger, now: u64) -> Option<Decision> {
        match &trigger {
            Trigger::Schedule => {
                self.expire_orders(now).await;
                self.housekeeping(now);
                None
            }
            Trigger::Fill(fill) => {
                self.on_fill(fill, now);
                None
            }
            Trigger::News { instrument_id, ts } => {
                self.market.record_news(instrument_id, *ts);
                Some(self.run(instrument_id, &trigger, now).await)
            }
            Trigger::Discovery(input) => {
                let id = input.instrument_id.clone();
                self.watch(input.clone(), PRIORITY_OPPORTUNISTIC, now);
                Some(self.run(&id, &trigger, now).await)
            }
            Trigger::Reconnect => {
                self.on_reconnect();
                None
            }
        }
    }

    /// Periodic upkeep: trading-day rollover, safety cooldown, due feedback,
    /// stale-slot report, aggregated stats.
    pub fn housekeeping(&self, now: u64) {
        if let Some(day) = local_time(now, self.cfg.schedule.utc_offset_secs).map(|t| t.date_naive()) {
            if self.safety.roll_day(day) {
                log(Level::Info, Domain::Safety, "day_rollover", obj(&[("day", v_str(&day.to_string()))]));
                let state = self.safety.snapshot();
                self.persist("put_safety", now, |s| s.put_safety(&state));
            }
        }
        let t = self.safety.tick(now);
        self.note_transition(t, now);
        self.resolve_feedback(now);

        let stale = self.slots.stale_slots(now, self.cfg.slots.stale_secs);
        if !stale.is_empty() {
            let ids: Vec<&str> = stale.iter().map(|s| s.instrument_id.as_str()).collect();
            log(
                Level::Warn,
                Domain::Slots,
                "stale_slots",
                obj(&[("count", v_num(stale.len() as f64)), ("instruments", v_str(&ids.join(",")))]),
            );
        }
        crate::logging::tick_aggregator();
    }

    /// Resolve every feedback record whose observation window has elapsed
    /// against the current price. Returns the number of weights moved.
    pub fn resolve_feedback(&self, now: u64) -> usize {
        let mut moved = 0;
        for record in self.traps.due_feedback(now) {
            let Some(price) = self.market.last_price(&record.instrument_id) else {
                continue;
            };
            let outcome = Outcome::judge(record.price_at_decision, price);
            if let Some(update) = self.traps.record_feedback(&record.key(), outcome, price) {
                self.persist("put_feedback", now, |s| {
                    s.put_feedback(&update.record)?;
                    s.put_pattern_weight(&update.weight)
                });
                moved += 1;
            }
        }
        self.traps.prune_resolved(now.saturating_sub(self.cfg.traps.feedback_window_secs));
        moved
    }

    // =========================================================================
    // Pipeline run
    // =========================================================================

    pub async fn run(&self, instrument_id: &str, trigger: &Trigger, now: u64) -> Decision {
        let decision = match InFlightGuard::acquire(&self.in_flight, instrument_id) {
            Some(_guard) => {
                let _p = ProfileScope::with_context("pipeline_run", &[("instrument_id", v_str(instrument_id))]);
                self.run_stages(instrument_id, now).await
            }
            None => Decision::InFlight,
        };

        match &decision {
            Decision::TrapVeto { .. } => agg_increment(Counter::Veto),
            Decision::Rejected(_) => agg_increment(Counter::Rejection),
            Decision::SafetyBlocked { .. } => agg_increment(Counter::SafetyBlock),
            _ => {}
        }
        agg_increment(Counter::Decision);
        log_decision(instrument_id, trigger.as_str(), decision.as_str(), &decision.detail());
        decision
    }

    fn has_pending(&self, instrument_id: &str) -> bool {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).contains_key(instrument_id)
    }

    async fn run_stages(&self, instrument_id: &str, now: u64) -> Decision {
        let Some(snap) = self.market.snapshot(instrument_id) else {
            return Decision::NoData;
        };
        let resting = self.expire_pending(instrument_id, now).await;
        if self.positions.contains(instrument_id) {
            return self.run_held(&snap, resting.map(|p| p.intent), now).await;
        }
        if resting.is_some() {
            return Decision::AwaitingFill;
        }
        let Some(input) = self.candidate(instrument_id) else {
            return Decision::Untracked;
        };
        self.run_entry(&snap, &input, now).await
    }

    /// `resting` is the intent of this instrument's unexpired outstanding
    /// order. A full exit replaces it; nothing else is sent while it rests.
    async fn run_held(&self, snap: &MarketSnapshot, resting: Option<FillIntent>, now: u64) -> Decision {
        let id = snap.instrument_id.as_str();
        if resting == Some(FillIntent::FullExit) {
            return Decision::AwaitingFill;
        }
        let detections = {
            let _p = ProfileScope::new("trap_detect");
            self.traps.detect(snap)
        };

        if let Some(top) = detections.first().filter(|d| d.severity == Severity::Critical) {
            self.open_feedback(top, snap, now);
            if !self.safety.permits(ActionKind::Exit) {
                return Decision::SafetyBlocked { mode: self.safety.mode(), action: ActionKind::Exit };
            }
            let Some(pos) = self.positions.get(id) else {
                return Decision::Abandoned { reason: "position closed before emergency exit".into() };
            };
            if resting.is_some() {
                self.supersede(id, now).await;
            }
            return match self.submit(id, Side::Sell, pos.quantity, snap.price, FillIntent::FullExit, None, now).await {
                Ok(order_id) => Decision::EmergencyExit { order_id, pattern: top.pattern_id, qty: pos.quantity },
                Err(e) => Decision::Failed { stage: "emergency_exit", error: format!("{e:#}") },
            };
        }

        let Some((action, pos)) = self.positions.evaluate(id, snap.price, &self.cfg.position) else {
            return Decision::Abandoned { reason: "position closed during evaluation".into() };
        };
        self.persist("put_position", now, |s| s.put_position(&pos));

        let (kind, side, qty, intent) = match action {
            PositionAction::StopLoss { qty } | PositionAction::TrailingStop { qty, .. } => {
                (ActionKind::Exit, Side::Sell, qty, FillIntent::FullExit)
            }
            _ if resting.is_some() => return Decision::AwaitingFill,
            PositionAction::None => return Decision::Hold,
            PositionAction::PartialExit { qty } => (ActionKind::Exit, Side::Sell, qty, FillIntent::PartialExit),
            PositionAction::Pyramid { stage, qty } => {
                if let Some(d) = detections.first() {
                    self.open_feedback(d, snap, now);
                    return Decision::TrapVeto { pattern: d.pattern_id };
                }
                (ActionKind::Pyramid, Side::Buy, qty, FillIntent::Pyramid { stage })
            }
        };
        log(
            Level::Info,
            Domain::Position,
            "position_trigger",
            obj(&[
                ("instrument_id", v_str(id)),
                ("action", v_str(action.as_str())),
                ("qty", v_num(qty as f64)),
                ("price", v_num(snap.price)),
                ("avg_cost", v_num(pos.avg_cost)),
                ("highest_price_seen", v_num(pos.highest_price_seen)),
            ]),
        );
        if !self.safety.permits(kind) {
            return Decision::SafetyBlocked { mode: self.safety.mode(), action: kind };
        }
        if resting.is_some() {
            self.supersede(id, now).await;
        }
        match self.submit(id, side, qty, snap.price, intent, None, now).await {
            Ok(order_id) => Decision::Submitted { order_id, intent, qty },
            Err(e) => Decision::Failed { stage: "submit", error: format!("{e:#}") },
        }
    }

    async fn run_entry(&self, snap: &MarketSnapshot, input: &QuantInput, now: u64) -> Decision {
        let id = snap.instrument_id.as_str();
        if !self.safety.permits(ActionKind::NewEntry) {
            return Decision::SafetyBlocked { mode: self.safety.mode(), action: ActionKind::NewEntry };
        }
        let age_secs = now.saturating_sub(snap.ts);
        if age_secs > self.cfg.slots.stale_secs {
            return Decision::StaleData { age_secs };
        }

        let summary = CandidateSummary {
            instrument_id: id.to_string(),
            quant_score: input.quant_score,
            price: snap.price,
            change_pct: snap.change_pct(),
            volume_ratio: snap.volume_ratio(),
            program_net: snap.program_net,
            foreign_net: snap.foreign_net,
            institution_net: snap.institution_net,
        };
        let verdict = self.score(&summary, now).await;
        let ai_score = verdict.as_ref().map(|v| v.score);

        let detections = {
            let _p = ProfileScope::new("trap_detect");
            self.traps.detect(snap)
        };
        let fused = self.fusion.fuse_with_traps(input.quant_score, ai_score, &detections);
        log_fusion(
            id,
            fused.quant_score,
            fused.ai_score,
            fused.fused_score,
            fused.recommendation.as_str(),
            fused.reason.as_str(),
        );
        // Only a detection that turned a BUY into something else gated this decision.
        if fused.recommendation != Recommendation::Buy
            && self.fusion.fuse(input.quant_score, ai_score).recommendation == Recommendation::Buy
        {
            if let Some(top) = detections.first() {
                self.open_feedback(top, snap, now);
            }
        }

        if fused.reason == FusionReason::TrapVeto {
            if let Some(d) = detections.first() {
                return Decision::TrapVeto { pattern: d.pattern_id };
            }
        }
        if fused.recommendation != Recommendation::Buy {
            return Decision::NotBuy(fused);
        }
        let Some(verdict) = verdict else {
            return Decision::NotBuy(fused);
        };

        let candidate = Candidate {
            candidate_id: format!("{}-{}-{}", id, now, self.seq.fetch_add(1, Ordering::SeqCst)),
            instrument_id: id.to_string(),
            quant_score: fused.quant_score,
            ai_score: verdict.score,
            fused_score: fused.fused_score,
            volatility_pct: input.volatility_pct,
        };
        let predicted = verdict
            .predicted_return_pct
            .unwrap_or_else(|| implied_return_pct(verdict.score));
        let validation = {
            let _p = ProfileScope::new("consensus");
            match self.consensus.validate(&candidate, snap.price, predicted).await {
                Ok(v) => v,
                Err(e) => {
                    log_store_failure("similar_setups", &e);
                    let t = self.safety.record_store_failure(now);
                    self.note_transition(t, now);
                    return Decision::Failed { stage: "consensus", error: format!("{e:#}") };
                }
            }
        };
        if !validation.approved {
            return Decision::Rejected(Box::new(validation));
        }

        // Commit re-checks.
        if self.positions.contains(id) {
            return Decision::Abandoned { reason: "position opened during validation".into() };
        }
        if self.has_pending(id) {
            return Decision::Abandoned { reason: "order submitted during validation".into() };
        }
        if !self.safety.permits(ActionKind::NewEntry) {
            return Decision::SafetyBlocked { mode: self.safety.mode(), action: ActionKind::NewEntry };
        }

        let qty = sizing::tranche(validation.recommended_size, self.cfg.position.entry_fractions[0]);
        if qty == 0 {
            return Decision::Abandoned { reason: "stage-1 tranche rounds to zero".into() };
        }
        let plan = EntryPlan {
            planned_quantity: validation.recommended_size,
            quant_score: candidate.quant_score,
            ai_score: candidate.ai_score,
        };
        match self.submit(id, Side::Buy, qty, snap.price, FillIntent::Entry, Some(plan), now).await {
            Ok(order_id) => Decision::Submitted { order_id, intent: FillIntent::Entry, qty },
            Err(e) => Decision::Failed { stage: "submit", error: format!("{e:#}") },
        }
    }

    /// AI score with per-attempt timeout and bounded retry. Exhausted
    /// timeouts and transient failures count as upstream errors; a permanent
    /// "unavailable" answer only degrades the candidate.
    async fn score(&self, summary: &CandidateSummary, now: u64) -> Option<AiVerdict> {
        let _p = ProfileScope::new("ai_score");
        let timeout = Duration::from_millis(self.cfg.pipeline.ai_timeout_ms);
        let scorer = self.scorer.clone();
        let result = retry_async(&self.retry, "ai_score", AiError::is_retryable, || {
            let scorer = scorer.clone();
            async move {
                match tokio::time::timeout(timeout, scorer.score(summary)).await {
                    Ok(r) => r,
                    Err(_) => Err(AiError::Timeout),
                }
            }
        })
        .await;

        match result {
            Ok(verdict) => {
                self.safety.record_api_success();
                Some(verdict)
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Pipeline,
                    "ai_score_unavailable",
                    obj(&[("instrument_id", v_str(&summary.instrument_id)), ("msg", v_str(&err.to_string()))]),
                );
                if err.is_retryable() {
                    let t = self.safety.record_api_error(now);
                    self.note_transition(t, now);
                }
                None
            }
        }
    }

    /// Record the detection that gated a decision so its weight can learn
    /// from what the price did next.
    fn open_feedback(&self, detection: &TrapDetection, snap: &MarketSnapshot, now: u64) {
        if let Some(record) = self.traps.open_feedback(detection, snap, true) {
            self.persist("put_feedback", now, |s| s.put_feedback(&record));
        }
    }

    // =========================================================================
    // Outstanding orders
    // =========================================================================

    /// Cancel this instrument's outstanding order if it has rested past the
    /// TTL. Returns the order that is still outstanding, if any.
    async fn expire_pending(&self, instrument_id: &str, now: u64) -> Option<PendingOrder> {
        let ttl = self.cfg.pipeline.order_ttl_secs;
        let expired = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let live = !pending.get(instrument_id)?.expired(now, ttl);
            if live {
                return pending.get(instrument_id).cloned();
            }
            pending.remove(instrument_id)
        };
        if let Some(order) = expired {
            self.cancel(instrument_id, &order, "expired", now).await;
        }
        None
    }

    /// Cancel every outstanding order that has rested past the TTL.
    pub async fn expire_orders(&self, now: u64) -> usize {
        let ttl = self.cfg.pipeline.order_ttl_secs;
        let expired: Vec<(String, PendingOrder)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.expired(now, ttl))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, order) in &expired {
            self.cancel(id, order, "expired", now).await;
        }
        expired.len()
    }

    pub fn pending_orders(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Withdraw the outstanding order so a full exit can take its place.
    async fn supersede(&self, instrument_id: &str, now: u64) {
        let prior = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(instrument_id);
        if let Some(order) = prior {
            self.cancel(instrument_id, &order, "superseded", now).await;
        }
    }

    /// Best effort: a failed cancel still releases the instrument, and a late
    /// fill of the withdrawn order is applied as an unmatched fill.
    async fn cancel(&self, instrument_id: &str, order: &PendingOrder, reason: &str, now: u64) {
        let Some(order_id) = order.order_id.as_deref() else {
            return;
        };
        let fields = [
            ("order_id", v_str(order_id)),
            ("instrument_id", v_str(instrument_id)),
            ("intent", v_str(order.intent.as_str())),
            ("filled", v_num(order.filled as f64)),
            ("requested", v_num(order.requested as f64)),
            ("reason", v_str(reason)),
        ];
        match self.executor.cancel_order(order_id).await {
            Ok(()) => log(Level::Info, Domain::Exec, "order_cancelled", obj(&fields)),
            Err(e) => {
                let mut fields = fields.to_vec();
                fields.push(("msg", v_str(&format!("{e:#}"))));
                log(Level::Warn, Domain::Exec, "order_cancel_failed", obj(&fields));
                let t = self.safety.record_api_error(now);
                self.note_transition(t, now);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        instrument_id: &str,
        side: Side,
        qty: u64,
        price: f64,
        intent: FillIntent,
        plan: Option<EntryPlan>,
        now: u64,
    ) -> Result<String> {
        // Registered before the call: the fill may arrive before the ack.
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            instrument_id.to_string(),
            PendingOrder { order_id: None, intent, requested: qty, filled: 0, plan, submitted_at: now },
        );
        let client_id = format!("{}-{}", instrument_id, self.seq.fetch_add(1, Ordering::SeqCst));
        // Full exits must not rest on the book.
        let order_type = if intent == FillIntent::FullExit { OrderType::Market } else { OrderType::Limit };
        let req = OrderRequest {
            instrument_id: instrument_id.to_string(),
            side,
            order_type,
            price: Some(price),
            qty,
            client_id,
        };
        match self.executor.place_order(req).await {
            Ok(ack) => {
                self.safety.record_api_success();
                if let Some(p) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).get_mut(instrument_id) {
                    p.order_id = Some(ack.order_id.clone());
                }
                log_order_submit(&ack.order_id, instrument_id, side.as_str(), qty, intent.as_str());
                agg_increment(Counter::Submit);
                Ok(ack.order_id)
            }
            Err(e) => {
                self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(instrument_id);
                let t = self.safety.record_api_error(now);
                self.note_transition(t, now);
                Err(e)
            }
        }
    }

    // =========================================================================
    // Fills
    // =========================================================================

    fn take_fill_intent(&self, fill: &FillEvent) -> (FillIntent, Option<EntryPlan>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = pending.get_mut(&fill.instrument_id) {
            if p.matches(&fill.order_id) {
                p.filled += fill.qty;
                let found = (p.intent, p.plan);
                if p.filled >= p.requested {
                    pending.remove(&fill.instrument_id);
                }
                return found;
            }
            // A cancelled or expired order filling late.
            log(
                Level::Warn,
                Domain::Exec,
                "fill_order_mismatch",
                obj(&[
                    ("order_id", v_str(&fill.order_id)),
                    ("instrument_id", v_str(&fill.instrument_id)),
                    ("expected", v_str(p.order_id.as_deref().unwrap_or_default())),
                ]),
            );
        }
        drop(pending);

        // Fill with no order of ours outstanding.
        log(
            Level::Warn,
            Domain::Exec,
            "unmatched_fill",
            obj(&[("order_id", v_str(&fill.order_id)), ("instrument_id", v_str(&fill.instrument_id))]),
        );
        let held = self.positions.get(&fill.instrument_id);
        let intent = match (fill.side, held) {
            (Side::Buy, None) => FillIntent::Entry,
            (Side::Buy, Some(p)) => FillIntent::Pyramid { stage: p.entry_stage },
            (Side::Sell, Some(p)) if fill.qty < p.quantity => FillIntent::PartialExit,
            (Side::Sell, _) => FillIntent::FullExit,
        };
        (intent, None)
    }

    /// Apply a fill to the position book, persist, keep priority-1 slots and
    /// the safety loss counters in step.
    pub fn on_fill(&self, fill: &FillEvent, now: u64) -> FillOutcome {
        let (intent, plan) = self.take_fill_intent(fill);
        let outcome = self
            .positions
            .apply_fill(&fill.instrument_id, intent, fill.price, fill.qty, plan, fill.ts);
        log_fill(&fill.order_id, &fill.instrument_id, fill.price, fill.qty, outcome.realized_pnl);
        agg_increment(Counter::Fill);

        match (&outcome.position, &outcome.closed) {
            (Some(pos), _) => self.persist("put_position", now, |s| s.put_position(pos)),
            (None, Some(closed)) => self.persist("close_position", now, |s| {
                s.delete_position(&closed.instrument_id)?;
                s.record_outcome(closed)
            }),
            (None, None) => {}
        }

        if fill.side == Side::Sell {
            self.safety.record_realized_pnl(outcome.realized_pnl, now);
            let state = self.safety.snapshot();
            self.persist("put_safety", now, |s| s.put_safety(&state));
        }

        let report = self.slots.sync_priority1(&self.positions.held_ids(), now);
        for id in &report.evicted {
            self.forget_candidate(id, "evicted");
        }
        if outcome.closed.is_some() && self.candidate(&fill.instrument_id).is_some() {
            let admission = self.slots.admit(&fill.instrument_id, StreamKind::Trade, PRIORITY_WATCHLIST, now);
            if let Some(victim) = &admission.evicted {
                self.forget_candidate(victim, "evicted");
            }
            if !admission.admitted {
                self.forget_candidate(&fill.instrument_id, "no_slot_after_close");
            }
        }
        outcome
    }
}
