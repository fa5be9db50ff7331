//! Structured JSONL logging for the decision pipeline.
//!
//! Every record is one JSON object with a run id and a monotonic sequence
//! number so a session can be replayed and audited line by line:
//!
//! ```text
//! {"ts":"…","run_id":"r-…","seq":12,"lvl":"INFO","component":"trap",
//!  "event":"detected","instrument_id":"005930","pattern_id":"gap_overextension","msg":"","data":{…}}
//! ```
//!
//! Filtering is controlled by `LOG_LEVEL` and `LOG_DOMAINS`; output lands in
//! `LOG_DIR/<run_id>/events.jsonl` (info and above) and `trace.jsonl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Levels and domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Slots,     // Subscription admission, eviction, replay
    Fusion,    // Quant/AI score fusion
    Trap,      // Pattern detections and weight learning
    Consensus, // Three-method validation
    Position,  // Staged entry/exit lifecycle
    Safety,    // Global NORMAL/SAFE/HALT gate
    Pipeline,  // Stage sequencing and decisions
    Exec,      // Order submission and fills
    Store,     // Persistence
    System,    // Startup, shutdown, aggregates
    Profile,   // Stage timing
    Audit,     // Weight changes and manual interventions
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Slots => "slots",
            Domain::Fusion => "fusion",
            Domain::Trap => "trap",
            Domain::Consensus => "consensus",
            Domain::Position => "position",
            Domain::Safety => "safety",
            Domain::Pipeline => "pipeline",
            Domain::Exec => "exec",
            Domain::Store => "store",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }
        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["instrument_id", "order_id", "pattern_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    println!("{}", line);
}

// =============================================================================
// Domain helpers
// =============================================================================

pub fn log_slot_change(event: &str, instrument_id: &str, stream: &str, priority: u8, live: usize) {
    log(
        Level::Info,
        Domain::Slots,
        event,
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("stream", v_str(stream)),
            ("priority", json!(priority)),
            ("live_slots", json!(live)),
        ]),
    );
}

/// Capacity exhausted for a held position: an operational alert, never resolved silently
pub fn log_slot_exhausted(instrument_id: &str, priority: u8, capacity: usize) {
    log(
        Level::Error,
        Domain::Slots,
        "slot_exhausted",
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("priority", json!(priority)),
            ("capacity", json!(capacity)),
            ("msg", v_str("no priority-3 slot to evict")),
        ]),
    );
}

pub fn log_fusion(instrument_id: &str, quant: f64, ai: Option<f64>, fused: f64, rec: &str, reason: &str) {
    log(
        Level::Debug,
        Domain::Fusion,
        "fused",
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("quant_score", v_num(quant)),
            ("ai_score", ai.map(v_num).unwrap_or(Value::Null)),
            ("fused_score", v_num(fused)),
            ("recommendation", v_str(rec)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_trap(instrument_id: &str, pattern_id: &str, severity: &str, confidence: f64, evidence: &str) {
    log(
        Level::Info,
        Domain::Trap,
        "detected",
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("pattern_id", v_str(pattern_id)),
            ("severity", v_str(severity)),
            ("confidence", v_num(confidence)),
            ("evidence", v_str(evidence)),
        ]),
    );
}

pub fn log_weight_change(pattern_id: &str, outcome: &str, before: f64, after: f64, version: u64) {
    log(
        Level::Info,
        Domain::Audit,
        "pattern_weight",
        obj(&[
            ("pattern_id", v_str(pattern_id)),
            ("outcome", v_str(outcome)),
            ("before", v_num(before)),
            ("after", v_num(after)),
            ("version", json!(version)),
        ]),
    );
}

pub fn log_validation(instrument_id: &str, scores: [f64; 3], final_score: f64, approved: bool, reason: &str) {
    log(
        Level::Info,
        Domain::Consensus,
        if approved { "approved" } else { "rejected" },
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("scenario_score", v_num(scores[0])),
            ("backtest_score", v_num(scores[1])),
            ("montecarlo_score", v_num(scores[2])),
            ("final_score", v_num(final_score)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_safety_transition(from: &str, to: &str, trigger: &str) {
    let level = if to == "HALT" { Level::Fatal } else { Level::Warn };
    log(
        level,
        Domain::Safety,
        "transition",
        obj(&[
            ("from", v_str(from)),
            ("to", v_str(to)),
            ("trigger", v_str(trigger)),
        ]),
    );
}

pub fn log_decision(instrument_id: &str, trigger: &str, outcome: &str, detail: &str) {
    log(
        Level::Info,
        Domain::Pipeline,
        "decision",
        obj(&[
            ("instrument_id", v_str(instrument_id)),
            ("trigger", v_str(trigger)),
            ("outcome", v_str(outcome)),
            ("detail", v_str(detail)),
        ]),
    );
}

pub fn log_order_submit(order_id: &str, instrument_id: &str, side: &str, qty: u64, intent: &str) {
    log(
        Level::Info,
        Domain::Exec,
        "order_submit",
        obj(&[
            ("order_id", v_str(order_id)),
            ("instrument_id", v_str(instrument_id)),
            ("side", v_str(side)),
            ("qty", json!(qty)),
            ("intent", v_str(intent)),
        ]),
    );
}

pub fn log_fill(order_id: &str, instrument_id: &str, price: f64, qty: u64, realized_pnl: f64) {
    log(
        Level::Info,
        Domain::Exec,
        "fill",
        obj(&[
            ("order_id", v_str(order_id)),
            ("instrument_id", v_str(instrument_id)),
            ("price", v_num(price)),
            ("qty", json!(qty)),
            ("realized_pnl", v_num(realized_pnl)),
        ]),
    );
}

pub fn log_store_failure(operation: &str, err: &anyhow::Error) {
    log(
        Level::Error,
        Domain::Store,
        "store_failure",
        obj(&[
            ("operation", v_str(operation)),
            ("msg", v_str(&format!("{:#}", err))),
        ]),
    );
}

// =============================================================================
// Helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

pub fn v_bool(b: bool) -> Value {
    Value::Bool(b)
}

// =============================================================================
// Profiling
// =============================================================================

/// Emits elapsed time for a pipeline stage on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self::with_context(label, &[])
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Aggregated counters
// =============================================================================

static AGGREGATOR: OnceLock<Mutex<LogAggregator>> = OnceLock::new();

fn get_aggregator() -> &'static Mutex<LogAggregator> {
    AGGREGATOR.get_or_init(|| Mutex::new(LogAggregator::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Decision,
    Veto,
    Rejection,
    Submit,
    Fill,
    SafetyBlock,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    decisions: u64,
    vetoes: u64,
    rejections: u64,
    submits: u64,
    fills: u64,
    safety_blocks: u64,
}

struct LogAggregator {
    counts: Counts,
    last_flush: Instant,
    flush_interval_secs: u64,
}

impl LogAggregator {
    fn new() -> Self {
        Self {
            counts: Counts::default(),
            last_flush: Instant::now(),
            flush_interval_secs: std::env::var("LOG_FLUSH_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        }
    }

    fn increment(&mut self, counter: Counter) {
        let c = &mut self.counts;
        match counter {
            Counter::Decision => c.decisions += 1,
            Counter::Veto => c.vetoes += 1,
            Counter::Rejection => c.rejections += 1,
            Counter::Submit => c.submits += 1,
            Counter::Fill => c.fills += 1,
            Counter::SafetyBlock => c.safety_blocks += 1,
        }
    }

    fn maybe_flush(&mut self) -> Option<Counts> {
        if self.last_flush.elapsed().as_secs() >= self.flush_interval_secs {
            self.last_flush = Instant::now();
            Some(std::mem::take(&mut self.counts))
        } else {
            None
        }
    }
}

/// Call periodically to emit aggregated stats
pub fn tick_aggregator() {
    if let Ok(mut agg) = get_aggregator().lock() {
        if let Some(c) = agg.maybe_flush() {
            log(
                Level::Info,
                Domain::System,
                "aggregated_stats",
                obj(&[
                    ("decisions", json!(c.decisions)),
                    ("vetoes", json!(c.vetoes)),
                    ("rejections", json!(c.rejections)),
                    ("submits", json!(c.submits)),
                    ("fills", json!(c.fills)),
                    ("safety_blocks", json!(c.safety_blocks)),
                ]),
            );
        }
    }
}

pub fn agg_increment(counter: Counter) {
    if let Ok(mut agg) = get_aggregator().lock() {
        agg.increment(counter);
    }
}
