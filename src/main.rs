use anyhow::Result;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use tradegate::collab::ai_http::HttpAiScorer;
use tradegate::collab::{AiScorer, NullFeed, NullScorer, PaperExecutor, QuantInput};
use tradegate::config::{now_ts, Config};
use tradegate::logging::{log, obj, v_num, v_str, Domain, Level};
use tradegate::market::{InstrumentReference, MacroContext, Tick, TickPayload};
use tradegate::pipeline::{Collaborators, Orchestrator};
use tradegate::schedule::{Scheduler, Trigger};
use tradegate::slots::PRIORITY_WATCHLIST;
use tradegate::storage::SqliteStore;

/// One JSON line on stdin. Market data, reference data and operator
/// commands all arrive this way in paper mode.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputEvent {
    Trade { instrument_id: String, ts: u64, price: f64, cum_volume: f64 },
    Quote { instrument_id: String, ts: u64, ask_qty: f64, bid_qty: f64 },
    Flow { instrument_id: String, ts: u64, program_net: f64, foreign_net: f64, institution_net: f64 },
    Reference {
        instrument_id: String,
        prev_close: f64,
        avg_volume: f64,
        long_ma: f64,
        sector: String,
        session_start_ts: u64,
        session_secs: u64,
    },
    Macro { sector_change_pct: HashMap<String, f64>, fx_change_pct: f64 },
    Watch { instrument_id: String, quant_score: f64, volatility_pct: f64 },
    Discovery { instrument_id: String, quant_score: f64, volatility_pct: f64 },
    News { instrument_id: String, ts: u64 },
    Reconnect,
    ManualReset,
}

fn spawn_stdin_reader(tx: mpsc::UnboundedSender<InputEvent>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<InputEvent>(&line) {
                Ok(ev) => {
                    if tx.send(ev).is_err() {
                        break;
                    }
                }
                Err(e) => log(
                    Level::Warn,
                    Domain::System,
                    "input_parse_error",
                    obj(&[("msg", v_str(&e.to_string()))]),
                ),
            }
        }
    });
}

fn spawn_trigger(orch: &Arc<Orchestrator>, trigger: Trigger) {
    let orch = orch.clone();
    tokio::spawn(async move {
        orch.handle(trigger, now_ts()).await;
    });
}

fn apply_input(orch: &Arc<Orchestrator>, ev: InputEvent) {
    let now = now_ts();
    match ev {
        InputEvent::Trade { instrument_id, ts, price, cum_volume } => orch.ingest_tick(&Tick {
            instrument_id,
            ts,
            payload: TickPayload::Trade { price, cum_volume },
        }),
        InputEvent::Quote { instrument_id, ts, ask_qty, bid_qty } => orch.ingest_tick(&Tick {
            instrument_id,
            ts,
            payload: TickPayload::Quote { ask_qty, bid_qty },
        }),
        InputEvent::Flow { instrument_id, ts, program_net, foreign_net, institution_net } => orch.ingest_tick(&Tick {
            instrument_id,
            ts,
            payload: TickPayload::Flow { program_net, foreign_net, institution_net },
        }),
        InputEvent::Reference {
            instrument_id,
            prev_close,
            avg_volume,
            long_ma,
            sector,
            session_start_ts,
            session_secs,
        } => orch.market().set_reference(
            &instrument_id,
            InstrumentReference { prev_close, avg_volume, long_ma, sector, session_start_ts, session_secs },
        ),
        InputEvent::Macro { sector_change_pct, fx_change_pct } => {
            orch.market().set_macro(MacroContext { sector_change_pct, fx_change_pct })
        }
        InputEvent::Watch { instrument_id, quant_score, volatility_pct } => {
            orch.watch(QuantInput { instrument_id, quant_score, volatility_pct }, PRIORITY_WATCHLIST, now);
        }
        InputEvent::Discovery { instrument_id, quant_score, volatility_pct } => {
            spawn_trigger(orch, Trigger::Discovery(QuantInput { instrument_id, quant_score, volatility_pct }))
        }
        InputEvent::News { instrument_id, ts } => spawn_trigger(orch, Trigger::News { instrument_id, ts }),
        InputEvent::Reconnect => spawn_trigger(orch, Trigger::Reconnect),
        InputEvent::ManualReset => orch.manual_reset(now),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let scheduler = Scheduler::from_config(&cfg.schedule)?;
    let store = Arc::new(SqliteStore::open(&cfg.pipeline.sqlite_path)?);

    let scorer: Arc<dyn AiScorer> = match &cfg.pipeline.ai_scorer_url {
        Some(url) => Arc::new(HttpAiScorer::new(url.clone())),
        None => Arc::new(NullScorer),
    };
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("sqlite_path", v_str(&cfg.pipeline.sqlite_path)),
            ("ai_scorer", v_str(cfg.pipeline.ai_scorer_url.as_deref().unwrap_or("null"))),
            ("slot_capacity", v_num(cfg.slots.capacity as f64)),
            ("executor", v_str("paper")),
        ]),
    );

    let (fill_tx, mut fill_rx) = mpsc::unbounded_channel();
    let collab = Collaborators {
        feed: Arc::new(NullFeed),
        executor: Arc::new(PaperExecutor::new(fill_tx)),
        scorer,
        history: store.clone(),
        store,
    };
    let orch = Arc::new(Orchestrator::new(cfg, collab, now_ts()));
    orch.restore(now_ts())?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    spawn_stdin_reader(input_tx);

    let mut next_scan = Instant::now();
    loop {
        tokio::select! {
            _ = sleep_until(next_scan) => {
                let now = now_ts();
                orch.handle(Trigger::Schedule, now).await;
                for id in orch.instruments() {
                    let orch = orch.clone();
                    tokio::spawn(async move {
                        orch.run(&id, &Trigger::Schedule, now).await;
                    });
                }
                next_scan = Instant::now() + scheduler.interval_at(now);
            }
            Some(fill) = fill_rx.recv() => {
                orch.handle(Trigger::Fill(fill), now_ts()).await;
            }
            ev = input_rx.recv() => match ev {
                Some(ev) => apply_input(&orch, ev),
                None => {
                    log(Level::Info, Domain::System, "input_closed", obj(&[]));
                    break;
                }
            },
        }
    }

    // Let in-flight fills land before exit.
    while let Ok(fill) = fill_rx.try_recv() {
        orch.handle(Trigger::Fill(fill), now_ts()).await;
    }
    log(Level::Info, Domain::System, "shutdown", obj(&[("positions", v_num(orch.positions().len() as f64))]));
    Ok(())
}
