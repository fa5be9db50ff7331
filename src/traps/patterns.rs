//! The ten trap predicates. Each either abstains (`None`) or returns a
//! short evidence string for the log.

use super::calendar::ReferenceCalendar;
use super::PatternId;
use crate::config::TrapConfig;
use crate::market::MarketSnapshot;

pub fn evaluate(
    pattern: PatternId,
    snap: &MarketSnapshot,
    cfg: &TrapConfig,
    calendar: &ReferenceCalendar,
) -> Option<String> {
    match pattern {
        PatternId::GapOverextension => gap_overextension(snap, cfg),
        PatternId::FlowDivergenceOnRise => flow_divergence_on_rise(snap, cfg),
        PatternId::ProgramFlowAcceleration => program_flow_acceleration(snap, cfg),
        PatternId::PostNewsReversal => post_news_reversal(snap, cfg),
        PatternId::VolumeLessRally => volume_less_rally(snap, cfg),
        PatternId::ResistanceWall => resistance_wall(snap, cfg),
        PatternId::SectorDecoupling => sector_decoupling(snap, cfg),
        PatternId::FxShock => fx_shock(snap, cfg),
        PatternId::LongMaResistance => long_ma_resistance(snap, cfg),
        PatternId::DilutionEventDay => dilution_event_day(snap, calendar),
    }
}

fn gap_overextension(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let gap = snap.gap_pct();
    (gap >= cfg.gap_overextension_pct)
        .then(|| format!("gap {:.2}% >= {:.2}%", gap, cfg.gap_overextension_pct))
}

/// Price up strongly while program trading is net selling.
fn flow_divergence_on_rise(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let rise = snap.gap_pct().max(snap.change_pct());
    (rise >= cfg.flow_divergence_rise_pct && snap.program_net < 0.0).then(|| {
        format!("rise {:.2}% with program net {:.0}", rise, snap.program_net)
    })
}

fn program_flow_acceleration(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    (snap.program_net_delta <= cfg.program_accel_threshold).then(|| {
        format!(
            "program net moved {:.0} within {}s",
            snap.program_net_delta, cfg.flow_window_secs
        )
    })
}

fn post_news_reversal(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let news_at = snap.news_at?;
    let peak = snap.post_news_peak?;
    if snap.ts.saturating_sub(news_at) > cfg.news_window_secs || peak <= 0.0 {
        return None;
    }
    let retrace = (peak - snap.price) / peak * 100.0;
    (retrace >= cfg.news_reversal_pct)
        .then(|| format!("retraced {:.2}% from post-news peak {:.0}", retrace, peak))
}

fn volume_less_rally(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let change = snap.change_pct();
    let ratio = snap.volume_ratio();
    (change >= cfg.rally_pct && ratio < cfg.rally_volume_ratio)
        .then(|| format!("up {:.2}% on {:.2}x expected volume", change, ratio))
}

fn resistance_wall(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let ratio = snap.book_ratio();
    (ratio >= cfg.wall_ratio).then(|| format!("ask/bid depth {:.2}x", ratio))
}

fn sector_decoupling(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    let spread = snap.change_pct() - snap.sector_change_pct;
    (snap.sector_change_pct < 0.0 && spread >= cfg.sector_gap_pct).then(|| {
        format!(
            "instrument {:.2}% vs sector {:.2}%",
            snap.change_pct(),
            snap.sector_change_pct
        )
    })
}

fn fx_shock(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    (snap.fx_change_pct.abs() >= cfg.fx_shock_pct)
        .then(|| format!("fx moved {:.2}%", snap.fx_change_pct))
}

/// Price pressing up against the long moving average from below.
fn long_ma_resistance(snap: &MarketSnapshot, cfg: &TrapConfig) -> Option<String> {
    if snap.long_ma <= 0.0 || snap.price >= snap.long_ma {
        return None;
    }
    let distance = (snap.long_ma - snap.price) / snap.long_ma * 100.0;
    (distance <= cfg.ma_resist_pct)
        .then(|| format!("{:.2}% below long MA {:.0}", distance, snap.long_ma))
}

fn dilution_event_day(snap: &MarketSnapshot, calendar: &ReferenceCalendar) -> Option<String> {
    calendar
        .is_dilution_day(&snap.instrument_id, snap.ts)
        .then(|| "dilution event scheduled today".to_string())
}
