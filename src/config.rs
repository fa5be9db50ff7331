use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn env_list(key: &str) -> Option<Vec<f64>> {
    let raw = std::env::var(key).ok()?;
    let parsed: Option<Vec<f64>> = raw.split(',').map(|s| s.trim().parse().ok()).collect();
    parsed.filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub slots: SlotConfig,
    pub fusion: FusionConfig,
    pub traps: TrapConfig,
    pub consensus: ConsensusConfig,
    pub position: PositionConfig,
    pub safety: SafetyConfig,
    pub schedule: ScheduleConfig,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: SlotConfig::default(),
            fusion: FusionConfig::default(),
            traps: TrapConfig::default(),
            consensus: ConsensusConfig::default(),
            position: PositionConfig::default(),
            safety: SafetyConfig::default(),
            schedule: ScheduleConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            slots: SlotConfig::from_env(),
            fusion: FusionConfig::from_env(),
            traps: TrapConfig::from_env(),
            consensus: ConsensusConfig::from_env(),
            position: PositionConfig::from_env(),
            safety: SafetyConfig::from_env(),
            schedule: ScheduleConfig::from_env(),
            pipeline: PipelineConfig::from_env(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotConfig {
    /// Live subscription pool size imposed by the market data transport
    pub capacity: usize,
    /// Silence after which a slot is reported stale
    pub stale_secs: u64,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self { capacity: 40, stale_secs: 120 }
    }
}

impl SlotConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            capacity: env_or("SLOT_CAPACITY", d.capacity),
            stale_secs: env_or("SLOT_STALE_SECS", d.stale_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub w_quant: f64,
    pub w_ai: f64,
    /// Score gap (points) beyond which the recommendation is forced to HOLD
    pub divergence_threshold: f64,
    pub buy_threshold: f64,
    pub sell_threshold: f64,
    /// Points subtracted from the AI score per unit of trap confidence
    pub penalty_unit: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            w_quant: 0.5,
            w_ai: 0.5,
            divergence_threshold: 30.0,
            buy_threshold: 70.0,
            sell_threshold: 30.0,
            penalty_unit: 20.0,
        }
    }
}

impl FusionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            w_quant: env_or("FUSION_W_QUANT", d.w_quant),
            w_ai: env_or("FUSION_W_AI", d.w_ai),
            divergence_threshold: env_or("FUSION_DIVERGENCE", d.divergence_threshold),
            buy_threshold: env_or("FUSION_BUY_TH", d.buy_threshold),
            sell_threshold: env_or("FUSION_SELL_TH", d.sell_threshold),
            penalty_unit: env_or("TRAP_PENALTY_UNIT", d.penalty_unit),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrapConfig {
    pub gap_overextension_pct: f64,
    pub flow_divergence_rise_pct: f64,
    /// Program net change over the flow window at or below which selling is accelerating
    pub program_accel_threshold: f64,
    pub flow_window_secs: u64,
    pub news_window_secs: u64,
    pub news_reversal_pct: f64,
    pub rally_pct: f64,
    pub rally_volume_ratio: f64,
    pub wall_ratio: f64,
    pub sector_gap_pct: f64,
    pub fx_shock_pct: f64,
    pub ma_resist_pct: f64,
    /// Observation window before a feedback record is resolved
    pub feedback_window_secs: u64,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            gap_overextension_pct: 5.0,
            flow_divergence_rise_pct: 3.0,
            program_accel_threshold: -500_000_000.0,
            flow_window_secs: 300,
            news_window_secs: 1800,
            news_reversal_pct: 2.0,
            rally_pct: 2.0,
            rally_volume_ratio: 0.5,
            wall_ratio: 3.0,
            sector_gap_pct: 3.0,
            fx_shock_pct: 1.0,
            ma_resist_pct: 1.0,
            feedback_window_secs: 3600,
        }
    }
}

impl TrapConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            gap_overextension_pct: env_or("TRAP_GAP_OVEREXT_PCT", d.gap_overextension_pct),
            flow_divergence_rise_pct: env_or("TRAP_FLOW_DIV_RISE_PCT", d.flow_divergence_rise_pct),
            program_accel_threshold: env_or("TRAP_PROGRAM_ACCEL", d.program_accel_threshold),
            flow_window_secs: env_or("TRAP_FLOW_WINDOW_SECS", d.flow_window_secs),
            news_window_secs: env_or("TRAP_NEWS_WINDOW_SECS", d.news_window_secs),
            news_reversal_pct: env_or("TRAP_NEWS_REVERSAL_PCT", d.news_reversal_pct),
            rally_pct: env_or("TRAP_RALLY_PCT", d.rally_pct),
            rally_volume_ratio: env_or("TRAP_RALLY_VOLUME_RATIO", d.rally_volume_ratio),
            wall_ratio: env_or("TRAP_WALL_RATIO", d.wall_ratio),
            sector_gap_pct: env_or("TRAP_SECTOR_GAP_PCT", d.sector_gap_pct),
            fx_shock_pct: env_or("TRAP_FX_SHOCK_PCT", d.fx_shock_pct),
            ma_resist_pct: env_or("TRAP_MA_RESIST_PCT", d.ma_resist_pct),
            feedback_window_secs: env_or("FEEDBACK_WINDOW_SECS", d.feedback_window_secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub min_final_score: f64,
    /// Fraction, 0.55 = 55%
    pub min_win_rate: f64,
    /// Fraction, 0.60 = 60%
    pub min_profit_probability: f64,
    /// Worst-case scenario return, as a positive percentage
    pub stop_floor_pct: f64,
    pub mc_samples: usize,
    /// Share of the predicted return used as the simulation mean
    pub mc_conservative_fraction: f64,
    pub mc_seed: Option<u64>,
    pub min_history: usize,
    /// Score distance (points) within which a past setup counts as similar
    pub similar_band: f64,
    pub base_allocation: f64,
    pub base_volatility_pct: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_final_score: 65.0,
            min_win_rate: 0.55,
            min_profit_probability: 0.60,
            stop_floor_pct: 3.0,
            mc_samples: 1000,
            mc_conservative_fraction: 0.6,
            mc_seed: None,
            min_history: 5,
            similar_band: 10.0,
            base_allocation: 1_000_000.0,
            base_volatility_pct: 2.0,
        }
    }
}

impl ConsensusConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            min_final_score: env_or("CONSENSUS_MIN_SCORE", d.min_final_score),
            min_win_rate: env_or("CONSENSUS_MIN_WIN_RATE", d.min_win_rate),
            min_profit_probability: env_or("CONSENSUS_MIN_PROFIT_PROB", d.min_profit_probability),
            stop_floor_pct: env_or("CONSENSUS_STOP_FLOOR_PCT", d.stop_floor_pct),
            mc_samples: env_or("CONSENSUS_MC_SAMPLES", d.mc_samples),
            mc_conservative_fraction: env_or("CONSENSUS_MC_FRACTION", d.mc_conservative_fraction),
            mc_seed: std::env::var("CONSENSUS_MC_SEED").ok().and_then(|v| v.parse().ok()),
            min_history: env_or("CONSENSUS_MIN_HISTORY", d.min_history),
            similar_band: env_or("CONSENSUS_SIMILAR_BAND", d.similar_band),
            base_allocation: env_or("BASE_ALLOCATION", d.base_allocation),
            base_volatility_pct: env_or("BASE_VOLATILITY_PCT", d.base_volatility_pct),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionConfig {
    /// Share of the planned quantity bought at each entry stage
    pub entry_fractions: [f64; 3],
    pub stage2_gain_pct: f64,
    /// Further gain from the stage-2 fill price that triggers stage 3
    pub stage3_gain_pct: f64,
    pub stop_loss_pct: f64,
    pub partial_exit_pct: f64,
    pub partial_exit_fraction: f64,
    pub trail_activate_pct: f64,
    pub trail_wide_pct: f64,
    pub trail_tight_pct: f64,
    pub trail_tight_from_pct: f64,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            entry_fractions: [0.4, 0.3, 0.3],
            stage2_gain_pct: 2.0,
            stage3_gain_pct: 3.0,
            stop_loss_pct: 3.0,
            partial_exit_pct: 5.0,
            partial_exit_fraction: 0.5,
            trail_activate_pct: 3.0,
            trail_wide_pct: 3.0,
            trail_tight_pct: 2.0,
            trail_tight_from_pct: 10.0,
        }
    }
}

impl PositionConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let entry_fractions = match env_list("ENTRY_FRACTIONS") {
            Some(v) if v.len() == 3 => [v[0], v[1], v[2]],
            _ => d.entry_fractions,
        };
        Self {
            entry_fractions,
            stage2_gain_pct: env_or("STAGE2_GAIN_PCT", d.stage2_gain_pct),
            stage3_gain_pct: env_or("STAGE3_GAIN_PCT", d.stage3_gain_pct),
            stop_loss_pct: env_or("STOP_LOSS_PCT", d.stop_loss_pct),
            partial_exit_pct: env_or("PARTIAL_EXIT_PCT", d.partial_exit_pct),
            partial_exit_fraction: env_or("PARTIAL_EXIT_FRACTION", d.partial_exit_fraction),
            trail_activate_pct: env_or("TRAIL_ACTIVATE_PCT", d.trail_activate_pct),
            trail_wide_pct: env_or("TRAIL_WIDE_PCT", d.trail_wide_pct),
            trail_tight_pct: env_or("TRAIL_TIGHT_PCT", d.trail_tight_pct),
            trail_tight_from_pct: env_or("TRAIL_TIGHT_FROM_PCT", d.trail_tight_from_pct),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub max_api_errors: u32,
    pub max_consecutive_losses: u32,
    pub safe_loss_pct: f64,
    pub halt_loss_pct: f64,
    pub cooldown_secs: u64,
    /// Equity used to express realized losses as a percentage
    pub account_equity: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_api_errors: 5,
            max_consecutive_losses: 3,
            safe_loss_pct: 2.0,
            halt_loss_pct: 5.0,
            cooldown_secs: 600,
            account_equity: 10_000_000.0,
        }
    }
}

impl SafetyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_api_errors: env_or("SAFETY_MAX_API_ERRORS", d.max_api_errors),
            max_consecutive_losses: env_or("SAFETY_MAX_CONSEC_LOSSES", d.max_consecutive_losses),
            safe_loss_pct: env_or("SAFETY_SAFE_LOSS_PCT", d.safe_loss_pct),
            halt_loss_pct: env_or("SAFETY_HALT_LOSS_PCT", d.halt_loss_pct),
            cooldown_secs: env_or("SAFETY_COOLDOWN_SECS", d.cooldown_secs),
            account_equity: env_or("ACCOUNT_EQUITY", d.account_equity),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub fast_secs: u64,
    pub slow_secs: u64,
    /// Offset of the exchange's local time from UTC
    pub utc_offset_secs: i32,
    /// High-activity windows as "HH:MM-HH:MM" in exchange-local time
    pub high_windows: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fast_secs: 10,
            slow_secs: 60,
            utc_offset_secs: 9 * 3600,
            high_windows: "09:00-09:30,14:50-15:20".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            fast_secs: env_or("SCHED_FAST_SECS", d.fast_secs),
            slow_secs: env_or("SCHED_SLOW_SECS", d.slow_secs),
            utc_offset_secs: env_or("SCHED_UTC_OFFSET_SECS", d.utc_offset_secs),
            high_windows: std::env::var("SCHED_HIGH_WINDOWS").unwrap_or(d.high_windows),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ai_timeout_ms: u64,
    pub ai_max_retries: u32,
    pub ai_scorer_url: Option<String>,
    pub sqlite_path: String,
    /// Unfilled orders older than this are cancelled and no longer block the instrument
    pub order_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ai_timeout_ms: 3000,
            ai_max_retries: 2,
            ai_scorer_url: None,
            sqlite_path: "./tradegate.sqlite".to_string(),
            order_ttl_secs: 60,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            ai_timeout_ms: env_or("AI_TIMEOUT_MS", d.ai_timeout_ms),
            ai_max_retries: env_or("AI_MAX_RETRIES", d.ai_max_retries),
            ai_scorer_url: std::env::var("AI_SCORER_URL").ok().filter(|v| !v.is_empty()),
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or(d.sqlite_path),
            order_ttl_secs: env_or("ORDER_TTL_SECS", d.order_ttl_secs),
        }
    }
}

pub fn now_ts() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.slots.capacity, 40);
        assert_eq!(cfg.fusion.w_quant, 0.5);
        assert_eq!(cfg.fusion.w_ai, 0.5);
        assert_eq!(cfg.fusion.divergence_threshold, 30.0);
        assert_eq!(cfg.consensus.min_final_score, 65.0);
        assert_eq!(cfg.consensus.min_win_rate, 0.55);
        assert_eq!(cfg.consensus.min_profit_probability, 0.60);
        assert_eq!(cfg.position.stop_loss_pct, 3.0);
        assert_eq!(cfg.position.partial_exit_fraction, 0.5);
        assert!(cfg.pipeline.order_ttl_secs > 0);
        assert!(cfg.safety.safe_loss_pct < cfg.safety.halt_loss_pct);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("TRADEGATE_TEST_GARBAGE", "not-a-number");
        let v: u64 = env_or("TRADEGATE_TEST_GARBAGE", 7);
        assert_eq!(v, 7);
        std::env::set_var("TRADEGATE_TEST_NUM", " 12 ");
        let v: u64 = env_or("TRADEGATE_TEST_NUM", 7);
        assert_eq!(v, 12);
    }

    #[test]
    fn test_env_list_rejects_partial_parse() {
        std::env::set_var("TRADEGATE_TEST_LIST", "0.5,x,0.2");
        assert!(env_list("TRADEGATE_TEST_LIST").is_none());
        std::env::set_var("TRADEGATE_TEST_LIST_OK", "0.5, 0.3,0.2");
        assert_eq!(env_list("TRADEGATE_TEST_LIST_OK"), Some(vec![0.5, 0.3, 0.2]));
    }
}
