use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub instrument_id: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit price, or the reference price for a market order
    pub price: Option<f64>,
    pub qty: u64,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub order_id: String,
    pub instrument_id: String,
    pub side: Side,
    pub price: f64,
    pub qty: u64,
    pub ts: u64,
}

/// What the AI scorer sees of a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateSummary {
    pub instrument_id: String,
    pub quant_score: f64,
    pub price: f64,
    pub change_pct: f64,
    pub volume_ratio: f64,
    pub program_net: f64,
    pub foreign_net: f64,
    pub institution_net: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AiVerdict {
    pub score: f64,
    #[serde(default)]
    pub rationale: String,
    /// Expected return over the holding horizon, percent
    #[serde(default)]
    pub predicted_return_pct: Option<f64>,
}

/// Similar-setup lookup for the backtest estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupQuery {
    pub instrument_id: String,
    pub quant_score: f64,
    pub ai_score: f64,
    /// Maximum score distance for a past setup to count as similar
    pub band: f64,
}

/// Upstream scanner output for one instrument. The quant score is opaque to
/// the pipeline; volatility feeds simulation spread and sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantInput {
    pub instrument_id: String,
    pub quant_score: f64,
    /// Recent daily volatility, percent
    pub volatility_pct: f64,
}
