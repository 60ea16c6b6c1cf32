//! Risk gate pipeline
//!
//! Each gate is a pure predicate over the bot's risk config and the intent
//! being considered. Gates run in a fixed order (floor price, bounds, buy/sell
//! toggle) and the first block wins.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::OrderSide;
use crate::strategy::RiskConfig;

/// Reason codes a gate can block with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateCode {
    FloorPriceTriggered,
    PriceBelowMin,
    PriceAboveMax,
    PositionBelowMin,
    PositionAboveMax,
    BuyDisabled,
    SellDisabled,
}

impl GateCode {
    pub fn as_str(self) -> &'static str {
        match self {
            GateCode::FloorPriceTriggered => "FLOOR_PRICE_TRIGGERED",
            GateCode::PriceBelowMin => "PRICE_BELOW_MIN",
            GateCode::PriceAboveMax => "PRICE_ABOVE_MAX",
            GateCode::PositionBelowMin => "POSITION_BELOW_MIN",
            GateCode::PositionAboveMax => "POSITION_ABOVE_MAX",
            GateCode::BuyDisabled => "BUY_DISABLED",
            GateCode::SellDisabled => "SELL_DISABLED",
        }
    }
}

impl std::fmt::Display for GateCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GateResult {
    Pass,
    Blocked { code: GateCode, reason: String },
}

impl GateResult {
    fn blocked(code: GateCode, reason: String) -> Self {
        GateResult::Blocked { code, reason }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, GateResult::Blocked { .. })
    }
}

/// What the engine is about to do, as seen by the gates
#[derive(Debug, Clone, Copy)]
pub struct GateContext {
    pub side: OrderSide,
    pub current_price: Decimal,
    /// Base-asset share of account value in percent, when known
    pub position_percent: Option<Decimal>,
}

type Gate = fn(&RiskConfig, &GateContext) -> GateResult;

const PIPELINE: [Gate; 3] = [floor_price_gate, bounds_gate, toggle_gate];

/// Run every gate in order, stopping at the first block
pub fn evaluate_gates(risk: &RiskConfig, ctx: &GateContext) -> GateResult {
    for gate in PIPELINE {
        let result = gate(risk, ctx);
        if result.is_blocked() {
            return result;
        }
    }
    GateResult::Pass
}

/// Buys below the floor are refused. Sells always pass.
pub fn floor_price_gate(risk: &RiskConfig, ctx: &GateContext) -> GateResult {
    if !risk.enable_floor_price || ctx.side != OrderSide::Buy {
        return GateResult::Pass;
    }
    match risk.floor_price {
        Some(floor) if ctx.current_price < floor => GateResult::blocked(
            GateCode::FloorPriceTriggered,
            format!("price {} is below floor {}", ctx.current_price, floor),
        ),
        _ => GateResult::Pass,
    }
}

pub fn bounds_gate(risk: &RiskConfig, ctx: &GateContext) -> GateResult {
    if let Some(min) = risk.price_min {
        if ctx.current_price < min {
            return GateResult::blocked(
                GateCode::PriceBelowMin,
                format!("price {} is below minimum {}", ctx.current_price, min),
            );
        }
    }
    if let Some(max) = risk.price_max {
        if ctx.current_price > max {
            return GateResult::blocked(
                GateCode::PriceAboveMax,
                format!("price {} is above maximum {}", ctx.current_price, max),
            );
        }
    }

    let Some(position) = ctx.position_percent else {
        return GateResult::Pass;
    };
    if let Some(min) = risk.min_position_percent {
        if position < min {
            return GateResult::blocked(
                GateCode::PositionBelowMin,
                format!("position {}% is below minimum {}%", position, min),
            );
        }
    }
    if let Some(max) = risk.max_position_percent {
        if position > max {
            return GateResult::blocked(
                GateCode::PositionAboveMax,
                format!("position {}% is above maximum {}%", position, max),
            );
        }
    }
    GateResult::Pass
}

pub fn toggle_gate(risk: &RiskConfig, ctx: &GateContext) -> GateResult {
    match ctx.side {
        OrderSide::Buy if !risk.buy_enabled() => {
            GateResult::blocked(GateCode::BuyDisabled, "buying is disabled".into())
        }
        OrderSide::Sell if !risk.sell_enabled() => {
            GateResult::blocked(GateCode::SellDisabled, "selling is disabled".into())
        }
        _ => GateResult::Pass,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ctx(side: OrderSide, price: &str) -> GateContext {
        GateContext {
            side,
            current_price: dec(price),
            position_percent: None,
        }
    }

    fn code(result: GateResult) -> Option<GateCode> {
        match result {
            GateResult::Pass => None,
            GateResult::Blocked { code, .. } => Some(code),
        }
    }

    #[test]
    fn test_floor_blocks_buys_below_floor() {
        let risk = RiskConfig {
            enable_floor_price: true,
            floor_price: Some(dec("80")),
            ..Default::default()
        };
        assert_eq!(
            code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "79.99"))),
            Some(GateCode::FloorPriceTriggered)
        );
        assert_eq!(code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "80"))), None);
    }

    #[test]
    fn test_floor_never_blocks_sells() {
        let risk = RiskConfig {
            enable_floor_price: true,
            floor_price: Some(dec("80")),
            ..Default::default()
        };
        for price in ["0.00000001", "1", "79.99", "80", "1000000"] {
            assert_eq!(code(floor_price_gate(&risk, &ctx(OrderSide::Sell, price))), None);
        }
    }

    #[test]
    fn test_floor_disabled_is_ignored() {
        let risk = RiskConfig {
            enable_floor_price: false,
            floor_price: Some(dec("80")),
            ..Default::default()
        };
        assert_eq!(code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "1"))), None);
    }

    #[test]
    fn test_price_bounds() {
        let risk = RiskConfig {
            price_min: Some(dec("50")),
            price_max: Some(dec("150")),
            ..Default::default()
        };
        assert_eq!(
            code(evaluate_gates(&risk, &ctx(OrderSide::Sell, "49.9"))),
            Some(GateCode::PriceBelowMin)
        );
        assert_eq!(
            code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "150.01"))),
            Some(GateCode::PriceAboveMax)
        );
        assert_eq!(code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "150"))), None);

        let only_max = RiskConfig {
            price_max: Some(dec("150")),
            ..Default::default()
        };
        assert_eq!(code(evaluate_gates(&only_max, &ctx(OrderSide::Buy, "0.01"))), None);
    }

    #[test]
    fn test_position_bounds() {
        let risk = RiskConfig {
            min_position_percent: Some(dec("10")),
            max_position_percent: Some(dec("90")),
            ..Default::default()
        };
        let mut c = ctx(OrderSide::Sell, "100");
        c.position_percent = Some(dec("5"));
        assert_eq!(code(evaluate_gates(&risk, &c)), Some(GateCode::PositionBelowMin));
        c.position_percent = Some(dec("95"));
        assert_eq!(code(evaluate_gates(&risk, &c)), Some(GateCode::PositionAboveMax));
        c.position_percent = None;
        assert_eq!(code(evaluate_gates(&risk, &c)), None);
    }

    #[test]
    fn test_toggles_default_to_enabled() {
        let risk = RiskConfig::default();
        assert_eq!(code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "1"))), None);
        assert_eq!(code(evaluate_gates(&risk, &ctx(OrderSide::Sell, "1"))), None);

        let no_buy = RiskConfig {
            enable_buy: Some(false),
            ..Default::default()
        };
        assert_eq!(
            code(evaluate_gates(&no_buy, &ctx(OrderSide::Buy, "1"))),
            Some(GateCode::BuyDisabled)
        );
        assert_eq!(code(evaluate_gates(&no_buy, &ctx(OrderSide::Sell, "1"))), None);
    }

    #[test]
    fn test_floor_wins_over_later_gates() {
        let risk = RiskConfig {
            enable_floor_price: true,
            floor_price: Some(dec("80")),
            price_min: Some(dec("90")),
            enable_buy: Some(false),
            ..Default::default()
        };
        assert_eq!(
            code(evaluate_gates(&risk, &ctx(OrderSide::Buy, "70"))),
            Some(GateCode::FloorPriceTriggered)
        );
    }
}
