//! Strategy configuration - the versioned JSON blob stored on each bot,
//! parsed once per config revision into typed values.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decimal::{parse_positive, round_down, DecimalError};
use crate::market::MarketInfo;
use crate::models::OrderType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed config blob: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Decimal(#[from] DecimalError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        "INVALID_CONFIG"
    }
}

/// An intent could not be turned into a tradable quantity
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SizingError {
    #[error("order price must be positive")]
    NonPositivePrice,
    #[error("quantity {quantity} below market minimum {minimum}")]
    BelowMinAmount { quantity: Decimal, minimum: Decimal },
    #[error("notional {notional} below market minimum {minimum}")]
    BelowMinNotional { notional: Decimal, minimum: Decimal },
    #[error("order size at price {price} is out of decimal range")]
    OutOfRange { price: Decimal },
}

impl SizingError {
    pub fn code(&self) -> &'static str {
        "INVALID_ORDER_SIZE"
    }
}

/// Where the grid's base price comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BasePriceType {
    Manual,
    #[default]
    Current,
}

/// Parsed, validated strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub trigger: TriggerConfig,
    pub order: OrderSizing,
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub base_price_type: BasePriceType,
    /// Required when `base_price_type` is manual
    pub base_price: Option<Decimal>,
    pub rise_sell_percent: Decimal,
    pub fall_buy_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderSizing {
    pub order_type: OrderType,
    pub size: SizeSpec,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    /// Fixed base-asset quantity
    Quantity(Decimal),
    /// Fixed quote-asset notional, converted at the order price
    QuoteAmount(Decimal),
}

/// Risk thresholds consumed by the gate pipeline and the auto-close detector
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RiskConfig {
    pub enable_floor_price: bool,
    pub floor_price: Option<Decimal>,
    pub price_min: Option<Decimal>,
    pub price_max: Option<Decimal>,
    pub min_position_percent: Option<Decimal>,
    pub max_position_percent: Option<Decimal>,
    pub enable_buy: Option<bool>,
    pub enable_sell: Option<bool>,
    pub enable_auto_close: bool,
    pub auto_close_drawdown_percent: Option<Decimal>,
}

impl RiskConfig {
    pub fn buy_enabled(&self) -> bool {
        self.enable_buy.unwrap_or(true)
    }

    pub fn sell_enabled(&self) -> bool {
        self.enable_sell.unwrap_or(true)
    }

    pub fn tracks_position(&self) -> bool {
        self.min_position_percent.is_some() || self.max_position_percent.is_some()
    }
}

impl OrderSizing {
    /// Base quantity to trade at `price`, truncated to the market's amount
    /// precision
    pub fn quantity_at(&self, price: Decimal, market: &MarketInfo) -> Result<Decimal, SizingError> {
        if price <= Decimal::ZERO {
            return Err(SizingError::NonPositivePrice);
        }
        let raw = match self.size {
            SizeSpec::Quantity(q) => q,
            SizeSpec::QuoteAmount(amount) => amount
                .checked_div(price)
                .ok_or(SizingError::OutOfRange { price })?,
        };
        let quantity = round_down(raw, market.amount_precision);
        if quantity.is_zero() || quantity < market.min_amount {
            return Err(SizingError::BelowMinAmount {
                quantity,
                minimum: market.min_amount,
            });
        }
        if let Some(minimum) = market.min_notional {
            let notional = quantity
                .checked_mul(price)
                .ok_or(SizingError::OutOfRange { price })?;
            if notional < minimum {
                return Err(SizingError::BelowMinNotional { notional, minimum });
            }
        }
        Ok(quantity)
    }
}

impl StrategyConfig {
    /// Parse the stored JSON blob. Decimal fields must be strings.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_value(value.clone())?;
        raw.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawConfig {
    trigger: RawTrigger,
    order: RawOrder,
    #[serde(default)]
    risk: RawRisk,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTrigger {
    #[serde(default)]
    base_price_type: BasePriceType,
    base_price: Option<String>,
    rise_sell_percent: String,
    fall_buy_percent: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    #[serde(rename = "type", default)]
    order_type: OrderType,
    quantity: Option<String>,
    quote_amount: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawRisk {
    #[serde(default)]
    enable_floor_price: bool,
    floor_price: Option<String>,
    price_min: Option<String>,
    price_max: Option<String>,
    min_position_percent: Option<String>,
    max_position_percent: Option<String>,
    enable_buy: Option<bool>,
    enable_sell: Option<bool>,
    #[serde(default)]
    enable_auto_close: bool,
    auto_close_drawdown_percent: Option<String>,
}

fn opt_positive(field: &str, raw: &Option<String>) -> Result<Option<Decimal>, DecimalError> {
    raw.as_deref().map(|s| parse_positive(field, s)).transpose()
}

impl RawConfig {
    fn validate(self) -> Result<StrategyConfig, ConfigError> {
        let base_price = opt_positive("trigger.basePrice", &self.trigger.base_price)?;
        if self.trigger.base_price_type == BasePriceType::Manual && base_price.is_none() {
            return Err(ConfigError::Invalid(
                "trigger.basePrice is required when basePriceType is manual".into(),
            ));
        }

        let trigger = TriggerConfig {
            base_price_type: self.trigger.base_price_type,
            base_price,
            rise_sell_percent: parse_positive(
                "trigger.riseSellPercent",
                &self.trigger.rise_sell_percent,
            )?,
            fall_buy_percent: parse_positive(
                "trigger.fallBuyPercent",
                &self.trigger.fall_buy_percent,
            )?,
        };
        if trigger.fall_buy_percent >= Decimal::ONE_HUNDRED {
            return Err(ConfigError::Invalid(
                "trigger.fallBuyPercent must be below 100".into(),
            ));
        }

        let size = match (&self.order.quantity, &self.order.quote_amount) {
            (Some(q), None) => SizeSpec::Quantity(parse_positive("order.quantity", q)?),
            (None, Some(a)) => SizeSpec::QuoteAmount(parse_positive("order.quoteAmount", a)?),
            _ => {
                return Err(ConfigError::Invalid(
                    "exactly one of order.quantity or order.quoteAmount is required".into(),
                ))
            }
        };

        let r = &self.risk;
        let risk = RiskConfig {
            enable_floor_price: r.enable_floor_price,
            floor_price: opt_positive("risk.floorPrice", &r.floor_price)?,
            price_min: opt_positive("risk.priceMin", &r.price_min)?,
            price_max: opt_positive("risk.priceMax", &r.price_max)?,
            min_position_percent: opt_positive("risk.minPositionPercent", &r.min_position_percent)?,
            max_position_percent: opt_positive("risk.maxPositionPercent", &r.max_position_percent)?,
            enable_buy: r.enable_buy,
            enable_sell: r.enable_sell,
            enable_auto_close: r.enable_auto_close,
            auto_close_drawdown_percent: opt_positive(
                "risk.autoCloseDrawdownPercent",
                &r.auto_close_drawdown_percent,
            )?,
        };

        if risk.enable_floor_price && risk.floor_price.is_none() {
            return Err(ConfigError::Invalid(
                "risk.floorPrice is required when enableFloorPrice is set".into(),
            ));
        }
        if matches!(risk.auto_close_drawdown_percent, Some(pct) if pct >= Decimal::ONE_HUNDRED) {
            return Err(ConfigError::Invalid(
                "risk.autoCloseDrawdownPercent must be below 100".into(),
            ));
        }
        if let (Some(min), Some(max)) = (risk.price_min, risk.price_max) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "risk.priceMin {} exceeds risk.priceMax {}",
                    min, max
                )));
            }
        }
        if let (Some(min), Some(max)) = (risk.min_position_percent, risk.max_position_percent) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "risk.minPositionPercent {} exceeds risk.maxPositionPercent {}",
                    min, max
                )));
            }
        }

        Ok(StrategyConfig {
            trigger,
            order: OrderSizing {
                order_type: self.order.order_type,
                size,
            },
            risk,
        })
    }
}
