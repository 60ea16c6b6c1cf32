//! Auto-close drawdown detector
//!
//! Unlike the gates this does not block an intent; it forces the bot to wind
//! down once price has fallen far enough from the reference. It fires at most
//! once per run and refuses to guess when price inputs are missing.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::decimal::{drawdown_percent, format_fixed, parse_positive, shift_down, DecimalError};
use crate::strategy::{BasePriceType, RiskConfig, TriggerConfig};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutoCloseError {
    #[error("reference price unavailable")]
    MissingReference,
    #[error("last price unavailable")]
    MissingLastPrice,
    #[error(transparent)]
    Price(#[from] DecimalError),
}

/// Price inputs, as received from config and market data
#[derive(Debug, Clone, Copy)]
pub struct AutoCloseInput<'a> {
    /// Latest ticker price used as reference when the base price is not manual
    pub ticker_reference: Option<&'a str>,
    pub last_price: Option<&'a str>,
    pub triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoCloseDecision {
    /// Disabled, unconfigured or already fired this run
    Inactive,
    Hold,
    Trigger {
        reference_price: Decimal,
        last_price: Decimal,
        /// Realized drawdown with two decimals, e.g. `"5.00"`
        drawdown_percent: String,
    },
}

pub fn evaluate_auto_close(
    trigger: &TriggerConfig,
    risk: &RiskConfig,
    input: &AutoCloseInput<'_>,
) -> Result<AutoCloseDecision, AutoCloseError> {
    let Some(threshold) = risk.auto_close_drawdown_percent else {
        return Ok(AutoCloseDecision::Inactive);
    };
    if !risk.enable_auto_close || input.triggered_at.is_some() {
        return Ok(AutoCloseDecision::Inactive);
    }

    let reference = match trigger.base_price_type {
        BasePriceType::Manual => trigger.base_price.ok_or(AutoCloseError::MissingReference)?,
        BasePriceType::Current => {
            let raw = input.ticker_reference.ok_or(AutoCloseError::MissingReference)?;
            parse_positive("referencePrice", raw)?
        }
    };
    let last = parse_positive(
        "lastPrice",
        input.last_price.ok_or(AutoCloseError::MissingLastPrice)?,
    )?;

    if last <= shift_down(reference, threshold)? {
        Ok(AutoCloseDecision::Trigger {
            reference_price: reference,
            last_price: last,
            drawdown_percent: format_fixed(drawdown_percent(reference, last), 2),
        })
    } else {
        Ok(AutoCloseDecision::Hold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual(base: i64) -> TriggerConfig {
        TriggerConfig {
            base_price_type: BasePriceType::Manual,
            base_price: Some(Decimal::from(base)),
            rise_sell_percent: Decimal::ONE,
            fall_buy_percent: Decimal::ONE,
        }
    }

    fn risk(pct: &str) -> RiskConfig {
        RiskConfig {
            enable_auto_close: true,
            auto_close_drawdown_percent: Some(pct.parse().unwrap()),
            ..Default::default()
        }
    }

    fn input(last: &str) -> AutoCloseInput<'_> {
        AutoCloseInput {
            ticker_reference: None,
            last_price: Some(last),
            triggered_at: None,
        }
    }

    #[test]
    fn test_triggers_at_threshold() {
        let decision = evaluate_auto_close(&manual(100), &risk("5"), &input("95")).unwrap();
        match decision {
            AutoCloseDecision::Trigger {
                drawdown_percent, ..
            } => assert_eq!(drawdown_percent, "5.00"),
            other => panic!("expected trigger, got {:?}", other),
        }
    }

    #[test]
    fn test_holds_just_above_threshold() {
        let decision = evaluate_auto_close(&manual(100), &risk("5"), &input("95.01")).unwrap();
        assert_eq!(decision, AutoCloseDecision::Hold);
    }

    #[test]
    fn test_once_per_run() {
        let mut i = input("50");
        i.triggered_at = Some(Utc::now());
        let decision = evaluate_auto_close(&manual(100), &risk("5"), &i).unwrap();
        assert_eq!(decision, AutoCloseDecision::Inactive);
    }

    #[test]
    fn test_disabled_or_unconfigured() {
        let mut r = risk("5");
        r.enable_auto_close = false;
        assert_eq!(
            evaluate_auto_close(&manual(100), &r, &input("1")).unwrap(),
            AutoCloseDecision::Inactive
        );
        let r = RiskConfig {
            enable_auto_close: true,
            ..Default::default()
        };
        assert_eq!(
            evaluate_auto_close(&manual(100), &r, &input("1")).unwrap(),
            AutoCloseDecision::Inactive
        );
    }

    #[test]
    fn test_missing_market_data_is_an_error() {
        let none = AutoCloseInput {
            ticker_reference: None,
            last_price: None,
            triggered_at: None,
        };
        assert_eq!(
            evaluate_auto_close(&manual(100), &risk("5"), &none),
            Err(AutoCloseError::MissingLastPrice)
        );
        assert!(matches!(
            evaluate_auto_close(&manual(100), &risk("5"), &input("n/a")),
            Err(AutoCloseError::Price(_))
        ));
    }

    #[test]
    fn test_out_of_range_reference_is_an_error() {
        let trigger = TriggerConfig {
            base_price: Some(Decimal::MAX),
            ..manual(1)
        };
        assert!(matches!(
            evaluate_auto_close(&trigger, &risk("5"), &input("95")),
            Err(AutoCloseError::Price(DecimalError::Overflow { .. }))
        ));
    }

    #[test]
    fn test_current_mode_uses_ticker_reference() {
        let trigger = TriggerConfig {
            base_price_type: BasePriceType::Current,
            base_price: None,
            rise_sell_percent: Decimal::ONE,
            fall_buy_percent: Decimal::ONE,
        };
        let missing = evaluate_auto_close(&trigger, &risk("10"), &input("80"));
        assert_eq!(missing, Err(AutoCloseError::MissingReference));

        let i = AutoCloseInput {
            ticker_reference: Some("200"),
            last_price: Some("180"),
            triggered_at: None,
        };
        match evaluate_auto_close(&trigger, &risk("10"), &i).unwrap() {
            AutoCloseDecision::Trigger {
                reference_price,
                drawdown_percent,
                ..
            } => {
                assert_eq!(reference_price, Decimal::from(200));
                assert_eq!(drawdown_percent, "10.00");
            }
            other => panic!("expected trigger, got {:?}", other),
        }
    }
}
