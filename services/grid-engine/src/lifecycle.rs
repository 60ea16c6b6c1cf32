//! Bot state machine
//!
//! The only way a bot's `status` changes. Every accepted transition bumps
//! `status_version`; rejected events leave the record untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Bot, BotStatus, LastError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotEvent {
    Start,
    TriggerHit,
    Pause,
    Resume,
    Stop,
    RiskTriggered,
    KillSwitch,
    FatalError,
    StoppedComplete,
}

impl BotEvent {
    pub const ALL: [BotEvent; 9] = [
        BotEvent::Start,
        BotEvent::TriggerHit,
        BotEvent::Pause,
        BotEvent::Resume,
        BotEvent::Stop,
        BotEvent::RiskTriggered,
        BotEvent::KillSwitch,
        BotEvent::FatalError,
        BotEvent::StoppedComplete,
    ];
}

impl std::fmt::Display for BotEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BotEvent::Start => "START",
            BotEvent::TriggerHit => "TRIGGER_HIT",
            BotEvent::Pause => "PAUSE",
            BotEvent::Resume => "RESUME",
            BotEvent::Stop => "STOP",
            BotEvent::RiskTriggered => "RISK_TRIGGERED",
            BotEvent::KillSwitch => "KILL_SWITCH",
            BotEvent::FatalError => "FATAL_ERROR",
            BotEvent::StoppedComplete => "STOPPED_COMPLETE",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("INVALID_TRANSITION: {event} not allowed from {from}")]
pub struct TransitionError {
    pub from: BotStatus,
    pub event: BotEvent,
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        "INVALID_TRANSITION"
    }
}

/// Transition table
pub fn transition(from: BotStatus, event: BotEvent) -> Result<BotStatus, TransitionError> {
    use BotEvent as E;
    use BotStatus as S;

    let to = match (from, event) {
        // operator override, accepted from anywhere
        (_, E::KillSwitch) => S::Stopping,
        (_, E::FatalError) => S::Error,
        (s, E::RiskTriggered) if !s.is_terminal() => S::Stopping,

        (S::Draft | S::Stopped, E::Start) => S::WaitingTrigger,
        (S::WaitingTrigger, E::TriggerHit) => S::Running,
        (S::Running, E::Pause) => S::Paused,
        (S::Paused, E::Resume) => S::Running,
        (S::Running | S::Paused | S::WaitingTrigger, E::Stop) => S::Stopping,
        (S::Stopping, E::StoppedComplete) => S::Stopped,

        _ => return Err(TransitionError { from, event }),
    };
    Ok(to)
}

/// Full record update produced by an accepted event
#[derive(Debug, Clone, PartialEq)]
pub struct BotTransition {
    pub event: BotEvent,
    pub from: BotStatus,
    pub to: BotStatus,
    /// Version the bot must still carry for the write to apply
    pub expected_version: i64,
    pub new_version: i64,
    pub run_id: Option<Uuid>,
    pub last_error: Option<String>,
    /// A fresh run starts: clear per-run runtime state
    pub new_run: bool,
    /// Record the auto-close firing in the same write as the transition
    pub auto_close_triggered: bool,
    pub at: DateTime<Utc>,
}

/// Compute the record update for `event` on `bot`.
///
/// `reason` is recorded as `last_error` for RISK_TRIGGERED, FATAL_ERROR and
/// KILL_SWITCH. START clears it; other events keep the existing value.
pub fn plan(
    bot: &Bot,
    event: BotEvent,
    reason: Option<&LastError>,
) -> Result<BotTransition, TransitionError> {
    let to = transition(bot.status, event)?;

    let new_run = bot.status == BotStatus::WaitingTrigger && to == BotStatus::Running;
    let run_id = match to {
        BotStatus::Running if new_run => Some(Uuid::new_v4()),
        BotStatus::Running => bot.run_id.or_else(|| Some(Uuid::new_v4())),
        BotStatus::Stopped | BotStatus::Error | BotStatus::WaitingTrigger | BotStatus::Draft => {
            None
        }
        BotStatus::Paused | BotStatus::Stopping => bot.run_id,
    };

    let last_error = match event {
        BotEvent::RiskTriggered | BotEvent::FatalError | BotEvent::KillSwitch => reason
            .map(|r| r.to_string())
            .or_else(|| bot.last_error.clone()),
        BotEvent::Start => None,
        _ => bot.last_error.clone(),
    };

    Ok(BotTransition {
        event,
        from: bot.status,
        to,
        expected_version: bot.status_version,
        new_version: bot.status_version + 1,
        run_id,
        last_error,
        new_run,
        auto_close_triggered: false,
        at: Utc::now(),
    })
}

/// Apply a planned transition to an in-memory record
pub fn apply(bot: &mut Bot, t: &BotTransition) {
    bot.status = t.to;
    bot.status_version = t.new_version;
    bot.run_id = t.run_id;
    bot.last_error = t.last_error.clone();
    if t.new_run {
        bot.runtime.auto_close_triggered_at = None;
    }
    if t.to == BotStatus::WaitingTrigger {
        // a restart measures from a fresh base
        bot.runtime.anchor_price = None;
        bot.runtime.reference_price = None;
        bot.runtime.auto_close_triggered_at = None;
    }
    if t.auto_close_triggered {
        bot.runtime.auto_close_triggered_at = Some(t.at);
    }
    bot.updated_at = t.at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBot;
    use BotEvent as E;
    use BotStatus as S;

    fn expected(from: S, event: E) -> Option<S> {
        match (from, event) {
            (_, E::KillSwitch) => Some(S::Stopping),
            (_, E::FatalError) => Some(S::Error),
            (S::Stopped | S::Error, E::RiskTriggered) => None,
            (_, E::RiskTriggered) => Some(S::Stopping),
            (S::Draft, E::Start) | (S::Stopped, E::Start) => Some(S::WaitingTrigger),
            (S::WaitingTrigger, E::TriggerHit) => Some(S::Running),
            (S::Running, E::Pause) => Some(S::Paused),
            (S::Paused, E::Resume) => Some(S::Running),
            (S::Running, E::Stop) | (S::Paused, E::Stop) | (S::WaitingTrigger, E::Stop) => {
                Some(S::Stopping)
            }
            (S::Stopping, E::StoppedComplete) => Some(S::Stopped),
            _ => None,
        }
    }

    #[test]
    fn test_transition_table_exhaustive() {
        for from in S::ALL {
            for event in E::ALL {
                match (transition(from, event), expected(from, event)) {
                    (Ok(to), Some(want)) => assert_eq!(to, want, "{} --{}-->", from, event),
                    (Err(e), None) => {
                        assert_eq!(e.code(), "INVALID_TRANSITION");
                        assert_eq!(e.from, from);
                    }
                    (got, want) => panic!("{} --{}--> got {:?}, want {:?}", from, event, got, want),
                }
            }
        }
    }

    fn bot() -> Bot {
        Bot::draft(NewBot {
            user_id: Uuid::new_v4(),
            exchange_account_id: Uuid::new_v4(),
            symbol: "ETH/USDT".into(),
            config: serde_json::json!({}),
        })
    }

    fn step(bot: &mut Bot, event: E) -> Result<BotTransition, TransitionError> {
        let t = plan(bot, event, None)?;
        apply(bot, &t);
        Ok(t)
    }

    #[test]
    fn test_start_only_once() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        assert_eq!(b.status, S::WaitingTrigger);
        assert_eq!(b.status_version, 1);

        let err = step(&mut b, E::Start).unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(b.status_version, 1, "rejected event must not bump version");
    }

    #[test]
    fn test_kill_switch_from_every_non_terminal_state() {
        for from in S::ALL.into_iter().filter(|s| !s.is_terminal()) {
            let mut b = bot();
            b.status = from;
            let before = b.status_version;
            step(&mut b, E::KillSwitch).unwrap();
            assert_eq!(b.status, S::Stopping);
            assert_eq!(b.status_version, before + 1);
        }
    }

    #[test]
    fn test_run_id_lifecycle() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        assert!(b.run_id.is_none());

        step(&mut b, E::TriggerHit).unwrap();
        let run = b.run_id.expect("run id set on entering RUNNING");

        step(&mut b, E::Pause).unwrap();
        step(&mut b, E::Resume).unwrap();
        assert_eq!(b.run_id, Some(run), "resume keeps the run");

        step(&mut b, E::Stop).unwrap();
        assert_eq!(b.run_id, Some(run), "draining still belongs to the run");

        step(&mut b, E::StoppedComplete).unwrap();
        assert!(b.run_id.is_none());
        assert_eq!(b.status_version, 6);
    }

    #[test]
    fn test_new_run_resets_auto_close_flag() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        b.runtime.auto_close_triggered_at = Some(Utc::now());
        let t = step(&mut b, E::TriggerHit).unwrap();
        assert!(t.new_run);
        assert!(b.runtime.auto_close_triggered_at.is_none());
    }

    #[test]
    fn test_risk_triggered_records_reason() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        step(&mut b, E::TriggerHit).unwrap();
        let reason = LastError::new("AUTO_CLOSE_TRIGGERED", "drawdown 5.00% >= 5%");
        let t = plan(&b, E::RiskTriggered, Some(&reason)).unwrap();
        apply(&mut b, &t);
        assert_eq!(b.status, S::Stopping);
        assert_eq!(
            b.last_error.as_deref(),
            Some("AUTO_CLOSE_TRIGGERED: drawdown 5.00% >= 5%")
        );
    }

    #[test]
    fn test_auto_close_flag_rides_on_the_transition() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        step(&mut b, E::TriggerHit).unwrap();

        let reason = LastError::new("AUTO_CLOSE_TRIGGERED", "drawdown 5.00%");
        let mut t = plan(&b, E::RiskTriggered, Some(&reason)).unwrap();
        assert!(!t.auto_close_triggered);
        assert!(b.runtime.auto_close_triggered_at.is_none(), "planning writes nothing");

        t.auto_close_triggered = true;
        apply(&mut b, &t);
        assert_eq!(b.status, S::Stopping);
        assert_eq!(b.runtime.auto_close_triggered_at, Some(t.at));
    }

    #[test]
    fn test_fatal_error_clears_run() {
        let mut b = bot();
        step(&mut b, E::Start).unwrap();
        step(&mut b, E::TriggerHit).unwrap();
        let reason = LastError::new("EXCHANGE_AUTH", "bad signature");
        let t = plan(&b, E::FatalError, Some(&reason)).unwrap();
        apply(&mut b, &t);
        assert_eq!(b.status, S::Error);
        assert!(b.run_id.is_none());
        assert_eq!(b.last_error.as_deref(), Some("EXCHANGE_AUTH: bad signature"));
    }
}
