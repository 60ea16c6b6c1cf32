//! Client order ids for exactly-once order placement
//!
//! Venues deduplicate on the client order id, so the id for a given
//! (bot, intent sequence) must be identical on every attempt, including
//! attempts made after a restart. This is the only place ids are built.

use thiserror::Error;

/// Prefix marking orders placed by this engine
pub const CLIENT_ORDER_PREFIX: &str = "gbot";

/// Characters of the bot id embedded in the client order id
const BOT_ID_CHARS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyError {
    #[error("INVALID_BOT_ID: bot id must have at least 8 characters, got {0:?}")]
    InvalidBotId(String),
    #[error("INVALID_INTENT_SEQ: intent sequence must be positive, got {0}")]
    InvalidIntentSeq(i64),
}

impl IdempotencyError {
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyError::InvalidBotId(_) => "INVALID_BOT_ID",
            IdempotencyError::InvalidIntentSeq(_) => "INVALID_INTENT_SEQ",
        }
    }
}

fn bot_tag(bot_id: &str) -> Result<String, IdempotencyError> {
    if bot_id.chars().count() < BOT_ID_CHARS {
        return Err(IdempotencyError::InvalidBotId(bot_id.to_string()));
    }
    Ok(bot_id.chars().take(BOT_ID_CHARS).collect())
}

/// `gbot-<first 8 chars of bot id>-<intent seq>`
pub fn generate_client_order_id(bot_id: &str, intent_seq: i64) -> Result<String, IdempotencyError> {
    let tag = bot_tag(bot_id)?;
    if intent_seq <= 0 {
        return Err(IdempotencyError::InvalidIntentSeq(intent_seq));
    }
    Ok(format!("{}-{}-{}", CLIENT_ORDER_PREFIX, tag, intent_seq))
}

/// True when the order was placed by this engine (any bot)
pub fn is_our_order(client_order_id: &str) -> bool {
    client_order_id
        .strip_prefix(CLIENT_ORDER_PREFIX)
        .is_some_and(|rest| rest.starts_with('-'))
}

/// True when the order was placed by this engine for `bot_id`
pub fn is_bot_order(client_order_id: &str, bot_id: &str) -> bool {
    let Ok(tag) = bot_tag(bot_id) else {
        return false;
    };
    let prefix = format!("{}-{}-", CLIENT_ORDER_PREFIX, tag);
    client_order_id
        .strip_prefix(&prefix)
        .is_some_and(|seq| !seq.is_empty() && seq.chars().all(|c| c.is_ascii_digit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "3f2a9c1e-5b7d-4e2f-9a1b-0c3d5e7f9a1b";

    #[test]
    fn test_generate_is_deterministic() {
        let a = generate_client_order_id(BOT, 7).unwrap();
        let b = generate_client_order_id(BOT, 7).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "gbot-3f2a9c1e-7");
        assert!(is_our_order(&a));
        assert!(is_bot_order(&a, BOT));
    }

    #[test]
    fn test_distinct_sequences_distinct_ids() {
        let ids: std::collections::HashSet<_> = (1..=100)
            .map(|seq| generate_client_order_id(BOT, seq).unwrap())
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_rejects_short_bot_id() {
        let err = generate_client_order_id("abc1234", 1).unwrap_err();
        assert_eq!(err.code(), "INVALID_BOT_ID");
        assert!(generate_client_order_id("", 1).is_err());
        assert!(generate_client_order_id("abcd1234", 1).is_ok());
    }

    #[test]
    fn test_rejects_non_positive_sequence() {
        for seq in [0, -1, i64::MIN] {
            let err = generate_client_order_id(BOT, seq).unwrap_err();
            assert_eq!(err.code(), "INVALID_INTENT_SEQ");
        }
    }

    #[test]
    fn test_multibyte_bot_id_is_not_split() {
        let id = generate_client_order_id("ääääääääää", 1).unwrap();
        assert_eq!(id, "gbot-ääääääää-1");
    }

    #[test]
    fn test_foreign_orders() {
        assert!(!is_our_order("web-12345"));
        assert!(!is_our_order("gbotx-1"));
        assert!(!is_our_order(""));
        let other = generate_client_order_id("99999999-aaaa", 1).unwrap();
        assert!(is_our_order(&other));
        assert!(!is_bot_order(&other, BOT));
        assert!(!is_bot_order("gbot-3f2a9c1e-", BOT));
    }
}
