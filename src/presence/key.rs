//! Conversation keys.

use crate::BotId;

use serde::{Deserialize, Serialize};

/// Addresses one conversation as seen by one bot identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    bot_id: BotId,
    chat_id: i64,
}

impl ConversationKey {
    pub fn new(bot_id: BotId, chat_id: i64) -> Self {
        Self { bot_id, chat_id }
    }

    pub fn bot_id(&self) -> &BotId {
        &self.bot_id
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.bot_id, self.chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn same_chat_under_different_bots_are_distinct_keys() {
        let first = ConversationKey::new(Arc::from("alpha"), -100123);
        let second = ConversationKey::new(Arc::from("beta"), -100123);
        let again = ConversationKey::new(Arc::from("alpha"), -100123);

        let keys: HashSet<_> = [first.clone(), second, again].into_iter().collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(first.to_string(), "alpha:-100123");
    }
}
