pub mod completion;
pub mod outbox;
pub mod prompt;
pub mod rate_limit;
pub mod turn;

use common::storage::types::message::MessageRole;
use serde::{Deserialize, Serialize};

pub use completion::{CompletionBackend, CompletionError, CompletionStream, OpenAiCompletion};
#[cfg(any(test, feature = "test-utils"))]
pub use completion::ScriptedCompletion;
pub use outbox::TurnReport;
pub use rate_limit::{QuotaDecision, SlidingWindowQuota, TurnQuota};
pub use turn::{
    prepare_turn, PillMetadata, PreparedTurn, StreamItem, TurnDeps, TurnError, TurnRequest,
    TurnStream,
};

// One entry of the inbound chat transcript, also what the completion backend
// replays to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnMessage {
    pub role: MessageRole,
    pub content: String,
}

impl TurnMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: MessageRole::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.to_string(),
        }
    }
}
