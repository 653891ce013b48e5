use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn mint(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::now_v7())
}

/// Declare a prefixed string ID newtype.
///
/// Fresh IDs embed a UUIDv7, so lexicographic order tracks creation
/// order within a process.
macro_rules! prefixed_id {
    ($(#[$doc:meta])* $name:ident => $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh ID.
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(mint($prefix))
            }

            /// Wrap an existing raw ID (read back from storage, or
            /// assigned by a provider).
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

prefixed_id!(
    /// One persisted conversation.
    SessionId => "sess"
);
prefixed_id!(
    /// One row in a session's event log.
    EventId => "evt"
);
prefixed_id!(
    /// One tool invocation requested by the model.
    ToolCallId => "toolu"
);
prefixed_id!(
    /// One run of the agent loop within a session.
    AgentId => "agent"
);
