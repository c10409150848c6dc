// The engine ties the per-transaction field store to the rule-action
// machinery: actions mutate the DPI, push log events, or transition the
// intervention state, and collection managers carry state across
// transactions through a kvstore.

mod tx;
pub use tx::{BlockMode, Intervention, Transaction, TxFlags, DEFAULT_BLOCK_STATUS};

// Actions are the side-effect vocabulary of rules.
pub mod actions;
pub use actions::{Action, ActionInst, ActionRegistry, InstFlags};

// Rules bind an optional operator and an action list to a pipeline phase.
mod rules;
pub use rules::{Operator, Phase, Rule};

// Matchers are pluggable pattern engines selected by string key.
pub mod matchers;
pub use matchers::{CompileError, CompiledPattern, MatcherProvider, MatcherRegistry, RegexMatcher};

// Collection managers seed and persist named field lists.
pub mod collections;
pub use collections::{populate_from_list, CollectionManager, ManagedCollection};

// Structured log events, buffered per transaction.
mod events;
pub use events::{EventAction, EventKind, LogEvent};

mod engine;
pub use engine::{ConnInfo, Connection, Engine, EngineBuilder};

/// Outcome of a handler that may opt out: the caller treats Declined as
/// "try the next handler" or "leave the default in place", never as an
/// error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    Declined,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is already registered")]
    Exists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("not implemented")]
    NotImpl,
    #[error(transparent)]
    Field(#[from] fields::Error),
    #[error(transparent)]
    Store(#[from] kvstore::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("collection state is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pattern failed to compile: {0}")]
    Compile(#[from] matchers::CompileError),
}
