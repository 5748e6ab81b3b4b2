//! Durable-store access for the rule execution engine.
//!
//! The engine only ever talks to the repository traits in
//! [`repository`]; two backends implement them:
//! - [`memory`] — in-process maps, used by tests and local runs
//! - [`postgres`] — sqlx-backed Postgres with embedded migrations
//!
//! [`sink`] carries the insight/command change feed downstream
//! consumers subscribe to.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod sink;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use repository::{
    ActorStateRepository, CommandRepository, ExecutionRequestRepository, InsightRepository,
    RuleInstanceRepository, RuleTemplateRepository, Store,
};
pub use sink::{ChangeEvent, ChangeFeed};
