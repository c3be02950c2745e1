pub mod cache;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod http;
pub mod migration;
pub mod party;
pub mod runtime;
pub mod session;

pub use cache::{CanonicalPath, DatabaseHandle, EngineCache, HandleLease};
pub use concurrency::{ConcurrencyController, ConflictToken, RetryPolicy};
pub use error::{Result, StoreError};
pub use migration::{MigrationCatalog, MigrationEngine, REQUIRED_SCHEMA_VERSION};
pub use party::PartyStore;
pub use runtime::StoreRuntime;
pub use session::{CallerContext, SelectOutcome, SessionBinding, Selector};
