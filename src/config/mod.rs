//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! node.toml (optional)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NodeConfig (validated, immutable)
//!     → env.rs fills the join key / forced login from the environment
//!     → NodeBuilder adds the non-serialisable parts (store, log fn)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the node is built
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod env;
pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{ListenerSettings, NodeConfig, ObservabilityConfig, StoreConfig, TimeoutConfig};
