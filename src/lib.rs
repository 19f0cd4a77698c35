//! # Mundus: a temporal attribute store
//!
//! Mundus is the core of a pervasive-computing world model: solvers push
//! time-stamped attribute assertions about named objects, clients read them
//! as point queries or live subscriptions, and history is persisted so the
//! state of the world at any past moment can be reconstructed.
//!
//! ## Quick start
//!
//! ```ignore
//! use mundus::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Non-persistent mode on the default ports (7009 solvers,
//!     // 7010 clients).
//!     let server = Server::start(Config::default()).await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! The engine can also be embedded directly, without the TCP surface:
//!
//! ```ignore
//! use std::sync::Arc;
//! use mundus::{Attribute, MemoryStore, SubscriptionBus, WorldModel};
//!
//! # async fn demo() {
//! let bus = SubscriptionBus::new();
//! let model = WorldModel::new(Arc::new(MemoryStore::new()), bus).await;
//!
//! model.create_uri("room.1".into(), "setup", 100).await;
//! model
//!     .insert_data(
//!         vec![("room.1".into(), vec![Attribute::new("temp", 200, "sensor", vec![0x10])])],
//!         false,
//!     )
//!     .await;
//!
//! let snapshot = model.snapshot_current(".*", &["temp".into()], true).await;
//! assert_eq!(snapshot["room.1"].len(), 1);
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`model::WorldModel`]: the current-value map behind a
//!   readers-writers gate, the write path (create/expire/delete,
//!   autocreate, transients), and the read paths.
//! - [`subscriptions::SubscriptionBus`]: standing queries with regex
//!   matching, partial-match memoization, and a single dispatcher task.
//! - [`protocol`]: the byte-exact framed TCP codec for both peer roles.
//! - [`store`]: the persistence capability boundary and its backends.
//! - [`sessions`] and [`server`]: per-peer connection machines and the
//!   listener/sweeper lifecycle.
//!
//! ## Thread safety
//!
//! The engine is shared as `Arc<WorldModel>` across all session tasks.
//! Reads run concurrently; writes take the exclusive side of the gate per
//! URI batch. Subscription fan-out happens on a single dispatcher task fed
//! by a channel, so per-subscription state needs no further coordination.

pub mod config;
pub mod error;
pub mod model;
mod patterns;
pub mod protocol;
pub mod server;
pub mod sessions;
pub mod store;
pub mod subscriptions;
pub mod types;

pub use config::Config;
pub use error::{WmError, WmResult};
pub use model::WorldModel;
pub use server::Server;
pub use store::{AttributeStore, MemoryStore, NullStore, PgStore};
pub use subscriptions::{Delta, OnDemandCommand, StandingQuery, SubscriptionBus};
pub use types::{Attribute, Timestamp, Uri, WorldState, CREATION_NAME, NEVER_EXPIRED};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{WmError, WmResult};
    pub use crate::model::WorldModel;
    pub use crate::server::Server;
    pub use crate::store::{AttributeStore, MemoryStore, NullStore, PgStore};
    pub use crate::subscriptions::{StandingQuery, SubscriptionBus};
    pub use crate::types::{Attribute, Timestamp, Uri, WorldState, CREATION_NAME};
}
