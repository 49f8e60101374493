//! kinetik-state — embedded state store for Kinetik.
//!
//! Backed by [redb](https://docs.rs/redb), holds node records, service
//! records (with their instances inlined) and the cluster configuration.
//!
//! Values are JSON-serialized into redb's `&[u8]` value columns. The
//! `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
