//! Client-side state for the chat: a normalized snapshot of what the server
//! returned, kept current by reconciling live events into it.

pub mod connection;
pub mod normalize;
pub mod reconcile;
pub mod snapshot;

pub use connection::Connection;
pub use normalize::{normalize, LiveEvent};
pub use reconcile::{Outcome, Reconciler, ViewingHandle};
pub use snapshot::Snapshot;
