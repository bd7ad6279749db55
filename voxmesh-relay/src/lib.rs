//! Relay-side services: the signal relay client, signal deduplication, the
//! presence tracker and an in-memory backend implementing the membership,
//! signal and presence traits.

pub mod dedup;
pub mod memory;
pub mod presence;
pub mod signal_client;

pub use dedup::SignalDeduplicator;
pub use memory::InMemoryBackend;
pub use presence::{PresenceTracker, SessionControl, CONNECTION_LOST};
pub use signal_client::SignalRelayClient;
