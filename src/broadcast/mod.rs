//! Fan-out of direction events to connected listeners
//!
//! ```text
//! adapter thread ─┐
//! adapter thread ─┼─► EventBus ──► Broadcaster ──► ClientRegistry snapshot ──► clients
//! adapter thread ─┘   (unbounded)   (one task)      (try_send per client)
//! ```
//!
//! Delivery is live-only and best-effort: a client whose channel is closed is
//! removed, a client whose buffer is full misses that frame.

pub mod broadcaster;
pub mod registry;

pub use broadcaster::{
    BroadcastSettings, BroadcastStats, Broadcaster, BroadcasterHandle, DeliveryOutcome,
    DeliveryReport, EventBus, WireEvent,
};
pub use registry::{ClientEntry, ClientId, ClientRegistry, Frame};
