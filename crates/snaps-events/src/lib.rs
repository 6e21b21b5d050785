//! Snaps Events - lifecycle notifications for the Snaps plugin runtime.
//!
//! Every controller transition publishes exactly one [`SnapEvent`], after the
//! registry mutation is committed. `bus.subscribe()` returns an
//! [`EventReceiver`] for every event; `bus.subscribe_snap(id)` narrows it to
//! one snap.
//!
//! # Example
//!
//! ```rust
//! use snaps_core::SnapId;
//! use snaps_events::{EventBus, EventMetadata, SnapEvent};
//!
//! # async fn example() {
//! let bus = EventBus::new();
//! let mut receiver = bus.subscribe();
//!
//! bus.publish(SnapEvent::SnapEnabled {
//!     metadata: EventMetadata::new("controller"),
//!     snap_id: SnapId::from_static("npm:example"),
//! });
//!
//! let event = receiver.recv().await.unwrap();
//! assert_eq!(event.event_type(), "snap_enabled");
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod bus;
mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::{EventMetadata, SnapEvent};
