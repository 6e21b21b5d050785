//! Prelude module - commonly used types for convenient import.
//!
//! Use `use snaps_events::prelude::*;` to import all essential types.

pub use crate::{EventBus, EventMetadata, EventReceiver, SnapEvent};
