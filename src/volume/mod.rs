//! Volume Lifecycle Engine
//!
//! Desired-state volumes and the manager that reconciles them against the
//! observed cluster. Consumers watch the ordered `{new, mod, del}` stream
//! from [`EventBus`] to mirror engine state.

pub mod events;
pub mod manager;
pub mod spec;
pub mod volume;

pub use events::{EventBus, EventKind, EventObject, VolumeEvent};
pub use manager::{ManagerConfig, ManagerStatus, VolumeManager};
pub use spec::VolumeSpec;
pub use volume::{Volume, VolumeSnapshot, VolumeState};
