//! Event bus and discovery event types

pub mod bus;
pub mod filter;
pub mod types;

pub use bus::{handler_fn, BusStatistics, EventBus, EventHandler, SubscriptionId, SubscriptionStats};
pub use filter::EventFilter;
pub use types::{DiscoveryEvent, EventKind, EventPriority, EventType};
