//! Change broadcast: queue change messages and the pub/sub mechanics that
//! carry them to observers.

pub mod bus;
pub mod change;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use change::{ChangeKind, QueueChange, QueueSnapshot};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
