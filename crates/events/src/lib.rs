//! Event mechanics: the event contract, the wire record, and a process-local
//! pub/sub bus used for consumer wakeups.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod record;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use record::EventRecord;
