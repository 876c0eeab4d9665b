//! Bus messages and the message bus abstraction.
//!
//! Wire commands (`command`), the static topic catalog (`topic`), the
//! transport-agnostic bus contract (`bus`, `message`) and an in-memory bus
//! for tests/dev. Infrastructure-backed buses live in `jobrelay-infra`.

pub mod bus;
pub mod command;
pub mod in_memory_bus;
pub mod message;
pub mod topic;

pub use bus::{
    BusError, DeadLetterPolicy, MessageBus, ReceiveSettings, Subscription, SubscriptionConfig,
    SubscriptionLease,
};
pub use command::{DoSmallTaskCommand, DoTaskCommand, TriggerCommand};
pub use in_memory_bus::InMemoryMessageBus;
pub use message::{Acker, Message};
pub use topic::{Topic, subscription_id};
