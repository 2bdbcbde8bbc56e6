pub mod broker;
pub mod event;
pub mod hub;
pub mod violation_events;

pub use broker::{MessageBroker, MessageBrokerTrait};
pub use event::EventType;
pub use hub::{LiveHub, Subscription, TOPIC_ALL};
pub use violation_events::ViolationEvents;
