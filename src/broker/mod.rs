pub mod dispatcher;
pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use dispatcher::{DispatchStats, Dispatcher, PublishReceipt};
pub use engine::Broker;
pub use message::Message;
pub use registry::TopicRegistry;
pub use topic::{ConsumerId, Topic};
