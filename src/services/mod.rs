pub mod codec;
pub mod notifier;
pub mod queue;
pub mod relay;
pub mod sender;
pub mod token;
pub mod worker;
