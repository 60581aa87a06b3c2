//! Topic queues.

pub mod length_checker;
pub mod read;
pub mod write;

pub use length_checker::QueueLengthChecker;
pub use read::{Callback, ReadTopic, ReadTopicOptions};
pub use write::WriteTopic;
