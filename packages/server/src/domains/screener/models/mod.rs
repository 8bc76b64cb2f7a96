pub mod topic;

pub use topic::{NewTopic, Topic, TopicStatus};
