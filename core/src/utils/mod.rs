/// Small shared building blocks
pub mod topic;

pub use topic::{Subscription, Topic};
