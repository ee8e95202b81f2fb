pub mod dlq;
pub mod handlers;
pub mod queue;
pub mod worker;
