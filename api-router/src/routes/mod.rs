pub mod aggregation;
pub mod chat;
pub mod liveness;
pub mod readiness;
