pub mod approvals;
pub mod bus;
pub mod chat;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod metrics;
pub mod orders;
pub mod persistence;
pub mod policy;
pub mod projection;
pub mod worker;
