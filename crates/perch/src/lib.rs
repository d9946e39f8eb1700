//! Perch - a gateway daemon bridging federated messaging users to a
//! microblogging service.

pub mod config;
pub mod link;
pub mod pool;
pub mod remote;
pub mod server;
pub mod session;
pub mod store;
