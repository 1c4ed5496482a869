pub mod auth;
pub mod bus;
pub mod config;
pub mod document;
pub mod logging;
pub mod ot;
pub mod oplog;
pub mod position;
pub mod queue;
pub mod registry;
pub mod session;
pub mod wire;
pub mod worker;
