pub mod config;
pub mod context;
pub mod logger;
pub mod schema;
pub mod server;
pub mod session;
