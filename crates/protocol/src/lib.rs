pub mod config;
pub mod janus;
pub mod messages;

pub use config::*;
pub use janus::*;
pub use messages::*;
