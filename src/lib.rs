pub mod config;
pub mod error;
pub mod ipc;
pub mod manager;  // server directory + routing
pub mod protocol;
pub mod supervisor;
pub mod utils;

pub use error::{BridgeError, Result};
pub use manager::Manager;
