pub mod coordinator;
pub mod listener;
pub mod persister;
pub mod session;

pub use listener::{run, HubConfig, PortListener};
