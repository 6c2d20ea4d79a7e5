pub mod api;
pub mod claim;
pub mod config_store;
pub mod output;
pub mod supervisor;
pub mod transport;
pub mod watch;
