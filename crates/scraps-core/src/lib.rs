pub mod backoff;
pub mod claims;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod event;
pub mod frame;
pub mod paths;
pub mod reference;
pub mod watch;
