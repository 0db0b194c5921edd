pub mod config;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::Config;
pub use session::{ConnectionManager, ConnectionStatus, SessionError, SessionRouter};

#[cfg(test)]
mod tests;
