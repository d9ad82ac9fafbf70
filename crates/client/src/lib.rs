// draftsync-client: per-document replica, reconnecting presence channel and autosave.

pub mod autosave;
pub mod clock;
pub mod config;
pub mod reconnect;
pub mod replica;
pub mod session;
pub mod transport;
