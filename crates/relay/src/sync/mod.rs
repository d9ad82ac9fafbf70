pub mod clock;
pub mod locks;
pub mod service;
pub mod snapshot;
pub mod ttl_store;
