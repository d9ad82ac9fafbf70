// draftsync-common: wire types shared by the relay server and the client library

pub mod crdt;
pub mod payload;
pub mod protocol;
pub mod types;
