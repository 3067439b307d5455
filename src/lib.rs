pub mod config;
pub mod coordinator;
pub mod directory;
pub mod hostel;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod projector;
pub mod protocol;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod wal;
pub mod wire;
