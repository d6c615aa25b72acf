pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reconcile;
pub mod tenant;
pub mod ticket;
pub mod wal;
pub mod wire;
