pub mod connection;
pub mod topology;

pub use connection::{ConnectionError, ConnectionManager, ReadyChannel};
pub use topology::TopologyManager;
