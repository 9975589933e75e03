pub mod connection;
pub mod sender;

pub use connection::{Connection, ConnectionError, ConnectionManager};
pub use sender::Sender;
