mod error;
mod transport;

pub use self::error::NetworkError;
pub use self::transport::{MulticastTransport, MAX_DATAGRAM};
