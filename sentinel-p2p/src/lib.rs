pub mod codec;
pub mod error;
pub mod in_memory;
pub mod message;
pub mod traits;

pub use error::NetworkError;
pub use in_memory::InMemoryNetwork;
pub use message::ClusterMessage;
pub use traits::Network;
