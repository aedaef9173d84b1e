pub mod auth;
pub mod crypto;
pub mod env;
pub mod error;
pub mod utils;

pub use error::{PbftError, Result};
pub use utils::NodeId;
