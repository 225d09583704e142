pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
