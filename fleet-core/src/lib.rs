pub mod diagnostics;
pub mod election;
pub mod error;
pub mod health;
pub mod load;
pub mod node;
pub mod sensor;
pub mod transport;

pub use diagnostics::Diagnostics;
pub use error::FleetError;
pub use node::{FleetConfig, FleetNode, NodeHandle};
pub use transport::Transport;
