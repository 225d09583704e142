pub mod dispatch;
pub mod error;
pub mod executor;
pub mod provider;
pub mod queue;

pub use dispatch::{DispatchPolicy, NodeView};
pub use error::{DispatchError, ProviderError, TaskQueueError};
pub use executor::{ModelTable, TaskExecutor};
pub use provider::{EchoProvider, HttpProvider, InferenceProvider};
pub use queue::{QueueStats, TaskQueue};
