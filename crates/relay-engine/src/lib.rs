pub mod bridge;
pub mod controller;
pub mod error;
pub mod mock;
pub mod queue;
pub mod resolver;

pub use bridge::{BridgeEvent, SessionEventBridge};
pub use controller::{SessionLifecycleController, SESSION_KEY};
pub use error::{EngineError, HandlerError};
pub use queue::{EnqueueOutcome, PendingRequestQueue, QueueSnapshot, Target};
pub use resolver::RpcForwardResolver;
