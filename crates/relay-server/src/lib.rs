pub mod client;
pub mod event_bridge;
pub mod handlers;
pub mod peer;
pub mod rpc;
pub mod server;

pub use peer::{HostedHandle, HostedTransport};
pub use server::{start, ServerConfig, ServerHandle};
