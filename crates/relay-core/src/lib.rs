pub mod errors;
pub mod events;
pub mod ids;
pub mod request;
pub mod resolver;
pub mod session;
pub mod transport;
pub mod uri;
