use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ResolverError;
use crate::request::CallRequest;

/// Performs the actual signing / transaction work for an approved request.
///
/// A returned value may itself carry `{ error: { message } }` to signal an
/// application-level rejection; the relay treats that the same as `Err`.
#[async_trait]
pub trait RequestResolver: Send + Sync {
    async fn resolve(&self, request: &CallRequest) -> Result<Value, ResolverError>;
}
