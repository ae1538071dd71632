use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::RelayError;
use crate::types::{ConsultRequest, Turn};

pub type ModelFuture = Pin<Box<dyn Future<Output = Result<Turn, RelayError>> + Send>>;

/// A hosted model endpoint. Implementations must answer with a `Turn::Assistant`.
#[async_trait]
pub trait ModelCollaborator: Send + Sync {
    async fn consult(&self, request: ConsultRequest) -> Result<Turn, RelayError>;
}

#[async_trait]
impl<F> ModelCollaborator for F
where
    F: Fn(ConsultRequest) -> ModelFuture + Send + Sync + 'static,
{
    async fn consult(&self, request: ConsultRequest) -> Result<Turn, RelayError> {
        (self)(request).await
    }
}

pub type ModelRef = Arc<dyn ModelCollaborator>;
