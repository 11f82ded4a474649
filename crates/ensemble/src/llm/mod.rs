pub mod anthropic;
pub mod retry;
pub mod types;

use std::sync::Arc;

use crate::error::Error;
use crate::llm::types::{CompletionRequest, CompletionResponse};

/// Trait for oracle (LLM completion) providers.
///
/// Implementors must be thread-safe (`Send + Sync`) so a single provider can
/// serve the planner, every worker, and the aggregator concurrently.
pub trait LlmProvider: Send + Sync {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl std::future::Future<Output = Result<CompletionResponse, Error>> + Send;

    /// Model identifier for observability, when the provider knows it.
    fn model_name(&self) -> Option<&str> {
        None
    }
}

/// A shared provider is itself a provider, so wrappers like
/// [`retry::RetryingProvider`] can be layered over an `Arc`.
impl<P: LlmProvider> LlmProvider for Arc<P> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, Error> {
        self.as_ref().complete(request).await
    }

    fn model_name(&self) -> Option<&str> {
        self.as_ref().model_name()
    }
}
