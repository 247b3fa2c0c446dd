use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::Tool;
use crate::errors::{AgentError, AgentResult};
use crate::models::tool::ToolDescriptor;

type Handler =
    Arc<dyn Fn(Value, CancellationToken) -> BoxFuture<'static, AgentResult<String>> + Send + Sync>;

/// A tool backed by an async closure
#[derive(Clone)]
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    handler: Handler,
}

impl FunctionTool {
    /// Wrap a closure that takes the raw JSON arguments
    pub fn new<F, Fut>(descriptor: ToolDescriptor, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        Self::cancellable(descriptor, move |args, _cancel| f(args))
    }

    /// Wrap a closure that also receives the conversation's cancellation token,
    /// for long-running work that should stop early
    pub fn cancellable<F, Fut>(descriptor: ToolDescriptor, f: F) -> Self
    where
        F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args: Value, cancel: CancellationToken| {
            let fut = f(args, cancel);
            async move { fut.await.map_err(|e| AgentError::ToolExecution(e.to_string())) }
                .boxed()
        });
        Self {
            descriptor,
            handler,
        }
    }

    /// Wrap a closure over a typed argument struct
    pub fn typed<A, F, Fut>(descriptor: ToolDescriptor, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args: Value, _cancel: CancellationToken| {
            let f = Arc::clone(&f);
            async move {
                let typed: A = serde_json::from_value(args)
                    .map_err(|e| AgentError::InvalidToolArguments(e.to_string()))?;
                f(typed)
                    .await
                    .map_err(|e| AgentError::ToolExecution(e.to_string()))
            }
            .boxed()
        });
        Self {
            descriptor,
            handler,
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn call(&self, args: Value) -> AgentResult<String> {
        (self.handler)(args, CancellationToken::new()).await
    }

    async fn call_with_cancel(&self, args: Value, cancel: CancellationToken) -> AgentResult<String> {
        (self.handler)(args, cancel).await
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
