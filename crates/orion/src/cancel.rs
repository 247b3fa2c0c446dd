use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::errors::{AgentError, AgentResult};

/// Race `fut` against the token. A fired token wins and yields `Cancelled`; the
/// future is dropped at its current await point.
pub async fn link<F, T>(token: Option<&CancellationToken>, fut: F) -> AgentResult<T>
where
    F: Future<Output = AgentResult<T>>,
{
    match token {
        None => fut.await,
        Some(token) => {
            if token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(AgentError::Cancelled),
                result = fut => result,
            }
        }
    }
}
