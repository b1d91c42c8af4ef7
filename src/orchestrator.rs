//! Fan-out of per-context work, sequential or parallel.
//!
//! Parallel mode runs one worker per context under a shared cancellation
//! token: the first failure cancels the siblings, every worker is awaited
//! before returning, and the collected errors are sorted by context name and
//! folded into one aggregate. Sequential mode iterates sorted names and
//! stops at the first error.

use futures::future::join_all;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Run `f` once per context.
///
/// `contexts` is iterated in sorted order. The token handed to `f` is a
/// child of `cancel`; workers are expected to stop issuing daemon calls
/// once it fires.
pub async fn for_each_context<F, Fut>(
    contexts: &[String],
    parallel: bool,
    cancel: &CancellationToken,
    f: F,
) -> Result<()>
where
    F: Fn(String, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut names: Vec<String> = contexts.to_vec();
    names.sort();
    names.dedup();

    if names.len() <= 1 || !parallel {
        for name in names {
            if cancel.is_cancelled() {
                return Err(cancelled(&name));
            }
            f(name.clone(), cancel.child_token()).await?;
        }
        return Ok(());
    }

    let token = cancel.child_token();
    let workers = names.iter().map(|name| {
        let name = name.clone();
        let token = token.clone();
        let fut = f(name.clone(), token.clone());
        async move {
            let result = tokio::select! {
                () = token.cancelled() => Err(cancelled(&name)),
                result = fut => result,
            };
            if result.is_err() {
                debug!("context {name} failed, cancelling siblings");
                token.cancel();
            }
            (name, result)
        }
    });

    let mut failures: Vec<(String, Error)> = join_all(workers)
        .await
        .into_iter()
        .filter_map(|(name, result)| result.err().map(|e| (name, e)))
        .collect();

    if failures.is_empty() {
        return Ok(());
    }
    failures.sort_by(|a, b| a.0.cmp(&b.0));
    Err(Error::aggregate(
        failures
            .into_iter()
            .map(|(name, e)| (format!("context {name}"), e))
            .collect(),
    ))
}

fn cancelled(context: &str) -> Error {
    Error::external("orchestrator", format!("context {context} cancelled"))
}
