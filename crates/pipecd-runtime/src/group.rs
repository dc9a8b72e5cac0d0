//! Fail-fast task group
//!
//! Every long-running component of a binary is spawned into one [`Group`].
//! All tasks share a cancellation token. The first task that returns an
//! error cancels the token, and [`Group::wait`] reports that error once every
//! task has exited.

use pipecd_common::{Error, Result};
use std::future::Future;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Structured-concurrency scope with errgroup semantics
pub struct Group {
    token: CancellationToken,
    tasks: JoinSet<(String, Result<()>)>,
}

impl Group {
    /// Create a group whose token is a child of `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Token cancelled on shutdown or on the first task failure
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a named task; the closure receives the group token
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let fut = f(self.token.clone());
        self.tasks.spawn(async move { (name, fut.await) });
    }

    /// Number of tasks not yet joined
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Join every task and return the first error
    pub async fn wait(mut self) -> Result<()> {
        let mut first: Option<Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let (name, result) = match joined {
                Ok(v) => v,
                Err(e) => ("<panicked>".to_string(), Err(Error::internal(format!("task failed: {e}")))),
            };
            match result {
                Ok(()) => debug!(task = %name, "task finished"),
                Err(e) => {
                    error!(task = %name, error = %e, "task returned an error");
                    self.token.cancel();
                    if first.is_none() {
                        first = Some(e);
                    }
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_group_all_ok() {
        let root = CancellationToken::new();
        let mut g = Group::new(&root);
        g.spawn("a", |_| async { Ok(()) });
        g.spawn("b", |_| async { Ok(()) });
        assert_eq!(g.len(), 2);
        g.wait().await.unwrap();
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_group_fail_fast_cancels_siblings() {
        let root = CancellationToken::new();
        let mut g = Group::new(&root);
        let sibling_cancelled = Arc::new(AtomicBool::new(false));

        let flag = sibling_cancelled.clone();
        g.spawn("long", move |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        g.spawn("failing", |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(Error::internal("boom"))
        });
        g.spawn("late-failing", |token| async move {
            token.cancelled().await;
            Err(Error::internal("second"))
        });

        let err = g.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert!(sibling_cancelled.load(Ordering::SeqCst));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_group_parent_cancellation() {
        let root = CancellationToken::new();
        let mut g = Group::new(&root);
        g.spawn("waiter", |token| async move {
            token.cancelled().await;
            Ok(())
        });
        root.cancel();
        g.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_group_panic_is_error() {
        let root = CancellationToken::new();
        let mut g = Group::new(&root);
        g.spawn("panics", |_| async {
            let v: Option<()> = None;
            v.expect("kaboom");
            Ok(())
        });
        assert!(g.wait().await.is_err());
    }
}
