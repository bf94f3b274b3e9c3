use std::future::Future;

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, warn};

/// Outcome of a fan-out across nodes.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, anyhow::Error)>,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    /// The first failure in target order, or `Ok`.
    pub fn into_result(self) -> Result<()> {
        match self.failed.into_iter().next() {
            Some((addr, e)) => Err(e.context(format!("on {addr}"))),
            None => Ok(()),
        }
    }
}

/// Run `f` for every address concurrently and wait for all of them.
///
/// Every failure is logged; the first one in target order is returned.
pub async fn on_nodes<'a, F, Fut>(what: &str, addrs: &'a [String], f: F) -> Result<()>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    collect(what, addrs, f).await.into_result()
}

/// Like [`on_nodes`] but returns the per-node outcome.
pub async fn collect<'a, F, Fut>(what: &str, addrs: &'a [String], f: F) -> BatchResult
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let outcomes = join_all(addrs.iter().map(|a| f(a.as_str()))).await;
    let mut result = BatchResult::default();
    for (addr, outcome) in addrs.iter().zip(outcomes) {
        match outcome {
            Ok(()) => result.succeeded.push(addr.clone()),
            Err(e) => {
                warn!(node = %addr, step = what, error = %format!("{e:#}"), "step failed");
                result.failed.push((addr.clone(), e));
            }
        }
    }
    debug!(
        step = what,
        succeeded = result.success_count(),
        failed = result.failure_count(),
        "fan-out complete"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_error_in_target_order() {
        let addrs: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let err = on_nodes("probe", &addrs, |a| async move {
            match a {
                "a" => Ok(()),
                other => anyhow::bail!("{other} broke"),
            }
        })
        .await
        .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("on b"), "{msg}");
        assert!(msg.contains("b broke"), "{msg}");
    }

    #[tokio::test]
    async fn test_collect_counts() {
        let addrs: Vec<String> = vec!["a".into(), "b".into()];
        let r = collect("probe", &addrs, |a| async move {
            if a == "b" { anyhow::bail!("no") } else { Ok(()) }
        })
        .await;
        assert_eq!(r.success_count(), 1);
        assert_eq!(r.failure_count(), 1);
        assert!(on_nodes("empty", &[], |_| async { Ok(()) }).await.is_ok());
    }
}
