//! Error and panic boundary for user-supplied hooks

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use tracing::{error, warn};

/// Await a hook, logging (and swallowing) any error or panic it raises
///
/// Returns `true` when the hook completed successfully.
pub async fn guard_hook<F>(name: &str, hook: F) -> bool
where
    F: Future<Output = anyhow::Result<()>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Hook {} failed: {:#}", name, e);
            false
        }
        Err(panic) => {
            error!("Hook {} panicked: {}", name, panic_reason(panic.as_ref()));
            false
        }
    }
}

/// Run a synchronous hook, logging (and swallowing) a panic
pub fn guard_sync_hook<F>(name: &str, hook: F) -> bool
where
    F: FnOnce(),
{
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(()) => true,
        Err(panic) => {
            error!("Hook {} panicked: {}", name, panic_reason(panic.as_ref()));
            false
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ok_hook() {
        assert!(guard_hook("ok", async { Ok(()) }).await);
    }

    #[tokio::test]
    async fn test_failing_hook_is_contained() {
        assert!(!guard_hook("err", async { Err(anyhow::anyhow!("boom")) }).await);
    }

    #[tokio::test]
    async fn test_panicking_hook_is_contained() {
        let hook = async {
            if true {
                panic!("hook exploded");
            }
            Ok(())
        };
        assert!(!guard_hook("panic", hook).await);
    }

    #[test]
    fn test_sync_hook_panic_is_contained() {
        let mut calls = 0;
        assert!(guard_sync_hook("count", || calls += 1));
        assert_eq!(calls, 1);

        assert!(!guard_sync_hook("panic", || panic!("sync hook exploded")));
    }
}
