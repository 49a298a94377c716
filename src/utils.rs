//! # Utility Functions
//!
//! Small helpers shared across the gateway core: pinning a long-lived
//! dispatch task to a specific CPU core, and a monotonic-ish wall-clock
//! timestamp for log correlation.

use anyhow::{anyhow, Result};
use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Spawns a future on a new thread pinned to a specific CPU core.
///
/// Used to give a device's scheduler dispatch loop (spec §4.5, §5) a
/// dedicated core under heavy fan-out, keeping its batching cadence free of
/// scheduling jitter from the rest of the Tokio runtime. If `core_id` is
/// `None`, the future just runs on the caller's runtime.
pub async fn spawn_with_affinity<F, T>(future: F, core_id: Option<usize>) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match core_id {
        Some(id) => {
            let handle = tokio::task::spawn_blocking(move || {
                let core_ids = core_affinity::get_core_ids()
                    .ok_or_else(|| anyhow!("Failed to get core IDs, is this a supported platform?"))?;

                if core_ids.is_empty() {
                    return Err(anyhow!("No available CPU cores found."));
                }

                let target_core = core_ids.get(id).ok_or_else(|| {
                    anyhow!(
                        "Invalid core ID: {}. System has {} available cores (valid IDs are 0 to {}).",
                        id,
                        core_ids.len(),
                        core_ids.len() - 1
                    )
                })?;

                if !core_affinity::set_for_current(*target_core) {
                    warn!("Failed to set affinity for core ID: {}", id);
                }

                let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
                rt.block_on(future)
            });
            handle.await?
        }
        None => future.await,
    }
}

/// Current wall-clock time as nanoseconds since the Unix epoch, used to
/// stamp diagnostics and discovery results. Falls back to 0 rather than
/// panicking if the system clock is somehow before the epoch.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[tokio::test]
    async fn spawn_with_affinity_retrieves_result() {
        let future = async { Ok("done") };
        let core_id = if core_affinity::get_core_ids().is_some() { Some(0) } else { None };
        let result = spawn_with_affinity(future, core_id).await.unwrap();
        assert_eq!(result, "done");
    }

    #[tokio::test]
    async fn spawn_with_affinity_uses_new_thread() {
        let main_thread_id = thread::current().id();
        let future = async move { Ok(thread::current().id()) };
        let core_id = if core_affinity::get_core_ids().is_some() { Some(0) } else { None };

        if core_id.is_some() {
            let future_thread_id = spawn_with_affinity(future, core_id).await.unwrap();
            assert_ne!(main_thread_id, future_thread_id, "future should have run on a different thread");
        }
    }

    #[tokio::test]
    async fn spawn_with_affinity_invalid_core_id_reports_bounds() {
        let future = async { Ok(()) };
        if let Some(cores) = core_affinity::get_core_ids() {
            let result = spawn_with_affinity(future, Some(9999)).await;
            assert!(result.is_err());
            let expected = format!(
                "Invalid core ID: 9999. System has {} available cores (valid IDs are 0 to {}).",
                cores.len(),
                cores.len() - 1
            );
            assert_eq!(result.err().unwrap().to_string(), expected);
        }
    }

    #[test]
    fn current_timestamp_ns_is_nonzero() {
        assert!(current_timestamp_ns() > 0);
    }
}
