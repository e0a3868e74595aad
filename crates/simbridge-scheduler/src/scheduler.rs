use std::any::Any;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use simbridge_types::BridgeError;

use crate::alert::Alerter;
use crate::duty::Duty;

/// Counters kept per duty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DutyStats {
    pub started: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Marks a duty busy for as long as it is alive.
#[derive(Debug)]
pub struct DutyGuard {
    duty: Duty,
    flag: Arc<AtomicBool>,
}

impl DutyGuard {
    pub fn duty(&self) -> Duty {
        self.duty
    }
}

impl Drop for DutyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        debug!(duty = %self.duty, "duty released");
    }
}

/// Runs each duty on its own task with at most one instance in flight.
///
/// Triggering a busy duty is skipped, not queued; the next trigger is the
/// retry. Errors and panics are reported to the alerter and always release
/// the duty.
pub struct DutyScheduler {
    flags: HashMap<Duty, Arc<AtomicBool>>,
    stats: Arc<DashMap<Duty, DutyStats>>,
    alerter: Arc<dyn Alerter>,
}

impl DutyScheduler {
    pub fn new(alerter: Arc<dyn Alerter>) -> Self {
        Self {
            flags: Duty::ALL
                .into_iter()
                .map(|duty| (duty, Arc::new(AtomicBool::new(false))))
                .collect(),
            stats: Arc::new(DashMap::new()),
            alerter,
        }
    }

    pub fn alerter(&self) -> Arc<dyn Alerter> {
        Arc::clone(&self.alerter)
    }

    pub fn is_busy(&self, duty: Duty) -> bool {
        self.flags[&duty].load(Ordering::Acquire)
    }

    pub fn stats(&self, duty: Duty) -> DutyStats {
        self.stats.get(&duty).map(|s| *s).unwrap_or_default()
    }

    /// Mark `duty` busy, or return `None` if it already is.
    pub fn try_acquire(&self, duty: Duty) -> Option<DutyGuard> {
        let flag = &self.flags[&duty];
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DutyGuard {
                duty,
                flag: Arc::clone(flag),
            })
    }

    /// Start `body` unless `duty` is already running. Returns whether it started.
    pub fn trigger<F>(&self, duty: Duty, body: F) -> bool
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        self.spawn(duty, body).is_some()
    }

    /// Like [`trigger`](Self::trigger), returning a handle that completes
    /// once the duty has finished and been released.
    pub fn spawn<F>(&self, duty: Duty, body: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let Some(guard) = self.try_acquire(duty) else {
            self.stats.entry(duty).or_default().skipped += 1;
            info!(%duty, "duty still running, skipping");
            return None;
        };
        self.stats.entry(duty).or_default().started += 1;

        let stats = Arc::clone(&self.stats);
        let alerter = Arc::clone(&self.alerter);
        Some(tokio::spawn(async move {
            let _guard = guard;
            let details = match tokio::spawn(body).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => json!({
                    "duty": duty.name(),
                    "error": err.to_string(),
                    "chain": error_chain(&err),
                }),
                Err(join) if join.is_panic() => json!({
                    "duty": duty.name(),
                    "panic": panic_message(join.into_panic()),
                }),
                Err(join) => json!({
                    "duty": duty.name(),
                    "error": join.to_string(),
                }),
            };
            stats.entry(duty).or_default().failed += 1;
            error!(%duty, %details, "duty failed");
            alerter.alert(&format!("{duty} duty failed"), details).await;
        }))
    }

    /// Poll until none of `duties` is busy, logging what is still running.
    pub async fn wait_idle(&self, duties: &[Duty], poll: Duration) {
        loop {
            let busy: Vec<&'static str> = duties
                .iter()
                .filter(|d| self.is_busy(**d))
                .map(|d| d.name())
                .collect();
            if busy.is_empty() {
                return;
            }
            info!(?busy, "waiting for duties to finish");
            tokio::time::sleep(poll).await;
        }
    }
}

fn error_chain(err: &(dyn StdError + 'static)) -> Value {
    let chain: Vec<String> = std::iter::successors(Some(err), |e| (*e).source())
        .map(|e| e.to_string())
        .collect();
    json!(chain)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::MemoryAlerter;
    use tokio::sync::oneshot;

    fn scheduler() -> (DutyScheduler, Arc<MemoryAlerter>) {
        let alerter = Arc::new(MemoryAlerter::new());
        (DutyScheduler::new(alerter.clone()), alerter)
    }

    #[tokio::test]
    async fn test_busy_duty_is_skipped() {
        let (scheduler, _) = scheduler();
        let (release, wait) = oneshot::channel::<()>();

        let handle = scheduler
            .spawn(Duty::Reward, async move {
                let _ = wait.await;
                Ok(())
            })
            .unwrap();
        assert!(scheduler.is_busy(Duty::Reward));
        assert!(!scheduler.trigger(Duty::Reward, async { Ok(()) }));
        assert!(!scheduler.is_busy(Duty::Save));

        release.send(()).unwrap();
        handle.await.unwrap();
        assert!(!scheduler.is_busy(Duty::Reward));
        assert_eq!(
            scheduler.stats(Duty::Reward),
            DutyStats { started: 1, skipped: 1, failed: 0 }
        );
    }

    #[tokio::test]
    async fn test_trigger_after_completion_runs_once() {
        let (scheduler, _) = scheduler();
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..3 {
            let runs = runs.clone();
            let handle = scheduler
                .spawn(Duty::Save, async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            handle.await.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.stats(Duty::Save).started, 3);
    }

    #[tokio::test]
    async fn test_error_releases_and_alerts() {
        let (scheduler, alerter) = scheduler();
        let handle = scheduler
            .spawn(Duty::Maintain, async {
                Err(BridgeError::Internal("metagraph unavailable".into()))
            })
            .unwrap();
        handle.await.unwrap();

        assert!(!scheduler.is_busy(Duty::Maintain));
        assert_eq!(scheduler.stats(Duty::Maintain).failed, 1);
        let alerts = alerter.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].details["duty"], "maintain");
        assert!(
            alerts[0].details["error"]
                .as_str()
                .unwrap()
                .contains("metagraph unavailable")
        );
    }

    #[tokio::test]
    async fn test_panic_releases_and_alerts() {
        let (scheduler, alerter) = scheduler();
        let handle = scheduler
            .spawn(Duty::Archive, async {
                if true {
                    panic!("disk vanished");
                }
                Ok(())
            })
            .unwrap();
        handle.await.unwrap();

        assert!(!scheduler.is_busy(Duty::Archive));
        assert_eq!(alerter.alerts()[0].details["panic"], "disk vanished");
        assert!(scheduler.trigger(Duty::Archive, async { Ok(()) }));
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_release() {
        let (scheduler, _) = scheduler();
        let guard = scheduler.try_acquire(Duty::Reward).unwrap();
        assert!(scheduler.try_acquire(Duty::Reward).is_none());

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        tokio::time::timeout(
            Duration::from_secs(2),
            scheduler.wait_idle(&[Duty::Reward, Duty::Maintain], Duration::from_millis(5)),
        )
        .await
        .unwrap();
        release.await.unwrap();
    }
}
