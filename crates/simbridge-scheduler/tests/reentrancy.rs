use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use simbridge_scheduler::{Duty, DutyScheduler, MemoryAlerter};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_start_one_instance() {
    let scheduler = Arc::new(DutyScheduler::new(Arc::new(MemoryAlerter::new())));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut triggers = Vec::new();
    for _ in 0..32 {
        let scheduler = scheduler.clone();
        let running = running.clone();
        let peak = peak.clone();
        triggers.push(tokio::spawn(async move {
            scheduler.trigger(Duty::Reward, async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }));
    }

    let mut started = 0;
    for trigger in triggers {
        if trigger.await.unwrap() {
            started += 1;
        }
    }
    scheduler
        .wait_idle(&[Duty::Reward], Duration::from_millis(10))
        .await;

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let stats = scheduler.stats(Duty::Reward);
    assert_eq!(stats.started, started);
    assert_eq!(stats.started + stats.skipped, 32);
}

#[tokio::test]
async fn test_duties_run_independently() {
    let scheduler = DutyScheduler::new(Arc::new(MemoryAlerter::new()));
    let _reward = scheduler.try_acquire(Duty::Reward).unwrap();

    for duty in [Duty::Maintain, Duty::Save, Duty::Archive, Duty::Report] {
        let handle = scheduler.spawn(duty, async { Ok(()) }).unwrap();
        handle.await.unwrap();
        assert!(!scheduler.is_busy(duty));
    }
    assert!(scheduler.is_busy(Duty::Reward));
}
