use crate::orchestrator::{Trigger, TriggerHandle};
use anyhow::Result;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

pub fn period_for_minutes(minutes: u64) -> Duration {
    Duration::from_secs(minutes.max(1) * 60)
}

/// Fires a [`Trigger::Timer`] every cycle period.
pub struct CycleTimer {
    scheduler: JobScheduler,
    trigger: TriggerHandle,
    job: Mutex<(Uuid, Duration)>,
}

impl CycleTimer {
    /// Initialize and start the scheduler
    pub async fn start(trigger: TriggerHandle, period: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        let uuid = scheduler.add(timer_job(trigger.clone(), period)?).await?;
        scheduler.start().await?;
        info!("✓ Scheduler started, cycle every {:?}", period);

        Ok(Self {
            scheduler,
            trigger,
            job: Mutex::new((uuid, period)),
        })
    }

    pub async fn period(&self) -> Duration {
        self.job.lock().await.1
    }

    /// Replace the timer job. Returns false if the period is unchanged.
    pub async fn reschedule(&self, period: Duration) -> Result<bool> {
        let mut job = self.job.lock().await;
        if job.1 == period {
            return Ok(false);
        }

        let uuid = self
            .scheduler
            .add(timer_job(self.trigger.clone(), period)?)
            .await?;
        self.scheduler.remove(&job.0).await?;
        *job = (uuid, period);

        info!("Cycle interval changed to {:?}", period);
        Ok(true)
    }

    /// Follow interval changes published by the orchestrator.
    pub fn follow(
        self: std::sync::Arc<Self>,
        mut minutes: watch::Receiver<u64>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = minutes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let period = period_for_minutes(*minutes.borrow_and_update());
                        if let Err(e) = self.reschedule(period).await {
                            error!("Failed to reschedule cycle timer: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        info!("Scheduler stopped");
        Ok(())
    }
}

fn timer_job(trigger: TriggerHandle, period: Duration) -> Result<Job> {
    let job = Job::new_repeated_async(period, move |_uuid, _l| {
        let trigger = trigger.clone();
        Box::pin(async move {
            trigger.trigger(Trigger::Timer);
        })
    })?;
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::trigger_channel;

    #[test]
    fn test_period_for_minutes() {
        assert_eq!(period_for_minutes(60), Duration::from_secs(3600));
        assert_eq!(period_for_minutes(0), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_timer_fires_trigger() {
        let (handle, mut receiver) = trigger_channel();
        let timer = CycleTimer::start(handle, Duration::from_secs(1))
            .await
            .unwrap();

        let trigger = tokio::time::timeout(Duration::from_secs(10), receiver.recv())
            .await
            .expect("timer did not fire");
        assert_eq!(trigger, Some(Trigger::Timer));

        timer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reschedule_only_on_change() {
        let (handle, _receiver) = trigger_channel();
        let timer = CycleTimer::start(handle, period_for_minutes(60))
            .await
            .unwrap();

        assert!(!timer.reschedule(period_for_minutes(60)).await.unwrap());
        assert!(timer.reschedule(period_for_minutes(5)).await.unwrap());
        assert_eq!(timer.period().await, Duration::from_secs(300));

        timer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_follow_applies_interval_updates() {
        let (handle, _receiver) = trigger_channel();
        let timer = std::sync::Arc::new(
            CycleTimer::start(handle, period_for_minutes(60))
                .await
                .unwrap(),
        );
        let (minutes, updates) = watch::channel(60u64);
        let cancel = CancellationToken::new();
        let follower = timer.clone().follow(updates, cancel.clone());

        minutes.send(15).unwrap();
        for _ in 0..50 {
            if timer.period().await == Duration::from_secs(900) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(timer.period().await, Duration::from_secs(900));

        cancel.cancel();
        follower.await.unwrap();
        timer.shutdown().await.unwrap();
    }
}
