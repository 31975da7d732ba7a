//! Job scheduling
//!
//! Four loops share one engine behind a single async mutex:
//! peer polling, session polling, baseline sync and the daily
//! fixation/resumption cycle. Every job runs on the blocking pool because
//! the ledger and the sources do synchronous I/O. A failing job is logged
//! and the loop carries on at its next tick.

use crate::engine::{Engine, Phase, PollReport, RolloverReport};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tally_common::clock::WallClock;
use tally_common::config::Timing;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Signature shared by every engine job
type Job<R> = fn(&mut Engine, DateTime<Utc>) -> tally_common::Result<R>;

pub struct Scheduler {
    engine: Arc<Mutex<Engine>>,
    timing: Timing,
}

impl Scheduler {
    pub fn new(engine: Engine, timing: Timing) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            timing,
        }
    }

    /// Shared handle to the engine
    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        Arc::clone(&self.engine)
    }

    /// One peer poll, queued behind any job holding the engine
    pub async fn poll_peers(&self) -> Option<PollReport> {
        run_job(&self.engine, "peer poll", Engine::poll_peers).await
    }

    /// One session poll, queued behind any job holding the engine
    pub async fn poll_sessions(&self) -> Option<PollReport> {
        run_job(&self.engine, "session poll", Engine::poll_sessions).await
    }

    /// Daily fixation right now, queued behind any job holding the engine
    pub async fn fix_period(&self) -> Option<RolloverReport> {
        run_job(&self.engine, "daily fixation", Engine::fix_period).await
    }

    /// Run a single cycle of every polling job and exit
    pub async fn run_once(&self) -> Result<()> {
        run_job(&self.engine, "startup", Engine::startup).await;
        self.poll_peers().await;
        self.poll_sessions().await;
        run_job(&self.engine, "baseline sync", Engine::sync).await;
        Ok(())
    }

    /// Run until `signal` completes, then stop every loop
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        run_job(&self.engine, "startup", Engine::startup).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = vec![
            self.spawn_interval(
                "peer poll",
                self.timing.poll_interval,
                Engine::poll_peers,
                shutdown_rx.clone(),
            ),
            self.spawn_interval(
                "session poll",
                self.timing.poll_interval,
                Engine::poll_sessions,
                shutdown_rx.clone(),
            ),
            self.spawn_interval(
                "baseline sync",
                self.timing.sync_interval,
                Engine::sync,
                shutdown_rx.clone(),
            ),
            self.spawn_rollover(shutdown_rx),
        ];
        info!(
            "Scheduler running: poll every {}s, sync every {}s, fix at {}, resume at {} ({})",
            self.timing.poll_interval.as_secs(),
            self.timing.sync_interval.as_secs(),
            self.timing.fix_time.format("%H:%M"),
            self.timing.resume_time.format("%H:%M"),
            self.timing.zone
        );

        signal.await;
        info!("Stopping scheduler");
        let _ = shutdown_tx.send(true);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Scheduler task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    fn spawn_interval<R>(
        &self,
        label: &'static str,
        period: Duration,
        job: Job<R>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        R: Debug + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Some(report) = run_job(&engine, label, job).await {
                    debug!("{}: {:?}", label, report);
                }
            }
        })
    }

    /// Alternate between waiting for the fix time and the resume time,
    /// starting from whatever phase the engine is in
    fn spawn_rollover(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        let timing = self.timing;

        tokio::spawn(async move {
            loop {
                let phase = engine.lock().await.phase();
                let at = match phase {
                    Phase::Polling => timing.fix_time,
                    Phase::Paused => timing.resume_time,
                };
                let target = timing.zone.next_occurrence(Utc::now(), at);
                debug!("Next {} transition at {}", phase.as_str(), target);

                tokio::select! {
                    _ = sleep(until(target)) => {}
                    _ = shutdown.changed() => break,
                }

                match phase {
                    Phase::Polling => {
                        if let Some(report) = run_job(&engine, "daily fixation", Engine::fix_period).await {
                            debug!("daily fixation: {:?}", report);
                        }
                    }
                    Phase::Paused => {
                        run_job(&engine, "resume", Engine::resume).await;
                    }
                }
            }
        })
    }
}

fn until(target: DateTime<Utc>) -> Duration {
    (target - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Run one job on the blocking pool under the engine lock
async fn run_job<R>(engine: &Arc<Mutex<Engine>>, label: &'static str, job: Job<R>) -> Option<R>
where
    R: Send + 'static,
{
    let engine = Arc::clone(engine);
    let joined = tokio::task::spawn_blocking(move || {
        let mut engine = engine.blocking_lock();
        let result = job(&mut engine, Utc::now());
        if let Err(e) = &result {
            engine.note_failure(e);
        }
        result
    })
    .await;

    match joined {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) if e.is_fatal() => {
            error!("{} failed: {}", label, e);
            None
        }
        Ok(Err(e)) => {
            warn!("{} failed: {}", label, e);
            None
        }
        Err(e) => {
            error!("{} task panicked: {}", label, e);
            None
        }
    }
}
