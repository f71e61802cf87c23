//! Interval scheduling for pipeline runs.
//!
//! One run at a time: a trigger that fires while a run is in progress is
//! skipped, not queued. Ctrl-C requests a cooperative stop; the active run
//! finishes its current page before exiting.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::models::{PipelineRun, RunStatus};
use crate::pipeline::Pipeline;

pub struct Scheduler {
    config: AppConfig,
    pipeline: Pipeline,
    // Held for the duration of a run; try_lock failure means skip.
    run_guard: Mutex<()>,
}

impl Scheduler {
    pub fn new(config: AppConfig) -> Result<Self> {
        let pipeline = Pipeline::new(config.clone())?;
        Ok(Self {
            config,
            pipeline,
            run_guard: Mutex::new(()),
        })
    }

    /// One pipeline pass plus export. The caller decides what a failed run
    /// means; partial results are already committed and exported.
    pub async fn run_once(&self) -> Result<PipelineRun> {
        let run = self.pipeline.run(None).await?;
        if !self.pipeline.store().is_empty() {
            self.pipeline
                .store()
                .export(&self.config.storage.export_format, &self.config.storage.data_dir)
                .context("Export failed")?;
        }
        Ok(run)
    }

    /// Run on the configured interval until Ctrl-C.
    pub async fn run_forever(&self, run_immediately: bool) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; finishing current page");
                let _ = stop_tx.send(true);
            }
        });

        // Clamped again here; a zero-length tokio interval panics.
        let days = self.config.schedule_interval_days.max(1);
        let period = Duration::from_secs(days * 24 * 60 * 60);
        info!(
            interval_days = self.config.schedule_interval_days,
            run_immediately, "scheduler started"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; it doubles
        // as the startup run when one was requested.
        if !run_immediately {
            ticker.tick().await;
        }

        let mut stop = stop_rx.clone();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.trigger(stop_rx.clone()).await;
                    if *stop.borrow() {
                        break;
                    }
                }
                _ = stop.changed() => break,
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    /// Run the pipeline unless one is already in flight.
    async fn trigger(&self, stop: watch::Receiver<bool>) {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("previous run still in progress; skipping this trigger");
            return;
        };

        match self.pipeline.run(Some(stop)).await {
            Ok(run) => {
                if run.status == RunStatus::Failed {
                    warn!("scheduled run failed; next trigger will retry");
                }
                if let Err(err) = self
                    .pipeline
                    .store()
                    .export(&self.config.storage.export_format, &self.config.storage.data_dir)
                {
                    error!(error = %err, "export failed");
                }
            }
            Err(err) => error!(error = %err, "could not start scheduled run"),
        }
    }
}
