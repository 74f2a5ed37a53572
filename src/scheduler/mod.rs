use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::config::{FileConfigManager, ScheduleConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{RelayError, Result};
use crate::store::keys;

pub const EOL_SWEEP_ALARM: &str = "eol-sweep";

/// What the store shows about a named alarm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub name: String,
    pub next_fire_at: DateTime<Utc>,
    pub interval_secs: u64,
}

/// First `time_of_day + k * interval` (UTC) strictly after `after`.
pub fn next_fire_after(after: DateTime<Utc>, time_of_day: NaiveTime, interval: Duration) -> DateTime<Utc> {
    let anchor = after.date_naive().and_time(time_of_day).and_utc();
    if anchor > after {
        return anchor;
    }

    let step = ChronoDuration::from_std(interval).unwrap_or_else(|_| ChronoDuration::days(1));
    let step_ms = step.num_milliseconds().max(1);
    let elapsed_ms = (after - anchor).num_milliseconds();
    let periods = elapsed_ms / step_ms + 1;
    anchor + ChronoDuration::milliseconds(periods * step_ms)
}

/// Fires the ended-listing sweep on a fixed daily anchor and interval.
pub struct EolSweepScheduler {
    dispatcher: Dispatcher,
    time_of_day: NaiveTime,
    interval: Duration,
    shutdown: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl EolSweepScheduler {
    pub fn new(dispatcher: Dispatcher, schedule: &ScheduleConfig) -> Result<Self> {
        let time_of_day = FileConfigManager::parse_time_of_day(&schedule.time_of_day)?;
        let interval = FileConfigManager::parse_time_to_duration(&schedule.interval)?;
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            dispatcher,
            time_of_day,
            interval,
            shutdown,
            task: None,
        })
    }

    pub fn next_fire_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        next_fire_after(after, self.time_of_day, self.interval)
    }

    /// Records the next fire time under `alarm:eol-sweep`.
    pub async fn arm(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = self.next_fire_after(after);
        let alarm = Alarm {
            name: EOL_SWEEP_ALARM.to_string(),
            next_fire_at: next,
            interval_secs: self.interval.as_secs(),
        };
        self.dispatcher
            .store()
            .set_json(&keys::alarm(EOL_SWEEP_ALARM), &alarm)
            .await?;
        Ok(next)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Err(RelayError::Config("Sweep scheduler already running".to_string()).into());
        }

        let scheduler = Self {
            dispatcher: self.dispatcher.clone(),
            time_of_day: self.time_of_day,
            interval: self.interval,
            shutdown: self.shutdown.clone(),
            task: None,
        };
        let mut shutdown_rx = self.shutdown.subscribe();

        self.task = Some(tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let next = match scheduler.arm(after).await {
                    Ok(next) => next,
                    Err(e) => {
                        error!("Could not arm {} alarm: {}", EOL_SWEEP_ALARM, e);
                        scheduler.next_fire_after(after)
                    }
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                info!("Next ended-listing sweep at {} (in {:?})", next, wait);

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Sweep scheduler received shutdown signal");
                        break;
                    }
                    _ = sleep(wait) => {
                        info!("Alarm {} fired", EOL_SWEEP_ALARM);
                        if let Err(e) = scheduler.dispatcher.start_eol_sweep().await {
                            error!("Ended-listing sweep failed to start: {}", e);
                        }
                        after = next;
                    }
                }
            }
        }));

        Ok(())
    }

    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
