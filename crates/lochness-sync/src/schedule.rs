//! Cycle scheduling: an optional not-before gate, then one cycle or a
//! cycle every `poll_interval` until shutdown.

use crate::error::ConfigError;
use chrono::{Local, NaiveDateTime, TimeZone};
use lochness_transfer::Timestamp;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Format accepted by `--until`, in local time.
pub const UNTIL_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a `--until` value such as `2017-01-01T15:00:00` (local time).
pub fn parse_until(value: &str) -> Result<Timestamp, ConfigError> {
    let naive = NaiveDateTime::parse_from_str(value, UNTIL_FORMAT)
        .map_err(|e| ConfigError::Invalid(format!("--until {value:?}: {e}")))?;
    let local = Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| ConfigError::Invalid(format!("--until {value:?} does not exist locally")))?;
    Ok(Timestamp::from_micros(local.timestamp_micros().max(0) as u64))
}

/// When cycles run.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    /// Hold off the first cycle until this time.
    pub not_before: Option<Timestamp>,
    /// Sleep between continuous cycles.
    pub poll_interval: Duration,
    /// Keep running cycles instead of stopping after one.
    pub continuous: bool,
}

impl Schedule {
    /// Drive `cycle` according to the schedule.
    ///
    /// Stops when a cycle returns `Err`, after the single cycle in one-shot
    /// mode, or when `shutdown` flips to `true` while waiting. Returns the
    /// output of the last completed cycle.
    pub async fn run<R, E, F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        mut cycle: F,
    ) -> Result<Option<R>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if let Some(not_before) = self.not_before {
            let now = Timestamp::now();
            if not_before > now {
                let delay = Duration::from_micros(not_before.as_micros() - now.as_micros());
                info!(until = %not_before, "waiting before first cycle");
                if wait_or_shutdown(delay, &mut shutdown).await {
                    return Ok(None);
                }
            }
        }

        loop {
            let output = cycle().await?;
            if !self.continuous {
                return Ok(Some(output));
            }
            info!(seconds = self.poll_interval.as_secs(), "sleeping until next cycle");
            if wait_or_shutdown(self.poll_interval, &mut shutdown).await {
                info!("shutdown requested; stopping");
                return Ok(Some(output));
            }
        }
    }
}

/// Sleep for `delay`; true if shutdown was requested first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = shutdown.changed() => match changed {
                Ok(()) if *shutdown.borrow() => return true,
                Ok(()) => continue,
                Err(_) => {
                    // Sender gone: nobody can request shutdown any more.
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}
