//! Process lifecycle: starts the clock probe at boot and stops it, with a
//! bounded wait, when a termination signal arrives.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::probe::{Clock, ClockProbe, ProbeHandle};
use crate::status::StatusCell;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Running,
    Stopping,
}

/// Outcome of a shutdown sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The probe confirmed exit inside the grace period.
    pub probe_confirmed: bool,
    pub waited: Duration,
}

struct Inner {
    state: LifecycleState,
    probe: Option<ProbeHandle>,
}

pub struct LifecycleController {
    interval: Duration,
    inner: Mutex<Inner>,
}

impl LifecycleController {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Mutex::new(Inner {
                state: LifecycleState::Stopped,
                probe: None,
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// Launch the clock probe. Valid only from `Stopped`.
    ///
    /// Returns the probe's cycle counter for health reporting.
    pub fn start(&self, clock: Arc<dyn Clock>, cell: Arc<StatusCell>) -> Result<Arc<AtomicU64>> {
        let mut inner = self.lock();
        if inner.state != LifecycleState::Stopped {
            return Err(anyhow!("lifecycle start requested while {:?}", inner.state));
        }
        let handle = ClockProbe::new(clock, cell, self.interval).spawn()?;
        let cycles = handle.cycle_counter();
        inner.probe = Some(handle);
        inner.state = LifecycleState::Running;
        log::info!(
            "clock probe started (interval {} s)",
            self.interval.as_secs_f32()
        );
        Ok(cycles)
    }

    /// Cancel the probe and wait at most `grace` for it to exit.
    ///
    /// Always ends in `Stopped`, whether or not the probe confirmed.
    pub fn shutdown(&self, grace: Duration) -> Result<ShutdownReport> {
        let probe = {
            let mut inner = self.lock();
            if inner.state != LifecycleState::Running {
                return Ok(ShutdownReport {
                    probe_confirmed: true,
                    waited: Duration::ZERO,
                });
            }
            inner.state = LifecycleState::Stopping;
            inner.probe.take()
        };

        let started = Instant::now();
        let result = match probe {
            Some(handle) => handle.stop(grace),
            None => Ok(true),
        };
        let waited = started.elapsed();
        self.lock().state = LifecycleState::Stopped;

        let probe_confirmed = result?;
        if probe_confirmed {
            log::info!("clock probe stopped after {} ms", waited.as_millis());
        } else {
            log::warn!("clock probe still running after grace period; continuing shutdown");
        }
        Ok(ShutdownReport {
            probe_confirmed,
            waited,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
