//! Background clock probe.
//!
//! Samples the wall clock on a fixed interval and publishes a fresh
//! `StatusSnapshot` to the shared `StatusCell`. The sleep between cycles
//! waits on a cancellation channel, so `ProbeHandle::stop` interrupts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};

use crate::status::{StatusCell, StatusSnapshot};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<DateTime<Local>>;
}

/// The system wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<DateTime<Local>> {
        Ok(Local::now())
    }
}

pub struct ClockProbe {
    clock: Arc<dyn Clock>,
    cell: Arc<StatusCell>,
    interval: Duration,
}

impl ClockProbe {
    pub fn new(clock: Arc<dyn Clock>, cell: Arc<StatusCell>, interval: Duration) -> Self {
        Self {
            clock,
            cell,
            interval,
        }
    }

    /// Run one sample-publish cycle. Returns the published snapshot.
    pub fn tick(&self) -> Result<StatusSnapshot> {
        let at = self.clock.now().context("sample wall clock")?;
        let snapshot = StatusSnapshot::from_instant(at);
        self.cell.publish(snapshot.clone());
        log::info!(
            "[{}] seconds={} -> divisible_by_2={}",
            snapshot.timestamp(),
            snapshot.second(),
            snapshot.divisible_by_2()
        );
        Ok(snapshot)
    }

    /// Start the probe loop on a dedicated thread.
    pub fn spawn(self) -> Result<ProbeHandle> {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let cycles = Arc::new(AtomicU64::new(0));
        let cycles_thread = cycles.clone();

        let join = std::thread::Builder::new()
            .name("clock-probe".to_string())
            .spawn(move || {
                loop {
                    if let Err(err) = self.tick() {
                        log::warn!("clock probe cycle failed: {:#}", err);
                    }
                    cycles_thread.fetch_add(1, Ordering::SeqCst);
                    match cancel_rx.recv_timeout(self.interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        // Explicit stop, or the handle was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("clock probe exiting");
                let _ = done_tx.send(());
            })
            .context("spawn clock probe thread")?;

        Ok(ProbeHandle {
            cancel: Some(cancel_tx),
            done: done_rx,
            cycles,
            join: Some(join),
        })
    }
}

/// Handle to a running probe.
#[derive(Debug)]
pub struct ProbeHandle {
    cancel: Option<Sender<()>>,
    done: mpsc::Receiver<()>,
    cycles: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl ProbeHandle {
    /// Completed probe cycles, including failed samples.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn cycle_counter(&self) -> Arc<AtomicU64> {
        self.cycles.clone()
    }

    /// Signal cancellation and wait at most `grace` for the probe to exit.
    ///
    /// Returns `Ok(true)` when the probe confirmed exit, `Ok(false)` when the
    /// grace period elapsed and the thread was left detached.
    pub fn stop(mut self, grace: Duration) -> Result<bool> {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "clock probe did not exit within {} ms; detaching",
                    grace.as_millis()
                );
                self.join.take();
                return Ok(false);
            }
        }
        if let Some(join) = self.join.take() {
            // The done signal is the thread's last statement.
            join.join()
                .map_err(|_| anyhow!("clock probe thread panicked"))?;
        }
        Ok(true)
    }
}
