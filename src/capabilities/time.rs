use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::model::UnixTimeMs;

pub trait Clock: Send + Sync {
    fn now(&self) -> UnixTimeMs;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UnixTimeMs {
        UnixTimeMs::now()
    }
}

/// Wall time derived from the tokio clock.
///
/// Under a paused test runtime both this clock and the timers from [`TokioScheduler`]
/// advance together, so immobility windows and countdowns can be driven without real sleeps.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
    origin_unix: UnixTimeMs,
}

impl TokioClock {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(UnixTimeMs::now())
    }

    #[must_use]
    pub fn starting_at(origin_unix: UnixTimeMs) -> Self {
        Self {
            origin: Instant::now(),
            origin_unix,
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> UnixTimeMs {
        #[allow(clippy::cast_possible_truncation)]
        self.origin_unix
            .add_millis(self.origin.elapsed().as_millis() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("no async runtime available to drive timers")]
    NoRuntime,
    #[error("timer period must be greater than zero")]
    InvalidPeriod,
}

/// Abort-on-drop handle for a background task (timer, location forwarder).
#[derive(Debug)]
pub struct TaskGuard {
    task: Option<JoinHandle<()>>,
}

impl TaskGuard {
    #[must_use]
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// What a running timer reports each period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    ImmobilityPoll,
    Countdown { generation: u64 },
}

/// Repeating timers that post a [`Tick`] into the monitor's mailbox.
pub trait Scheduler: Send + Sync {
    /// Posts `tick` every `period`, first after one full period. Dropping the returned
    /// guard stops the timer.
    fn every(
        &self,
        period: Duration,
        mailbox: mpsc::Sender<Tick>,
        tick: Tick,
    ) -> Result<TaskGuard, ScheduleError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn every(
        &self,
        period: Duration,
        mailbox: mpsc::Sender<Tick>,
        tick: Tick,
    ) -> Result<TaskGuard, ScheduleError> {
        if period.is_zero() {
            return Err(ScheduleError::InvalidPeriod);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ScheduleError::NoRuntime)?;

        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if mailbox.send(tick).await.is_err() {
                    break;
                }
            }
        });
        Ok(TaskGuard::new(task))
    }
}

// --- Timer capability ---

/// Timer requests from the core. The shell answers with tick events of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TimerOperation {
    StartPoll { period_ms: u64 },
    StopPoll,
    StartCountdown { generation: u64, tick_ms: u64 },
    CancelCountdown,
}

impl Operation for TimerOperation {
    type Output = ();
}

pub struct Timer<Ev> {
    context: CapabilityContext<TimerOperation, Ev>,
}

impl<Ev> Capability<Ev> for Timer<Ev> {
    type Operation = TimerOperation;
    type MappedSelf<MappedEv> = Timer<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Timer::new(self.context.map_event(f))
    }
}

impl<Ev> Timer<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<TimerOperation, Ev>) -> Self {
        Self { context }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn start_poll(&self, period: Duration) {
        self.notify(TimerOperation::StartPoll {
            period_ms: period.as_millis() as u64,
        });
    }

    pub fn stop_poll(&self) {
        self.notify(TimerOperation::StopPoll);
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn start_countdown(&self, generation: u64, tick: Duration) {
        self.notify(TimerOperation::StartCountdown {
            generation,
            tick_ms: tick.as_millis() as u64,
        });
    }

    pub fn cancel_countdown(&self) {
        self.notify(TimerOperation::CancelCountdown);
    }

    fn notify(&self, operation: TimerOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}
