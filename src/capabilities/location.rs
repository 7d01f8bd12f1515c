use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crux_core::capability::{Capability, CapabilityContext, Operation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::time::Clock;
use crate::error::ErrorKind;
use crate::geo::Coordinate;
use crate::model::{LocationSample, SessionId};

pub const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("location unavailable: {0}")]
    Unavailable(String),
    #[error("location updates stopped")]
    StreamEnded,
}

impl LocationError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::Unavailable(_) | Self::StreamEnded => ErrorKind::LocationUnavailable,
        }
    }
}

/// A live stream of samples. Dropping it unsubscribes.
#[derive(Debug)]
pub struct LocationSubscription {
    receiver: mpsc::Receiver<LocationSample>,
    producer: Option<JoinHandle<()>>,
}

impl LocationSubscription {
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<LocationSample>) -> Self {
        Self {
            receiver,
            producer: None,
        }
    }

    /// Subscription backed by a task that is aborted when the subscription is dropped.
    #[must_use]
    pub fn with_producer(receiver: mpsc::Receiver<LocationSample>, producer: JoinHandle<()>) -> Self {
        Self {
            receiver,
            producer: Some(producer),
        }
    }

    /// Next sample, or `None` once the provider stopped delivering.
    pub async fn next(&mut self) -> Option<LocationSample> {
        self.receiver.recv().await
    }
}

impl Drop for LocationSubscription {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    async fn subscribe(&self) -> Result<LocationSubscription, LocationError>;

    /// One-shot fix, used for the initial sample of a walk.
    async fn current_location(&self) -> Result<LocationSample, LocationError>;
}

// --- Location capability ---

/// Subscription requests from the core. Samples come back as plain events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LocationOperation {
    Start { session_id: SessionId },
    Stop,
}

impl Operation for LocationOperation {
    type Output = ();
}

pub struct Location<Ev> {
    context: CapabilityContext<LocationOperation, Ev>,
}

impl<Ev> Capability<Ev> for Location<Ev> {
    type Operation = LocationOperation;
    type MappedSelf<MappedEv> = Location<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        Location::new(self.context.map_event(f))
    }
}

impl<Ev> Location<Ev>
where
    Ev: 'static,
{
    pub fn new(context: CapabilityContext<LocationOperation, Ev>) -> Self {
        Self { context }
    }

    pub fn start(&self, session_id: SessionId) {
        self.notify(LocationOperation::Start { session_id });
    }

    pub fn stop(&self) {
        self.notify(LocationOperation::Stop);
    }

    fn notify(&self, operation: LocationOperation) {
        let context = self.context.clone();
        self.context.spawn(async move {
            context.notify_shell(operation).await;
        });
    }
}

#[derive(Debug, Default)]
struct ChannelState {
    subscribers: Vec<mpsc::Sender<LocationSample>>,
    last: Option<LocationSample>,
    permission_denied: bool,
}

/// Provider fed by the host platform: the shell pushes each fix it receives.
#[derive(Debug, Default)]
pub struct ChannelLocationProvider {
    state: Mutex<ChannelState>,
}

impl ChannelLocationProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ChannelState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Delivers a fix to every live subscriber. Full or closed subscribers miss it.
    pub fn push(&self, sample: LocationSample) {
        self.with_state(|state| {
            state.last = Some(sample);
            state.subscribers.retain(|tx| match tx.try_send(sample) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("location subscriber lagging, sample dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        });
    }

    /// Future subscriptions fail with [`LocationError::PermissionDenied`] and current
    /// streams end.
    pub fn deny_permission(&self) {
        self.with_state(|state| {
            state.permission_denied = true;
            state.subscribers.clear();
        });
    }

    pub fn grant_permission(&self) {
        self.with_state(|state| state.permission_denied = false);
    }

    /// Ends every live stream without revoking permission.
    pub fn close_streams(&self) {
        self.with_state(|state| state.subscribers.clear());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.with_state(|state| {
            state.subscribers.retain(|tx| !tx.is_closed());
            state.subscribers.len()
        })
    }
}

#[async_trait::async_trait]
impl LocationProvider for ChannelLocationProvider {
    async fn subscribe(&self) -> Result<LocationSubscription, LocationError> {
        self.with_state(|state| {
            if state.permission_denied {
                return Err(LocationError::PermissionDenied);
            }
            let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
            state.subscribers.push(tx);
            Ok(LocationSubscription::new(rx))
        })
    }

    async fn current_location(&self) -> Result<LocationSample, LocationError> {
        self.with_state(|state| {
            if state.permission_denied {
                return Err(LocationError::PermissionDenied);
            }
            state
                .last
                .ok_or_else(|| LocationError::Unavailable("no fix received yet".into()))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedWalk {
    pub start: Coordinate,
    pub heading_deg: f64,
    pub step_m: f64,
    pub jitter_m: f64,
    pub interval: Duration,
    /// After this many steps the simulated walker stands still (jitter only).
    pub stop_after: Option<u32>,
    pub seed: Option<u64>,
}

impl SimulatedWalk {
    #[must_use]
    pub fn from(start: Coordinate) -> Self {
        Self {
            start,
            heading_deg: 0.0,
            step_m: 1.4,
            jitter_m: 1.0,
            interval: Duration::from_secs(1),
            stop_after: None,
            seed: None,
        }
    }
}

/// Demo provider producing a synthetic walk. Every sample is marked synthetic, so once a
/// real fix reaches the monitor these are ignored.
pub struct SimulatedWalkProvider {
    walk: SimulatedWalk,
    clock: Arc<dyn Clock>,
}

impl SimulatedWalkProvider {
    #[must_use]
    pub fn new(walk: SimulatedWalk, clock: Arc<dyn Clock>) -> Self {
        Self { walk, clock }
    }

    fn sample_at(&self, position: Coordinate, speed_mps: f64) -> LocationSample {
        LocationSample::new(position, speed_mps, 5.0, self.clock.now()).synthetic()
    }
}

fn step(walk: &SimulatedWalk, rng: &mut StdRng, from: Coordinate, moving: bool) -> Coordinate {
    let heading = walk.heading_deg.to_radians();
    let (mut north, mut east) = if moving {
        (walk.step_m * heading.cos(), walk.step_m * heading.sin())
    } else {
        (0.0, 0.0)
    };
    if walk.jitter_m > 0.0 {
        north += rng.gen_range(-walk.jitter_m..=walk.jitter_m);
        east += rng.gen_range(-walk.jitter_m..=walk.jitter_m);
    }
    from.offset_meters(north, east).unwrap_or(from)
}

#[async_trait::async_trait]
impl LocationProvider for SimulatedWalkProvider {
    async fn subscribe(&self) -> Result<LocationSubscription, LocationError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LocationError::Unavailable(e.to_string()))?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let walk = self.walk.clone();
        let clock = Arc::clone(&self.clock);

        let producer = runtime.spawn(async move {
            let mut rng = walk
                .seed
                .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
            let mut position = walk.start;
            let mut steps = 0_u32;
            let mut interval = tokio::time::interval(walk.interval);
            loop {
                interval.tick().await;
                let moving = walk.stop_after.map_or(true, |limit| steps < limit);
                position = step(&walk, &mut rng, position, moving);
                steps = steps.saturating_add(1);
                let speed = if moving {
                    walk.step_m / walk.interval.as_secs_f64().max(0.001)
                } else {
                    0.0
                };
                let sample = LocationSample::new(position, speed, 5.0, clock.now()).synthetic();
                if tx.send(sample).await.is_err() {
                    debug!("simulated walk unsubscribed");
                    break;
                }
            }
        });
        Ok(LocationSubscription::with_producer(rx, producer))
    }

    async fn current_location(&self) -> Result<LocationSample, LocationError> {
        Ok(self.sample_at(self.walk.start, 0.0))
    }
}
