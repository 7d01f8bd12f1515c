mod documents;
mod history;
mod location;
mod sms;
mod time;

use std::sync::Arc;

pub use crux_core::render::Render;

pub use self::documents::{
    Collection, DocumentStore, MemoryDocumentStore, StoreError, StoredDocument, MAX_ID_LENGTH,
};
#[cfg(not(target_arch = "wasm32"))]
pub use self::documents::SqliteDocumentStore;
pub use self::history::{History, HistoryOperation, HistorySaveOutcome};
pub use self::location::{
    ChannelLocationProvider, Location, LocationError, LocationOperation, LocationProvider,
    LocationSubscription, SimulatedWalk, SimulatedWalkProvider,
};
#[cfg(feature = "http-sms")]
pub use self::sms::HttpSmsGateway;
pub use self::sms::{
    validate_message, Sms, SmsDelivery, SmsError, SmsGateway, SmsOperation, SmsReceipt,
    MAX_MESSAGE_LENGTH,
};
pub use self::time::{
    Clock, ScheduleError, Scheduler, SystemClock, TaskGuard, Tick, Timer, TimerOperation,
    TokioClock, TokioScheduler,
};

use crate::event::Event;
use crate::monitor::App;

/// Side effects the core asks its shell to perform.
#[derive(crux_core::macros::Effect)]
pub struct Capabilities {
    pub render: Render<Event>,
    pub location: Location<Event>,
    pub timer: Timer<Event>,
    pub sms: Sms<Event>,
    pub history: History<Event>,
}

/// Platform collaborators the tokio shell uses to perform [`Effect`]s.
#[derive(Clone)]
pub struct Services {
    pub location: Arc<dyn LocationProvider>,
    pub sms: Arc<dyn SmsGateway>,
    pub documents: Arc<dyn DocumentStore>,
    pub clock: Arc<dyn Clock>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Services {
    /// Uses the tokio clock and timers.
    pub fn new(
        location: Arc<dyn LocationProvider>,
        sms: Arc<dyn SmsGateway>,
        documents: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            location,
            sms,
            documents,
            clock: Arc::new(TokioClock::new()),
            scheduler: Arc::new(TokioScheduler),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }
}
