#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use walk_companion::capabilities::{
    ChannelLocationProvider, Clock, DocumentStore, MemoryDocumentStore, SmsError, SmsGateway,
    SmsReceipt, TokioClock,
};
use walk_companion::geo::Coordinate;
use walk_companion::{
    Contact, LocationSample, MonitorConfig, MonitorHandle, PhoneNumber, Services, UnixTimeMs,
    UserId,
};

pub const T0: u64 = 1_700_000_000_000;

#[derive(Default)]
pub struct RecordingSms {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingSms {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SmsGateway for RecordingSms {
    async fn send(&self, to: &PhoneNumber, message: &str) -> Result<SmsReceipt, SmsError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.as_str().to_string(), message.to_string()));
        Ok(SmsReceipt {
            provider_id: Some(format!("msg-{}", sent.len())),
        })
    }
}

pub struct Walker {
    pub handle: MonitorHandle,
    pub location: Arc<ChannelLocationProvider>,
    pub sms: Arc<RecordingSms>,
    pub clock: Arc<TokioClock>,
}

impl Walker {
    /// Monitor for user "walker" on the given store. Must be called inside a runtime.
    pub fn spawn(documents: Arc<dyn DocumentStore>) -> Self {
        let location = Arc::new(ChannelLocationProvider::new());
        let sms = Arc::new(RecordingSms::default());
        let clock = Arc::new(TokioClock::starting_at(UnixTimeMs(T0)));
        let services = Services::new(location.clone(), sms.clone(), documents)
            .with_clock(clock.clone());
        let (handle, _task) =
            MonitorHandle::spawn(UserId::new("walker"), MonitorConfig::default(), services)
                .unwrap();
        Self {
            handle,
            location,
            sms,
            clock,
        }
    }

    pub fn in_memory() -> Self {
        Self::spawn(Arc::new(MemoryDocumentStore::new()))
    }

    /// Sample at `at`, stamped with the current clock.
    pub fn fix(&self, at: Coordinate, speed_mps: f64) -> LocationSample {
        LocationSample::new(at, speed_mps, 5.0, self.clock.now())
    }
}

pub fn ann() -> Contact {
    Contact::new("Ann", Some("+15550100")).unwrap()
}

pub fn point_a() -> Coordinate {
    Coordinate::new(40.0, -74.0).unwrap()
}
