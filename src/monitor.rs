use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::{Capabilities, HistorySaveOutcome, LocationError, Sms, SmsDelivery};
use crate::config::MonitorConfig;
use crate::error::{AppError, Rejection, SosError};
use crate::event::Event;
use crate::filter::{LocationFilter, Verdict};
use crate::immobility::ImmobilityDetector;
use crate::lifecycle::{begin_session, finalize_session};
use crate::model::{
    Contact, HistoryId, HistoryRecord, LocationSample, LocationSnapshot, SessionId, UnixTimeMs,
    UserId, WalkSession,
};
use crate::notifier::{DeliveryState, EmergencyNotifier, SosDispatch, SosReason};
use crate::safety_check::{SafetyCheck, SafetyCheckState, TickOutcome};
use crate::store::{Alert, AlertType, SessionStore};

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum LocationStatus {
    /// No fix received yet this walk.
    Waiting,
    Live,
    /// Updates stopped; the view keeps showing the last known position.
    Degraded { error: LocationError },
}

/// Everything a shell needs to draw the walk screen.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorView {
    pub session: Option<WalkSession>,
    pub path_points: usize,
    pub distance_meters: f64,
    pub duration_ms: u64,
    pub last_known: Option<LocationSnapshot>,
    pub alerts: Vec<Alert>,
    pub safety_check: SafetyCheckState,
    pub help_sent: bool,
    pub delivery: DeliveryState,
    pub location: LocationStatus,
    /// Record of the walk that ended last, until the next one starts.
    pub summary: Option<HistoryRecord>,
    /// Why the last command was refused, if it was.
    pub rejection: Option<Rejection>,
}

#[derive(Debug)]
struct Walk {
    session: WalkSession,
    path: SessionStore,
    immobility: ImmobilityDetector,
    safety: SafetyCheck,
    notifier: EmergencyNotifier,
    last_known: Option<LocationSample>,
    real_fix_seen: bool,
    location_error: Option<LocationError>,
}

impl Walk {
    fn ingest(&mut self, filter: &LocationFilter, sample: LocationSample, now: UnixTimeMs) {
        match filter.classify(self.path.last_accepted(), &sample) {
            Verdict::Accept => self.path.append(sample),
            Verdict::Reject(reason) => trace!(?reason, "sample kept out of path"),
        }

        let relocated = self.immobility.observe(sample.coordinate, now);
        if relocated && !self.safety.is_awaiting() {
            self.path.alerts_mut().deactivate(AlertType::NoMove, now);
        }

        if self
            .last_known
            .map_or(true, |known| !sample.timestamp.is_before(known.timestamp))
        {
            self.last_known = Some(sample);
        }

        if self.location_error.take().is_some() {
            self.path.alerts_mut().deactivate(AlertType::ConnLost, now);
            info!(session_id = %self.session.id, "location updates restored");
        }
    }

    /// Composes the SOS and hands it to the shell. The latch is set before the send.
    fn escalate(
        &mut self,
        reason: SosReason,
        now: UnixTimeMs,
        sms: &Sms<Event>,
    ) -> Result<(), SosError> {
        let last_known = self.last_known.map(|s| s.coordinate);
        match self
            .notifier
            .send_sos(&self.session.contact, last_known, reason)
        {
            Ok(dispatch) => {
                info!(session_id = %self.session.id, %reason, "dispatching SOS");
                self.path.alerts_mut().upsert(
                    AlertType::Emergency,
                    format!("Sending SOS to {} ({reason})", self.session.contact.name),
                    true,
                    now,
                );
                self.dispatch(dispatch, sms);
                Ok(())
            }
            Err(SosError::NoRecipient) => {
                self.path.alerts_mut().upsert(
                    AlertType::SosFailed,
                    format!(
                        "Cannot send SOS: {} has no phone number",
                        self.session.contact.name
                    ),
                    true,
                    now,
                );
                Err(SosError::NoRecipient)
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch(&self, dispatch: SosDispatch, sms: &Sms<Event>) {
        let session_id = self.session.id.clone();
        let attempt = dispatch.attempt;
        sms.send(dispatch, move |delivery| Event::SmsCompleted {
            session_id,
            attempt,
            delivery,
        });
    }

    fn location_status(&self) -> LocationStatus {
        match (&self.location_error, &self.last_known) {
            (Some(error), _) => LocationStatus::Degraded {
                error: error.clone(),
            },
            (None, Some(_)) => LocationStatus::Live,
            (None, None) => LocationStatus::Waiting,
        }
    }
}

fn active(walk: &mut Option<Walk>) -> Result<&mut Walk, Rejection> {
    walk.as_mut()
        .filter(|w| w.session.is_active())
        .ok_or(Rejection::NoActiveSession)
}

/// State of one user's monitor.
///
/// After a walk ends it stays readable (view, late SMS results) until the next start.
#[derive(Debug, Default)]
pub struct Model {
    user_id: UserId,
    config: MonitorConfig,
    filter: LocationFilter,
    walk: Option<Walk>,
    summary: Option<HistoryRecord>,
    rejection: Option<Rejection>,
    now: UnixTimeMs,
}

impl Model {
    #[must_use]
    pub fn session(&self) -> Option<&WalkSession> {
        self.walk.as_ref().map(|w| &w.session)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.session().is_some_and(WalkSession::is_active)
    }

    #[must_use]
    pub fn path(&self) -> Option<&SessionStore> {
        self.walk.as_ref().map(|w| &w.path)
    }

    fn configure(&mut self, user_id: UserId, config: MonitorConfig) {
        if let Err(e) = config.validate() {
            error!(error = %e, "configuration rejected, keeping previous thresholds");
            return;
        }
        self.filter = LocationFilter::from_config(&config);
        self.config = config;
        self.user_id = user_id;
    }

    fn start(
        &mut self,
        contact: Contact,
        initial: Option<LocationSample>,
        now: UnixTimeMs,
        caps: &Capabilities,
    ) -> Result<(), Rejection> {
        if let Some(current) = self.session().filter(|s| s.is_active()) {
            return Err(Rejection::AlreadyActive(current.id.to_string()));
        }
        if contact.phone.is_none() {
            warn!(contact = %contact.name, "walk started with a contact that has no phone number");
        }

        let mut walk = Walk {
            path: SessionStore::new(),
            immobility: ImmobilityDetector::new(&self.config, now),
            safety: SafetyCheck::new(&self.config),
            notifier: EmergencyNotifier::new(self.config.maps_base_url().ok()),
            last_known: None,
            real_fix_seen: false,
            location_error: None,
            session: begin_session(self.user_id.clone(), contact, now),
        };
        walk.path.alerts_mut().upsert(
            AlertType::Started,
            format!("Walk started with {}", walk.session.contact.name),
            false,
            now,
        );
        if let Some(sample) = initial {
            walk.real_fix_seen = !sample.synthetic;
            walk.ingest(&self.filter, sample, now);
        }

        info!(session_id = %walk.session.id, user_id = %self.user_id, "walk started");
        caps.location.start(walk.session.id.clone());
        caps.timer.start_poll(self.config.poll_interval());
        self.walk = Some(walk);
        self.summary = None;
        Ok(())
    }

    fn on_location(&mut self, sample: LocationSample, now: UnixTimeMs) -> bool {
        let Ok(walk) = active(&mut self.walk) else {
            debug!("location sample ignored, no active walk");
            return false;
        };
        if sample.synthetic && walk.real_fix_seen {
            trace!("synthetic sample ignored after a real fix");
            return false;
        }
        if !sample.synthetic {
            walk.real_fix_seen = true;
        }
        walk.ingest(&self.filter, sample, now);
        true
    }

    fn on_location_lost(&mut self, error: LocationError, now: UnixTimeMs) -> bool {
        let Ok(walk) = active(&mut self.walk) else {
            return false;
        };
        warn!(session_id = %walk.session.id, %error, "location updates lost");
        let message = AppError::from(error.clone()).user_facing_message();
        walk.path
            .alerts_mut()
            .upsert(AlertType::ConnLost, message, true, now);
        walk.location_error = Some(error);
        true
    }

    fn on_poll(&mut self, now: UnixTimeMs, caps: &Capabilities) -> bool {
        let Ok(walk) = active(&mut self.walk) else {
            return false;
        };
        if walk.safety.is_awaiting() || !walk.immobility.poll(now) {
            return false;
        }

        let stay_secs = walk.immobility.stay_duration_ms(now) / 1_000;
        walk.path.alerts_mut().upsert(
            AlertType::NoMove,
            format!("No movement for {stay_secs} seconds"),
            true,
            now,
        );
        if let Some(generation) = walk.safety.request(now) {
            info!(session_id = %walk.session.id, generation, stay_secs, "safety check requested");
            caps.timer
                .start_countdown(generation, self.config.countdown_tick());
        }
        true
    }

    fn on_tick(&mut self, generation: u64, now: UnixTimeMs, caps: &Capabilities) -> bool {
        let Ok(walk) = active(&mut self.walk) else {
            return false;
        };
        match walk.safety.tick(generation) {
            TickOutcome::Stale => {
                debug!(generation, "stale countdown tick discarded");
                false
            }
            TickOutcome::Counting { .. } => true,
            TickOutcome::Expired { generation } => {
                warn!(session_id = %walk.session.id, generation, "safety check unanswered");
                walk.path.alerts_mut().upsert(
                    AlertType::NoResponse,
                    "No response to the safety check",
                    true,
                    now,
                );
                caps.timer.cancel_countdown();
                let _ = walk.escalate(SosReason::NoResponse, now, &caps.sms);
                true
            }
        }
    }

    fn on_countdown_unavailable(
        &mut self,
        generation: u64,
        now: UnixTimeMs,
        caps: &Capabilities,
    ) -> bool {
        let Ok(walk) = active(&mut self.walk) else {
            return false;
        };
        if !walk.safety.abandon(generation) {
            return false;
        }
        error!(session_id = %walk.session.id, generation, "countdown could not be scheduled, escalating now");
        let _ = walk.escalate(SosReason::CountdownUnavailable, now, &caps.sms);
        true
    }

    fn on_sms_completed(
        &mut self,
        session_id: &SessionId,
        attempt: u32,
        delivery: SmsDelivery,
    ) -> bool {
        let Some(walk) = self.walk.as_mut() else {
            return false;
        };
        if walk.session.id != *session_id {
            debug!(%session_id, attempt, "SMS result for an earlier walk ignored");
            return false;
        }
        let SmsDelivery { result, at } = delivery;
        if !walk.notifier.record_delivery(attempt, result.clone()) {
            debug!(attempt, "superseded SMS result ignored");
            return false;
        }
        let contact = &walk.session.contact.name;
        match result {
            Ok(receipt) => {
                info!(session_id = %walk.session.id, attempt, provider_id = ?receipt.provider_id, "SOS delivered");
                walk.path.alerts_mut().upsert(
                    AlertType::Emergency,
                    format!("SOS sent to {contact}"),
                    true,
                    at,
                );
            }
            Err(e) => {
                error!(session_id = %walk.session.id, attempt, error = %e, "SOS delivery failed");
                walk.path.alerts_mut().upsert(
                    AlertType::SosFailed,
                    format!("SOS to {contact} could not be delivered: {e}"),
                    true,
                    at,
                );
            }
        }
        true
    }

    fn on_history_saved(&mut self, history_id: &HistoryId, outcome: HistorySaveOutcome) -> bool {
        let HistorySaveOutcome { result, at } = outcome;
        let Err(reason) = result else {
            debug!(%history_id, "walk saved to history");
            return false;
        };
        error!(%history_id, error = %reason, "walk could not be saved to history");
        match self.walk.as_mut() {
            Some(walk) => {
                walk.path.alerts_mut().upsert(
                    AlertType::HistoryNotSaved,
                    format!("This walk could not be saved: {reason}"),
                    true,
                    at,
                );
                true
            }
            None => false,
        }
    }

    /// "I'm safe": ends any outstanding check and restarts the immobility clock.
    fn respond_safe(&mut self, now: UnixTimeMs, caps: &Capabilities) -> Result<(), Rejection> {
        let walk = active(&mut self.walk)?;
        let resolved = walk.safety.resolve();
        walk.immobility.reset_clock(now);
        let alerts = walk.path.alerts_mut();
        alerts.deactivate(AlertType::NoMove, now);
        alerts.upsert(AlertType::UserSafe, "You confirmed you are safe", false, now);
        info!(session_id = %walk.session.id, had_check = resolved.is_some(), "user confirmed safe");
        if resolved.is_some() {
            caps.timer.cancel_countdown();
        }
        Ok(())
    }

    /// "I need help" answer. Only meaningful while a safety check is waiting for one.
    fn respond_unsafe(&mut self, now: UnixTimeMs, caps: &Capabilities) -> Result<bool, Rejection> {
        let walk = active(&mut self.walk)?;
        if !walk.safety.is_awaiting() {
            debug!(session_id = %walk.session.id, "no safety check to answer");
            return Ok(false);
        }
        self.request_help(SosReason::UserRequestedHelp, now, caps)?;
        Ok(true)
    }

    /// The SOS button. Also ends an outstanding check, since the user is clearly responsive.
    fn request_help(
        &mut self,
        reason: SosReason,
        now: UnixTimeMs,
        caps: &Capabilities,
    ) -> Result<(), Rejection> {
        let walk = active(&mut self.walk)?;
        if walk.safety.resolve().is_some() {
            caps.timer.cancel_countdown();
        }
        walk.escalate(reason, now, &caps.sms).map_err(|e| {
            info!(session_id = %walk.session.id, %reason, error = %e, "SOS not dispatched");
            Rejection::Sos(e)
        })
    }

    /// Re-sends the SOS after a failed delivery. Never invoked automatically.
    fn retry_sos(&mut self, now: UnixTimeMs, caps: &Capabilities) -> Result<(), Rejection> {
        let walk = active(&mut self.walk)?;
        let dispatch = walk.notifier.retry().map_err(Rejection::Sos)?;
        info!(session_id = %walk.session.id, attempt = dispatch.attempt, "retrying SOS");
        let alerts = walk.path.alerts_mut();
        alerts.deactivate(AlertType::SosFailed, now);
        alerts.upsert(
            AlertType::Emergency,
            format!("Retrying SOS to {}", walk.session.contact.name),
            true,
            now,
        );
        walk.dispatch(dispatch, &caps.sms);
        Ok(())
    }

    /// Ends the walk. Alerts stay visible in the final view; every timer and the location
    /// subscription are torn down in the same step.
    fn end(&mut self, now: UnixTimeMs, caps: &Capabilities) -> Result<(), Rejection> {
        let walk = active(&mut self.walk)?;
        walk.safety.resolve();
        let record = finalize_session(
            &mut walk.session,
            &walk.path,
            walk.notifier.help_sent(),
            now,
        )?;
        info!(
            session_id = %record.session_id,
            distance_m = record.distance_meters,
            duration_ms = record.duration_ms,
            help_sent = record.help_sent,
            "walk ended"
        );
        caps.timer.cancel_countdown();
        caps.timer.stop_poll();
        caps.location.stop();
        let history_id = record.id.clone();
        caps.history.save(record.clone(), move |outcome| Event::HistorySaved {
            history_id,
            outcome,
        });
        self.summary = Some(record);
        Ok(())
    }
}

/// The walk-session safety monitor.
///
/// Every input is an [`Event`] applied to the [`Model`] one at a time; I/O is requested
/// through [`Capabilities`] and performed by the shell.
#[derive(Default)]
pub struct App;

impl crux_core::App for App {
    type Event = Event;
    type Model = Model;
    type ViewModel = MonitorView;
    type Capabilities = Capabilities;

    fn update(&self, event: Event, model: &mut Model, caps: &Capabilities) {
        trace!(event = event.name(), "monitor event");
        if let Some(at) = event.at() {
            model.now = at;
        }
        model.rejection = None;

        let outcome = match event {
            Event::Configure { user_id, config } => {
                model.configure(user_id, config);
                return;
            }
            Event::StartWalk {
                contact,
                initial,
                at,
            } => model.start(contact, initial, at, caps).map(|()| true),
            Event::RespondSafe { at } => model.respond_safe(at, caps).map(|()| true),
            Event::RespondUnsafe { at } => model.respond_unsafe(at, caps),
            Event::ManualSos { at } => model
                .request_help(SosReason::ManualSos, at, caps)
                .map(|()| true),
            Event::RetrySos { at } => model.retry_sos(at, caps).map(|()| true),
            Event::EndWalk { at } => model.end(at, caps).map(|()| true),
            Event::LocationReceived { sample, at } => Ok(model.on_location(sample, at)),
            Event::LocationLost { error, at } => Ok(model.on_location_lost(error, at)),
            Event::ImmobilityPoll { at } => Ok(model.on_poll(at, caps)),
            Event::CountdownTick { generation, at } => Ok(model.on_tick(generation, at, caps)),
            Event::CountdownUnavailable { generation, at } => {
                Ok(model.on_countdown_unavailable(generation, at, caps))
            }
            Event::SmsCompleted {
                session_id,
                attempt,
                delivery,
            } => Ok(model.on_sms_completed(&session_id, attempt, delivery)),
            Event::HistorySaved {
                history_id,
                outcome,
            } => Ok(model.on_history_saved(&history_id, outcome)),
        };

        match outcome {
            Ok(false) => {}
            Ok(true) => caps.render.render(),
            Err(rejection) => {
                debug!(%rejection, "command rejected");
                model.rejection = Some(rejection);
                caps.render.render();
            }
        }
    }

    fn view(&self, model: &Model) -> MonitorView {
        let (summary, rejection) = (model.summary.clone(), model.rejection.clone());
        let Some(walk) = &model.walk else {
            return MonitorView {
                session: None,
                path_points: 0,
                distance_meters: 0.0,
                duration_ms: 0,
                last_known: None,
                alerts: Vec::new(),
                safety_check: SafetyCheckState::Idle,
                help_sent: false,
                delivery: DeliveryState::NotAttempted,
                location: LocationStatus::Waiting,
                summary,
                rejection,
            };
        };
        MonitorView {
            session: Some(walk.session.clone()),
            path_points: walk.path.path().len(),
            distance_meters: walk.path.distance_m(),
            duration_ms: walk.session.duration_ms(model.now),
            last_known: walk.last_known.as_ref().map(LocationSnapshot::from),
            alerts: walk.path.alerts().all().to_vec(),
            safety_check: walk.safety.state(),
            help_sent: walk.notifier.help_sent(),
            delivery: walk.notifier.delivery().clone(),
            location: walk.location_status(),
            summary,
            rejection,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{
        Effect, HistoryOperation, LocationOperation, SmsOperation, SmsReceipt, TimerOperation,
    };
    use crate::geo::Coordinate;
    use crux_core::testing::AppTester;
    use proptest::prelude::*;

    type Tester = AppTester<App, Effect>;

    fn origin() -> Coordinate {
        Coordinate::new(51.5, -0.12).unwrap()
    }

    fn fix(north_m: f64, speed: f64, ts: u64) -> LocationSample {
        LocationSample::new(origin().offset_meters(north_m, 0.0).unwrap(), speed, 5.0, UnixTimeMs(ts))
    }

    fn ann() -> Contact {
        Contact::new("Ann", Some("+15550100")).unwrap()
    }

    fn configured() -> (Tester, Model) {
        let app = Tester::default();
        let mut model = Model::default();
        app.update(
            Event::Configure {
                user_id: UserId::new("user-1"),
                config: MonitorConfig::default(),
            },
            &mut model,
        );
        (app, model)
    }

    fn started() -> (Tester, Model) {
        let (app, mut model) = configured();
        app.update(
            Event::StartWalk {
                contact: ann(),
                initial: Some(fix(0.0, 0.0, 0)),
                at: UnixTimeMs(0),
            },
            &mut model,
        );
        (app, model)
    }

    fn located(sample: LocationSample, at: u64) -> Event {
        Event::LocationReceived {
            sample,
            at: UnixTimeMs(at),
        }
    }

    fn poll(at: u64) -> Event {
        Event::ImmobilityPoll { at: UnixTimeMs(at) }
    }

    fn tick(generation: u64, at: u64) -> Event {
        Event::CountdownTick {
            generation,
            at: UnixTimeMs(at),
        }
    }

    fn sms_sent(effects: &[Effect]) -> Vec<SosDispatch> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Sms(request) => {
                    let SmsOperation::Send(dispatch) = &request.operation;
                    Some(dispatch.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn timer_ops(effects: &[Effect]) -> Vec<TimerOperation> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Timer(request) => Some(request.operation.clone()),
                _ => None,
            })
            .collect()
    }

    fn location_ops(effects: &[Effect]) -> Vec<LocationOperation> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Location(request) => Some(request.operation.clone()),
                _ => None,
            })
            .collect()
    }

    fn saved_records(effects: &[Effect]) -> Vec<HistoryRecord> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::History(request) => {
                    let HistoryOperation::Save(record) = &request.operation;
                    Some(record.clone())
                }
                _ => None,
            })
            .collect()
    }

    fn renders(effects: &[Effect]) -> bool {
        effects.iter().any(|e| matches!(e, Effect::Render(_)))
    }

    fn delivered(
        session_id: SessionId,
        attempt: u32,
        result: Result<SmsReceipt, SosError>,
        at: u64,
    ) -> Event {
        Event::SmsCompleted {
            session_id,
            attempt,
            delivery: SmsDelivery {
                result,
                at: UnixTimeMs(at),
            },
        }
    }

    fn session_id(model: &Model) -> SessionId {
        model.session().unwrap().id.clone()
    }

    /// Drives the model into AwaitingResponse and returns the generation.
    fn trigger_check(app: &Tester, model: &mut Model) -> u64 {
        let update = app.update(poll(32_000), model);
        match timer_ops(&update.effects).first() {
            Some(TimerOperation::StartCountdown { generation, .. }) => *generation,
            other => panic!("expected countdown, got {other:?}"),
        }
    }

    fn run_out(app: &Tester, model: &mut Model, generation: u64) -> Vec<Effect> {
        let mut all = Vec::new();
        for i in 1..=10 {
            all.extend(app.update(tick(generation, 32_000 + i * 1_000), model).effects);
        }
        all
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_start_requests_location_and_poll() {
            let (app, mut model) = configured();
            let update = app.update(
                Event::StartWalk {
                    contact: ann(),
                    initial: None,
                    at: UnixTimeMs(10),
                },
                &mut model,
            );
            let session = model.session().unwrap().clone();
            assert!(session.is_active());
            assert_eq!(session.user_id, UserId::new("user-1"));
            assert_eq!(
                location_ops(&update.effects),
                vec![LocationOperation::Start {
                    session_id: session.id
                }]
            );
            assert_eq!(
                timer_ops(&update.effects),
                vec![TimerOperation::StartPoll { period_ms: 2_000 }]
            );
            assert!(renders(&update.effects));
            let started = model.path().unwrap().alerts().get(AlertType::Started).unwrap();
            assert!(!started.active);
        }

        #[test]
        fn test_start_while_active_is_rejected() {
            let (app, mut model) = started();
            let first = session_id(&model);
            let update = app.update(
                Event::StartWalk {
                    contact: ann(),
                    initial: None,
                    at: UnixTimeMs(1),
                },
                &mut model,
            );
            assert!(location_ops(&update.effects).is_empty());
            assert_eq!(
                app.view(&model).rejection,
                Some(Rejection::AlreadyActive(first.to_string()))
            );
        }

        #[test]
        fn test_end_tears_everything_down() {
            let (app, mut model) = started();
            app.update(located(fix(13.0, 0.0, 1_000), 1_000), &mut model);
            let update = app.update(Event::EndWalk { at: UnixTimeMs(60_000) }, &mut model);

            let saved = saved_records(&update.effects);
            assert_eq!(saved.len(), 1);
            let record = &saved[0];
            assert_eq!(record.path_points, 2);
            assert_eq!(record.duration_ms, 60_000);
            let timers = timer_ops(&update.effects);
            assert!(timers.contains(&TimerOperation::CancelCountdown));
            assert!(timers.contains(&TimerOperation::StopPoll));
            assert_eq!(location_ops(&update.effects), vec![LocationOperation::Stop]);
            assert!(!model.is_active());
            assert_eq!(app.view(&model).summary.as_ref(), Some(record));

            app.update(Event::EndWalk { at: UnixTimeMs(61_000) }, &mut model);
            assert_eq!(app.view(&model).rejection, Some(Rejection::NoActiveSession));
        }

        #[test]
        fn test_commands_without_session() {
            let (app, mut model) = configured();
            app.update(Event::RespondSafe { at: UnixTimeMs(0) }, &mut model);
            assert_eq!(app.view(&model).rejection, Some(Rejection::NoActiveSession));
            app.update(Event::ManualSos { at: UnixTimeMs(0) }, &mut model);
            assert_eq!(app.view(&model).rejection, Some(Rejection::NoActiveSession));

            let update = app.update(located(fix(0.0, 1.0, 0), 0), &mut model);
            assert!(update.effects.is_empty());
            let view = app.view(&model);
            assert_eq!(view.session, None);
            assert_eq!(view.rejection, None);
        }

        #[test]
        fn test_restart_after_end_is_fresh() {
            let (app, mut model) = started();
            app.update(Event::ManualSos { at: UnixTimeMs(5) }, &mut model);
            app.update(Event::EndWalk { at: UnixTimeMs(10) }, &mut model);
            app.update(
                Event::StartWalk {
                    contact: ann(),
                    initial: None,
                    at: UnixTimeMs(20),
                },
                &mut model,
            );
            let view = app.view(&model);
            assert!(!view.help_sent);
            assert_eq!(view.path_points, 0);
            assert_eq!(view.summary, None);
            assert!(!view.alerts.iter().any(|a| a.alert_type == AlertType::Emergency));
        }

        #[test]
        fn test_alerts_survive_end() {
            let (app, mut model) = started();
            app.update(Event::ManualSos { at: UnixTimeMs(5) }, &mut model);
            app.update(Event::EndWalk { at: UnixTimeMs(10) }, &mut model);
            let view = app.view(&model);
            assert!(view
                .alerts
                .iter()
                .any(|a| a.alert_type == AlertType::Emergency && a.active));
        }

        #[test]
        fn test_failed_save_raises_alert() {
            let (app, mut model) = started();
            let update = app.update(Event::EndWalk { at: UnixTimeMs(10) }, &mut model);
            let record = saved_records(&update.effects).remove(0);

            let update = app.update(
                Event::HistorySaved {
                    history_id: record.id,
                    outcome: HistorySaveOutcome {
                        result: Err("storage backend error: disk full".into()),
                        at: UnixTimeMs(11),
                    },
                },
                &mut model,
            );
            assert!(renders(&update.effects));
            let alert = model
                .path()
                .unwrap()
                .alerts()
                .get(AlertType::HistoryNotSaved)
                .unwrap();
            assert!(alert.active);
            assert!(alert.message.contains("disk full"));
        }

        #[test]
        fn test_successful_save_is_quiet() {
            let (app, mut model) = started();
            let update = app.update(Event::EndWalk { at: UnixTimeMs(10) }, &mut model);
            let record = saved_records(&update.effects).remove(0);
            let update = app.update(
                Event::HistorySaved {
                    history_id: record.id,
                    outcome: HistorySaveOutcome {
                        result: Ok(()),
                        at: UnixTimeMs(11),
                    },
                },
                &mut model,
            );
            assert!(update.effects.is_empty());
            assert!(!model
                .path()
                .unwrap()
                .alerts()
                .is_active(AlertType::HistoryNotSaved));
        }
    }

    mod path {
        use super::*;

        #[test]
        fn test_jitter_rejected_jump_accepted() {
            let (app, mut model) = started();
            app.update(located(fix(3.0, 0.0, 1_000), 1_000), &mut model);
            assert_eq!(model.path().unwrap().path().len(), 1);
            app.update(located(fix(16.0, 0.0, 2_000), 2_000), &mut model);
            assert_eq!(model.path().unwrap().path().len(), 2);
            app.update(located(fix(22.0, 0.5, 3_000), 3_000), &mut model);
            assert_eq!(model.path().unwrap().path().len(), 3);
            assert!((model.path().unwrap().distance_m() - 22.0).abs() < 0.01);
        }

        #[test]
        fn test_out_of_order_sample_not_in_path_nor_last_known() {
            let (app, mut model) = started();
            app.update(located(fix(20.0, 1.0, 5_000), 5_000), &mut model);
            app.update(located(fix(40.0, 1.0, 4_000), 5_100), &mut model);
            let view = app.view(&model);
            assert_eq!(view.path_points, 2);
            assert_eq!(view.last_known.unwrap().ts, UnixTimeMs(5_000));
            assert_eq!(view.duration_ms, 5_100);
        }

        #[test]
        fn test_synthetic_ignored_after_real_fix() {
            let (app, mut model) = configured();
            app.update(
                Event::StartWalk {
                    contact: ann(),
                    initial: None,
                    at: UnixTimeMs(0),
                },
                &mut model,
            );
            app.update(located(fix(0.0, 1.0, 0).synthetic(), 0), &mut model);
            app.update(located(fix(20.0, 1.0, 1_000).synthetic(), 1_000), &mut model);
            assert_eq!(model.path().unwrap().path().len(), 2);

            app.update(located(fix(40.0, 1.0, 2_000), 2_000), &mut model);
            let update = app.update(located(fix(60.0, 1.0, 3_000).synthetic(), 3_000), &mut model);
            assert!(update.effects.is_empty());
            assert_eq!(model.path().unwrap().path().len(), 3);
        }

        #[test]
        fn test_geojson_export() {
            let (app, mut model) = started();
            app.update(located(fix(13.0, 0.0, 1_000), 1_000), &mut model);
            let feature = model.path().unwrap().to_geojson();
            assert!(matches!(
                feature.geometry.unwrap().value,
                geojson::Value::LineString(ref points) if points.len() == 2
            ));
        }
    }

    mod safety {
        use super::*;

        #[test]
        fn test_immobility_raises_single_check() {
            let (app, mut model) = started();
            for t in (2_000..=30_000).step_by(2_000) {
                assert!(app.update(poll(t), &mut model).effects.is_empty());
            }
            let generation = trigger_check(&app, &mut model);
            assert!(model.path().unwrap().alerts().is_active(AlertType::NoMove));
            assert!(app.update(poll(34_000), &mut model).effects.is_empty());
            assert_eq!(
                app.view(&model).safety_check,
                SafetyCheckState::AwaitingResponse {
                    generation,
                    deadline: UnixTimeMs(42_000),
                    remaining: 10,
                }
            );
        }

        #[test]
        fn test_expiry_sends_exactly_one_sms() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            let effects = run_out(&app, &mut model, generation);
            assert_eq!(sms_sent(&effects).len(), 1);
            assert!(timer_ops(&effects).contains(&TimerOperation::CancelCountdown));
            let view = app.view(&model);
            assert!(view.help_sent);
            assert_eq!(view.safety_check, SafetyCheckState::Idle);
            assert!(view.alerts.iter().any(|a| a.alert_type == AlertType::NoResponse && a.active));
            assert!(view.alerts.iter().any(|a| a.alert_type == AlertType::Emergency && a.active));

            let manual = app.update(Event::ManualSos { at: UnixTimeMs(43_000) }, &mut model);
            assert!(sms_sent(&manual.effects).is_empty());
            assert_eq!(
                app.view(&model).rejection,
                Some(Rejection::Sos(SosError::AlreadySent))
            );
        }

        #[test]
        fn test_sos_message_names_reason_and_location() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            let effects = run_out(&app, &mut model, generation);
            let dispatch = sms_sent(&effects).remove(0);
            assert_eq!(dispatch.reason, SosReason::NoResponse);
            assert!(dispatch.message.contains("Ann"));
            assert!(dispatch.message.contains("51.500000, -0.120000"));
            assert!(dispatch.message.contains("https://www.google.com/maps/search/"));
        }

        #[test]
        fn test_respond_safe_cancels_and_rearms() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            let update = app.update(Event::RespondSafe { at: UnixTimeMs(33_000) }, &mut model);
            assert_eq!(timer_ops(&update.effects), vec![TimerOperation::CancelCountdown]);
            assert!(renders(&update.effects));

            // In-flight tick of the resolved check.
            assert!(app.update(tick(generation, 33_500), &mut model).effects.is_empty());
            // Clock restarted: no new check right away.
            assert!(app.update(poll(34_000), &mut model).effects.is_empty());
            assert!(app.update(poll(63_000), &mut model).effects.is_empty());

            let alerts = model.path().unwrap().alerts();
            assert!(!alerts.is_active(AlertType::NoMove));
            assert!(alerts.get(AlertType::UserSafe).is_some());
            assert!(!app.view(&model).help_sent);

            let next = app.update(poll(64_000), &mut model);
            assert!(matches!(
                timer_ops(&next.effects).first(),
                Some(TimerOperation::StartCountdown { generation: g, tick_ms: 1_000 }) if *g == generation + 1
            ));
        }

        #[test]
        fn test_respond_unsafe_escalates() {
            let (app, mut model) = started();
            trigger_check(&app, &mut model);
            let update = app.update(Event::RespondUnsafe { at: UnixTimeMs(33_000) }, &mut model);
            assert_eq!(timer_ops(&update.effects), vec![TimerOperation::CancelCountdown]);
            let sent = sms_sent(&update.effects);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].reason, SosReason::UserRequestedHelp);
            assert_eq!(app.view(&model).rejection, None);
        }

        #[test]
        fn test_respond_unsafe_without_check_does_nothing() {
            let (app, mut model) = started();
            let update = app.update(Event::RespondUnsafe { at: UnixTimeMs(5_000) }, &mut model);
            assert!(update.effects.is_empty());
            let view = app.view(&model);
            assert!(!view.help_sent);
            assert_eq!(view.rejection, None);
            assert_eq!(view.delivery, DeliveryState::NotAttempted);
        }

        #[test]
        fn test_manual_sos_during_countdown_wins_race() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            let manual = app.update(Event::ManualSos { at: UnixTimeMs(35_000) }, &mut model);
            assert_eq!(sms_sent(&manual.effects).len(), 1);
            let late = run_out(&app, &mut model, generation);
            assert!(sms_sent(&late).is_empty());
        }

        #[test]
        fn test_countdown_unavailable_fails_open() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            let unavailable = Event::CountdownUnavailable {
                generation,
                at: UnixTimeMs(32_000),
            };
            let update = app.update(unavailable.clone(), &mut model);
            let sent = sms_sent(&update.effects);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].reason, SosReason::CountdownUnavailable);
            assert!(app.update(unavailable, &mut model).effects.is_empty());
        }

        #[test]
        fn test_movement_clears_no_move() {
            let (app, mut model) = started();
            let generation = trigger_check(&app, &mut model);
            run_out(&app, &mut model, generation);
            assert!(model.path().unwrap().alerts().is_active(AlertType::NoMove));

            app.update(located(fix(15.0, 1.0, 43_000), 43_000), &mut model);
            assert!(!model.path().unwrap().alerts().is_active(AlertType::NoMove));
        }
    }

    mod delivery {
        use super::*;

        fn failed() -> Result<SmsReceipt, SosError> {
            Err(SosError::SendFailed("HTTP error 503: gateway unavailable".into()))
        }

        #[test]
        fn test_missing_phone_records_sos_failed() {
            let (app, mut model) = configured();
            app.update(
                Event::StartWalk {
                    contact: Contact::new("Ann", None).unwrap(),
                    initial: None,
                    at: UnixTimeMs(0),
                },
                &mut model,
            );
            let update = app.update(Event::ManualSos { at: UnixTimeMs(1) }, &mut model);
            assert!(sms_sent(&update.effects).is_empty());
            let view = app.view(&model);
            assert_eq!(view.rejection, Some(Rejection::Sos(SosError::NoRecipient)));
            assert!(!view.help_sent);
            assert!(view.alerts.iter().any(|a| a.alert_type == AlertType::SosFailed && a.active));
        }

        #[test]
        fn test_failed_delivery_then_manual_retry() {
            let (app, mut model) = started();
            let id = session_id(&model);
            app.update(Event::ManualSos { at: UnixTimeMs(1) }, &mut model);
            app.update(delivered(id.clone(), 1, failed(), 2), &mut model);

            let view = app.view(&model);
            assert!(view.help_sent);
            assert!(view.alerts.iter().any(|a| a.alert_type == AlertType::SosFailed && a.active));
            app.update(Event::ManualSos { at: UnixTimeMs(3) }, &mut model);
            assert_eq!(
                app.view(&model).rejection,
                Some(Rejection::Sos(SosError::AlreadySent))
            );

            let retry = app.update(Event::RetrySos { at: UnixTimeMs(4) }, &mut model);
            assert_eq!(app.view(&model).rejection, None);
            let resent = sms_sent(&retry.effects);
            assert_eq!(resent.len(), 1);
            assert_eq!(resent[0].attempt, 2);

            app.update(delivered(id, 2, Ok(SmsReceipt::default()), 5), &mut model);
            let view = app.view(&model);
            assert!(matches!(view.delivery, DeliveryState::Delivered { attempt: 2, .. }));
            assert!(!view.alerts.iter().any(|a| a.alert_type == AlertType::SosFailed && a.active));
        }

        #[test]
        fn test_retry_without_failure() {
            let (app, mut model) = started();
            app.update(Event::RetrySos { at: UnixTimeMs(1) }, &mut model);
            assert_eq!(
                app.view(&model).rejection,
                Some(Rejection::Sos(SosError::NothingToRetry))
            );
            app.update(Event::ManualSos { at: UnixTimeMs(2) }, &mut model);
            app.update(Event::RetrySos { at: UnixTimeMs(3) }, &mut model);
            assert_eq!(
                app.view(&model).rejection,
                Some(Rejection::Sos(SosError::AlreadySent))
            );
        }

        #[test]
        fn test_result_after_end_is_recorded() {
            let (app, mut model) = started();
            let id = session_id(&model);
            app.update(Event::ManualSos { at: UnixTimeMs(1) }, &mut model);
            app.update(Event::EndWalk { at: UnixTimeMs(2) }, &mut model);
            app.update(
                delivered(id, 1, Err(SosError::Timeout { timeout_ms: 15_000 }), 15_001),
                &mut model,
            );
            assert!(matches!(
                app.view(&model).delivery,
                DeliveryState::Failed { attempt: 1, .. }
            ));
        }

        #[test]
        fn test_result_of_previous_walk_is_ignored() {
            let (app, mut model) = started();
            let first = session_id(&model);
            app.update(Event::ManualSos { at: UnixTimeMs(1) }, &mut model);
            app.update(Event::EndWalk { at: UnixTimeMs(2) }, &mut model);
            app.update(
                Event::StartWalk {
                    contact: ann(),
                    initial: None,
                    at: UnixTimeMs(3),
                },
                &mut model,
            );
            app.update(Event::ManualSos { at: UnixTimeMs(4) }, &mut model);

            let update = app.update(delivered(first, 1, failed(), 5), &mut model);
            assert!(update.effects.is_empty());
            let view = app.view(&model);
            assert_eq!(view.delivery, DeliveryState::InFlight { attempt: 1 });
            assert!(!view.alerts.iter().any(|a| a.alert_type == AlertType::SosFailed));
        }
    }

    mod connectivity {
        use super::*;

        #[test]
        fn test_lost_then_restored() {
            let (app, mut model) = started();
            app.update(
                Event::LocationLost {
                    error: LocationError::PermissionDenied,
                    at: UnixTimeMs(1_000),
                },
                &mut model,
            );
            let view = app.view(&model);
            assert_eq!(
                view.location,
                LocationStatus::Degraded {
                    error: LocationError::PermissionDenied
                }
            );
            assert!(view.alerts.iter().any(|a| a.alert_type == AlertType::ConnLost && a.active));
            assert!(view.last_known.is_some());

            app.update(located(fix(1.0, 0.0, 2_000), 2_000), &mut model);
            let view = app.view(&model);
            assert_eq!(view.location, LocationStatus::Live);
            assert!(!view.alerts.iter().any(|a| a.alert_type == AlertType::ConnLost && a.active));
        }

        #[test]
        fn test_view_serializes_for_shells() {
            let (app, mut model) = started();
            app.update(
                Event::LocationLost {
                    error: LocationError::StreamEnded,
                    at: UnixTimeMs(1),
                },
                &mut model,
            );
            app.update(Event::RetrySos { at: UnixTimeMs(2) }, &mut model);
            let json = serde_json::to_value(app.view(&model)).unwrap();
            assert_eq!(json["location"]["status"], "degraded");
            assert_eq!(json["safetyCheck"]["phase"], "idle");
            assert_eq!(json["alerts"][0]["type"], "started");
            assert_eq!(json["rejection"]["reason"], "sos");
        }
    }

    proptest! {
        #[test]
        fn prop_path_is_ordered_subsequence_of_input(
            steps in prop::collection::vec((-30.0f64..30.0, 0.0f64..2.0, -2_000i64..4_000), 1..60)
        ) {
            let (app, mut model) = configured();
            app.update(
                Event::StartWalk { contact: ann(), initial: None, at: UnixTimeMs(0) },
                &mut model,
            );

            let mut north = 0.0;
            let mut ts: i64 = 100_000;
            let mut input = Vec::new();
            for (dn, speed, dt) in steps {
                north += dn;
                ts = (ts + dt).max(0);
                #[allow(clippy::cast_sign_loss)]
                let sample = fix(north, speed, ts as u64);
                input.push(sample);
                app.update(located(sample, 200_000), &mut model);
            }

            let path = model.path().unwrap().path();
            let mut cursor = input.iter();
            for accepted in path {
                prop_assert!(cursor.any(|s| s == accepted));
            }
            prop_assert!(path.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

            let expected: f64 = path
                .windows(2)
                .map(|w| crate::geo::distance_meters(w[0].coordinate, w[1].coordinate))
                .sum();
            prop_assert!((model.path().unwrap().distance_m() - expected).abs() < 1e-6);
        }
    }
}
