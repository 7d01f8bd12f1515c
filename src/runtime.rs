use std::collections::VecDeque;
use std::time::Duration;

use crux_core::{Core, Request};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::capabilities::{
    Capabilities, Effect, HistoryOperation, HistorySaveOutcome, LocationError, LocationOperation,
    LocationSubscription, Services, SmsDelivery, SmsOperation, SmsReceipt, TaskGuard, Tick,
    TimerOperation,
};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, SosError};
use crate::event::Event;
use crate::lifecycle::HistoryRepository;
use crate::model::{Contact, HistoryId, HistoryRecord, LocationSample, UserId, WalkSession};
use crate::monitor::{App, MonitorView};
use crate::MAILBOX_CAPACITY;

type Reply<T> = oneshot::Sender<Result<T, MonitorError>>;

enum Command {
    Start {
        contact: Contact,
        initial: Option<LocationSample>,
        reply: Reply<WalkSession>,
    },
    RespondSafe {
        reply: Reply<()>,
    },
    RespondUnsafe {
        reply: Reply<()>,
    },
    ManualSos {
        reply: Reply<()>,
    },
    RetrySos {
        reply: Reply<()>,
    },
    End {
        reply: Reply<HistoryRecord>,
    },
    History {
        reply: Reply<Vec<HistoryRecord>>,
    },
    DeleteHistory {
        id: HistoryId,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<MonitorView>,
    },
    Shutdown,
}

/// What background tasks report back to the monitor task.
enum Signal {
    Location(LocationSample),
    LocationLost(LocationError),
    SmsDone {
        request: Request<SmsOperation>,
        result: Result<SmsReceipt, SosError>,
    },
}

/// Cloneable handle to a user's monitor task.
///
/// Every call is a message to the task; the task applies them one at a time together
/// with location samples, timer ticks and SMS results.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    signals: mpsc::Sender<Signal>,
    view: watch::Receiver<MonitorView>,
}

impl MonitorHandle {
    /// Spawns the monitor task on the current tokio runtime.
    pub fn spawn(
        user_id: UserId,
        config: MonitorConfig,
        services: Services,
    ) -> Result<(Self, JoinHandle<()>), MonitorError> {
        config.validate()?;
        let sms_timeout = config.sms_timeout();
        let core: Core<Effect, App> = Core::new::<Capabilities>();
        // Configuring never renders, so there is nothing to perform.
        let _ = core.process_event(Event::Configure {
            user_id: user_id.clone(),
            config,
        });

        let (command_tx, command_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (tick_tx, tick_rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (view_tx, view_rx) = watch::channel(core.view());

        let actor = MonitorActor {
            history: HistoryRepository::new(services.documents.clone(), user_id.clone()),
            user_id,
            core,
            services,
            sms_timeout,
            signals: signal_tx.clone(),
            ticks: tick_tx,
            view: view_tx,
            location: None,
            poll: None,
            countdown: None,
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx, tick_rx));

        Ok((
            Self {
                commands: command_tx,
                signals: signal_tx,
                view: view_rx,
            },
            task,
        ))
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, MonitorError>>) -> Command,
    ) -> Result<T, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| MonitorError::Closed)?;
        response.await.map_err(|_| MonitorError::Closed)?
    }

    pub async fn start_walk(
        &self,
        contact: Contact,
        initial: Option<LocationSample>,
    ) -> Result<WalkSession, MonitorError> {
        self.call(|reply| Command::Start {
            contact,
            initial,
            reply,
        })
        .await
    }

    /// Feeds a sample directly, bypassing the location provider.
    pub async fn push_location(&self, sample: LocationSample) -> Result<(), MonitorError> {
        self.signals
            .send(Signal::Location(sample))
            .await
            .map_err(|_| MonitorError::Closed)
    }

    pub async fn respond_safe(&self) -> Result<(), MonitorError> {
        self.call(|reply| Command::RespondSafe { reply }).await
    }

    /// Does nothing unless a safety check is waiting for an answer.
    pub async fn respond_unsafe(&self) -> Result<(), MonitorError> {
        self.call(|reply| Command::RespondUnsafe { reply }).await
    }

    pub async fn manual_sos(&self) -> Result<(), MonitorError> {
        self.call(|reply| Command::ManualSos { reply }).await
    }

    pub async fn retry_sos(&self) -> Result<(), MonitorError> {
        self.call(|reply| Command::RetrySos { reply }).await
    }

    /// Ends the walk. A failed history save shows up as a `historyNotSaved` alert.
    pub async fn end_walk(&self) -> Result<HistoryRecord, MonitorError> {
        self.call(|reply| Command::End { reply }).await
    }

    pub async fn history(&self) -> Result<Vec<HistoryRecord>, MonitorError> {
        self.call(|reply| Command::History { reply }).await
    }

    pub async fn delete_history(&self, id: HistoryId) -> Result<bool, MonitorError> {
        self.call(|reply| Command::DeleteHistory { id, reply }).await
    }

    /// Current view, after everything already queued has been applied.
    pub async fn snapshot(&self) -> Result<MonitorView, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| MonitorError::Closed)?;
        response.await.map_err(|_| MonitorError::Closed)
    }

    /// Receives a new view whenever the monitor renders.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view.clone()
    }

    /// Stops the task. Timers and the location subscription are dropped with it.
    pub async fn shutdown(&self) -> Result<(), MonitorError> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| MonitorError::Closed)
    }
}

fn verdict(view: &MonitorView) -> Result<(), MonitorError> {
    match &view.rejection {
        Some(rejection) => Err(rejection.clone().into()),
        None => Ok(()),
    }
}

/// The shell: owns the core and performs every effect it requests.
struct MonitorActor {
    core: Core<Effect, App>,
    services: Services,
    history: HistoryRepository,
    user_id: UserId,
    sms_timeout: Duration,
    signals: mpsc::Sender<Signal>,
    ticks: mpsc::Sender<Tick>,
    view: watch::Sender<MonitorView>,
    location: Option<TaskGuard>,
    poll: Option<TaskGuard>,
    countdown: Option<TaskGuard>,
}

impl MonitorActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut signals: mpsc::Receiver<Signal>,
        mut ticks: mpsc::Receiver<Tick>,
    ) {
        info!(user_id = %self.user_id, "monitor started");
        loop {
            // Background reports first, so a command sees every sample queued before it.
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.on_signal(signal).await,
                Some(tick) = ticks.recv() => self.on_tick(tick).await,
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.execute(command).await,
                },
            }
        }
        self.countdown = None;
        self.poll = None;
        self.location = None;
        info!(user_id = %self.user_id, "monitor stopped");
    }

    async fn on_signal(&mut self, signal: Signal) {
        let at = self.services.clock.now();
        match signal {
            Signal::Location(sample) => self.submit(Event::LocationReceived { sample, at }).await,
            Signal::LocationLost(error) => self.submit(Event::LocationLost { error, at }).await,
            Signal::SmsDone {
                mut request,
                result,
            } => {
                let effects = self.core.resolve(&mut request, SmsDelivery { result, at });
                self.perform(effects).await;
            }
        }
    }

    async fn on_tick(&mut self, tick: Tick) {
        let at = self.services.clock.now();
        let event = match tick {
            Tick::ImmobilityPoll => Event::ImmobilityPoll { at },
            Tick::Countdown { generation } => Event::CountdownTick { generation, at },
        };
        self.submit(event).await;
    }

    async fn submit(&mut self, event: Event) {
        let effects = self.core.process_event(event);
        self.perform(effects).await;
    }

    /// Applies a command and returns the view as the command left it.
    async fn command(&mut self, event: Event) -> MonitorView {
        let effects = self.core.process_event(event);
        let view = self.core.view();
        self.perform(effects).await;
        view
    }

    async fn execute(&mut self, command: Command) {
        let at = self.services.clock.now();
        match command {
            Command::Start {
                contact,
                initial,
                reply,
            } => {
                let view = self
                    .command(Event::StartWalk {
                        contact,
                        initial,
                        at,
                    })
                    .await;
                let result = verdict(&view)
                    .and_then(|()| view.session.ok_or(MonitorError::NoActiveSession));
                let _ = reply.send(result);
            }
            Command::RespondSafe { reply } => {
                let view = self.command(Event::RespondSafe { at }).await;
                let _ = reply.send(verdict(&view));
            }
            Command::RespondUnsafe { reply } => {
                let view = self.command(Event::RespondUnsafe { at }).await;
                let _ = reply.send(verdict(&view));
            }
            Command::ManualSos { reply } => {
                let view = self.command(Event::ManualSos { at }).await;
                let _ = reply.send(verdict(&view));
            }
            Command::RetrySos { reply } => {
                let view = self.command(Event::RetrySos { at }).await;
                let _ = reply.send(verdict(&view));
            }
            Command::End { reply } => {
                let view = self.command(Event::EndWalk { at }).await;
                let result = verdict(&view)
                    .and_then(|()| view.summary.ok_or(MonitorError::NoActiveSession));
                let _ = reply.send(result);
            }
            Command::History { reply } => {
                let _ = reply.send(self.history.list().await.map_err(MonitorError::from));
            }
            Command::DeleteHistory { id, reply } => {
                let _ = reply.send(self.history.delete(&id).await.map_err(MonitorError::from));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.core.view());
            }
            Command::Shutdown => {}
        }
    }

    /// Performs effects; effects produced while performing them are handled before returning.
    async fn perform(&mut self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            queue.extend(self.apply(effect).await);
        }
    }

    async fn apply(&mut self, effect: Effect) -> Vec<Effect> {
        match effect {
            Effect::Render(_) => {
                self.view.send_replace(self.core.view());
                Vec::new()
            }
            Effect::Location(request) => self.locate(request.operation).await,
            Effect::Timer(request) => self.schedule(request.operation),
            Effect::Sms(request) => {
                self.send_sms(request);
                Vec::new()
            }
            Effect::History(mut request) => {
                let HistoryOperation::Save(record) = request.operation.clone();
                let result = match self.history.save(&record).await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        error!(history_id = %record.id, error = %e, "walk could not be saved to history");
                        Err(e.to_string())
                    }
                };
                let outcome = HistorySaveOutcome {
                    result,
                    at: self.services.clock.now(),
                };
                self.core.resolve(&mut request, outcome)
            }
        }
    }

    async fn locate(&mut self, operation: LocationOperation) -> Vec<Effect> {
        match operation {
            LocationOperation::Start { session_id } => {
                match self.services.location.subscribe().await {
                    Ok(subscription) => {
                        debug!(%session_id, "location updates started");
                        self.location = Some(self.forward_locations(subscription));
                        Vec::new()
                    }
                    Err(error) => {
                        warn!(%session_id, %error, "location updates unavailable");
                        let at = self.services.clock.now();
                        self.core.process_event(Event::LocationLost { error, at })
                    }
                }
            }
            LocationOperation::Stop => {
                self.location = None;
                Vec::new()
            }
        }
    }

    fn schedule(&mut self, operation: TimerOperation) -> Vec<Effect> {
        let scheduler = &self.services.scheduler;
        match operation {
            TimerOperation::StartPoll { period_ms } => {
                let period = Duration::from_millis(period_ms);
                match scheduler.every(period, self.ticks.clone(), Tick::ImmobilityPoll) {
                    Ok(timer) => self.poll = Some(timer),
                    Err(e) => error!(error = %e, "immobility poll could not be scheduled"),
                }
            }
            TimerOperation::StopPoll => self.poll = None,
            TimerOperation::StartCountdown {
                generation,
                tick_ms,
            } => {
                let tick = Duration::from_millis(tick_ms);
                match scheduler.every(tick, self.ticks.clone(), Tick::Countdown { generation }) {
                    Ok(timer) => self.countdown = Some(timer),
                    Err(e) => {
                        error!(generation, error = %e, "countdown could not be scheduled");
                        let at = self.services.clock.now();
                        return self
                            .core
                            .process_event(Event::CountdownUnavailable { generation, at });
                    }
                }
            }
            TimerOperation::CancelCountdown => self.countdown = None,
        }
        Vec::new()
    }

    fn forward_locations(&self, mut subscription: LocationSubscription) -> TaskGuard {
        let signals = self.signals.clone();
        TaskGuard::new(tokio::spawn(async move {
            while let Some(sample) = subscription.next().await {
                if signals.send(Signal::Location(sample)).await.is_err() {
                    return;
                }
            }
            let _ = signals
                .send(Signal::LocationLost(LocationError::StreamEnded))
                .await;
        }))
    }

    /// Sends in the background; the outcome resolves `request` back on the monitor task.
    fn send_sms(&self, request: Request<SmsOperation>) {
        let SmsOperation::Send(dispatch) = &request.operation;
        let span = info_span!("sos_send", attempt = dispatch.attempt, reason = %dispatch.reason);
        let recipient = dispatch.recipient.clone();
        let message = dispatch.message.clone();
        let sms = self.services.sms.clone();
        let signals = self.signals.clone();
        let timeout = self.sms_timeout;
        let send = async move {
            #[allow(clippy::cast_possible_truncation)]
            let timeout_ms = timeout.as_millis() as u64;
            let result = match tokio::time::timeout(timeout, sms.send(&recipient, &message)).await
            {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) => Err(SosError::from(e)),
                Err(_) => Err(SosError::Timeout { timeout_ms }),
            };
            if signals
                .send(Signal::SmsDone { request, result })
                .await
                .is_err()
            {
                debug!("monitor stopped before the SMS result arrived");
            }
        };
        tokio::spawn(send.instrument(span));
    }
}
