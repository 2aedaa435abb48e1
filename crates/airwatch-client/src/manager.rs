//! Connection manager.
//!
//! Owns the session lifecycle: push first, bounded exponential reconnects,
//! fallback to polling, periodic push probes while polling, and staleness
//! detection. One actor task owns the active transport and the ingest
//! pipeline; the [`ConnectionManager`] handle talks to it over a command
//! channel and exposes status, snapshot and alerts through `watch` views.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected -> Reconnecting -> Connected | Polling
//! Polling -> Connected            (successful probe)
//! any -> Disconnected             (disconnect)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use airwatch_core::{
    Alert, BusEvent, Category, ConfigError, ConnectionState, ConnectionStatus, EventBus,
    ObservationEvent, ReconciledSnapshot, Settings, Subscription, SubscriptionBus, TransportKind,
};
use airwatch_protocol::Command;

use crate::backoff::Backoff;
use crate::pipeline::{IngestPipeline, Origin, PipelineViews};
use crate::transport::{
    ActiveTransport, ConnectionHandle, EventSink, HttpTransportFactory, Response,
    TransportAdapter, TransportError, TransportEvent, TransportFactory,
};

const EVENT_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 32;

enum ManagerCommand {
    RequestLatest(oneshot::Sender<Vec<ObservationEvent>>),
    LoadHistory(oneshot::Sender<usize>),
    Invoke(Command, oneshot::Sender<Result<Response, TransportError>>),
}

/// Writes the status watch and publishes the matching bus events.
#[derive(Clone)]
struct StatusWriter {
    tx: Arc<watch::Sender<ConnectionStatus>>,
    bus: Arc<SubscriptionBus>,
}

impl StatusWriter {
    fn transition<F>(&self, state: ConnectionState, update: F)
    where
        F: FnOnce(&mut ConnectionStatus),
    {
        let mut previous = state;
        self.tx.send_modify(|status| {
            previous = status.state;
            status.state = state;
            update(status);
        });
        let status = self.tx.borrow().clone();

        if previous != state {
            info!(
                from = ?previous,
                to = ?state,
                transport = ?status.transport,
                "Connection state changed"
            );
        }
        if state == ConnectionState::Connected && previous != state {
            self.bus.publish(BusEvent::Connected(status.clone()));
        }
        if previous != state
            && (previous == ConnectionState::Connected || state == ConnectionState::Disconnected)
        {
            self.bus.publish(BusEvent::Disconnected(status.clone()));
        }
        self.bus.publish(BusEvent::StatusChanged(status));
    }

    fn record_error(&self, error: &TransportError) {
        let text = error.to_string();
        self.tx.send_modify(|status| status.last_error = Some(text));
    }

    fn data_received(&self) {
        let mut cleared = false;
        self.tx.send_modify(|status| {
            status.last_data_at = Some(Utc::now());
            cleared = std::mem::take(&mut status.waiting_for_data);
        });
        if cleared {
            info!("Data flowing again");
            let status = self.tx.borrow().clone();
            self.bus.publish(BusEvent::StatusChanged(status));
        }
    }

    /// Set `waiting_for_data`; returns the status when it was not set yet.
    fn mark_stale(&self) -> Option<ConnectionStatus> {
        let marked = self.tx.send_if_modified(|status| {
            !std::mem::replace(&mut status.waiting_for_data, true)
        });
        if !marked {
            return None;
        }
        let status = self.tx.borrow().clone();
        self.bus.publish(BusEvent::StatusChanged(status.clone()));
        Some(status)
    }
}

struct Running {
    cancel: CancellationToken,
    commands: mpsc::Sender<ManagerCommand>,
    task: JoinHandle<IngestPipeline>,
}

struct Inner {
    /// Parked here while no actor runs.
    pipeline: Option<IngestPipeline>,
    running: Option<Running>,
}

/// Handle to one client session.
///
/// Bus handlers may read status, snapshot and alerts, but must not call the
/// async lifecycle methods from inside a handler.
pub struct ConnectionManager {
    settings: Settings,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<SubscriptionBus>,
    status: StatusWriter,
    views: PipelineViews,
    inner: Mutex<Inner>,
    /// Held across start and the whole of disconnect, so a restart never
    /// races the pipeline hand-back.
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager using the WebSocket and HTTP transports.
    pub fn new(settings: Settings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let factory = Arc::new(HttpTransportFactory::new(settings.transport.clone()));
        Ok(Self::with_factory(settings, factory))
    }

    /// Create a manager with custom transports.
    pub fn with_factory(settings: Settings, factory: Arc<dyn TransportFactory>) -> Self {
        let bus = Arc::new(SubscriptionBus::new());
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let views = PipelineViews::new();
        let pipeline = IngestPipeline::new(&settings, bus.clone(), views.clone());

        Self {
            settings,
            factory,
            status: StatusWriter {
                tx: Arc::new(status_tx),
                bus: bus.clone(),
            },
            bus,
            views,
            inner: Mutex::new(Inner {
                pipeline: Some(pipeline),
                running: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Start the session if needed and wait until it settles.
    ///
    /// Returns `true` when connected over push, `false` when degraded to
    /// polling (or stopped meanwhile).
    pub async fn initialize(&self) -> bool {
        self.start().await;

        let mut status_rx = self.status.tx.subscribe();
        let settled = status_rx
            .wait_for(|status| {
                matches!(
                    status.state,
                    ConnectionState::Connected
                        | ConnectionState::Polling
                        | ConnectionState::Disconnected
                )
            })
            .await;

        match settled {
            Ok(status) => status.state == ConnectionState::Connected,
            Err(_) => false,
        }
    }

    /// Start the session without waiting for it to settle. No-op when
    /// already running. Waits for a disconnect in progress to finish.
    pub async fn start(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let mut inner = self.inner.lock();
        if inner.running.is_some() {
            return;
        }

        let pipeline = match inner.pipeline.take() {
            Some(pipeline) => pipeline,
            None => self.fresh_pipeline(),
        };

        // Visible before the actor runs so `initialize` never reads a stale
        // Disconnected.
        self.status.tx.send_modify(|status| {
            status.state = ConnectionState::Connecting;
            status.is_enabled = true;
        });

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let mut stale_check =
            tokio::time::interval(stale_check_period(self.settings.staleness.threshold()));
        stale_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let actor = Actor {
            settings: self.settings.clone(),
            factory: self.factory.clone(),
            pipeline,
            status: self.status.clone(),
            cancel: cancel.clone(),
            commands: commands_rx,
            backoff: Backoff::from_settings(&self.settings.reconnect),
            last_activity: Instant::now(),
            stale_check,
        };

        inner.running = Some(Running {
            cancel,
            commands: commands_tx,
            task: tokio::spawn(actor.run()),
        });
    }

    /// Stop the session: cancels pending connects, backoff timers, probes
    /// and the poll ticker, then waits for them to finish.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.inner.lock().running.take();
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        let pipeline = match running.task.await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(error = %e, "Connection manager task failed, reconciled state lost");
                self.fresh_pipeline()
            }
        };
        self.inner.lock().pipeline = Some(pipeline);

        self.status
            .transition(ConnectionState::Disconnected, |status| {
                status.is_enabled = false;
                status.transport = None;
                status.reconnect_attempts = 0;
                status.waiting_for_data = false;
            });
    }

    /// Fetch the latest observation per station, in any mode.
    ///
    /// Results are reconciled like pushed data. Failures yield an empty list.
    pub async fn request_latest(&self) -> Vec<ObservationEvent> {
        if let Some(commands) = self.commands() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands
                .send(ManagerCommand::RequestLatest(reply_tx))
                .await
                .is_err()
            {
                return Vec::new();
            }
            return reply_rx.await.unwrap_or_default();
        }

        let events = observations_or_empty(
            "latest",
            self.invoke_detached(Command::GetLatestAirQuality).await,
        );
        self.preload_detached(events.clone());
        events
    }

    /// Fetch recent history and reconcile it oldest first. Returns the
    /// number of accepted observations.
    pub async fn load_history(&self) -> usize {
        if let Some(commands) = self.commands() {
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands
                .send(ManagerCommand::LoadHistory(reply_tx))
                .await
                .is_err()
            {
                return 0;
            }
            return reply_rx.await.unwrap_or_default();
        }

        let events = observations_or_empty(
            "history",
            self.invoke_detached(Command::GetAirQualityHistory).await,
        );
        self.preload_detached(events)
    }

    /// Invoke a hub method on the active transport (or a one-shot poll
    /// adapter when stopped).
    pub async fn invoke(&self, command: Command) -> Result<Response, TransportError> {
        match self.commands() {
            Some(commands) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                commands
                    .send(ManagerCommand::Invoke(command, reply_tx))
                    .await
                    .map_err(|_| TransportError::Closed("session stopped".to_string()))?;
                reply_rx
                    .await
                    .map_err(|_| TransportError::Closed("session stopped".to_string()))?
            }
            None => self.invoke_detached(command).await,
        }
    }

    /// Receive pushes for one station only.
    pub async fn join_location_group(&self, station_id: &str) -> bool {
        self.group_command(Command::JoinLocationGroup(station_id.to_string()))
            .await
    }

    pub async fn leave_location_group(&self, station_id: &str) -> bool {
        self.group_command(Command::LeaveLocationGroup(station_id.to_string()))
            .await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.tx.borrow().is_connected()
    }

    pub fn is_polling(&self) -> bool {
        self.status.tx.borrow().is_polling()
    }

    pub fn bus(&self) -> &Arc<SubscriptionBus> {
        &self.bus
    }

    /// Subscribe a closure to one bus category.
    pub fn on<F>(&self, category: Category, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.bus.on(category, handler)
    }

    pub fn snapshot(&self) -> Arc<ReconciledSnapshot> {
        self.views.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Arc<ReconciledSnapshot>> {
        self.views.snapshot.subscribe()
    }

    /// Recent alerts, newest first.
    pub fn recent_alerts(&self) -> Vec<Alert> {
        self.views.alerts.borrow().clone()
    }

    pub fn watch_alerts(&self) -> watch::Receiver<Vec<Alert>> {
        self.views.alerts.subscribe()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn commands(&self) -> Option<mpsc::Sender<ManagerCommand>> {
        self.inner
            .lock()
            .running
            .as_ref()
            .map(|running| running.commands.clone())
    }

    fn fresh_pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(&self.settings, self.bus.clone(), self.views.clone())
    }

    async fn invoke_detached(&self, command: Command) -> Result<Response, TransportError> {
        let adapter = self.factory.poll()?;
        adapter.invoke(command).await
    }

    fn preload_detached(&self, events: Vec<ObservationEvent>) -> usize {
        let mut inner = self.inner.lock();
        match inner.pipeline.as_mut() {
            Some(pipeline) => {
                let accepted = pipeline.preload(events);
                if accepted > 0 {
                    self.status.data_received();
                }
                accepted
            }
            None => 0,
        }
    }

    async fn group_command(&self, command: Command) -> bool {
        let name = command.name();
        match self.invoke(command).await {
            Ok(response) => {
                if let Some(message) = &response.message {
                    debug!(command = name, message = %message, "Group command answered");
                }
                response.success
            }
            Err(e) => {
                warn!(command = name, error = %e, "Group command failed");
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(running) = self.inner.get_mut().running.take() {
            running.cancel.cancel();
        }
    }
}

fn observations_or_empty(
    what: &str,
    result: Result<Response, TransportError>,
) -> Vec<ObservationEvent> {
    match result {
        Ok(response) if response.success => response.observations,
        Ok(response) => {
            warn!(request = what, message = ?response.message, "Request rejected");
            Vec::new()
        }
        Err(e) => {
            warn!(request = what, error = %e, "Request failed");
            Vec::new()
        }
    }
}

/// Next thing the actor does.
enum Step {
    ConnectPush,
    RetryPush,
    StartPolling,
    Serve(ActiveTransport, mpsc::Receiver<TransportEvent>),
    Stop,
}

/// Session owner: runs the state machine until cancelled, then hands the
/// pipeline back.
struct Actor {
    settings: Settings,
    factory: Arc<dyn TransportFactory>,
    pipeline: IngestPipeline,
    status: StatusWriter,
    cancel: CancellationToken,
    commands: mpsc::Receiver<ManagerCommand>,
    backoff: Backoff,
    last_activity: Instant,
    /// Runs in every state, including connects and backoff sleeps.
    stale_check: Interval,
}

impl Actor {
    async fn run(mut self) -> IngestPipeline {
        self.status
            .transition(ConnectionState::Connecting, |status| {
                status.is_enabled = true;
                status.transport = None;
                status.reconnect_attempts = 0;
                status.last_error = None;
            });

        let mut step = if self.settings.transport.push_enabled {
            Step::ConnectPush
        } else {
            info!("Push disabled, polling only");
            Step::StartPolling
        };

        loop {
            step = match step {
                Step::ConnectPush => self.connect_push().await,
                Step::RetryPush => self.retry_push().await,
                Step::StartPolling => self.start_polling().await,
                Step::Serve(transport, events) => self.serve(transport, events).await,
                Step::Stop => break,
            };
        }

        debug!("Connection manager actor stopped");
        self.pipeline
    }

    async fn connect_push(&mut self) -> Step {
        let mut adapter = match self.factory.push() {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(error = %e, "Cannot create push transport");
                self.status.record_error(&e);
                return Step::StartPolling;
            }
        };

        let (sink, events) = mpsc::channel(EVENT_BUFFER);
        let Some(connected) = self.connect_adapter(&mut adapter, sink).await else {
            return Step::Stop;
        };

        match connected {
            Ok(_) => {
                self.backoff.reset();
                self.status
                    .transition(ConnectionState::Connected, |status| {
                        status.transport = Some(TransportKind::Push);
                        status.reconnect_attempts = 0;
                        status.last_error = None;
                    });
                Step::Serve(ActiveTransport::Push(adapter), events)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    retries = self.backoff.attempts(),
                    "Push connect failed"
                );
                self.status.record_error(&e);
                Step::RetryPush
            }
        }
    }

    async fn retry_push(&mut self) -> Step {
        if self.backoff.attempts() >= self.settings.reconnect.max_attempts {
            info!(
                retries = self.backoff.attempts(),
                "Push unavailable, falling back to polling"
            );
            return Step::StartPolling;
        }

        let delay = self.backoff.next_delay();
        let attempts = self.backoff.attempts();
        self.status
            .transition(ConnectionState::Reconnecting, |status| {
                status.transport = None;
                status.reconnect_attempts = attempts;
            });
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempts,
            "Scheduling push reconnect"
        );

        if self.pause(delay).await {
            Step::ConnectPush
        } else {
            Step::Stop
        }
    }

    async fn start_polling(&mut self) -> Step {
        let retry_after = self.settings.transport.poll_interval();

        let mut adapter = match self.factory.poll() {
            Ok(adapter) => adapter,
            Err(e) => {
                error!(error = %e, "Cannot create poll transport");
                self.status.record_error(&e);
                return if self.pause(retry_after).await {
                    Step::StartPolling
                } else {
                    Step::Stop
                };
            }
        };

        let (sink, events) = mpsc::channel(EVENT_BUFFER);
        let Some(connected) = self.connect_adapter(&mut adapter, sink).await else {
            return Step::Stop;
        };

        match connected {
            Ok(_) => {
                self.status.transition(ConnectionState::Polling, |status| {
                    status.transport = Some(TransportKind::Poll);
                });
                Step::Serve(ActiveTransport::Poll(adapter), events)
            }
            Err(e) => {
                warn!(error = %e, "Poll transport failed to start");
                self.status.record_error(&e);
                if self.pause(retry_after).await {
                    Step::StartPolling
                } else {
                    Step::Stop
                }
            }
        }
    }

    async fn serve(
        &mut self,
        mut transport: ActiveTransport,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> Step {
        let mut probe = (transport.kind() == TransportKind::Poll
            && self.settings.transport.push_enabled)
            .then(|| {
                let period = self.settings.reconnect.probe_interval();
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    transport.disconnect().await;
                    return Step::Stop;
                }

                event = events.recv() => match event {
                    Some(TransportEvent::Closed { reason }) => {
                        return self.transport_closed(transport, reason).await;
                    }
                    Some(event) => self.apply(event),
                    None => {
                        return self
                            .transport_closed(transport, "event channel closed".to_string())
                            .await;
                    }
                },

                Some(command) = self.commands.recv() => {
                    self.handle_command(command, Some(&transport)).await;
                }

                _ = tick(&mut probe) => {
                    if let Some((push, push_events)) = self.probe_push().await {
                        transport.disconnect().await;
                        self.backoff.reset();
                        self.status.transition(ConnectionState::Connected, |status| {
                            status.transport = Some(TransportKind::Push);
                            status.reconnect_attempts = 0;
                            status.last_error = None;
                        });
                        return Step::Serve(ActiveTransport::Push(push), push_events);
                    }
                }

                _ = self.stale_check.tick() => self.check_staleness(),
            }
        }
    }

    async fn transport_closed(&mut self, mut transport: ActiveTransport, reason: String) -> Step {
        transport.disconnect().await;
        warn!(transport = %transport.kind(), reason = %reason, "Transport closed");
        self.status
            .record_error(&TransportError::Closed(reason));

        match transport.kind() {
            TransportKind::Push => Step::RetryPush,
            TransportKind::Poll => Step::StartPolling,
        }
    }

    /// Try the push transport while polling.
    async fn probe_push(
        &mut self,
    ) -> Option<(Box<dyn TransportAdapter>, mpsc::Receiver<TransportEvent>)> {
        let mut adapter = match self.factory.push() {
            Ok(adapter) => adapter,
            Err(e) => {
                debug!(error = %e, "Push probe skipped");
                return None;
            }
        };

        let (sink, events) = mpsc::channel(EVENT_BUFFER);
        let connected = self.connect_adapter(&mut adapter, sink).await?;

        match connected {
            Ok(handle) => {
                info!(
                    connection_id = ?handle.connection_id,
                    "Push probe succeeded, leaving polling"
                );
                Some((adapter, events))
            }
            Err(e) => {
                debug!(error = %e, "Push probe failed");
                None
            }
        }
    }

    /// Sleep while still answering commands. Returns `false` when cancelled.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(command) = self.commands.recv() => {
                    self.handle_command(command, None).await;
                }
                _ = self.stale_check.tick() => self.check_staleness(),
            }
        }
    }

    /// Drive one connect attempt, checking staleness while it is pending.
    /// `None` when cancelled.
    async fn connect_adapter(
        &mut self,
        adapter: &mut Box<dyn TransportAdapter>,
        sink: EventSink,
    ) -> Option<Result<ConnectionHandle, TransportError>> {
        let mut connect = adapter.connect(sink);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                connected = &mut connect => return Some(connected),
                _ = self.stale_check.tick() => self.check_staleness(),
            }
        }
    }

    fn apply(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::NewData(event) => {
                self.ingest(event, Origin::NewData);
            }
            TransportEvent::Update(event) => {
                self.ingest(event, Origin::Update);
            }
            TransportEvent::Alert(alert) => {
                let station_id = alert.station_id.clone();
                let level = alert.level;
                if self.pipeline.accept_pushed_alert(alert) {
                    info!(station_id = %station_id, level = %level, "Alert pushed by backend");
                }
            }
            TransportEvent::DeviceStatus(status) => self.pipeline.publish_device_status(status),
            TransportEvent::Closed { .. } => {}
        }
    }

    fn ingest(&mut self, event: ObservationEvent, origin: Origin) -> bool {
        let accepted = self.pipeline.ingest(event, origin).is_some();
        if accepted {
            self.last_activity = Instant::now();
            self.status.data_received();
        }
        accepted
    }

    fn check_staleness(&self) {
        let threshold = self.settings.staleness.threshold();
        if self.last_activity.elapsed() < threshold {
            return;
        }
        if let Some(status) = self.status.mark_stale() {
            info!(threshold_secs = threshold.as_secs(), "No new data, waiting for data");
            self.status.bus.publish(BusEvent::DataStale {
                last_data_at: status.last_data_at,
            });
        }
    }

    async fn handle_command(&mut self, command: ManagerCommand, transport: Option<&ActiveTransport>) {
        match command {
            ManagerCommand::RequestLatest(reply) => {
                let events = observations_or_empty(
                    "latest",
                    self.invoke(transport, Command::GetLatestAirQuality).await,
                );
                for event in events.iter().cloned() {
                    self.ingest(event, Origin::NewData);
                }
                let _ = reply.send(events);
            }
            ManagerCommand::LoadHistory(reply) => {
                let events = observations_or_empty(
                    "history",
                    self.invoke(transport, Command::GetAirQualityHistory).await,
                );
                let accepted = events
                    .into_iter()
                    .filter(|event| self.ingest(event.clone(), Origin::NewData))
                    .count();
                info!(accepted, "History loaded");
                let _ = reply.send(accepted);
            }
            ManagerCommand::Invoke(command, reply) => {
                let _ = reply.send(self.invoke(transport, command).await);
            }
        }
    }

    async fn invoke(
        &self,
        transport: Option<&ActiveTransport>,
        command: Command,
    ) -> Result<Response, TransportError> {
        let request = async {
            match transport {
                Some(transport) => transport.adapter().invoke(command).await,
                None => self.factory.poll()?.invoke(command).await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed("session stopped".to_string())),
            result = request => result,
        }
    }
}

fn stale_check_period(threshold: Duration) -> Duration {
    (threshold / 4).max(Duration::from_millis(10))
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use airwatch_core::{AlertLevel, Location};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::time::timeout;


    #[derive(Default)]
    struct Script {
        push_failing: AtomicBool,
        push_hangs: AtomicBool,
        push_connects: AtomicUsize,
        push_sink: Mutex<Option<EventSink>>,
        poll_active: AtomicBool,
        poll_sink: Mutex<Option<EventSink>>,
        latest: Mutex<Vec<ObservationEvent>>,
    }

    struct FakeFactory(Arc<Script>);

    impl TransportFactory for FakeFactory {
        fn push(&self) -> Result<Box<dyn TransportAdapter>, TransportError> {
            Ok(Box::new(FakePush(self.0.clone())))
        }

        fn poll(&self) -> Result<Box<dyn TransportAdapter>, TransportError> {
            Ok(Box::new(FakePoll(self.0.clone())))
        }
    }

    struct FakePush(Arc<Script>);

    #[async_trait]
    impl TransportAdapter for FakePush {
        fn kind(&self) -> TransportKind {
            TransportKind::Push
        }

        async fn connect(&mut self, sink: EventSink) -> Result<ConnectionHandle, TransportError> {
            self.0.push_connects.fetch_add(1, Ordering::SeqCst);
            if self.0.push_hangs.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.0.push_failing.load(Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    url: "ws://fake".to_string(),
                    reason: "refused".to_string(),
                });
            }
            *self.0.push_sink.lock() = Some(sink);
            Ok(ConnectionHandle::new(TransportKind::Push, Some("fake".to_string())))
        }

        async fn disconnect(&mut self) {
            self.0.push_sink.lock().take();
        }

        async fn invoke(&self, _command: Command) -> Result<Response, TransportError> {
            Ok(Response::with_observations(self.0.latest.lock().clone()))
        }
    }

    struct FakePoll(Arc<Script>);

    #[async_trait]
    impl TransportAdapter for FakePoll {
        fn kind(&self) -> TransportKind {
            TransportKind::Poll
        }

        async fn connect(&mut self, sink: EventSink) -> Result<ConnectionHandle, TransportError> {
            self.0.poll_active.store(true, Ordering::SeqCst);
            *self.0.poll_sink.lock() = Some(sink);
            Ok(ConnectionHandle::new(TransportKind::Poll, None))
        }

        async fn disconnect(&mut self) {
            self.0.poll_active.store(false, Ordering::SeqCst);
            self.0.poll_sink.lock().take();
        }

        async fn invoke(&self, _command: Command) -> Result<Response, TransportError> {
            Ok(Response::with_observations(self.0.latest.lock().clone()))
        }
    }

    fn settings(push_enabled: bool) -> Settings {
        let mut settings = Settings::default();
        settings.transport.push_enabled = push_enabled;
        settings.reconnect.max_attempts = 2;
        settings.reconnect.initial_delay_ms = 10;
        settings.reconnect.max_delay_ms = 40;
        settings.reconnect.probe_interval_ms = 100;
        settings.staleness.threshold_secs = 1;
        settings
    }

    fn manager(push_enabled: bool, script: &Arc<Script>) -> ConnectionManager {
        ConnectionManager::with_factory(settings(push_enabled), Arc::new(FakeFactory(script.clone())))
    }

    fn counter(manager: &ConnectionManager, category: Category) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        manager.on(category, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn reading(station: &str, millis: i64, aqi: f64) -> ObservationEvent {
        ObservationEvent::new(
            station,
            Utc.timestamp_millis_opt(1_740_816_000_000 + millis).unwrap(),
            Location::new(21.0, 105.8),
        )
        .with_aqi(aqi)
    }

    fn poll_sink(script: &Script) -> EventSink {
        script.poll_sink.lock().clone().expect("poll transport connected")
    }

    async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
        let mut rx = manager.watch_status();
        timeout(Duration::from_secs(30), rx.wait_for(|s| s.state == state))
            .await
            .expect("state reached in time")
            .expect("status channel open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_polling_after_retry_budget() {
        let script = Arc::new(Script::default());
        script.push_failing.store(true, Ordering::SeqCst);
        let manager = manager(true, &script);

        assert!(!manager.initialize().await);

        let status = manager.status();
        assert!(status.is_polling());
        assert!(!status.is_connected());
        assert!(status.is_enabled);
        assert_eq!(status.transport, Some(TransportKind::Poll));
        assert_eq!(status.reconnect_attempts, 2);
        assert!(status.last_error.is_some());
        assert_eq!(script.push_connects.load(Ordering::SeqCst), 3);
        assert!(script.poll_active.load(Ordering::SeqCst));

        manager.disconnect().await;
        assert!(!script.poll_active.load(Ordering::SeqCst));
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert!(!manager.status().is_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_probe_switches_back_to_push() {
        let script = Arc::new(Script::default());
        script.push_failing.store(true, Ordering::SeqCst);
        let manager = manager(true, &script);
        let connected = counter(&manager, Category::Connected);

        assert!(!manager.initialize().await);
        script.push_failing.store(false, Ordering::SeqCst);

        wait_for_state(&manager, ConnectionState::Connected).await;
        assert!(manager.is_connected());
        assert_eq!(manager.status().transport, Some(TransportKind::Push));
        assert!(!script.poll_active.load(Ordering::SeqCst));
        assert_eq!(connected.load(Ordering::SeqCst), 1);

        manager.disconnect().await;
        assert!(script.push_sink.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_discards_pending_connect() {
        let script = Arc::new(Script::default());
        script.push_hangs.store(true, Ordering::SeqCst);
        let manager = manager(true, &script);
        let connected = counter(&manager, Category::Connected);
        let disconnected = counter(&manager, Category::Disconnected);

        manager.start().await;
        assert_eq!(manager.status().state, ConnectionState::Connecting);
        while script.push_connects.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        manager.disconnect().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(connected.load(Ordering::SeqCst), 0);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(script.push_connects.load(Ordering::SeqCst), 1);
        assert!(!script.poll_active.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_push_reconnects() {
        let script = Arc::new(Script::default());
        let manager = manager(true, &script);
        let connected = counter(&manager, Category::Connected);
        let disconnected = counter(&manager, Category::Disconnected);

        assert!(manager.initialize().await);

        let sink = script.push_sink.lock().clone().unwrap();
        sink.send(TransportEvent::Closed {
            reason: "hub restarted".to_string(),
        })
        .await
        .unwrap();
        drop(sink);

        wait_for_state(&manager, ConnectionState::Reconnecting).await;
        wait_for_state(&manager, ConnectionState::Connected).await;

        assert_eq!(connected.load(Ordering::SeqCst), 2);
        assert_eq!(disconnected.load(Ordering::SeqCst), 1);
        assert_eq!(script.push_connects.load(Ordering::SeqCst), 2);
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_is_reported_once() {
        let script = Arc::new(Script::default());
        let manager = manager(false, &script);
        let stale = counter(&manager, Category::DataStale);

        assert!(!manager.initialize().await);

        let mut rx = manager.watch_status();
        timeout(Duration::from_secs(30), rx.wait_for(|s| s.waiting_for_data))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(stale.load(Ordering::SeqCst), 1);

        poll_sink(&script)
            .send(TransportEvent::NewData(reading("S1", 0, 20.0)))
            .await
            .unwrap();
        timeout(Duration::from_secs(30), rx.wait_for(|s| !s.waiting_for_data))
            .await
            .unwrap()
            .unwrap();
        assert!(manager.status().last_data_at.is_some());

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_stream_end_to_end() {
        let script = Arc::new(Script::default());
        let manager = manager(false, &script);
        let alerts = counter(&manager, Category::Alert);
        let new_data = counter(&manager, Category::NewData);

        assert!(!manager.initialize().await);

        let sink = poll_sink(&script);
        for event in [
            reading("S1", 1_000, 40.0),
            reading("S1", 2_000, 160.0),
            reading("S1", 1_500, 999.0),
            reading("S2", 0, 10.0),
        ] {
            sink.send(TransportEvent::NewData(event)).await.unwrap();
        }

        let mut snapshot_rx = manager.watch_snapshot();
        timeout(
            Duration::from_secs(30),
            snapshot_rx.wait_for(|s| s.latest("S2").is_some()),
        )
        .await
        .unwrap()
        .unwrap();

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.latest("S1").and_then(|e| e.aqi), Some(160.0));
        let s1_history: Vec<i64> = snapshot
            .history
            .iter()
            .filter(|e| e.station_id == "S1")
            .map(|e| e.observed_at.timestamp_millis() - 1_740_816_000_000)
            .collect();
        assert_eq!(s1_history, vec![1_000, 2_000]);

        let recent = manager.recent_alerts();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].level, AlertLevel::Unhealthy);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);
        assert_eq!(new_data.load(Ordering::SeqCst), 3);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_request_latest_while_stopped() {
        let script = Arc::new(Script::default());
        *script.latest.lock() = vec![reading("S1", 0, 30.0), reading("S2", 0, 60.0)];
        let manager = manager(true, &script);

        let events = manager.request_latest().await;
        assert_eq!(events.len(), 2);
        assert_eq!(manager.snapshot().latest_by_station.len(), 2);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(script.push_connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_loaded_once() {
        let script = Arc::new(Script::default());
        *script.latest.lock() = vec![
            reading("S1", 0, 30.0),
            reading("S1", 1_000, 35.0),
            reading("S1", 500, 80.0),
        ];
        let manager = manager(false, &script);
        manager.initialize().await;

        assert_eq!(manager.load_history().await, 2);
        assert_eq!(manager.load_history().await, 0);
        assert_eq!(manager.snapshot().history.len(), 2);
        assert!(manager.join_location_group("S1").await);

        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_during_disconnect_keeps_reconciled_state() {
        let script = Arc::new(Script::default());
        let manager = manager(false, &script);
        let new_data = counter(&manager, Category::NewData);

        assert!(!manager.initialize().await);
        poll_sink(&script)
            .send(TransportEvent::NewData(reading("S1", 0, 30.0)))
            .await
            .unwrap();
        let mut snapshot_rx = manager.watch_snapshot();
        timeout(
            Duration::from_secs(30),
            snapshot_rx.wait_for(|s| s.latest("S1").is_some()),
        )
        .await
        .unwrap()
        .unwrap();

        let (_, pushed) = tokio::join!(manager.disconnect(), async {
            tokio::task::yield_now().await;
            manager.initialize().await
        });
        assert!(!pushed);

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Polling);
        assert!(status.is_enabled);
        assert!(manager.inner.lock().pipeline.is_none());

        let sink = poll_sink(&script);
        sink.send(TransportEvent::NewData(reading("S1", 0, 30.0)))
            .await
            .unwrap();
        sink.send(TransportEvent::NewData(reading("S2", 0, 40.0)))
            .await
            .unwrap();
        timeout(
            Duration::from_secs(30),
            snapshot_rx.wait_for(|s| s.latest("S2").is_some()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(manager.snapshot().history.len(), 2);
        assert_eq!(new_data.load(Ordering::SeqCst), 2);

        manager.disconnect().await;
        assert!(manager.inner.lock().pipeline.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_reported_while_push_connect_pending() {
        let script = Arc::new(Script::default());
        script.push_hangs.store(true, Ordering::SeqCst);
        let manager = manager(true, &script);
        let stale = counter(&manager, Category::DataStale);

        manager.start().await;
        let mut rx = manager.watch_status();
        timeout(Duration::from_secs(30), rx.wait_for(|s| s.waiting_for_data))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(manager.status().state, ConnectionState::Connecting);
        assert_eq!(stale.load(Ordering::SeqCst), 1);
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_reported_during_reconnect_backoff() {
        let script = Arc::new(Script::default());
        script.push_failing.store(true, Ordering::SeqCst);
        let mut settings = settings(true);
        settings.reconnect.initial_delay_ms = 5_000;
        settings.reconnect.max_delay_ms = 5_000;
        let manager = ConnectionManager::with_factory(settings, Arc::new(FakeFactory(script.clone())));
        let stale = counter(&manager, Category::DataStale);

        manager.start().await;
        let mut rx = manager.watch_status();
        timeout(Duration::from_secs(30), rx.wait_for(|s| s.waiting_for_data))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(manager.status().state, ConnectionState::Reconnecting);
        assert_eq!(stale.load(Ordering::SeqCst), 1);
        assert_eq!(script.push_connects.load(Ordering::SeqCst), 1);
        manager.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_alert_with_its_reading_is_recorded_once() {
        let script = Arc::new(Script::default());
        let manager = manager(true, &script);
        let alerts = counter(&manager, Category::Alert);

        assert!(manager.initialize().await);

        let hot = reading("S1", 2_000, 160.0);
        let late = reading("S1", 1_500, 999.0);
        let backend_alert = |event: &ObservationEvent| Alert {
            station_id: event.station_id.clone(),
            level: AlertLevel::from_aqi(event.aqi.unwrap_or_default()),
            aqi: event.aqi,
            message: "Backend alert".to_string(),
            triggered_at: event.observed_at,
        };

        let sink = script.push_sink.lock().clone().unwrap();
        for event in [
            TransportEvent::NewData(hot.clone()),
            TransportEvent::Alert(backend_alert(&hot)),
            TransportEvent::NewData(late.clone()),
            TransportEvent::Alert(backend_alert(&late)),
            TransportEvent::NewData(reading("S2", 0, 10.0)),
        ] {
            sink.send(event).await.unwrap();
        }

        let mut snapshot_rx = manager.watch_snapshot();
        timeout(
            Duration::from_secs(30),
            snapshot_rx.wait_for(|s| s.latest("S2").is_some()),
        )
        .await
        .unwrap()
        .unwrap();

        let recent = manager.recent_alerts();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].level, AlertLevel::Unhealthy);
        assert_eq!(alerts.load(Ordering::SeqCst), 1);

        manager.disconnect().await;
    }
}
