//! Connection Manager
//!
//! Owns the connection state machine and is the only entry point for
//! callers. All work happens on one task: caller requests, transport events
//! and timers are taken from a `select!` one at a time, so no two
//! transitions ever interleave.
//!
//! ```text
//!  Disconnected ──connect()──▶ Scanning ──name match──▶ Connecting
//!                                 │                        │ link up
//!                          timeout│                        ▼
//!                                 ▼               DiscoveringServices
//!                              Failed ◀──mismatch──────────┤ both found
//!                                 ▲                        ▼
//!                    retries spent│   backoff   ◀──link lost── Ready
//!                                 └── Reconnecting ──▶ Scanning
//! ```

use crate::domain::event_log::{EventLog, LogListener, SubscriptionId};
use crate::domain::models::{
    CharacteristicHandle, ConnectionSession, ConnectionState, Device, LogEntry, Severity,
};
use crate::domain::reconnect::ReconnectPolicy;
use crate::domain::settings::{BleSettings, Settings};
use crate::error::{ClientError, Result};
use crate::infrastructure::bluetooth::command::CommandChannel;
use crate::infrastructure::bluetooth::notification::NotificationChannel;
use crate::infrastructure::bluetooth::protocol::{Command, CommandCodec};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, EventReceiver, TransportEvent, WriteId,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Caller requests, answered on the oneshot they carry
enum Request {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Send(String, oneshot::Sender<Result<()>>),
    Subscribe(LogListener, oneshot::Sender<SubscriptionId>),
    Unsubscribe(SubscriptionId),
    ExportLog(oneshot::Sender<Vec<LogEntry>>),
    ClearLog(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    ScanTimeout,
    LinkSetup,
    Backoff,
}

/// Handle to the connection manager task. Cheap to clone.
///
/// The task stops, and the link is closed, once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Start the manager on the current tokio runtime
    pub fn spawn(
        transport: Box<dyn BleTransport>,
        events: EventReceiver,
        settings: &Settings,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);

        let driver = Driver::new(transport, settings, state_tx, transitions.clone());
        tokio::spawn(driver.run(requests_rx, events));

        Self {
            requests: requests_tx,
            state: state_rx,
            transitions,
        }
    }

    /// Begin scanning for the peripheral.
    ///
    /// Returns once the request is accepted; progress is visible through
    /// [`state`](Self::state) and the event log.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Connect(tx))?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Drop the session from any state, cancelling whatever is outstanding
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Disconnect(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Send a command. Only accepted while `Ready`.
    pub async fn send(&self, text: impl Into<String>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Send(text.into(), tx))?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Latest-value view of the state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Every transition, in order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState> {
        let mut state = self.state.clone();
        let found = state
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok((*found).clone())
    }

    /// Call `callback` for every log entry appended from now on
    pub async fn subscribe_to_log(
        &self,
        callback: impl FnMut(&LogEntry) + Send + 'static,
    ) -> Result<SubscriptionId> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Subscribe(Box::new(callback), tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn unsubscribe_from_log(&self, id: SubscriptionId) -> Result<()> {
        self.request(Request::Unsubscribe(id))
    }

    /// Snapshot of the event log in insertion order
    pub async fn export_log(&self) -> Result<Vec<LogEntry>> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::ExportLog(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub async fn clear_log(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::ClearLog(tx))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| ClientError::Closed)
    }
}

/// State owned by the manager task
struct Driver {
    transport: Box<dyn BleTransport>,
    ble: BleSettings,
    policy: ReconnectPolicy,
    codec: CommandCodec,
    log: EventLog,
    commands: CommandChannel,
    notifications: NotificationChannel,
    session: Option<ConnectionSession>,
    timer: Option<(Timer, Instant)>,
    state_tx: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl Driver {
    fn new(
        transport: Box<dyn BleTransport>,
        settings: &Settings,
        state_tx: watch::Sender<ConnectionState>,
        transitions: broadcast::Sender<ConnectionState>,
    ) -> Self {
        Self {
            transport,
            ble: settings.ble.clone(),
            policy: settings.reconnect.clone(),
            codec: CommandCodec::new(settings.ble.max_command_len),
            log: EventLog::new(settings.log_capacity),
            commands: CommandChannel::new(settings.ble.write_with_response),
            notifications: NotificationChannel::new(&settings.notifications),
            session: None,
            timer: None,
            state_tx,
            transitions,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: EventReceiver,
    ) {
        debug!("Connection manager started");
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = sleep_until_deadline(deadline) => self.handle_deadline(Instant::now()),
            }
        }

        if self.session.is_some() {
            self.release_link();
        }
        debug!("Connection manager stopped");
    }

    fn state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.state.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn next_deadline(&self) -> Option<Instant> {
        let timer = self.timer.map(|(_, at)| at);
        match (timer, self.notifications.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn arm(&mut self, timer: Timer, after: Duration) {
        self.timer = Some((timer, Instant::now() + after));
    }

    // ── transitions ──────────────────────────────────────────

    /// Move to `next`, logging the transition and publishing it
    fn enter(&mut self, next: ConnectionState) {
        let previous = self.state();
        if previous.is_ready() && !next.is_ready() {
            self.release_channels();
        }

        if next == ConnectionState::Disconnected {
            self.session = None;
        } else {
            let session = self
                .session
                .get_or_insert_with(|| ConnectionSession::new(next.clone()));
            session.state = next.clone();
            if next.is_failed() {
                session.device = None;
            }
        }

        let (severity, message) = match &next {
            ConnectionState::Failed(reason) => {
                (Severity::Error, format!("{} -> Failed: {}", previous, reason))
            }
            ConnectionState::Reconnecting => {
                (Severity::Warn, format!("{} -> {}", previous, next))
            }
            _ => (Severity::Info, format!("{} -> {}", previous, next)),
        };
        self.log.append(severity, message);

        self.state_tx.send_replace(next.clone());
        let _ = self.transitions.send(next);
    }

    fn release_channels(&mut self) {
        if let Some(command) = self.commands.detach() {
            debug!("Discarding in-flight command {}", command);
        }
        self.notifications.unsubscribe(self.transport.as_mut());
        if let Some(session) = self.session.as_mut() {
            session.clear_link();
        }
    }

    /// Stop every transport activity belonging to the session
    fn release_link(&mut self) {
        self.timer = None;
        self.release_channels();
        self.transport.stop_scan();
        self.transport.disconnect();
    }

    fn start_scan(&mut self) {
        self.enter(ConnectionState::Scanning);
        match self.transport.start_scan(self.ble.service_uuid) {
            Ok(()) => {
                info!("Scanning for {:?}", self.ble.device_name);
                self.arm(
                    Timer::ScanTimeout,
                    Duration::from_millis(self.ble.scan_timeout_ms),
                );
            }
            Err(e) => self.link_failure(format!("scan could not start: {}", e)),
        }
    }

    /// A transient failure: back off and retry, or give up
    fn link_failure(&mut self, reason: String) {
        self.release_link();
        self.log.warn(ClientError::ConnectFailed(reason).to_string());

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.retries < self.policy.max_retries {
            session.retries += 1;
            let attempt = session.retries;
            let delay = self.policy.jittered_delay_for(attempt);
            self.enter(ConnectionState::Reconnecting);
            self.log.info(format!(
                "Reconnect attempt {} of {} in {} ms",
                attempt,
                self.policy.max_retries,
                delay.as_millis()
            ));
            self.arm(Timer::Backoff, delay);
        } else {
            let attempts = session.retries;
            self.enter(ConnectionState::Failed(ClientError::RetriesExhausted {
                attempts,
            }));
        }
    }

    /// A failure that retrying cannot fix
    fn fatal(&mut self, error: ClientError) {
        self.release_link();
        self.enter(ConnectionState::Failed(error));
    }

    // ── caller requests ──────────────────────────────────────

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Request::Disconnect(reply) => {
                self.disconnect();
                let _ = reply.send(());
            }
            Request::Send(text, reply) => {
                let _ = reply.send(self.send(text));
            }
            Request::Subscribe(listener, reply) => {
                let _ = reply.send(self.log.subscribe(listener));
            }
            Request::Unsubscribe(id) => {
                self.log.unsubscribe(id);
            }
            Request::ExportLog(reply) => {
                let _ = reply.send(self.log.export());
            }
            Request::ClearLog(reply) => {
                self.log.clear();
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            debug!("connect() ignored while {}", state);
            return Ok(());
        }

        if !self.transport.is_available() {
            self.fatal(ClientError::UnsupportedTransport);
            return Err(ClientError::UnsupportedTransport);
        }

        // Fresh session, including after a failure
        self.session = Some(ConnectionSession::new(self.state()));
        self.start_scan();
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.release_link();
        self.enter(ConnectionState::Disconnected);
        info!("Disconnected from device");
    }

    fn send(&mut self, text: String) -> Result<()> {
        if !self.state().is_ready() {
            return Err(ClientError::NotConnected);
        }

        let command = Command::parse(&text);
        match self
            .commands
            .send(self.transport.as_mut(), &self.codec, command.clone())
        {
            Ok(len) => {
                self.log.info(format!("Sent {} ({} bytes)", command, len));
                Ok(())
            }
            Err(ClientError::WriteFailed(reason)) => {
                self.log
                    .error(format!("Write of {} failed: {}", command, reason));
                Err(ClientError::WriteFailed(reason))
            }
            Err(e) => {
                debug!("send({:?}) rejected: {}", text, e);
                Err(e)
            }
        }
    }

    // ── transport events ─────────────────────────────────────

    fn handle_event(&mut self, event: TransportEvent) {
        let state = self.state();
        match (state, event) {
            (ConnectionState::Scanning, TransportEvent::DeviceDiscovered(device)) => {
                self.on_device(device)
            }
            (ConnectionState::Connecting, TransportEvent::Connected) => self.on_connected(),
            (ConnectionState::Connecting, TransportEvent::ConnectFailed(reason)) => {
                self.link_failure(reason)
            }
            (ConnectionState::DiscoveringServices, TransportEvent::ServicesDiscovered(found)) => {
                self.on_services(found)
            }
            (ConnectionState::DiscoveringServices, TransportEvent::DiscoveryFailed(reason)) => {
                self.link_failure(format!("service discovery failed: {}", reason))
            }
            (ConnectionState::Ready, TransportEvent::Indication(bytes)) => {
                self.notifications
                    .on_indication(&bytes, Instant::now(), &self.codec, &mut self.log)
            }
            (ConnectionState::Ready, TransportEvent::WriteCompleted { id, result }) => {
                self.on_write_completed(id, result)
            }
            (
                ConnectionState::Ready
                | ConnectionState::Connecting
                | ConnectionState::DiscoveringServices,
                TransportEvent::LinkLost(reason),
            ) => self.link_failure(format!("link lost: {}", reason)),
            (state, event) => trace!("Ignoring {:?} while {}", event, state),
        }
    }

    fn on_device(&mut self, device: Device) {
        if device.name != self.ble.device_name {
            trace!("Skipping {} ({})", device.name, device.id);
            return;
        }

        info!("Found {} ({})", device.name, device.id);
        self.transport.stop_scan();
        self.timer = None;
        if let Some(session) = self.session.as_mut() {
            session.device = Some(device.clone());
        }
        self.enter(ConnectionState::Connecting);

        match self.transport.connect(&device) {
            Ok(()) => self.arm(
                Timer::LinkSetup,
                Duration::from_millis(self.ble.connect_timeout_ms),
            ),
            Err(e) => self.link_failure(format!("connect could not start: {}", e)),
        }
    }

    fn on_connected(&mut self) {
        self.enter(ConnectionState::DiscoveringServices);
        if let Err(e) = self.transport.discover(self.ble.service_uuid) {
            self.link_failure(format!("service discovery could not start: {}", e));
        }
    }

    fn on_services(&mut self, found: Vec<Uuid>) {
        self.timer = None;
        let resolve = |uuid: Uuid| found.contains(&uuid).then_some(CharacteristicHandle(uuid));
        let write = resolve(self.ble.write_char_uuid);
        let indicate = resolve(self.ble.indicate_char_uuid);

        let (write, indicate) = match (write, indicate) {
            (Some(write), Some(indicate)) => (write, indicate),
            (write, _) => {
                let missing = if write.is_none() {
                    self.ble.write_char_uuid
                } else {
                    self.ble.indicate_char_uuid
                };
                self.fatal(ClientError::ProtocolMismatch(format!(
                    "characteristic {} not found",
                    missing
                )));
                return;
            }
        };

        if let Err(e) = self
            .notifications
            .subscribe(self.transport.as_mut(), indicate)
        {
            self.link_failure(format!("indication subscription failed: {}", e));
            return;
        }
        self.commands.attach(write);

        if let Some(session) = self.session.as_mut() {
            session.write_characteristic = Some(write);
            session.indicate_characteristic = Some(indicate);
            session.retries = 0;
        }
        self.enter(ConnectionState::Ready);
    }

    fn on_write_completed(&mut self, id: WriteId, result: std::result::Result<(), String>) {
        let Some(done) = self.commands.complete(id, result) else {
            return;
        };
        match done.result {
            Ok(()) => self
                .log
                .info(format!("Peripheral acknowledged {}", done.command)),
            Err(reason) => self
                .log
                .error(format!("Write of {} failed: {}", done.command, reason)),
        };
    }

    // ── timers ───────────────────────────────────────────────

    fn handle_deadline(&mut self, now: Instant) {
        if let Some((timer, at)) = self.timer {
            if at <= now {
                self.timer = None;
                self.on_timer(timer);
            }
        }
        self.notifications.on_timer(now, &mut self.log);
    }

    fn on_timer(&mut self, timer: Timer) {
        match (timer, self.state()) {
            (Timer::ScanTimeout, ConnectionState::Scanning) => {
                self.transport.stop_scan();
                let reconnecting = self.session.as_ref().is_some_and(|s| s.retries > 0);
                if reconnecting {
                    self.link_failure(format!("{} not found", self.ble.device_name));
                } else {
                    self.fatal(ClientError::DeviceNotFound {
                        name: self.ble.device_name.clone(),
                        timeout_ms: self.ble.scan_timeout_ms,
                    });
                }
            }
            (Timer::LinkSetup, ConnectionState::Connecting | ConnectionState::DiscoveringServices) => {
                self.link_failure(format!(
                    "no response within {} ms",
                    self.ble.connect_timeout_ms
                ));
            }
            (Timer::Backoff, ConnectionState::Reconnecting) => self.start_scan(),
            (timer, state) => trace!("Stale {:?} timer while {}", timer, state),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
