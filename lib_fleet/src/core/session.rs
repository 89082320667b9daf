//! # Session Controller
//!
//! One `SessionController` drives one connection to the telemetry server, from
//! the handshake to the moment the session ends. It is the only owner of the
//! `ReconciliationEngine` and the only component that starts timers.
//!
//! ## Lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Open -> (Closed | TearingDown)
//! ```
//!
//! - **Open**: the handshake `{"token": ...}` is sent and the installed data
//!   sources are registered in the background.
//! - **Frames**: every inbound frame is decoded, mapped and applied; mapped
//!   intents become cancellable timers.
//! - **End**: `run` returns a `SessionExit`. A reload is carried out by the
//!   caller: drop the controller, build a fresh one, fetch a new snapshot and
//!   reconnect.
//!
//! ## Concurrency:
//!
//! Background tasks never touch the engine. They send their results back
//! through the controller's inbox and the `run` loop applies them, so every
//! mutation is serialized through a single `select!`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::reconcile::ReconciliationEngine;
use crate::telemetry::decoder::{decode, Frame};
use crate::telemetry::mapper::{map_frame, MappedUpdate, ScheduledIntent, SessionSignal};
use crate::telemetry::model::{Fleet, MachineId, MachinePatch, MachineRecord};

/// Credential and sender identity attached to every outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub credential: Option<String>,
    pub sender: Option<String>,
}

impl SessionContext {
    pub fn new(credential: Option<String>, sender: Option<String>) -> Self {
        Self { credential, sender }
    }

    /// The first message sent on a freshly opened socket.
    pub fn handshake(&self) -> String {
        serde_json::json!({ "token": self.credential }).to_string()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("failed to send: {0}")]
    Send(String),

    #[error("failed to receive: {0}")]
    Receive(String),
}

/// Request collaborator as seen by the session.
pub trait FleetApi: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// The initial snapshot, in server order.
    fn current_list(&self) -> impl Future<Output = Result<Vec<MachineRecord>, Self::Error>> + Send;

    /// Data sources installed for this site.
    fn installed_sources(&self) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send;

    /// Asks the edge to start streaming the given source.
    fn register_source(&self, source: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// The server-computed completion time, if it has one.
    fn completion_time(
        &self,
        id: &MachineId,
    ) -> impl Future<Output = Result<Option<NaiveDateTime>, Self::Error>> + Send;
}

/// Frame stream collaborator.
pub trait Transport: Send {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// `None` once the stream has ended.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Timer durations of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub hard_refresh: Duration,
    pub completion_refresh_delay: Duration,
    pub registration_settle: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            hard_refresh: Duration::from_millis(1_200_000),
            completion_refresh_delay: Duration::from_millis(2_000),
            registration_settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    TearingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadReason {
    /// The server sent a `closed` event.
    ServerClosed,
    /// The stream ended or failed.
    ConnectionLost,
    /// The session outlived the hard-refresh period.
    HardRefresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    Reload(ReloadReason),
    Shutdown,
}

/// Results of background tasks, applied by the session loop.
#[derive(Debug)]
enum SessionCommand {
    Patch(MachinePatch),
}

/// # Session Controller
///
/// Generic over the request collaborator so tests can substitute a fake.
pub struct SessionController<A: FleetApi> {
    api: Arc<A>,
    context: SessionContext,
    settings: SessionSettings,
    engine: ReconciliationEngine,
    state: SessionState,
    timers: CancellationToken,
    inbox_tx: mpsc::UnboundedSender<SessionCommand>,
    inbox_rx: mpsc::UnboundedReceiver<SessionCommand>,
}

impl<A: FleetApi> SessionController<A> {
    pub fn new(api: Arc<A>, context: SessionContext, settings: SessionSettings) -> Self {
        Self::with_engine(api, context, settings, ReconciliationEngine::new())
    }

    /// Builds a controller that publishes on an existing channel, so readers
    /// survive the rebuild that follows a reload.
    pub fn with_publisher(
        api: Arc<A>,
        context: SessionContext,
        settings: SessionSettings,
        publisher: watch::Sender<Fleet>,
    ) -> Self {
        Self::with_engine(api, context, settings, ReconciliationEngine::with_publisher(publisher))
    }

    fn with_engine(api: Arc<A>, context: SessionContext, settings: SessionSettings, engine: ReconciliationEngine) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            api,
            context,
            settings,
            engine,
            state: SessionState::Disconnected,
            timers: CancellationToken::new(),
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn fleet(&self) -> &Fleet {
        self.engine.fleet()
    }

    pub fn subscribe(&self) -> watch::Receiver<Fleet> {
        self.engine.subscribe()
    }

    /// Fetches the current list and replaces the collection with it.
    /// Returns the number of machines loaded.
    pub async fn load_snapshot(&mut self) -> Result<usize, A::Error> {
        let records = self.api.current_list().await?;
        self.engine.replace_all(records);
        log::info!("Loaded fleet snapshot with {} machines.", self.engine.fleet().len());
        Ok(self.engine.fleet().len())
    }

    pub fn mark_connecting(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// # On Open
    ///
    /// ## Logic:
    /// 1.  Sends the handshake carrying the session credential.
    /// 2.  Marks the session open and clears the tearing-down flag.
    /// 3.  Spawns source registration: list the installed sources, wait for
    ///     the settle delay, then register each one. Failures are logged.
    pub async fn on_open<T: Transport>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        transport.send_text(self.context.handshake()).await?;
        self.state = SessionState::Open;
        self.engine.set_tearing_down(false);
        log::info!("Telemetry session open.");
        self.spawn_registration();
        Ok(())
    }

    fn spawn_registration(&self) {
        let api = Arc::clone(&self.api);
        let settle = self.settings.registration_settle;
        let cancel = self.timers.child_token();

        tokio::spawn(async move {
            let sources = tokio::select! {
                _ = cancel.cancelled() => return,
                result = api.installed_sources() => result,
            };
            let sources = match sources {
                Ok(sources) => sources,
                Err(e) => {
                    log::warn!("Could not list installed sources: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }

            for source in sources {
                if cancel.is_cancelled() {
                    return;
                }
                match api.register_source(&source).await {
                    Ok(()) => log::debug!("Registered source {}", source),
                    Err(e) => log::warn!("Registering source {} failed: {}", source, e),
                }
            }
        });
    }

    /// # Handle Frame
    ///
    /// Decodes, maps and applies one inbound frame, then schedules whatever
    /// the mapper asked for. Returns `Some` when the frame ends the session.
    pub fn handle_frame(&mut self, frame: Frame) -> Option<SessionExit> {
        let decoded = match decode(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {}", e);
                return None;
            }
        };

        let outcome = map_frame(&decoded, self.engine.fleet());

        let exit = match outcome.update {
            MappedUpdate::Patch(patch) => {
                self.engine.apply_patch(patch);
                None
            }
            MappedUpdate::Replace(records) => {
                self.engine.replace_all(records);
                None
            }
            MappedUpdate::MarkMessage(id) => {
                self.engine.mark_message_received(id);
                None
            }
            MappedUpdate::SessionEvent(SessionSignal::Connected) => {
                self.engine.set_tearing_down(false);
                self.state = SessionState::Open;
                None
            }
            MappedUpdate::SessionEvent(SessionSignal::Closed) => {
                if self.engine.is_tearing_down() {
                    log::debug!("Server closed the session during teardown.");
                    None
                } else {
                    log::info!("Server closed the session; reloading.");
                    self.state = SessionState::Closed;
                    Some(SessionExit::Reload(ReloadReason::ServerClosed))
                }
            }
            MappedUpdate::Nothing => None,
        };

        for intent in outcome.intents {
            self.schedule(intent);
        }

        exit
    }

    fn schedule(&self, intent: ScheduledIntent) {
        if self.engine.is_tearing_down() {
            log::debug!("Tearing down; dropping {:?}", intent);
            return;
        }

        match intent {
            ScheduledIntent::RefreshCompletionTime(id) => {
                let api = Arc::clone(&self.api);
                let inbox = self.inbox_tx.clone();
                let delay = self.settings.completion_refresh_delay;
                let cancel = self.timers.child_token();

                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return,
                        result = api.completion_time(&id) => result,
                    };
                    match result {
                        Ok(Some(at)) => {
                            let patch = MachinePatch::completion_time(id.clone(), at);
                            if inbox.send(SessionCommand::Patch(patch)).is_err() {
                                log::debug!("Session gone; dropping completion time for machine {}", id);
                            }
                        }
                        Ok(None) => log::debug!("No completion time for machine {}", id),
                        Err(e) => log::warn!("Completion time lookup for machine {} failed: {}", id, e),
                    }
                });
            }
        }
    }

    fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Patch(patch) => {
                self.engine.apply_patch(patch);
            }
        }
    }

    /// Applies every background result already waiting in the inbox.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(command) = self.inbox_rx.try_recv() {
            self.execute(command);
            applied += 1;
        }
        applied
    }

    /// Enters teardown: late `closed` events are ignored and every pending
    /// timer is cancelled.
    pub fn begin_teardown(&mut self) {
        self.state = SessionState::TearingDown;
        self.engine.set_tearing_down(true);
        self.timers.cancel();
        self.timers = CancellationToken::new();
    }

    pub async fn disconnect<T: Transport>(&mut self, transport: &mut T) {
        let was_connected = matches!(self.state, SessionState::Open | SessionState::Connecting);
        self.begin_teardown();
        if was_connected {
            if let Err(e) = transport.close().await {
                log::debug!("Closing transport: {}", e);
            }
        }
    }

    /// # Run
    ///
    /// Opens the session and serves it until it ends.
    ///
    /// ## Logic:
    /// 1.  Performs `on_open`; a failed handshake is a lost connection.
    /// 2.  Loops over, in priority order: the shutdown token, the hard-refresh
    ///     deadline, background results and transport frames.
    /// 3.  Whatever ends the loop, every timer of this session is cancelled
    ///     before returning.
    pub async fn run<T: Transport>(&mut self, mut transport: T, shutdown: &CancellationToken) -> SessionExit {
        if let Err(e) = self.on_open(&mut transport).await {
            log::warn!("Handshake failed: {}", e);
            self.state = SessionState::Closed;
            return SessionExit::Reload(ReloadReason::ConnectionLost);
        }

        let hard_refresh = tokio::time::sleep(self.settings.hard_refresh);
        tokio::pin!(hard_refresh);

        let exit = loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    log::info!("Shutdown requested; closing telemetry session.");
                    self.disconnect(&mut transport).await;
                    break SessionExit::Shutdown;
                }

                _ = &mut hard_refresh => {
                    log::info!("Session reached the hard refresh period; reloading.");
                    self.disconnect(&mut transport).await;
                    break SessionExit::Reload(ReloadReason::HardRefresh);
                }

                Some(command) = self.inbox_rx.recv() => self.execute(command),

                frame = transport.next_frame() => match frame {
                    Some(Ok(frame)) => {
                        if let Some(exit) = self.handle_frame(frame) {
                            self.disconnect(&mut transport).await;
                            break exit;
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Telemetry transport failed: {}", e);
                        self.state = SessionState::Closed;
                        break SessionExit::Reload(ReloadReason::ConnectionLost);
                    }
                    None if self.engine.is_tearing_down() => break SessionExit::Shutdown,
                    None => {
                        log::warn!("Telemetry stream ended unexpectedly.");
                        self.state = SessionState::Closed;
                        break SessionExit::Reload(ReloadReason::ConnectionLost);
                    }
                },
            }
        };

        self.timers.cancel();
        exit
    }
}

impl<A: FleetApi> Drop for SessionController<A> {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;

    fn noon() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    #[derive(Default)]
    struct FakeApi {
        snapshot: Vec<MachineRecord>,
        sources: Vec<String>,
        completion: Option<NaiveDateTime>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl FleetApi for FakeApi {
        type Error = io::Error;

        async fn current_list(&self) -> Result<Vec<MachineRecord>, io::Error> {
            self.record("current_list".to_string());
            Ok(self.snapshot.clone())
        }

        async fn installed_sources(&self) -> Result<Vec<String>, io::Error> {
            self.record("installed_sources".to_string());
            Ok(self.sources.clone())
        }

        async fn register_source(&self, source: &str) -> Result<(), io::Error> {
            self.record(format!("register:{source}"));
            Ok(())
        }

        async fn completion_time(&self, id: &MachineId) -> Result<Option<NaiveDateTime>, io::Error> {
            self.record(format!("completion:{id}"));
            Ok(self.completion)
        }
    }

    struct ScriptedTransport {
        frames: mpsc::UnboundedReceiver<Frame>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Transport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
            self.frames.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push("<close>".to_string());
            Ok(())
        }
    }

    fn scripted() -> (ScriptedTransport, mpsc::UnboundedSender<Frame>, Arc<Mutex<Vec<String>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            frames: rx,
            sent: Arc::clone(&sent),
        };
        (transport, tx, sent)
    }

    fn api_with_machine_five() -> Arc<FakeApi> {
        let mut five = MachineRecord::new("5", "1");
        five.planned_completion_time = Some(noon() - chrono::Duration::hours(1));
        Arc::new(FakeApi {
            snapshot: vec![five, MachineRecord::new("6", "2")],
            sources: vec!["edge-a".to_string(), "edge-b".to_string()],
            completion: Some(noon()),
            ..Default::default()
        })
    }

    fn part_count_frame(id: &str, progress: &str) -> Frame {
        Frame::Binary(format!("edge|PART_COUNT|t|O1|x|{progress}|3|a|b|c|d|e|f|{id}").into_bytes())
    }

    fn controller(api: &Arc<FakeApi>) -> SessionController<FakeApi> {
        SessionController::new(
            Arc::clone(api),
            SessionContext::new(Some("secret".to_string()), None),
            SessionSettings::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn completion_refresh_lands_after_delay() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        session.load_snapshot().await.unwrap();

        assert_eq!(session.handle_frame(part_count_frame("5", "6")), None);
        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert_eq!(session.process_pending(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.process_pending(), 1);
        let five = session.fleet().find(&MachineId::from("5")).cloned().unwrap();
        assert_eq!(five.planned_completion_time, Some(noon()));
        assert_eq!(five.produced_count, 3);
        assert!(api.calls().contains(&"completion:5".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_refresh() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        session.load_snapshot().await.unwrap();

        session.handle_frame(part_count_frame("5", "9"));
        session.begin_teardown();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(session.process_pending(), 0);
        assert!(!api.calls().iter().any(|c| c.starts_with("completion")));
        assert_eq!(session.state(), SessionState::TearingDown);
    }

    #[tokio::test]
    async fn closed_event_reloads_unless_tearing_down() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        let closed = || Frame::Text(r#"{"response":"closed"}"#.to_string());

        session.begin_teardown();
        assert_eq!(session.handle_frame(closed()), None);

        session.handle_frame(Frame::Text(r#"{"response":"connect"}"#.to_string()));
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(
            session.handle_frame(closed()),
            Some(SessionExit::Reload(ReloadReason::ServerClosed))
        );
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        session.load_snapshot().await.unwrap();
        let before = session.fleet().clone();

        assert_eq!(session.handle_frame(Frame::Binary(vec![0xff, 0xfe])), None);
        assert_eq!(session.handle_frame(Frame::Text("{".to_string())), None);
        assert_eq!(session.fleet(), &before);
    }

    #[tokio::test(start_paused = true)]
    async fn open_sends_handshake_then_registers_after_settle() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        let (mut transport, _frames, sent) = scripted();

        session.on_open(&mut transport).await.unwrap();
        assert_eq!(sent.lock().unwrap().clone(), vec![r#"{"token":"secret"}"#.to_string()]);
        assert_eq!(session.state(), SessionState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.calls(), vec!["installed_sources".to_string()]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            api.calls(),
            vec![
                "installed_sources".to_string(),
                "register:edge-a".to_string(),
                "register:edge-b".to_string()
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_each_exit_reason() {
        let api = api_with_machine_five();
        let shutdown = CancellationToken::new();

        // Stream end.
        let mut session = controller(&api);
        let (transport, frames, _sent) = scripted();
        drop(frames);
        assert_eq!(
            session.run(transport, &shutdown).await,
            SessionExit::Reload(ReloadReason::ConnectionLost)
        );

        // Server closed.
        let mut session = controller(&api);
        let (transport, frames, sent) = scripted();
        frames.send(Frame::Text(r#"{"response":"closed"}"#.to_string())).unwrap();
        assert_eq!(
            session.run(transport, &shutdown).await,
            SessionExit::Reload(ReloadReason::ServerClosed)
        );
        assert_eq!(sent.lock().unwrap().last().map(String::as_str), Some("<close>"));

        // Hard refresh with an idle stream.
        let mut session = controller(&api);
        let (transport, _frames, _sent) = scripted();
        assert_eq!(
            session.run(transport, &shutdown).await,
            SessionExit::Reload(ReloadReason::HardRefresh)
        );

        // Shutdown wins.
        shutdown.cancel();
        let mut session = controller(&api);
        let (transport, _frames, _sent) = scripted();
        assert_eq!(session.run(transport, &shutdown).await, SessionExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_background_results() {
        let api = api_with_machine_five();
        let mut session = controller(&api);
        session.load_snapshot().await.unwrap();
        let mut watcher = session.subscribe();
        let (transport, frames, _sent) = scripted();
        let shutdown = CancellationToken::new();

        frames.send(part_count_frame("005", "6")).unwrap();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            stop.cancel();
        });

        assert_eq!(session.run(transport, &shutdown).await, SessionExit::Shutdown);
        let five = watcher.borrow_and_update().find(&MachineId::from("5")).cloned().unwrap();
        assert_eq!(five.planned_completion_time, Some(noon()));
    }
}
