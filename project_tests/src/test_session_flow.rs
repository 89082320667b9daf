//! # Session Flow Tests
//!
//! Runs a `SessionController` end to end against a channel-backed transport
//! and an in-memory `FleetApi`. Timers run on tokio's paused clock.

#![forbid(unsafe_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use lib_fleet::core::{
    FleetApi, ReloadReason, SessionContext, SessionController, SessionExit, SessionSettings, SessionState, Transport,
    TransportError,
};
use lib_fleet::telemetry::{Fleet, Frame, MachineId, MachineRecord};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

fn at(hour: u32) -> NaiveDateTime {
    chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(hour, 0, 0))
        .expect("valid timestamp")
}

#[derive(Default)]
struct InMemoryApi {
    snapshot: Vec<MachineRecord>,
    completion: Option<NaiveDateTime>,
    log: Mutex<Vec<String>>,
}

impl InMemoryApi {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl FleetApi for InMemoryApi {
    type Error = io::Error;

    async fn current_list(&self) -> Result<Vec<MachineRecord>, io::Error> {
        self.log.lock().unwrap().push("current_list".to_string());
        Ok(self.snapshot.clone())
    }

    async fn installed_sources(&self) -> Result<Vec<String>, io::Error> {
        Err(io::Error::other("cloud unavailable"))
    }

    async fn register_source(&self, _source: &str) -> Result<(), io::Error> {
        Ok(())
    }

    async fn completion_time(&self, id: &MachineId) -> Result<Option<NaiveDateTime>, io::Error> {
        self.log.lock().unwrap().push(format!("completion_time:{id}"));
        Ok(self.completion)
    }
}

struct ChannelTransport {
    inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: Arc<Mutex<Vec<String>>>,
}

impl Transport for ChannelTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outbound.lock().unwrap().push("close".to_string());
        Ok(())
    }
}

fn channel_transport() -> (ChannelTransport, mpsc::UnboundedSender<Frame>, Arc<Mutex<Vec<String>>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let outbound = Arc::new(Mutex::new(Vec::new()));
    (
        ChannelTransport {
            inbound: rx,
            outbound: Arc::clone(&outbound),
        },
        tx,
        outbound,
    )
}

fn api() -> Arc<InMemoryApi> {
    let mut five = MachineRecord::new("5", "2");
    five.planned_completion_time = Some(at(15));
    Arc::new(InMemoryApi {
        snapshot: vec![MachineRecord::new("4", "1"), five],
        completion: Some(at(17)),
        ..Default::default()
    })
}

fn controller(api: &Arc<InMemoryApi>, publisher: watch::Sender<Fleet>) -> SessionController<InMemoryApi> {
    SessionController::with_publisher(
        Arc::clone(api),
        SessionContext::new(Some("floor-token".to_string()), Some("board".to_string())),
        SessionSettings::default(),
        publisher,
    )
}

#[tokio::test]
async fn closed_event_reloads_only_when_not_tearing_down() {
    let api = api();
    let (publisher, _rx) = watch::channel(Fleet::default());
    let mut session = controller(&api, publisher);
    let closed = || Frame::Text(r#"{"response":"closed"}"#.to_string());

    session.begin_teardown();
    assert_eq!(session.state(), SessionState::TearingDown);
    assert_eq!(session.handle_frame(closed()), None);

    let (mut transport, _frames, outbound) = channel_transport();
    session.on_open(&mut transport).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(outbound.lock().unwrap()[0], r#"{"token":"floor-token"}"#);
    assert_eq!(
        session.handle_frame(closed()),
        Some(SessionExit::Reload(ReloadReason::ServerClosed))
    );
}

#[tokio::test]
async fn back_to_back_frames_for_two_machines_are_both_kept() {
    let api = api();
    let (publisher, mut board) = watch::channel(Fleet::default());
    let mut session = controller(&api, publisher);
    session.load_snapshot().await.unwrap();

    let first = session.handle_frame(Frame::Binary(b"edge|PART_COUNT|t|O4|-|1|3|-|-|-|-|-|-|4".to_vec()));
    let second = session.handle_frame(Frame::Binary(b"edge|PART_COUNT|t|O5|-|1|42|-|-|-|-|-|-|5".to_vec()));
    assert_eq!((first, second), (None, None));

    let fleet = board.borrow_and_update().clone();
    let ids: Vec<&str> = fleet.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["4", "5"]);
    assert_eq!(fleet.get(0).map(|r| (r.produced_count, r.program_name.as_str())), Some((3, "O4")));
    assert_eq!(fleet.get(1).map(|r| (r.produced_count, r.program_name.as_str())), Some((42, "O5")));
}

#[tokio::test(start_paused = true)]
async fn completion_refresh_reaches_readers_through_the_session_loop() {
    let api = api();
    let (publisher, mut board) = watch::channel(Fleet::default());
    let mut session = controller(&api, publisher);
    assert_eq!(session.load_snapshot().await.unwrap(), 2);
    session.mark_connecting();
    assert_eq!(session.state(), SessionState::Connecting);

    let (transport, frames, outbound) = channel_transport();
    frames
        .send(Frame::Binary(b"edge|PART_COUNT|t|O1|-|6|42|-|-|-|-|-|-|5".to_vec()))
        .unwrap();

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        stop.cancel();
    });

    assert_eq!(session.run(transport, &shutdown).await, SessionExit::Shutdown);
    assert_eq!(outbound.lock().unwrap().last().map(String::as_str), Some("close"));
    assert_eq!(api.log(), vec!["current_list".to_string(), "completion_time:5".to_string()]);

    let fleet = board.borrow_and_update().clone();
    let five = fleet.find(&MachineId::from("5")).expect("machine 5 present");
    assert_eq!(five.produced_count, 42);
    assert_eq!(five.planned_completion_time, Some(at(17)));
    assert_eq!(fleet.get(0).map(|r| r.id.as_str()), Some("4"));
}

#[tokio::test(start_paused = true)]
async fn rebuilt_session_keeps_publishing_on_the_same_channel() {
    let api = api();
    let (publisher, mut board) = watch::channel(Fleet::default());
    let shutdown = CancellationToken::new();

    let mut first = controller(&api, publisher.clone());
    first.load_snapshot().await.unwrap();
    let (transport, frames, _outbound) = channel_transport();
    drop(frames);
    assert_eq!(
        first.run(transport, &shutdown).await,
        SessionExit::Reload(ReloadReason::ConnectionLost)
    );
    drop(first);

    let mut second = controller(&api, publisher);
    second.load_snapshot().await.unwrap();
    let (transport, frames, _outbound) = channel_transport();
    frames
        .send(Frame::Binary(b"edge|MESSAGE|t|-|-|-|4".to_vec()))
        .unwrap();
    frames
        .send(Frame::Text(r#"{"response":"closed"}"#.to_string()))
        .unwrap();
    assert_eq!(
        second.run(transport, &shutdown).await,
        SessionExit::Reload(ReloadReason::ServerClosed)
    );

    let fleet = board.borrow_and_update().clone();
    assert!(fleet.find(&MachineId::from("4")).is_some_and(|r| r.has_unread_message));
    assert_eq!(api.log().iter().filter(|c| *c == "current_list").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn hard_refresh_fires_after_configured_lifetime() {
    let api = api();
    let (publisher, _board) = watch::channel(Fleet::default());
    let mut session = SessionController::with_publisher(
        Arc::clone(&api),
        SessionContext::default(),
        SessionSettings {
            hard_refresh: Duration::from_secs(60),
            ..SessionSettings::default()
        },
        publisher,
    );
    let (transport, _frames, _outbound) = channel_transport();
    let started = tokio::time::Instant::now();

    assert_eq!(
        session.run(transport, &CancellationToken::new()).await,
        SessionExit::Reload(ReloadReason::HardRefresh)
    );
    assert!(started.elapsed() >= Duration::from_secs(60));
}
