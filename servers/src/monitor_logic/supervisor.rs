//! Restart loop around the telemetry session.
//!
//! A session ends with a reload request or a shutdown. On reload the
//! controller is dropped (cancelling its timers), a fresh one is built on the
//! same publisher, the snapshot is fetched again and the socket reconnected.
//! Failed snapshot fetches, failed connects and sessions that end before
//! `STABLE_SESSION` all back off exponentially; the backoff resets only after
//! a session has stayed up that long.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use lib_fleet::core::{FleetApi, SessionContext, SessionController, SessionExit, SessionSettings, Transport, TransportError};
use lib_fleet::telemetry::Fleet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A session that lasts at least this long resets the reconnect backoff.
pub const STABLE_SESSION: Duration = Duration::from_secs(30);

/// Exponential reconnect delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Sleeps for the next delay. `false` when shutdown interrupted the wait.
    async fn wait(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.next_delay();
        log::info!("Retrying in {} ms.", delay.as_millis());
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

pub struct Supervisor<A: FleetApi> {
    pub api: Arc<A>,
    pub context: SessionContext,
    pub settings: SessionSettings,
    pub publisher: watch::Sender<Fleet>,
    pub backoff: Backoff,
}

impl<A: FleetApi> Supervisor<A> {
    /// Runs sessions until `shutdown` fires. `connect` opens a new transport
    /// for every session.
    pub async fn run<T, F, Fut>(mut self, connect: F, shutdown: CancellationToken)
    where
        T: Transport,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        while !shutdown.is_cancelled() {
            let mut session = SessionController::with_publisher(
                Arc::clone(&self.api),
                self.context.clone(),
                self.settings.clone(),
                self.publisher.clone(),
            );

            if let Err(e) = session.load_snapshot().await {
                log::warn!("Snapshot fetch failed: {}", e);
                if !self.backoff.wait(&shutdown).await {
                    break;
                }
                continue;
            }

            session.mark_connecting();
            let transport = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = connect() => result,
            };
            let transport = match transport {
                Ok(transport) => transport,
                Err(e) => {
                    log::warn!("{}", e);
                    if !self.backoff.wait(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let started = tokio::time::Instant::now();
            match session.run(transport, &shutdown).await {
                SessionExit::Shutdown => break,
                SessionExit::Reload(reason) if started.elapsed() >= STABLE_SESSION => {
                    log::info!("Session ended ({:?}); rebuilding.", reason);
                    self.backoff.reset();
                }
                SessionExit::Reload(reason) => {
                    log::warn!(
                        "Session ended after {} ms ({:?}); backing off before rebuilding.",
                        started.elapsed().as_millis(),
                        reason
                    );
                    if !self.backoff.wait(&shutdown).await {
                        break;
                    }
                }
            }
        }
        log::info!("Supervisor stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDateTime;
    use lib_fleet::telemetry::{Frame, MachineId, MachineRecord};

    #[derive(Default)]
    struct CountingApi {
        snapshots: AtomicUsize,
    }

    impl FleetApi for CountingApi {
        type Error = io::Error;

        async fn current_list(&self) -> Result<Vec<MachineRecord>, io::Error> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            Ok(vec![MachineRecord::new("1", "1")])
        }

        async fn installed_sources(&self) -> Result<Vec<String>, io::Error> {
            Ok(Vec::new())
        }

        async fn register_source(&self, _source: &str) -> Result<(), io::Error> {
            Ok(())
        }

        async fn completion_time(&self, _id: &MachineId) -> Result<Option<NaiveDateTime>, io::Error> {
            Ok(None)
        }
    }

    /// Accepts the handshake, then ends the stream at once.
    struct DroppedSocket;

    impl Transport for DroppedSocket {
        async fn send_text(&mut self, _text: String) -> Result<(), TransportError> {
            Ok(())
        }

        async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
            None
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(1_000), Duration::from_millis(5_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(4_000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5_000));
        for _ in 0..40 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(5_000));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_cut_short_by_shutdown() {
        let mut backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(!backoff.wait(&shutdown).await);
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_sessions_back_off_before_reconnecting() {
        let api = Arc::new(CountingApi::default());
        let (publisher, _board) = watch::channel(Fleet::default());
        let supervisor = Supervisor {
            api: Arc::clone(&api),
            context: SessionContext::default(),
            settings: SessionSettings::default(),
            publisher,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        };

        let connects = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connects);
        let connect = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TransportError>(DroppedSocket) }
        };

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(3_500)).await;
            stop.cancel();
        });

        // Connects at 0 s, 1 s and 3 s; the 4 s wait is cut by shutdown.
        supervisor.run(connect, shutdown).await;
        assert_eq!(connects.load(Ordering::SeqCst), 3);
        assert_eq!(api.snapshots.load(Ordering::SeqCst), 3);
    }
}
