use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;

use crate::config::ServerConfig;
use crate::logging::LogLevel;
use crate::shutdown::ShutdownSignal;
use crate::wire::INVALID_LINE;
use crate::wire::session::{SessionContext, WorkerSession};

const CONTEXT: &str = "server";
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

type SessionTable = Arc<Mutex<HashMap<u64, TcpStream>>>;

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        connection_id: u64,
        source: io::Error,
    },
    SpawnSession {
        connection_id: u64,
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind worker server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set worker server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept worker connection: {source}"),
            Self::ConfigureAcceptedStream {
                connection_id,
                source,
            } => write!(
                f,
                "failed to configure worker connection {connection_id}: {source}"
            ),
            Self::SpawnSession {
                connection_id,
                source,
            } => write!(
                f,
                "failed to spawn session thread for connection {connection_id}: {source}"
            ),
        }
    }
}

impl std::error::Error for ServerError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Started { connection_id: u64 },
    Rejected { connection_id: u64 },
}

/// Removes a session from the table when its thread finishes.
struct SessionGuard {
    connection_id: u64,
    sessions: SessionTable,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(&self.connection_id);
    }
}

/// Accepts worker connections and runs one [`WorkerSession`] thread each.
pub struct WorkerServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    sessions: SessionTable,
    max_workers: usize,
    context: Arc<SessionContext>,
}

impl WorkerServer {
    pub fn bind(config: &ServerConfig, context: Arc<SessionContext>) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_workers: config.max_workers,
            context,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .len()
    }

    /// Accepts at most one pending connection without blocking.
    pub fn poll_accept(&self) -> Result<Option<AcceptOutcome>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let configure = |source| ServerError::ConfigureAcceptedStream {
            connection_id,
            source,
        };

        stream.set_nonblocking(false).map_err(configure)?;
        stream.set_nodelay(true).map_err(configure)?;

        let active = {
            let mut sessions = self.sessions.lock().expect("session table lock poisoned");
            if sessions.len() >= self.max_workers {
                None
            } else {
                sessions.insert(connection_id, stream.try_clone().map_err(configure)?);
                Some(sessions.len())
            }
        };
        let Some(active_sessions) = active else {
            self.reject(stream, connection_id, peer_addr);
            return Ok(Some(AcceptOutcome::Rejected { connection_id }));
        };

        let guard = SessionGuard {
            connection_id,
            sessions: Arc::clone(&self.sessions),
        };
        let context = Arc::clone(&self.context);
        thread::Builder::new()
            .name(format!("worker-session-{connection_id}"))
            .spawn(move || {
                let _guard = guard;
                match WorkerSession::new(connection_id, stream, Arc::clone(&context)) {
                    Ok(session) => {
                        // Outcome is logged by the session itself.
                        let _ = session.run();
                    }
                    Err(error) => context.logger.warn(
                        Some(CONTEXT),
                        &format!("failed to start session for connection {connection_id}: {error}"),
                    ),
                }
            })
            .map_err(|source| ServerError::SpawnSession {
                connection_id,
                source,
            })?;

        self.context.logger.log(
            LogLevel::Info,
            Some(CONTEXT),
            "Accepted worker connection",
            Some(json!({
                "connection_id": connection_id,
                "peer_addr": peer_addr.to_string(),
                "active_sessions": active_sessions,
                "max_workers": self.max_workers
            })),
        );
        Ok(Some(AcceptOutcome::Started { connection_id }))
    }

    /// Polls for connections until `signal` fires. Accept failures are logged
    /// and do not stop the loop.
    pub fn serve_until(&self, signal: &ShutdownSignal) {
        while !signal.is_triggered() {
            match self.poll_accept() {
                Ok(Some(_)) => {}
                Ok(None) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(error) => {
                    self.context.logger.warn(Some(CONTEXT), &error.to_string());
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }
    }

    /// Closes every live worker socket so blocked session reads return.
    pub fn shutdown_all_sessions(&self) {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        for stream in sessions.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn reject(&self, mut stream: TcpStream, connection_id: u64, peer_addr: SocketAddr) {
        let _ = stream.write_all(INVALID_LINE);
        let _ = stream.shutdown(Shutdown::Both);
        self.context.logger.log(
            LogLevel::Warn,
            Some(CONTEXT),
            "Worker limit reached, connection rejected",
            Some(json!({
                "connection_id": connection_id,
                "peer_addr": peer_addr.to_string(),
                "max_workers": self.max_workers
            })),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use crate::config::ServerConfig;
    use crate::dispatch::{DispatchRegistry, Msg};
    use crate::shutdown::ShutdownSignal;
    use crate::storage::StorageFacade;
    use crate::storage::testing::{test_storage, unique_temp_path};
    use crate::wire::session::SessionTimeouts;
    use crate::wire::session::testing::{TestWorker, test_context};

    use super::{AcceptOutcome, WorkerServer};

    const TOPIC: &str = "acme.example_alerts";

    fn local_config(max_workers: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            max_workers,
            ..ServerConfig::default()
        }
    }

    struct RunningServer {
        path: String,
        storage: Arc<StorageFacade>,
        registry: Arc<DispatchRegistry>,
        server: Arc<WorkerServer>,
        signal: ShutdownSignal,
        accept_loop: Option<JoinHandle<()>>,
    }

    impl RunningServer {
        fn start(label: &str, max_workers: usize) -> Self {
            let path = unique_temp_path(label);
            let storage = Arc::new(test_storage(&path));
            let registry = Arc::new(DispatchRegistry::new(16));
            let context = test_context(
                Arc::clone(&storage),
                Arc::clone(&registry),
                SessionTimeouts::default(),
                false,
            );
            let server = Arc::new(
                WorkerServer::bind(&local_config(max_workers), context)
                    .expect("server should bind"),
            );
            let signal = ShutdownSignal::new();
            let accept_loop = {
                let server = Arc::clone(&server);
                let signal = signal.clone();
                thread::spawn(move || server.serve_until(&signal))
            };

            Self {
                path,
                storage,
                registry,
                server,
                signal,
                accept_loop: Some(accept_loop),
            }
        }

        fn worker(&self) -> TestWorker {
            TestWorker::connect(self.server.local_addr().expect("server should have an address"))
        }

        fn ingest(&self, body: &[u8]) -> u64 {
            let id = self
                .storage
                .append("acme.example", "alerts", body)
                .expect("append should work");
            self.registry
                .publish(Msg::new(TOPIC, id))
                .expect("publish should work");
            id
        }

        fn wait_for_sessions(&self, expected: usize) {
            let started = Instant::now();
            while self.server.active_sessions() != expected {
                assert!(
                    started.elapsed() < Duration::from_secs(5),
                    "expected {expected} active sessions, have {}",
                    self.server.active_sessions()
                );
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    impl Drop for RunningServer {
        fn drop(&mut self) {
            self.signal.trigger();
            self.registry.close();
            self.server.shutdown_all_sessions();
            if let Some(handle) = self.accept_loop.take() {
                let _ = handle.join();
            }
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn listener_is_non_blocking() {
        let path = unique_temp_path("server-nonblocking");
        let storage = Arc::new(test_storage(&path));
        let registry = Arc::new(DispatchRegistry::new(4));
        let context = test_context(storage, registry, SessionTimeouts::default(), false);
        let server = WorkerServer::bind(&local_config(1), context).expect("server should bind");

        assert_eq!(server.poll_accept().expect("poll should not fail"), None);
        assert_eq!(server.active_sessions(), 0);

        drop(server);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn acknowledged_job_is_not_delivered_again() {
        let server = RunningServer::start("server-ack", 4);
        let first = server.ingest(b"first");
        let mut worker = server.worker();

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job(), (first, b"first".to_vec()));
        worker.send("OK");

        let second = server.ingest(b"second");
        assert_eq!(worker.request_job(), (second, b"second".to_vec()));

        let stats = server.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!(stats.requeued_total, 0);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.delivered_total, 1);
    }

    #[test]
    fn job_abandoned_after_pong_goes_to_next_worker() {
        let server = RunningServer::start("server-redeliver", 4);
        let id = server.ingest(b"retry me");

        let mut first = server.worker();
        first.subscribe(&[TOPIC]);
        assert_eq!(first.request_job().0, id);
        first.send("PONG");
        drop(first);

        let mut second = server.worker();
        second.subscribe(&[TOPIC]);
        assert_eq!(second.request_job(), (id, b"retry me".to_vec()));
    }

    #[test]
    fn command_before_subscription_closes_connection() {
        let server = RunningServer::start("server-invalid", 4);
        let mut worker = server.worker();

        assert_eq!(worker.read_line(), "HELLO hfast.v1");
        worker.send("OK");
        assert_eq!(worker.read_line(), "INVALID");
        worker.assert_closed();
        server.wait_for_sessions(0);
    }

    #[test]
    fn connections_over_the_worker_cap_are_rejected() {
        let server = RunningServer::start("server-cap", 1);

        let mut admitted = server.worker();
        admitted.subscribe(&[TOPIC]);
        server.wait_for_sessions(1);

        let mut rejected = server.worker();
        assert_eq!(rejected.read_line(), "INVALID");
        rejected.assert_closed();

        drop(admitted);
        server.wait_for_sessions(0);

        let mut later = server.worker();
        later.subscribe(&[TOPIC]);
    }

    #[test]
    fn shutdown_closes_idle_sessions() {
        let server = RunningServer::start("server-shutdown", 4);
        let mut worker = server.worker();
        worker.subscribe(&[TOPIC]);
        server.wait_for_sessions(1);

        server.server.shutdown_all_sessions();
        worker.assert_closed();
        server.wait_for_sessions(0);
    }

    #[test]
    fn accept_outcomes_report_connection_ids() {
        let path = unique_temp_path("server-outcomes");
        let storage = Arc::new(test_storage(&path));
        let registry = Arc::new(DispatchRegistry::new(4));
        let context = test_context(storage, Arc::clone(&registry), SessionTimeouts::default(), false);
        let server = WorkerServer::bind(&local_config(1), context).expect("server should bind");
        let addr = server.local_addr().expect("server should have an address");

        let mut first = TestWorker::connect(addr);
        let mut second = TestWorker::connect(addr);
        let mut outcomes = Vec::new();
        let started = Instant::now();
        while outcomes.len() < 2 && started.elapsed() < Duration::from_secs(5) {
            match server.poll_accept() {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => thread::sleep(Duration::from_millis(5)),
                Err(error) => panic!("accept failed: {error}"),
            }
        }

        assert_eq!(
            outcomes,
            vec![
                AcceptOutcome::Started { connection_id: 1 },
                AcceptOutcome::Rejected { connection_id: 2 }
            ]
        );
        assert_eq!(first.read_line(), "HELLO hfast.v1");
        assert_eq!(second.read_line(), "INVALID");

        registry.close();
        server.shutdown_all_sessions();
        let _ = std::fs::remove_dir_all(path);
    }
}
