use std::fmt;
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config::ServerConfig;
use crate::dispatch::{DispatchRegistry, Msg, RegistryError};
use crate::logging::{LogLevel, Logger};
use crate::storage::{StorageError, StorageFacade};

use super::command::{WorkerCommand, parse_command, read_command_line};
use super::{BANNER_LINE, INVALID_LINE, READY_LINE, job_header};

const CONTEXT: &str = "wire::session";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Read deadline armed right after a job is written.
    pub dispatch_deadline: Duration,
    /// Read deadline re-armed by every `PONG`.
    pub pong_extension: Duration,
}

impl SessionTimeouts {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            dispatch_deadline: Duration::from_millis(config.dispatch_deadline_ms),
            pong_extension: Duration::from_millis(config.pong_extension_ms),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

/// Dependencies shared by every worker session.
pub struct SessionContext {
    pub registry: Arc<DispatchRegistry>,
    pub storage: Arc<StorageFacade>,
    pub logger: Logger,
    pub timeouts: SessionTimeouts,
    pub remove_on_ack: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Subscribed,
    Dispatched,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Subscribed => "SUBSCRIBED",
            Self::Dispatched => "DISPATCHED",
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Io(io::Error),
    DeadlineExceeded,
    ProtocolViolation { state: SessionState, reason: String },
    Storage(StorageError),
    Registry(RegistryError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "worker socket error: {source}"),
            Self::DeadlineExceeded => write!(f, "worker missed its deadline"),
            Self::ProtocolViolation { state, reason } => {
                write!(f, "protocol violation in state {}: {reason}", state.as_str())
            }
            Self::Storage(source) => write!(f, "job payload unavailable: {source}"),
            Self::Registry(source) => write!(f, "dispatch unavailable: {source}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// One worker connection running the push protocol.
///
/// A job handed out by `READY` stays in flight until the worker answers `OK`.
/// However the session ends, an in-flight job goes back to its topic's
/// requeue buffer.
pub struct WorkerSession {
    connection_id: u64,
    peer_addr: SocketAddr,
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    state: SessionState,
    topics: Vec<String>,
    in_flight: Option<Msg>,
    deadline: Option<Instant>,
    context: Arc<SessionContext>,
}

impl WorkerSession {
    pub fn new(
        connection_id: u64,
        stream: TcpStream,
        context: Arc<SessionContext>,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_write_timeout(Some(context.timeouts.dispatch_deadline))?;
        let reader = BufReader::new(stream.try_clone()?);

        Ok(Self {
            connection_id,
            peer_addr,
            reader,
            writer: stream,
            state: SessionState::Init,
            topics: Vec::new(),
            in_flight: None,
            deadline: None,
            context,
        })
    }

    /// Drives the session until the worker leaves or breaks the protocol.
    pub fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive();
        let requeued = self.release_in_flight();
        let _ = self.writer.shutdown(Shutdown::Both);

        let payload = json!({
            "connection_id": self.connection_id,
            "peer_addr": self.peer_addr.to_string(),
            "state": self.state.as_str(),
            "topics": self.topics,
            "requeued_job": requeued.map(|msg| msg.id)
        });
        match &result {
            Ok(()) => self.context.logger.log(
                LogLevel::Info,
                Some(CONTEXT),
                "Worker disconnected",
                Some(payload),
            ),
            Err(error) => self.context.logger.log(
                LogLevel::Warn,
                Some(CONTEXT),
                &format!("Worker session closed: {error}"),
                Some(payload),
            ),
        }
        result
    }

    fn drive(&mut self) -> Result<(), SessionError> {
        self.send(BANNER_LINE)?;

        loop {
            let Some(line) = self.next_line()? else {
                return Ok(());
            };
            self.trace("<<", &line);

            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(error) => return Err(self.violation(error.to_string())),
            };

            match (self.state, command) {
                (SessionState::Init, WorkerCommand::Chan(topics)) => self.subscribe(topics)?,
                (SessionState::Subscribed, WorkerCommand::Ready) => self.dispatch_next()?,
                (SessionState::Dispatched, WorkerCommand::Pong) => self.extend_deadline(),
                (SessionState::Dispatched, WorkerCommand::Ok) => self.complete_in_flight(),
                (state, command) => {
                    return Err(self.violation(format!(
                        "{} is not valid in state {}",
                        command.name(),
                        state.as_str()
                    )));
                }
            }
        }
    }

    fn subscribe(&mut self, topics: Vec<String>) -> Result<(), SessionError> {
        for topic in &topics {
            self.context.registry.ensure_topic(topic);
        }
        self.topics = topics;
        self.send(READY_LINE)?;
        self.state = SessionState::Subscribed;

        self.context.logger.log(
            LogLevel::Debug,
            Some(CONTEXT),
            "Worker subscribed",
            Some(json!({
                "connection_id": self.connection_id,
                "topics": self.topics
            })),
        );
        Ok(())
    }

    fn dispatch_next(&mut self) -> Result<(), SessionError> {
        let (msg, payload) = loop {
            let msg = self
                .context
                .registry
                .take_any(&self.topics)
                .map_err(SessionError::Registry)?;

            match self.context.storage.fetch(&msg.topic, msg.id) {
                Ok(payload) => break (msg, payload),
                Err(error) if error.is_not_found() => {
                    self.context.logger.error(
                        Some(CONTEXT),
                        &format!("dropping reference to missing job {} of '{}'", msg.id, msg.topic),
                    );
                }
                Err(error) => {
                    self.in_flight = Some(msg);
                    return Err(SessionError::Storage(error));
                }
            }
        };

        let header = job_header(msg.id, payload.len());
        self.in_flight = Some(msg);
        self.state = SessionState::Dispatched;

        self.send(header.as_bytes())?;
        self.writer.write_all(&payload).map_err(SessionError::Io)?;
        self.deadline = Some(Instant::now() + self.context.timeouts.dispatch_deadline);
        Ok(())
    }

    fn extend_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.context.timeouts.pong_extension);
    }

    fn complete_in_flight(&mut self) {
        if let Some(msg) = self.in_flight.take() {
            self.context.registry.acknowledge(&msg);

            if self.context.remove_on_ack {
                if let Err(error) = self.context.storage.remove(&msg.topic, msg.id) {
                    self.context.logger.warn(
                        Some(CONTEXT),
                        &format!("failed to remove acknowledged job {} of '{}': {error}", msg.id, msg.topic),
                    );
                }
            }

            self.context.logger.log(
                LogLevel::Debug,
                Some(CONTEXT),
                "Job acknowledged",
                Some(json!({
                    "connection_id": self.connection_id,
                    "topic": msg.topic,
                    "id": msg.id
                })),
            );
        }

        self.deadline = None;
        self.state = SessionState::Subscribed;
    }

    fn release_in_flight(&mut self) -> Option<Msg> {
        let msg = self.in_flight.take()?;

        match self.context.registry.requeue(msg.clone()) {
            Ok(()) => Some(msg),
            Err(error) => {
                self.context.logger.warn(
                    Some(CONTEXT),
                    &format!(
                        "job {} of '{}' not requeued ({error}); it stays stored for recovery",
                        msg.id, msg.topic
                    ),
                );
                None
            }
        }
    }

    /// Reads the next command, honouring the armed deadline if any.
    fn next_line(&mut self) -> Result<Option<String>, SessionError> {
        let timeout = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(SessionError::DeadlineExceeded);
                }
                Some(remaining)
            }
            None => None,
        };
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .map_err(SessionError::Io)?;

        match read_command_line(&mut self.reader) {
            Ok(line) => Ok(line),
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Err(SessionError::DeadlineExceeded)
            }
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                Err(self.violation(error.to_string()))
            }
            Err(error) => Err(SessionError::Io(error)),
        }
    }

    /// Emits `INVALID` and returns the error that ends the session.
    fn violation(&mut self, reason: String) -> SessionError {
        if let Err(error) = self.send(INVALID_LINE) {
            self.context.logger.debug(
                Some(CONTEXT),
                &format!("failed to send INVALID to connection {}: {error}", self.connection_id),
            );
        }
        SessionError::ProtocolViolation {
            state: self.state,
            reason,
        }
    }

    fn send(&mut self, line: &[u8]) -> Result<(), SessionError> {
        self.writer.write_all(line).map_err(SessionError::Io)?;
        if self.context.logger.enabled(LogLevel::Verbose) {
            self.trace(">>", String::from_utf8_lossy(line).trim_end());
        }
        Ok(())
    }

    fn trace(&self, direction: &str, line: &str) {
        self.context.logger.verbose(
            Some(CONTEXT),
            &format!(
                "connection {} state={} {direction} {line}",
                self.connection_id,
                self.state.as_str()
            ),
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::dispatch::DispatchRegistry;
    use crate::logging::{LogLevel, Logger, LoggerConfig};
    use crate::storage::StorageFacade;

    use super::{SessionContext, SessionTimeouts};

    pub fn test_context(
        storage: Arc<StorageFacade>,
        registry: Arc<DispatchRegistry>,
        timeouts: SessionTimeouts,
        remove_on_ack: bool,
    ) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            registry,
            storage,
            logger: Logger::new(LoggerConfig {
                min_level: LogLevel::Error,
                human_friendly: false,
            }),
            timeouts,
            remove_on_ack,
        })
    }

    /// Client side of the worker protocol.
    pub struct TestWorker {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl TestWorker {
        pub fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).expect("worker should connect");
            Self::from_stream(stream)
        }

        pub fn from_stream(stream: TcpStream) -> Self {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("read timeout should apply");
            let reader = BufReader::new(stream.try_clone().expect("stream should clone"));
            Self {
                reader,
                writer: stream,
            }
        }

        pub fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\r\n").as_bytes())
                .expect("command should be written");
        }

        pub fn read_line(&mut self) -> String {
            let mut line = String::new();
            self.reader
                .read_line(&mut line)
                .expect("server line should arrive");
            line.trim_end_matches(['\r', '\n']).to_owned()
        }

        pub fn subscribe(&mut self, topics: &[&str]) {
            assert_eq!(self.read_line(), "HELLO hfast.v1");
            self.send(&format!("CHAN {}", topics.join(" ")));
            assert_eq!(self.read_line(), "READY");
        }

        /// Sends `READY` and reads the job that follows.
        pub fn request_job(&mut self) -> (u64, Vec<u8>) {
            self.send("READY");
            self.read_job()
        }

        pub fn read_job(&mut self) -> (u64, Vec<u8>) {
            let header = self.read_line();
            let parts: Vec<&str> = header.split(' ').collect();
            assert_eq!(parts.len(), 3, "unexpected job header '{header}'");
            assert_eq!(parts[0], "JOB");
            let id: u64 = parts[1].parse().expect("job id should be numeric");
            let len: usize = parts[2].parse().expect("job length should be numeric");

            let mut payload = vec![0_u8; len];
            self.reader
                .read_exact(&mut payload)
                .expect("job payload should arrive");
            (id, payload)
        }

        /// Asserts the server closed the connection.
        pub fn assert_closed(&mut self) {
            let mut rest = Vec::new();
            let read = self.reader.read_to_end(&mut rest);
            assert!(
                matches!(read, Ok(0)) || read.is_err(),
                "connection should be closed, got {read:?} {rest:?}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use crate::dispatch::{DispatchRegistry, Msg};
    use crate::storage::StorageFacade;
    use crate::storage::testing::{test_storage, unique_temp_path};

    use super::testing::{TestWorker, test_context};
    use super::{SessionContext, SessionError, SessionTimeouts, WorkerSession};

    const TOPIC: &str = "acme.example_alerts";

    struct Fixture {
        path: String,
        storage: Arc<StorageFacade>,
        registry: Arc<DispatchRegistry>,
    }

    impl Fixture {
        fn new(label: &str) -> Self {
            let path = unique_temp_path(label);
            Self {
                storage: Arc::new(test_storage(&path)),
                registry: Arc::new(DispatchRegistry::new(16)),
                path,
            }
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

        fn context(&self, timeouts: SessionTimeouts, remove_on_ack: bool) -> Arc<SessionContext> {
            test_context(
                Arc::clone(&self.storage),
                Arc::clone(&self.registry),
                timeouts,
                remove_on_ack,
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.registry.close();
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    fn start_session(
        context: Arc<SessionContext>,
    ) -> (TestWorker, JoinHandle<Result<(), SessionError>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr().expect("listener should have an address");
        let worker = TestWorker::connect(addr);
        let (stream, _) = listener.accept().expect("connection should be accepted");

        let handle = thread::spawn(move || {
            WorkerSession::new(1, stream, context)
                .expect("session should start")
                .run()
        });
        (worker, handle)
    }

    fn short_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            dispatch_deadline: Duration::from_millis(300),
            pong_extension: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn delivers_job_bytes_and_accepts_completion() {
        let fixture = Fixture::new("session-deliver");
        let first = fixture.ingest(b"first payload");
        let second = fixture.ingest(b"second payload");
        let (mut worker, _handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job(), (first, b"first payload".to_vec()));
        worker.send("OK");
        assert_eq!(worker.request_job(), (second, b"second payload".to_vec()));

        let stats = fixture.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!(stats.delivered_total, 1);
        assert_eq!(stats.dispatched_total, 2);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn disconnect_while_dispatched_requeues_the_job() {
        let fixture = Fixture::new("session-requeue");
        let id = fixture.ingest(b"payload");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job().0, id);
        worker.send("PONG");
        drop(worker);

        handle
            .join()
            .expect("session thread should not panic")
            .expect("client disconnect is a clean end");
        let stats = fixture.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!(stats.requeued, 1);
        assert_eq!(fixture.registry.take(TOPIC).expect("take should work").id, id);
    }

    #[test]
    fn disconnect_while_subscribed_requeues_nothing() {
        let fixture = Fixture::new("session-idle");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        drop(worker);

        handle
            .join()
            .expect("session thread should not panic")
            .expect("client disconnect is a clean end");
        let stats = fixture.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!(stats.requeued_total, 0);
    }

    #[test]
    fn command_before_subscription_is_invalid() {
        let fixture = Fixture::new("session-invalid-init");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        assert_eq!(worker.read_line(), "HELLO hfast.v1");
        worker.send("READY");
        assert_eq!(worker.read_line(), "INVALID");
        worker.assert_closed();

        let result = handle.join().expect("session thread should not panic");
        assert!(matches!(result, Err(SessionError::ProtocolViolation { .. })));
    }

    #[test]
    fn unknown_command_while_subscribed_is_invalid() {
        let fixture = Fixture::new("session-invalid-subscribed");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        worker.send("FETCH");
        assert_eq!(worker.read_line(), "INVALID");
        worker.assert_closed();

        assert!(matches!(
            handle.join().expect("session thread should not panic"),
            Err(SessionError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn violation_while_dispatched_requeues_the_job() {
        let fixture = Fixture::new("session-invalid-dispatched");
        let id = fixture.ingest(b"payload");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job().0, id);
        worker.send("READY");
        assert_eq!(worker.read_line(), "INVALID");

        assert!(matches!(
            handle.join().expect("session thread should not panic"),
            Err(SessionError::ProtocolViolation { .. })
        ));
        assert_eq!(fixture.registry.take(TOPIC).expect("take should work").id, id);
    }

    #[test]
    fn missed_deadline_closes_and_requeues() {
        let fixture = Fixture::new("session-deadline");
        let id = fixture.ingest(b"payload");
        let (mut worker, handle) = start_session(fixture.context(short_timeouts(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job().0, id);

        let result = handle.join().expect("session thread should not panic");
        assert!(matches!(result, Err(SessionError::DeadlineExceeded)));
        worker.assert_closed();
        assert_eq!(fixture.registry.take(TOPIC).expect("take should work").id, id);
    }

    #[test]
    fn pong_extends_the_deadline() {
        let fixture = Fixture::new("session-pong");
        let first = fixture.ingest(b"slow job");
        let second = fixture.ingest(b"next job");
        let (mut worker, _handle) = start_session(fixture.context(short_timeouts(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job().0, first);
        thread::sleep(Duration::from_millis(150));
        worker.send("PONG");
        thread::sleep(Duration::from_millis(400));
        worker.send("OK");

        assert_eq!(worker.request_job().0, second);
        let stats = fixture.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!(stats.delivered_total, 1);
        assert_eq!(stats.requeued_total, 0);
    }

    #[test]
    fn subscription_covers_several_topics() {
        let fixture = Fixture::new("session-multi");
        let id = fixture
            .storage
            .append("acme.example", "billing", b"invoice")
            .expect("append should work");
        fixture
            .registry
            .publish(Msg::new("acme.example_billing", id))
            .expect("publish should work");
        let (mut worker, _handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC, "acme.example_billing"]);
        assert_eq!(worker.request_job(), (id, b"invoice".to_vec()));
    }

    #[test]
    fn acknowledged_jobs_are_removed_when_configured() {
        let fixture = Fixture::new("session-remove-on-ack");
        let first = fixture.ingest(b"one");
        let second = fixture.ingest(b"two");
        let (mut worker, _handle) = start_session(fixture.context(SessionTimeouts::default(), true));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job().0, first);
        worker.send("OK");
        assert_eq!(worker.request_job().0, second);

        let err = fixture
            .storage
            .fetch(TOPIC, first)
            .expect_err("acknowledged job should be gone");
        assert!(err.is_not_found());
        assert!(fixture.storage.fetch(TOPIC, second).is_ok());
    }

    #[test]
    fn missing_payload_is_skipped_without_dropping_the_worker() {
        let fixture = Fixture::new("session-missing-payload");
        fixture
            .registry
            .publish(Msg::new(TOPIC, 42))
            .expect("publish should work");
        let id = fixture.ingest(b"stored payload");
        let (mut worker, handle) = start_session(fixture.context(SessionTimeouts::default(), false));

        worker.subscribe(&[TOPIC]);
        assert_eq!(worker.request_job(), (id, b"stored payload".to_vec()));
        worker.send("OK");
        drop(worker);

        handle
            .join()
            .expect("session thread should not panic")
            .expect("skipping a missing payload keeps the session healthy");
        let stats = fixture.registry.stats(TOPIC).expect("topic should exist");
        assert_eq!((stats.pending, stats.requeued), (0, 0));
        assert_eq!(stats.delivered_total, 1);
    }
}
