use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::config::HeartbeatConfig;
use crate::dispatch::DispatchRegistry;
use crate::logging::{LogLevel, Logger};

const CONTEXT: &str = "heartbeat";
pub const MIN_INTERVAL_MS: u64 = 100;

#[derive(Debug)]
pub enum HeartbeatError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn(io::Error),
    JoinFailed,
}

impl fmt::Display for HeartbeatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "heartbeat interval must be 0 (disabled) or at least {MIN_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "heartbeat is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn heartbeat thread: {source}"),
            Self::JoinFailed => write!(f, "heartbeat worker thread join failed"),
        }
    }
}

impl std::error::Error for HeartbeatError {}

/// Periodically logs the dispatch registry's per-topic statistics.
pub struct Heartbeat {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    registry: Arc<DispatchRegistry>,
    logger: Logger,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn new(
        registry: Arc<DispatchRegistry>,
        logger: Logger,
        config: HeartbeatConfig,
    ) -> Result<Self, HeartbeatError> {
        if config.interval_ms != 0 && config.interval_ms < MIN_INTERVAL_MS {
            return Err(HeartbeatError::InvalidInterval {
                provided_ms: config.interval_ms,
            });
        }

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms: config.interval_ms,
            registry,
            logger,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.interval_ms > 0
    }

    /// Starts the reporter thread; does nothing when disabled.
    pub fn start(&mut self) -> Result<(), HeartbeatError> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.worker.is_some() {
            return Err(HeartbeatError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let registry = Arc::clone(&self.registry);
        let logger = self.logger.clone();
        let initiated_at = self.initiated_at;
        let interval = Duration::from_millis(self.interval_ms);

        let handle = thread::Builder::new()
            .name("queue-heartbeat".to_owned())
            .spawn(move || {
                let mut next_report = Instant::now() + interval;
                while !stop_signal.load(Ordering::SeqCst) {
                    let now = Instant::now();
                    if now >= next_report {
                        report(&registry, &logger, initiated_at);
                        next_report = now + interval;
                    }
                    // Woken early by `stop`.
                    thread::park_timeout(next_report.saturating_duration_since(Instant::now()));
                }
            })
            .map_err(HeartbeatError::Spawn)?;
        self.worker = Some(handle);

        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), HeartbeatError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            handle.thread().unpark();
            return handle.join().map_err(|_| HeartbeatError::JoinFailed);
        }

        Ok(())
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms,
            "enabled": self.is_enabled()
        })
    }
}

fn report(registry: &DispatchRegistry, logger: &Logger, initiated_at: DateTime<Utc>) {
    let topics = registry.snapshot();
    let pending: usize = topics.iter().map(|stats| stats.pending).sum();
    let requeued: usize = topics.iter().map(|stats| stats.requeued).sum();

    logger.log(
        LogLevel::Info,
        Some(CONTEXT),
        "Queue statistics",
        Some(json!({
            "initiated_at": initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "emitted_at": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "pending": pending,
            "requeued": requeued,
            "topics": topics
        })),
    );
}
