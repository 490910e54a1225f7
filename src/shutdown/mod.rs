use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[cfg(unix)]
use signal_hook::SigId;
#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;

const ASYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cloneable view of the process-wide shutdown flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    /// Resolves once the flag is set; used as axum's graceful shutdown future.
    pub async fn wait(self) {
        while !self.is_triggered() {
            tokio::time::sleep(ASYNC_POLL_INTERVAL).await;
        }
    }
}

/// SIGINT/SIGTERM registration feeding a [`ShutdownSignal`].
pub struct ShutdownHooks {
    signal: ShutdownSignal,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let signal = ShutdownSignal::new();

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&signal.triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&signal.triggered))?;
            Ok(Self {
                signal,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { signal })
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
