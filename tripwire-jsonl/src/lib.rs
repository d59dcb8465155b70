//! JSONL sink for `tripwire`. Writes one guard event per line.
//! Always appends; bring your own path.
//!
//! [`JsonlSink::new`] spawns a writer task on the current tokio runtime. `call` only
//! queues the rendered line, so the sink can go straight into a guard and be hit from
//! any thread:
//!
//! ```no_run
//! use tripwire::{AbuseGuard, GuardConfig};
//! use tripwire_jsonl::JsonlSink;
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let sink = JsonlSink::new("/var/log/guard.jsonl")?;
//! let guard = AbuseGuard::<String, _>::new(GuardConfig::default()).with_sink(sink);
//! # let _ = guard;
//! # Ok(())
//! # }
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tripwire::telemetry::{event_to_json, GuardEvent, TelemetrySink};

/// Lines queued ahead of the writer by [`JsonlSink::new`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Appends each [`GuardEvent`] as one JSON object per line.
#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: Arc<PathBuf>,
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

impl JsonlSink {
    /// Sink appending to `path`, created if missing. Fails outside a tokio runtime.
    pub fn new<P: Into<PathBuf>>(path: P) -> io::Result<Self> {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    /// Like [`new`](Self::new) with room for `capacity` pending lines.
    pub fn with_capacity<P: Into<PathBuf>>(path: P, capacity: usize) -> io::Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let path = Arc::new(path.into());
        let (tx, rx) = mpsc::channel(capacity.max(1));
        handle.spawn(write_lines(path.clone(), rx));
        Ok(Self { path, tx, dropped: Arc::new(AtomicU64::new(0)) })
    }

    /// Target file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn write_lines(path: Arc<PathBuf>, mut rx: mpsc::Receiver<String>) {
    let mut file =
        match tokio::fs::OpenOptions::new().create(true).append(true).open(path.as_path()).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(target: "tripwire::jsonl", path = %path.display(), error = %e, "cannot open; writer stopping");
                return;
            }
        };
    while let Some(line) = rx.recv().await {
        let written = match file.write_all(line.as_bytes()).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::warn!(target: "tripwire::jsonl", path = %path.display(), error = %e, "write failed");
        }
    }
}

impl tower_service::Service<GuardEvent> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        let line = event_to_json(&event).to_string() + "\n";
        tracing::trace!(target: "tripwire::jsonl", path = %self.path.display(), key = event.key(), "append");
        let result = match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "jsonl writer stopped"))
            }
        };
        Box::pin(std::future::ready(result))
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}
