//! Log shipping pipeline.
//!
//! `SpoolShipper` drains an unbounded queue of node log lines into the local
//! spool on a blocking worker. Lines are JSON objects tagged with the node's
//! log id so a later uploader can forward them unchanged.

use futures_util::future::BoxFuture;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};

use crate::error::BoxError;
use crate::observability::spool::{Spool, DEFAULT_CAP};

/// Destination for node log lines.
pub trait LogShipper: Send + Sync {
    /// Queue one line. Never blocks.
    fn write(&self, line: &str);

    /// Flush everything queued so far and stop accepting lines.
    fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    /// Stop without waiting for queued lines.
    fn abort(&self);
}

#[derive(Serialize)]
struct Record<'a> {
    log_id: &'a str,
    client_time_ms: u128,
    text: &'a str,
}

enum Msg {
    Line(String),
    Flush(oneshot::Sender<std::io::Result<()>>),
}

pub struct SpoolShipper {
    tx: Mutex<Option<mpsc::UnboundedSender<Msg>>>,
}

impl SpoolShipper {
    /// Open the spool in `dir` and start the drain worker.
    pub fn open(dir: &Path, log_id: &str) -> std::io::Result<Self> {
        let spool = Spool::open(dir, DEFAULT_CAP)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let log_id = log_id.to_string();
        tokio::task::spawn_blocking(move || drain(spool, rx, &log_id));
        Ok(Self {
            tx: Mutex::new(Some(tx)),
        })
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Msg>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn drain(mut spool: Spool, mut rx: mpsc::UnboundedReceiver<Msg>, log_id: &str) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            Msg::Line(text) => {
                let client_time_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                let record = Record {
                    log_id,
                    client_time_ms,
                    text: &text,
                };
                let written = serde_json::to_string(&record)
                    .map_err(std::io::Error::other)
                    .and_then(|line| spool.append(&line));
                if let Err(e) = written {
                    tracing::warn!(error = %e, "Dropping log line");
                }
            }
            Msg::Flush(done) => {
                let _ = done.send(spool.sync());
            }
        }
    }
    if let Err(e) = spool.sync() {
        tracing::debug!(error = %e, "Final spool sync failed");
    }
}

impl LogShipper for SpoolShipper {
    fn write(&self, line: &str) {
        if let Some(tx) = self.sender() {
            let _ = tx.send(Msg::Line(line.to_string()));
        }
    }

    fn shutdown(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        Box::pin(async move {
            let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
                return Ok(());
            };
            let (done_tx, done_rx) = oneshot::channel();
            tx.send(Msg::Flush(done_tx))
                .map_err(|_| "log shipper already stopped")?;
            drop(tx);
            done_rx.await.map_err(|_| "log shipper stopped before flushing")??;
            Ok(())
        })
    }

    fn abort(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::spool::read_lines;

    #[tokio::test]
    async fn lines_are_spooled_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let shipper = SpoolShipper::open(dir.path(), "abc123").unwrap();
        shipper.write("hello");
        shipper.write("world");
        shipper.shutdown().await.unwrap();

        let lines = read_lines(dir.path()).unwrap();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(first["log_id"], "abc123");
        assert_eq!(first["text"], "hello");

        // Closed shippers ignore writes and a second shutdown.
        shipper.write("late");
        shipper.shutdown().await.unwrap();
    }
}
