use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use smidr_common::log::{LogItem, LogStream};

use super::filter;

/// Capacity of each subscriber's channel; an entry that would block is
/// dropped for that subscriber only.
pub const SUBSCRIBER_BUFFER_SIZE: usize = 100;

const SINK_BUFFER_SIZE: usize = 1024;

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<LogItem>,
    dropped: u64,
}

struct HubInner {
    buffer: Vec<LogItem>,
    subscribers: Vec<Subscriber>,
    next_subscriber: SubscriberId,
    closed: bool,
}

/// Per-build append-only log buffer with multi-subscriber fanout.
///
/// Every raw line is teed to the build's plain-text and JSON-lines files;
/// container output additionally passes the forwarding filter before it
/// reaches the in-memory buffer and subscribers. Subscribers that fall
/// behind lose entries individually and never stall the build.
pub struct LogHub {
    inner: Mutex<HubInner>,
    sink: Option<mpsc::Sender<LogItem>>,
}

impl LogHub {
    /// Hub with file sinks. The files are truncated per run.
    pub fn new(plain_path: &Path, json_path: &Path) -> std::io::Result<Self> {
        let mut plain = std::fs::File::create(plain_path)?;
        let mut json = std::fs::File::create(json_path)?;

        let (sink_tx, mut sink_rx) = mpsc::channel::<LogItem>(SINK_BUFFER_SIZE);
        tokio::task::spawn_blocking(move || {
            while let Some(item) = sink_rx.blocking_recv() {
                if let Err(err) = write_sinks(&mut plain, &mut json, &item) {
                    warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to write build log file"
                    );
                }
            }
            let _ = plain.flush();
            let _ = json.flush();
        });

        Ok(Self {
            inner: Mutex::new(HubInner {
                buffer: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                closed: false,
            }),
            sink: Some(sink_tx),
        })
    }

    /// Hub without file sinks.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(HubInner {
                buffer: Vec::new(),
                subscribers: Vec::new(),
                next_subscriber: 0,
                closed: false,
            }),
            sink: None,
        }
    }

    /// Append a daemon-originated line: always forwarded to subscribers.
    pub fn append(&self, stream: LogStream, line: impl Into<String>) {
        let item = new_item(stream, line.into());
        self.tee(&item);
        self.push(item);
    }

    /// Append a raw container output line. The full line goes to the file
    /// sinks; only lines passing the forwarding filter reach subscribers.
    pub fn append_container(&self, stream: LogStream, line: impl Into<String>) {
        let item = new_item(stream, line.into());
        self.tee(&item);
        if filter::should_forward(&item.line) {
            self.push(item);
        }
    }

    fn tee(&self, item: &LogItem) {
        if let Some(sink) = &self.sink {
            if sink.try_send(item.clone()).is_err() {
                // Sink task gone or saturated; the in-memory path still works.
            }
        }
    }

    fn push(&self, item: LogItem) {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        if inner.closed {
            return;
        }

        inner.buffer.push(item.clone());

        inner.subscribers.retain_mut(|sub| match sub.tx.try_send(item.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Accumulated entries plus a channel for what comes after: the snapshot
    /// concatenated with the channel is a gap-free, duplicate-free prefix of
    /// the append order (modulo entries dropped for this subscriber alone).
    ///
    /// On a closed hub the snapshot is complete and the channel is already
    /// at end-of-stream.
    pub fn subscribe(&self) -> (Vec<LogItem>, SubscriberId, mpsc::Receiver<LogItem>) {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;

        if !inner.closed {
            inner.subscribers.push(Subscriber { id, tx, dropped: 0 });
        }

        (inner.buffer.clone(), id, rx)
    }

    /// Idempotent; safe from any thread.
    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        inner.subscribers.retain(|sub| sub.id != id);
    }

    /// Mark the build finished: subscribers drain their channels and then
    /// observe end-of-stream. Further appends are discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("log hub lock poisoned");
        inner.closed = true;
        for sub in inner.subscribers.drain(..) {
            if sub.dropped > 0 {
                warn!(
                    subscriber = sub.id,
                    dropped = sub.dropped,
                    "slow log subscriber lost entries"
                );
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("log hub lock poisoned").closed
    }

    /// Entries currently buffered; index order is append order.
    pub fn snapshot(&self) -> Vec<LogItem> {
        self.inner.lock().expect("log hub lock poisoned").buffer.clone()
    }
}

fn new_item(stream: LogStream, line: String) -> LogItem {
    LogItem {
        timestamp: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        stream,
        line,
    }
}

fn write_sinks(
    plain: &mut std::fs::File,
    json: &mut std::fs::File,
    item: &LogItem,
) -> std::io::Result<()> {
    writeln!(plain, "{}", item.line)?;
    let encoded = serde_json::to_string(item)?;
    writeln!(json, "{encoded}")?;

    Ok(())
}
