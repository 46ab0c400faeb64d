// src/notify.rs

//! Change notification and cancellation
//!
//! Every committed catalog transition is published once as a `ChangeEvent`
//! through a `ChangeNotifier`. Publishing is fire-and-forget: a notifier that
//! cannot deliver logs the failure and moves on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Kind of catalog transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeMethod {
    New,
    Upgrade,
    Overwrite,
    Delete,
}

impl ChangeMethod {
    pub fn as_str(&self) -> &str {
        match self {
            ChangeMethod::New => "new",
            ChangeMethod::Upgrade => "upgrade",
            ChangeMethod::Overwrite => "overwrite",
            ChangeMethod::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published catalog transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub branch: String,
    pub component: String,
    pub package: String,
    pub architecture: String,
    pub method: ChangeMethod,
    /// Empty for `new`
    pub from_version: String,
    /// Empty for `delete`
    pub to_version: String,
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{} {} {} {} {} -> {}",
            self.branch,
            self.component,
            self.method,
            self.architecture,
            self.package,
            self.from_version,
            self.to_version
        )
    }
}

/// Sink for change events
pub trait ChangeNotifier: Send + Sync {
    fn publish(&self, event: &ChangeEvent);
}

/// Logs each event through `tracing`
#[derive(Debug, Default)]
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn publish(&self, event: &ChangeEvent) {
        info!("change: {}", event);
    }
}

/// Writes one JSON object per line to a writer
pub struct JsonLinesNotifier<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesNotifier<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> ChangeNotifier for JsonLinesNotifier<W> {
    fn publish(&self, event: &ChangeEvent) {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let result = serde_json::to_writer(&mut *writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = result {
            warn!("Failed to write change event for {}: {}", event.package, e);
        }
    }
}

/// Forwards events to an in-process channel
///
/// A dropped receiver is not an error; events are discarded.
pub struct ChannelNotifier {
    sender: Sender<ChangeEvent>,
}

impl ChannelNotifier {
    pub fn new(sender: Sender<ChangeEvent>) -> Self {
        Self { sender }
    }
}

impl ChangeNotifier for ChannelNotifier {
    fn publish(&self, event: &ChangeEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!("Change receiver gone, dropping event for {}", event.package);
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<ChangeEvent>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events published so far
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Drain the events published so far
    pub fn take(&self) -> Vec<ChangeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl ChangeNotifier for CollectingNotifier {
    fn publish(&self, event: &ChangeEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

impl<N: ChangeNotifier + ?Sized> ChangeNotifier for Arc<N> {
    fn publish(&self, event: &ChangeEvent) {
        (**self).publish(event);
    }
}

/// Shared cancellation flag for a reconcile pass
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
