// ─── Progress Reporting ───
// Typed progress events pushed to whatever sink the host installs (GUI
// bridge, channel, log). Components only see `&dyn ProgressSink`.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Install stages in the order the coordinator walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Verify,
    Runtime,
    Tool,
    Version,
    Download,
    Patch,
    OnlineFix,
    Launch,
    Complete,
}

/// Byte-level details attached to download progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStats {
    pub current_file: String,
    pub bytes_per_sec: f64,
    pub speed: String,
    pub downloaded_bytes: u64,
    /// `None` when the server did not send a length.
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Omitted when the total size is unknown.
    pub percent: Option<f64>,
    pub message: String,
    #[serde(flatten)]
    pub transfer: Option<TransferStats>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: Some(clamp_percent(percent)),
            message: message.into(),
            transfer: None,
        }
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// Receiver of progress events.
///
/// Only `emit` is required; the helpers build events for the common cases.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    fn report(&self, stage: Stage, percent: f64, message: &str) {
        self.emit(ProgressEvent::new(stage, percent, message));
    }

    fn report_download(
        &self,
        stage: Stage,
        percent: Option<f64>,
        message: &str,
        transfer: TransferStats,
    ) {
        self.emit(ProgressEvent {
            stage,
            percent: percent.map(clamp_percent),
            message: message.to_string(),
            transfer: Some(transfer),
        });
    }
}

/// Discards everything.
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Mirrors events into the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        debug!(
            stage = ?event.stage,
            percent = ?event.percent,
            "{}",
            event.message
        );
    }
}

/// Forwards events to an async consumer (e.g. a UI bridge task).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A closed receiver just means nobody is watching anymore.
        let _ = self.tx.send(event);
    }
}

/// Stateful reporter in front of a sink: normalizes percentages, remembers
/// the last event, and can be reset to idle between operations.
pub struct Reporter<S> {
    sink: S,
    last: Mutex<Option<ProgressEvent>>,
}

impl<S: ProgressSink> Reporter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            last: Mutex::new(None),
        }
    }

    /// Last event emitted since the previous reset.
    pub fn snapshot(&self) -> Option<ProgressEvent> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    pub fn reset(&self) {
        if let Ok(mut last) = self.last.lock() {
            *last = None;
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: ProgressSink> ProgressSink for Reporter<S> {
    fn emit(&self, mut event: ProgressEvent) {
        event.percent = event.percent.map(clamp_percent);
        if let Ok(mut last) = self.last.lock() {
            *last = Some(event.clone());
        }
        self.sink.emit(event);
    }
}

/// Maps a component's own 0–100 onto `[lo, hi]` of the parent stage.
pub struct Scaler<'a> {
    inner: &'a dyn ProgressSink,
    lo: f64,
    hi: f64,
}

impl<'a> Scaler<'a> {
    pub fn new(inner: &'a dyn ProgressSink, lo: f64, hi: f64) -> Self {
        let lo = clamp_percent(lo);
        let hi = clamp_percent(hi).max(lo);
        Self { inner, lo, hi }
    }

    fn scale(&self, percent: f64) -> f64 {
        self.lo + clamp_percent(percent) / 100.0 * (self.hi - self.lo)
    }
}

impl ProgressSink for Scaler<'_> {
    fn emit(&self, mut event: ProgressEvent) {
        event.percent = event.percent.map(|p| self.scale(p));
        self.inner.emit(event);
    }
}

/// Human-readable transfer rate, e.g. `1.5 MB/s`.
pub fn format_speed(bytes_per_sec: f64) -> String {
    const UNIT: f64 = 1024.0;
    if bytes_per_sec < UNIT {
        return format!("{:.0} B/s", bytes_per_sec.max(0.0));
    }
    let mut value = bytes_per_sec / UNIT;
    let mut prefixes = ['K', 'M', 'G', 'T', 'P'].iter().peekable();
    let mut prefix = 'K';
    while let Some(p) = prefixes.next() {
        prefix = *p;
        if value < UNIT || prefixes.peek().is_none() {
            break;
        }
        value /= UNIT;
    }
    format!("{value:.1} {prefix}B/s")
}
