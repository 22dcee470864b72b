//! Terminal resize propagation for interactive executions.
//!
//! Each interactive execution owns one [`ResizeBridge`]. The bridge listens on
//! a channel private to that execution, so resize events from one session
//! never reach another. Subscribing performs one synchronization right away;
//! afterwards every notification triggers another until the bridge is stopped.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use portable_pty::PtySize;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ExecError;

/// Pending notifications per session; extra events are coalesced.
const RESIZE_CHANNEL_CAPACITY: usize = 16;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// A resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeEvent {
    /// Re-read the dimension source.
    Inherit,
    /// Apply dimensions reported by the remote peer.
    Set(TermSize),
}

/// Where the current terminal dimensions come from.
pub trait DimensionSource: Send + Sync {
    fn dimensions(&self) -> io::Result<TermSize>;
}

/// Dimensions of the gateway's controlling terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllingTerminal;

impl DimensionSource for ControllingTerminal {
    fn dimensions(&self) -> io::Result<TermSize> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(TermSize { cols, rows })
    }
}

/// A fixed size, for sessions whose peer reports its own dimensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedDimensions(pub TermSize);

impl DimensionSource for FixedDimensions {
    fn dimensions(&self) -> io::Result<TermSize> {
        Ok(self.0)
    }
}

/// Something that can be resized; in practice the pty master.
pub trait ResizeTarget: Send + Sync {
    fn resize(&self, size: TermSize) -> Result<(), ExecError>;
}

/// Sending half of a session's resize channel.
#[derive(Debug, Clone)]
pub struct ResizeNotifier {
    tx: mpsc::Sender<ResizeEvent>,
}

impl ResizeNotifier {
    /// Asks the bridge to re-read the dimension source.
    ///
    /// Returns `false` if the bridge is gone or the event was coalesced.
    pub fn notify(&self) -> bool {
        self.tx.try_send(ResizeEvent::Inherit).is_ok()
    }

    /// Asks the bridge to apply `size`.
    pub fn resize(&self, size: TermSize) -> bool {
        self.tx.try_send(ResizeEvent::Set(size)).is_ok()
    }
}

/// Per-session resize subscription.
pub struct ResizeBridge {
    tx: mpsc::Sender<ResizeEvent>,
    cancel: CancellationToken,
    syncs: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ResizeBridge {
    /// Subscribes `target` to resize notifications.
    ///
    /// One synchronization from `source` happens before this returns. With
    /// `forward_sigwinch`, the gateway's own `SIGWINCH` is also delivered into
    /// this session's channel for as long as the bridge lives.
    pub fn subscribe(
        target: Arc<dyn ResizeTarget>,
        source: Arc<dyn DimensionSource>,
        forward_sigwinch: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(RESIZE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let syncs = Arc::new(AtomicU64::new(0));

        sync(&*target, &*source, ResizeEvent::Inherit, &syncs);

        let winch = if forward_sigwinch {
            match signal(SignalKind::window_change()) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to register SIGWINCH handler");
                    None
                }
            }
        } else {
            None
        };

        let task = tokio::spawn(listen(
            rx,
            winch,
            target,
            source,
            cancel.clone(),
            Arc::clone(&syncs),
        ));

        Self {
            tx,
            cancel,
            syncs,
            task: Some(task),
        }
    }

    /// Returns a handle for delivering notifications to this bridge.
    pub fn notifier(&self) -> ResizeNotifier {
        ResizeNotifier {
            tx: self.tx.clone(),
        }
    }

    /// Number of synchronizations attempted so far, including the initial one.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Stops the subscription and waits for the listener to exit.
    ///
    /// No synchronization starts once this has been called.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "resize listener ended abnormally");
            }
        }
    }
}

impl Drop for ResizeBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn listen(
    mut rx: mpsc::Receiver<ResizeEvent>,
    mut winch: Option<Signal>,
    target: Arc<dyn ResizeTarget>,
    source: Arc<dyn DimensionSource>,
    cancel: CancellationToken,
    syncs: Arc<AtomicU64>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            Some(()) = next_winch(&mut winch) => ResizeEvent::Inherit,
        };
        if cancel.is_cancelled() {
            break;
        }
        sync(&*target, &*source, event, &syncs);
    }
    tracing::trace!("resize listener stopped");
}

async fn next_winch(winch: &mut Option<Signal>) -> Option<()> {
    match winch {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

fn sync(
    target: &dyn ResizeTarget,
    source: &dyn DimensionSource,
    event: ResizeEvent,
    syncs: &AtomicU64,
) {
    syncs.fetch_add(1, Ordering::SeqCst);
    let size = match event {
        ResizeEvent::Set(size) => size,
        ResizeEvent::Inherit => match source.dimensions() {
            Ok(size) => size,
            Err(e) => {
                tracing::debug!(error = %e, "no terminal dimensions to inherit");
                return;
            }
        },
    };
    match target.resize(size) {
        Ok(()) => tracing::debug!(cols = size.cols, rows = size.rows, "resized pty"),
        Err(ExecError::TtyClosed) => tracing::trace!("pty already released, skipping resize"),
        Err(e) => tracing::warn!(error = %e, "error resizing pty"),
    }
}
