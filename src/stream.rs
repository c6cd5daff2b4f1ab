//! Push channel for run snapshots.
//!
//! The engine emits a [`RunView`] on every state or step transition. The
//! hub broadcasts each snapshot to pluggable sinks: a channel sink feeds
//! external consumers (UI layers, SSE endpoints), a tracing sink feeds
//! logs. Sinks whose consumer went away are dropped on the next emit.
//!
//! Emission must never block the executor: a subscriber that stops
//! draining is disconnected once it falls a full buffer behind, instead of
//! stalling the run (and every other run) mid-advance.

use parking_lot::Mutex;
use std::io::{self, Result as IoResult};

use crate::runs::RunView;

/// Output target consuming run snapshots.
pub trait UpdateSink: Send + Sync {
    fn handle(&mut self, view: &RunView) -> IoResult<()>;
}

/// Sink logging each snapshot through `tracing`.
#[derive(Default)]
pub struct TracingSink;

impl UpdateSink for TracingSink {
    fn handle(&mut self, view: &RunView) -> IoResult<()> {
        tracing::info!(
            run = %view.id,
            state = %view.state,
            step = view.current_step.as_ref().map(|s| s.as_str()),
            "run transition"
        );
        Ok(())
    }
}

/// Sink forwarding snapshots to a flume channel for async consumers.
pub struct ChannelSink {
    tx: flume::Sender<RunView>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<RunView>) -> Self {
        Self { tx }
    }
}

impl UpdateSink for ChannelSink {
    fn handle(&mut self, view: &RunView) -> IoResult<()> {
        // Non-blocking: a full buffer means the consumer stopped draining,
        // and it is disconnected rather than allowed to stall the executor.
        self.tx.try_send(view.clone()).map_err(|err| match err {
            flume::TrySendError::Full(_) => {
                io::Error::new(io::ErrorKind::WouldBlock, "stream receiver fell behind")
            }
            flume::TrySendError::Disconnected(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "stream receiver dropped")
            }
        })
    }
}

/// Broadcast hub owned by the engine.
pub struct StreamHub {
    sinks: Mutex<Vec<Box<dyn UpdateSink>>>,
    buffer: usize,
}

impl StreamHub {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            sinks: Mutex::new(vec![Box::new(TracingSink)]),
            buffer,
        }
    }

    /// Attach an additional sink.
    pub fn add_sink(&self, sink: impl UpdateSink + 'static) {
        self.sinks.lock().push(Box::new(sink));
    }

    /// Open a bounded subscription channel. Every run transition after this
    /// call is delivered until the receiver is dropped or falls a full
    /// buffer behind, at which point the subscription is severed.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<RunView> {
        let (tx, rx) = flume::bounded(self.buffer);
        self.add_sink(ChannelSink::new(tx));
        rx
    }

    /// Broadcast one snapshot; sinks that error (receiver gone) are removed.
    pub fn emit(&self, view: &RunView) {
        let mut sinks = self.sinks.lock();
        sinks.retain_mut(|sink| sink.handle(view).is_ok());
    }
}
