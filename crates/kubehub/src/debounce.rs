//! Settle notification: trailing-edge debounce of change signals.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Per-watcher settle broadcast. Subscribers see a generation counter that moves
/// once per settled burst. Missed generations are not queued: after waking, a
/// waiter re-checks whatever it was waiting for.
#[derive(Clone)]
pub struct SettleSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for SettleSignal {
    fn default() -> Self { Self::new() }
}

impl SettleSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0u64);
        Self { tx: Arc::new(tx) }
    }

    pub fn broadcast(&self) {
        self.tx.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.tx.subscribe() }

    pub fn generation(&self) -> u64 { *self.tx.borrow() }
}

/// Debounce loop: every signal re-arms the idle timer to `quiet` from now; when the
/// timer fires the settle signal is broadcast once. Exits on cancel, or once the
/// signal channel is closed and no broadcast is pending.
pub(crate) async fn run_debouncer(
    mut events: mpsc::Receiver<()>,
    settle: SettleSignal,
    quiet: Duration,
    cancel: CancellationToken,
) {
    let idle = sleep_until(Instant::now());
    tokio::pin!(idle);
    let mut armed = false;
    let mut open = true;
    loop {
        if !open && !armed {
            break;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = &mut idle, if armed => {
                armed = false;
                trace!("settled; broadcasting");
                counter!("watcher_settle_broadcasts_total", 1u64);
                settle.broadcast();
            }
            ev = events.recv(), if open => match ev {
                Some(()) => {
                    idle.as_mut().reset(Instant::now() + quiet);
                    armed = true;
                }
                None => open = false,
            },
        }
    }
}

/// Consumer-owned aggregator: one receiver that moves whenever any attached
/// watcher settles. Dropping the aggregator stops its forwarding tasks.
pub struct SettleFanIn {
    out: SettleSignal,
    tasks: JoinSet<()>,
}

impl Default for SettleFanIn {
    fn default() -> Self { Self::new() }
}

impl SettleFanIn {
    pub fn new() -> Self { Self { out: SettleSignal::new(), tasks: JoinSet::new() } }

    /// Forward settles of `signal`. Must be called within a Tokio runtime.
    pub fn attach(&mut self, signal: &SettleSignal) {
        let mut rx = signal.subscribe();
        rx.borrow_and_update();
        let out = self.out.clone();
        self.tasks.spawn(async move {
            while rx.changed().await.is_ok() {
                out.broadcast();
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> { self.out.subscribe() }

    pub fn attached(&self) -> usize { self.tasks.len() }

    /// Stop forwarding. Existing receivers keep their last value.
    pub fn close(&mut self) { self.tasks.abort_all(); }
}
