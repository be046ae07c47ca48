//! Pipeline driver glue.
//!
//! A pipeline instance is single-threaded and cooperative: inputs push
//! batches in, the chain transforms them synchronously, and outputs
//! consume the result. Outputs may buffer internally; the pipeline
//! watches their queue depths and signals the upstream input to pause
//! when a high-water mark is crossed. Multiple pipeline instances may
//! run in separate threads; they share no mutable state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::chain::{Chain, ChainStats, ConfigError, StatsSnapshot};
use crate::EventKind;

/// Set of errors an output can signal for a single delivery.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The output's internal queue refused the batch.
    #[error("output queue is full")]
    QueueFull,
}

/// A delivery target for filtered batches. Implementations may buffer
/// and flush asynchronously on their own workers; `pending` reports
/// how many batches are buffered so the pipeline can apply
/// back-pressure.
pub trait Output {
    /// The output's registered name, used in log lines.
    fn name(&self) -> &'static str;

    /// Accepts one batch for delivery.
    fn write(&mut self, tag: &str, kind: EventKind, data: &[u8]) -> Result<(), OutputError>;

    /// The number of batches accepted but not yet delivered.
    fn pending(&self) -> usize {
        0
    }

    /// Blocks until buffered batches are delivered, within reason.
    fn flush(&mut self) -> Result<(), OutputError> {
        Ok(())
    }
}

/// Flow-control signal returned to the ingesting input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,

    /// Stop reading until [`Pipeline::poll_flow`] answers
    /// [`Continue`](Flow::Continue) again.
    Pause,
}

/// Queue-depth thresholds for back-pressure. Reads pause above `high`
/// and resume below `low`.
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Default for Watermarks {
    fn default() -> Self {
        Watermarks { high: 64, low: 16 }
    }
}

/// Cooperative cancellation flag, shared between the pipeline and the
/// host. Cancelling stops intake; queued data still drains during
/// [`Pipeline::shutdown`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A single pipeline instance: one chain, its outputs and counters.
pub struct Pipeline {
    chain: Chain,
    outputs: Vec<Box<dyn Output>>,
    watermarks: Watermarks,
    cancel: CancellationToken,
    paused: bool,
    stats: Arc<ChainStats>,
}

impl Pipeline {
    pub fn new(chain: Chain, watermarks: Watermarks) -> Pipeline {
        let stats = chain.stats_handle();
        Pipeline {
            chain,
            outputs: Vec::new(),
            watermarks,
            cancel: CancellationToken::new(),
            paused: false,
            stats,
        }
    }

    pub fn add_output(&mut self, output: Box<dyn Output>) {
        self.outputs.push(output);
    }

    /// The shared cancellation flag. Hosts hand clones to signal
    /// handlers or control planes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Validates and initializes the chain. `input_kinds` lists the
    /// event kinds the host's inputs will produce.
    pub fn start(&mut self, input_kinds: &[EventKind]) -> Result<(), ConfigError> {
        self.chain.start(input_kinds)
    }

    /// Runs one batch through the chain and fans the result out to
    /// every output. The returned signal tells the ingesting input
    /// whether to keep reading.
    pub fn ingest(&mut self, tag: &str, kind: EventKind, batch: Vec<u8>) -> Flow {
        if self.cancel.is_cancelled() {
            warn!("batch refused after cancellation: tag={} kind={}", tag, kind);
            return Flow::Pause;
        }

        let data = self.chain.dispatch(tag, kind, batch);
        if !data.is_empty() {
            for output in &mut self.outputs {
                if let Err(e) = output.write(tag, kind, &data) {
                    error!("[output {}] delivery failed tag={}: {}", output.name(), tag, e);
                }
            }
        }

        self.update_flow()
    }

    /// Re-evaluates the back-pressure state for a paused input.
    pub fn poll_flow(&mut self) -> Flow {
        self.update_flow()
    }

    fn update_flow(&mut self) -> Flow {
        let deepest = self
            .outputs
            .iter()
            .map(|o| o.pending())
            .max()
            .unwrap_or(0);
        if self.paused {
            if deepest <= self.watermarks.low {
                self.paused = false;
            }
        } else if deepest > self.watermarks.high {
            self.paused = true;
        }
        if self.paused {
            Flow::Pause
        } else {
            Flow::Continue
        }
    }

    /// A point-in-time copy of the pipeline counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stops intake, drains the outputs within the grace period and
    /// releases the chain. Batches still buffered past the grace
    /// period are dropped with a warning.
    pub fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        for output in &mut self.outputs {
            if Instant::now() >= deadline {
                break;
            }
            if let Err(e) = output.flush() {
                error!("[output {}] flush failed: {}", output.name(), e);
            }
        }

        let stranded: usize = self.outputs.iter().map(|o| o.pending()).sum();
        if stranded > 0 {
            warn!("{} batches dropped past the shutdown grace period", stranded);
        }

        self.chain.stop();
    }
}
