//! # Broadcast Scheduler
//!
//! Every `interval`, independently of upstream traffic, reads the latest state
//! snapshot, applies the warm-up gate and hands one serialized frame to the
//! [`Dispatcher`].
//!
//! In [`ExecutionMode::Production`] the real state is withheld (an empty object
//! is sent instead) until the update counter has exceeded the warm-up
//! threshold, so subscribers are not shown a half-populated session.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::core::dispatcher::{Dispatcher, FanoutReport, Payload};
use crate::core::state::{StateReader, StateSnapshot};

/// Frame sent while the broadcast is gated.
pub const GATED_PAYLOAD: &str = "{}";
/// Update units that must be exceeded before production mode shows real state.
pub const DEFAULT_WARMUP_THRESHOLD: u64 = 5;
/// Default tick period.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);

/// Whether the warm-up gate is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Always broadcast the real state.
    #[default]
    Development,
    /// Broadcast `{}` until the warm-up threshold is exceeded.
    Production,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(ExecutionMode::Production),
            "development" | "dev" => Ok(ExecutionMode::Development),
            other => Err(format!("unknown execution mode '{other}' (expected production or development)")),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Development => f.write_str("development"),
            ExecutionMode::Production => f.write_str("production"),
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub mode: ExecutionMode,
    pub warmup_threshold: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BROADCAST_INTERVAL,
            mode: ExecutionMode::default(),
            warmup_threshold: DEFAULT_WARMUP_THRESHOLD,
        }
    }
}

/// True when the tick must send [`GATED_PAYLOAD`] instead of the state.
pub fn is_gated(mode: ExecutionMode, updates: u64, warmup_threshold: u64) -> bool {
    mode == ExecutionMode::Production && updates <= warmup_threshold
}

/// Last rendered frame, reused while the snapshot does not change.
struct Rendered {
    version: u64,
    gated: bool,
    payload: Payload,
}

pub struct BroadcastScheduler {
    config: SchedulerConfig,
    reader: StateReader,
    dispatcher: Arc<Dispatcher>,
    last: Option<Rendered>,
}

impl BroadcastScheduler {
    pub fn new(config: SchedulerConfig, reader: StateReader, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            reader,
            dispatcher,
            last: None,
        }
    }

    /// Chooses and serializes the frame for `snapshot`.
    pub fn render(&mut self, snapshot: &StateSnapshot) -> Payload {
        let gated = is_gated(self.config.mode, snapshot.updates, self.config.warmup_threshold);

        if let Some(last) = &self.last {
            if last.version == snapshot.version && last.gated == gated {
                return Arc::clone(&last.payload);
            }
        }

        let payload: Payload = if gated {
            Arc::from(GATED_PAYLOAD)
        } else {
            match serde_json::to_string(snapshot.tree.as_ref()) {
                Ok(text) => Arc::from(text),
                Err(e) => {
                    log::error!("Failed to serialize consolidated state: {}", e);
                    Arc::from(GATED_PAYLOAD)
                }
            }
        };

        self.last = Some(Rendered {
            version: snapshot.version,
            gated,
            payload: Arc::clone(&payload),
        });
        payload
    }

    /// One broadcast: snapshot, gate, serialize, fan out.
    pub fn tick(&mut self) -> FanoutReport {
        let snapshot = self.reader.current();
        let payload = self.render(&snapshot);
        let report = self.dispatcher.broadcast(&payload);
        log::trace!(
            "Tick v{} ({} updates, {} bytes): {:?}",
            snapshot.version,
            snapshot.updates,
            payload.len(),
            report
        );
        report
    }

    /// Ticks at the configured cadence until shutdown.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        log::info!(
            "Broadcast scheduler started: every {:?}, mode {}, warm-up threshold {}",
            self.config.interval,
            self.config.mode,
            self.config.warmup_threshold
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    log::info!("Broadcast scheduler shutting down.");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}
