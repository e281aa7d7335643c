//! Periodic stats reporting

use super::stats::Stats;
use crate::bus::signals::{BusSignal, Notifier, SignalKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

pub struct StatsReporter;

impl StatsReporter {
    /// Emit a snapshot every `period` while anyone listens for stats.
    /// Runs until the returned task is aborted.
    pub fn spawn(period: Duration, stats: Arc<Stats>, notifier: Notifier) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if Self::report(&stats, &notifier) {
                    trace!("Stats snapshot emitted");
                }
            }
        })
    }

    /// Emit one snapshot if a stats listener is attached. Returns whether it emitted.
    pub fn report(stats: &Stats, notifier: &Notifier) -> bool {
        if notifier.listener_count(SignalKind::Stats) == 0 {
            return false;
        }
        notifier.emit(BusSignal::Stats(stats.snapshot()));
        true
    }
}
