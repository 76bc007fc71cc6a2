//! Counters for the replicated write protocol.
//!
//! Every node owns one [`CacheMetrics`] shared by the engine, the state
//! machine and the inbound dispatcher. Counters are plain atomics; export is
//! a Prometheus text rendering.

mod counters;

pub use counters::{Counter, LabeledCounter};

/// Protocol metrics of one node.
#[derive(Debug)]
pub struct CacheMetrics {
    // Reads
    pub get_total: Counter,
    pub get_hits: Counter,
    pub get_misses: Counter,
    /// Reads that scheduled a sliding refresh.
    pub sliding_refreshes: Counter,

    // Writes
    /// Completed writes by operation.
    pub writes: LabeledCounter,
    /// Writes handed to a remote leader.
    pub redirected: Counter,
    /// Local changes undone after a failed replication.
    pub rollbacks: Counter,
    /// Loop iterations started after a failure.
    pub retries: Counter,
    /// Writes abandoned because the caller cancelled.
    pub cancelled: Counter,

    // Log replay
    /// Committed entries applied while the local write path held the lock.
    pub replay_inline: Counter,
    /// Committed entries applied under the state machine's own lock.
    pub replay_locked: Counter,
    pub replay_malformed: Counter,

    // Inbound
    pub inbound_requests: Counter,
    /// Inbound requests answered with something other than `OK`.
    pub inbound_rejected: Counter,
    pub membership_changes: Counter,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            get_total: Counter::new("cache_get_total", "Total GET requests"),
            get_hits: Counter::new("cache_get_hits_total", "GET requests that found a value"),
            get_misses: Counter::new("cache_get_misses_total", "GET requests that found nothing"),
            sliding_refreshes: Counter::new(
                "cache_sliding_refresh_total",
                "Refreshes scheduled by reads of sliding entries",
            ),
            writes: LabeledCounter::new("cache_writes_total", "Completed writes", "operation"),
            redirected: Counter::new("cache_redirected_total", "Writes relayed to the leader"),
            rollbacks: Counter::new("cache_rollbacks_total", "Local changes rolled back"),
            retries: Counter::new("cache_retries_total", "Write attempts retried"),
            cancelled: Counter::new("cache_cancelled_total", "Writes cancelled by the caller"),
            replay_inline: Counter::new(
                "log_replay_inline_total",
                "Committed entries applied under the writer's lock",
            ),
            replay_locked: Counter::new(
                "log_replay_locked_total",
                "Committed entries applied under their own lock",
            ),
            replay_malformed: Counter::new(
                "log_replay_malformed_total",
                "Committed entries that could not be decoded",
            ),
            inbound_requests: Counter::new("router_inbound_total", "Inbound change requests"),
            inbound_rejected: Counter::new(
                "router_inbound_rejected_total",
                "Inbound change requests not answered OK",
            ),
            membership_changes: Counter::new(
                "membership_changes_total",
                "Membership changes applied",
            ),
        }
    }

    /// Record a local read.
    pub fn record_get(&self, hit: bool) {
        self.get_total.inc();
        if hit {
            self.get_hits.inc();
        } else {
            self.get_misses.inc();
        }
    }

    /// Get a point-in-time snapshot of the read and write counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            get_total: self.get_total.get(),
            get_hits: self.get_hits.get(),
            get_misses: self.get_misses.get(),
            writes: self.writes.get_all().iter().map(|(_, n)| n).sum(),
            redirected: self.redirected.get(),
            rollbacks: self.rollbacks.get(),
            retries: self.retries.get(),
            cancelled: self.cancelled.get(),
            replay_inline: self.replay_inline.get(),
            replay_locked: self.replay_locked.get(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_counter {
            ($metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_counter!(self.get_total);
        add_counter!(self.get_hits);
        add_counter!(self.get_misses);
        add_counter!(self.sliding_refreshes);
        add_counter!(self.redirected);
        add_counter!(self.rollbacks);
        add_counter!(self.retries);
        add_counter!(self.cancelled);
        add_counter!(self.replay_inline);
        add_counter!(self.replay_locked);
        add_counter!(self.replay_malformed);
        add_counter!(self.inbound_requests);
        add_counter!(self.inbound_rejected);
        add_counter!(self.membership_changes);

        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            self.writes.name(),
            self.writes.help(),
            self.writes.name()
        ));
        for (value, count) in self.writes.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                self.writes.name(),
                self.writes.label(),
                value,
                count
            ));
        }

        output
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of protocol metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub get_total: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub writes: u64,
    pub redirected: u64,
    pub rollbacks: u64,
    pub retries: u64,
    pub cancelled: u64,
    pub replay_inline: u64,
    pub replay_locked: u64,
}

impl MetricsSnapshot {
    /// Calculate the read hit rate.
    pub fn hit_rate(&self) -> f64 {
        if self.get_total == 0 {
            0.0
        } else {
            self.get_hits as f64 / self.get_total as f64
        }
    }
}
