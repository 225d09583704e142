use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

const EVENT_CAPACITY: usize = 1000;
const LATENCY_CAPACITY: usize = 256;

#[derive(Debug, Default)]
pub struct Counters {
    pub stale_heartbeats: AtomicU64,
    pub stale_election_messages: AtomicU64,
    pub stale_completions: AtomicU64,
    pub elections_started: AtomicU64,
    pub elections_won: AtomicU64,
    pub election_splits: AtomicU64,
    pub tasks_dispatched_local: AtomicU64,
    pub tasks_dispatched_remote: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_reassigned: AtomicU64,
    pub sensor_failures: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CounterSnapshot {
    pub stale_heartbeats: u64,
    pub stale_election_messages: u64,
    pub stale_completions: u64,
    pub elections_started: u64,
    pub elections_won: u64,
    pub election_splits: u64,
    pub tasks_dispatched_local: u64,
    pub tasks_dispatched_remote: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_reassigned: u64,
    pub sensor_failures: u64,
    pub transport_errors: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// In-process observability: monotonic counters for anything dropped or
/// decided, a bounded ring of operator-readable events and a window of
/// task latencies. Everything here is best effort and never blocks the
/// protocol paths for long.
pub struct Diagnostics {
    pub counters: Counters,
    events: RwLock<VecDeque<String>>,
    latencies: RwLock<VecDeque<u64>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            events: RwLock::new(VecDeque::with_capacity(EVENT_CAPACITY)),
            latencies: RwLock::new(VecDeque::with_capacity(LATENCY_CAPACITY)),
        }
    }

    pub async fn event(&self, line: impl Into<String>) {
        let stamped = format!(
            "[{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            line.into()
        );
        let mut events = self.events.write().await;
        if events.len() == EVENT_CAPACITY {
            events.pop_front();
        }
        events.push_back(stamped);
    }

    /// Oldest first, at most the ring capacity.
    pub async fn recent_events(&self) -> Vec<String> {
        self.events.read().await.iter().cloned().collect()
    }

    pub async fn record_latency_ms(&self, ms: u64) {
        let mut latencies = self.latencies.write().await;
        if latencies.len() == LATENCY_CAPACITY {
            latencies.pop_front();
        }
        latencies.push_back(ms);
    }

    pub async fn latency(&self) -> LatencySummary {
        let latencies = self.latencies.read().await;
        let count = latencies.len();
        let sum: u64 = latencies.iter().sum();
        LatencySummary {
            count,
            avg_ms: if count == 0 { 0 } else { sum / count as u64 },
            max_ms: latencies.iter().copied().max().unwrap_or(0),
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            stale_heartbeats: get(&c.stale_heartbeats),
            stale_election_messages: get(&c.stale_election_messages),
            stale_completions: get(&c.stale_completions),
            elections_started: get(&c.elections_started),
            elections_won: get(&c.elections_won),
            election_splits: get(&c.election_splits),
            tasks_dispatched_local: get(&c.tasks_dispatched_local),
            tasks_dispatched_remote: get(&c.tasks_dispatched_remote),
            tasks_completed: get(&c.tasks_completed),
            tasks_failed: get(&c.tasks_failed),
            tasks_reassigned: get(&c.tasks_reassigned),
            sensor_failures: get(&c.sensor_failures),
            transport_errors: get(&c.transport_errors),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
