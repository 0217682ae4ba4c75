//! Process-wide compile counters. Recording never fails and never blocks for
//! long; derived figures (averages, rates, percentiles) are computed on read.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use pipeconfig::TelemetrySection;
use scheduler::JobId;
use serde::Serialize;

/// Where an error was observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub job: Option<JobId>,
    pub requester: Option<String>,
    pub stage: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub at: DateTime<Utc>,
    pub message: String,
    #[serde(flatten)]
    pub context: ErrorContext,
}

#[derive(Debug, Clone, Copy, Default)]
struct Aggregate {
    count: u64,
    successes: u64,
    total: Duration,
}

impl Aggregate {
    fn record(&mut self, duration: Duration, success: bool) {
        self.count += 1;
        self.total += duration;
        if success {
            self.successes += 1;
        }
    }

    fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            count: self.count,
            successes: self.successes,
            failures: self.count - self.successes,
            avg_ms: if self.count == 0 {
                0.0
            } else {
                self.total.as_secs_f64() * 1000.0 / self.count as f64
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSnapshot {
    pub samples: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p95_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub compile_time: TimingSnapshot,
    pub active: usize,
    pub peak_active: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub by_kind: BTreeMap<String, AggregateSnapshot>,
    pub by_requester: BTreeMap<String, AggregateSnapshot>,
    pub recent_errors: Vec<ErrorRecord>,
}

#[derive(Default)]
struct MetricsState {
    attempts: u64,
    successes: u64,
    compile_times: VecDeque<Duration>,
    by_kind: HashMap<String, Aggregate>,
    by_requester: HashMap<String, Aggregate>,
    recent_errors: VecDeque<ErrorRecord>,
    cache_hits: u64,
    cache_misses: u64,
}

pub struct PipelineMetrics {
    history_limit: usize,
    error_limit: usize,
    started: Mutex<Instant>,
    state: Mutex<MetricsState>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl PipelineMetrics {
    pub fn new(telemetry: &TelemetrySection) -> Self {
        Self {
            history_limit: telemetry.history_limit.max(1),
            error_limit: telemetry.error_limit.max(1),
            started: Mutex::new(Instant::now()),
            state: Mutex::new(MetricsState::default()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn record_compilation(
        &self,
        duration: Duration,
        success: bool,
        kind: &str,
        requester: Option<&str>,
    ) {
        let mut state = self.state.lock();
        state.attempts += 1;
        if success {
            state.successes += 1;
        }
        if state.compile_times.len() == self.history_limit {
            state.compile_times.pop_front();
        }
        state.compile_times.push_back(duration);
        state
            .by_kind
            .entry(kind.to_string())
            .or_default()
            .record(duration, success);
        if let Some(requester) = requester {
            state
                .by_requester
                .entry(requester.to_string())
                .or_default()
                .record(duration, success);
        }
    }

    pub fn record_error(&self, message: impl Into<String>, context: ErrorContext) {
        let mut state = self.state.lock();
        if state.recent_errors.len() == self.error_limit {
            state.recent_errors.pop_front();
        }
        state.recent_errors.push_back(ErrorRecord {
            at: Utc::now(),
            message: message.into(),
            context,
        });
    }

    pub fn record_cache(&self, hit: bool) {
        let mut state = self.state.lock();
        if hit {
            state.cache_hits += 1;
        } else {
            state.cache_misses += 1;
        }
    }

    pub fn start_compilation(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    pub fn end_compilation(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |value| {
                value.checked_sub(1)
            });
    }

    /// Brackets one compilation in the active gauge until dropped.
    pub fn compilation(&self) -> CompilationGauge<'_> {
        self.start_compilation();
        CompilationGauge(self)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let failures = state.attempts - state.successes;
        MetricsSnapshot {
            uptime_secs: self.started.lock().elapsed().as_secs(),
            attempts: state.attempts,
            successes: state.successes,
            failures,
            success_rate: if state.attempts == 0 {
                0.0
            } else {
                state.successes as f64 / state.attempts as f64
            },
            compile_time: timing(&state.compile_times),
            active: self.active.load(Ordering::Acquire),
            peak_active: self.peak.load(Ordering::Acquire),
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            by_kind: state
                .by_kind
                .iter()
                .map(|(kind, aggregate)| (kind.clone(), aggregate.snapshot()))
                .collect(),
            by_requester: state
                .by_requester
                .iter()
                .map(|(requester, aggregate)| (requester.clone(), aggregate.snapshot()))
                .collect(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
        }
    }

    /// Clears every counter and restarts the uptime clock. The active gauge
    /// keeps counting compilations that are still running.
    pub fn reset(&self) {
        *self.state.lock() = MetricsState::default();
        *self.started.lock() = Instant::now();
        self.peak
            .store(self.active.load(Ordering::Acquire), Ordering::Release);
    }
}

pub struct CompilationGauge<'a>(&'a PipelineMetrics);

impl Drop for CompilationGauge<'_> {
    fn drop(&mut self) {
        self.0.end_compilation();
    }
}

fn ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn timing(samples: &VecDeque<Duration>) -> TimingSnapshot {
    if samples.is_empty() {
        return TimingSnapshot::default();
    }
    let mut sorted: Vec<Duration> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let n = sorted.len();
    let total: Duration = sorted.iter().sum();
    let rank = (0.95 * n as f64).ceil().clamp(1.0, n as f64) as usize;
    TimingSnapshot {
        samples: n,
        min_ms: ms(sorted[0]),
        max_ms: ms(sorted[n - 1]),
        avg_ms: ms(total) / n as f64,
        p95_ms: ms(sorted[rank - 1]),
    }
}
