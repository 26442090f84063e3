// crates/lore-server/src/db/health.rs
// Pool health snapshots with a TTL cache and a sliding latency window

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use super::pool::{DatabasePool, PoolStatus};

/// Number of probe samples kept for latency statistics.
const LATENCY_WINDOW: usize = 100;

/// In-use/open ratio above which the pool is degraded.
const DEGRADED_UTILIZATION: f64 = 0.8;

/// Wait count and cumulative wait duration that together mean degraded.
const DEGRADED_WAIT_COUNT: u64 = 100;
const DEGRADED_WAIT_MS: u64 = 100;

/// Single probe latency above which the pool is degraded.
const DEGRADED_QUERY_MS: f64 = 10.0;

/// P95 latency above which the pool is degraded.
const DEGRADED_P95_MS: f64 = 50.0;

/// Overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Aggregates over the sliding latency window.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p95_ms: f64,
}

/// One health check result. Returned even when the probe fails (with `error`
/// populated and status unhealthy).
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub pool: PoolStatus,
    /// Latency of the probe query, when it succeeded.
    pub probe_latency_ms: Option<f64>,
    /// Stats over recent probes; None until the first successful probe.
    pub latency: Option<LatencyStats>,
    pub checked_at_epoch: i64,
    pub error: Option<String>,
}

/// Fixed-size ring of probe latencies, indexed modulo the window size.
struct LatencyWindow {
    samples: Vec<f64>,
    next: usize,
    filled: usize,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            samples: vec![0.0; LATENCY_WINDOW],
            next: 0,
            filled: 0,
        }
    }

    fn record(&mut self, latency_ms: f64) {
        self.samples[self.next] = latency_ms;
        self.next = (self.next + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    /// Avg/min/max plus P95 via a sorted copy (O(n log n) over the window).
    fn stats(&self) -> Option<LatencyStats> {
        if self.filled == 0 {
            return None;
        }
        let mut window: Vec<f64> = self.samples[..self.filled].to_vec();
        window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let sum: f64 = window.iter().sum();
        let p95_idx = ((window.len() as f64) * 0.95).ceil() as usize;
        let p95_idx = p95_idx.saturating_sub(1).min(window.len() - 1);

        Some(LatencyStats {
            samples: window.len(),
            avg_ms: sum / window.len() as f64,
            min_ms: window[0],
            max_ms: window[window.len() - 1],
            p95_ms: window[p95_idx],
        })
    }
}

/// Health monitor over a database pool.
///
/// Snapshots are cached for a TTL behind a reader-preferring lock with a
/// double-check: readers holding the read lock return the fresh snapshot;
/// the first writer past the check re-validates under the write lock before
/// probing, so a burst of callers produces one probe, not many.
pub struct HealthMonitor {
    pool: Arc<DatabasePool>,
    cache: RwLock<Option<(Instant, HealthSnapshot)>>,
    cache_ttl: Duration,
    window: Mutex<LatencyWindow>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<DatabasePool>, cache_ttl: Duration) -> Self {
        Self {
            pool,
            cache: RwLock::new(None),
            cache_ttl,
            window: Mutex::new(LatencyWindow::new()),
        }
    }

    /// Get a health snapshot, served from cache when fresh.
    pub async fn health(&self) -> HealthSnapshot {
        {
            let cache = self.cache.read().await;
            if let Some((at, snapshot)) = cache.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return snapshot.clone();
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Double-check: another writer may have refreshed while we waited.
        if let Some((at, snapshot)) = cache.as_ref() {
            if at.elapsed() < self.cache_ttl {
                return snapshot.clone();
            }
        }

        let snapshot = self.probe().await;
        *cache = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Get a fresh snapshot, bypassing (and refreshing) the cache.
    pub async fn health_forced(&self) -> HealthSnapshot {
        let snapshot = self.probe().await;
        let mut cache = self.cache.write().await;
        *cache = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Run the probe query and derive a status from pool stats + latency.
    async fn probe(&self) -> HealthSnapshot {
        let pool_status = self.pool.status();
        let checked_at_epoch = chrono::Utc::now().timestamp_millis();

        let start = Instant::now();
        let probe = self
            .pool
            .interact(|conn| {
                conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                    .map_err(Into::into)
            })
            .await;
        let probe_ms = start.elapsed().as_secs_f64() * 1000.0;

        match probe {
            Ok(_) => {
                let stats = {
                    let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
                    window.record(probe_ms);
                    window.stats()
                };
                let status = derive_status(&pool_status, probe_ms, stats.as_ref());
                HealthSnapshot {
                    status,
                    pool: pool_status,
                    probe_latency_ms: Some(probe_ms),
                    latency: stats,
                    checked_at_epoch,
                    error: None,
                }
            }
            Err(e) => HealthSnapshot {
                status: HealthStatus::Unhealthy,
                pool: pool_status,
                probe_latency_ms: None,
                latency: self
                    .window
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .stats(),
                checked_at_epoch,
                error: Some(e.to_string()),
            },
        }
    }
}

fn derive_status(pool: &PoolStatus, probe_ms: f64, stats: Option<&LatencyStats>) -> HealthStatus {
    if pool.open > 0 {
        let utilization = pool.in_use as f64 / pool.open as f64;
        if utilization > DEGRADED_UTILIZATION {
            return HealthStatus::Degraded;
        }
    }
    if pool.wait_count > DEGRADED_WAIT_COUNT && pool.wait_duration_ms > DEGRADED_WAIT_MS {
        return HealthStatus::Degraded;
    }
    if probe_ms > DEGRADED_QUERY_MS {
        return HealthStatus::Degraded;
    }
    if let Some(s) = stats {
        if s.p95_ms > DEGRADED_P95_MS {
            return HealthStatus::Degraded;
        }
    }
    HealthStatus::Healthy
}
