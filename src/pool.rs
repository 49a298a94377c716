//! # Connection Pool
//!
//! One `DevicePool` per observed device id, held in a process-global
//! `PoolRegistry` keyed by id (spec §4.3). Idle connections sit in a
//! bounded, mutex-protected queue; waiters are served strictly FIFO via an
//! explicit queue of one-shot wakeups rather than a broadcast `Notify`,
//! since `tokio::sync::Notify::notify_one` does not guarantee ordering and
//! spec §4.3 requires "at most one waiter is woken per release" in FIFO
//! order.

use crate::connection::{Connection, ConnectionFactory};
use crate::error::{GatewayError, Result};
use crate::value::DeviceId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

struct PoolInner {
    idle: VecDeque<Box<dyn Connection>>,
    total: usize,
    active: usize,
    last_health_check: Instant,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Bounded per-device connection set (spec §3 DevicePool, §4.3).
pub struct DevicePool {
    device_id: DeviceId,
    max_per_device: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    inner: Mutex<PoolInner>,
    /// Shared with the owning `PoolRegistry` so acquires that would breach
    /// the process-wide cap can be rejected before a factory dial even
    /// starts (spec §4.3 "global cap").
    global_total: Arc<AtomicUsize>,
    max_total_connections: usize,
}

impl DevicePool {
    pub fn new(
        device_id: DeviceId,
        max_per_device: usize,
        idle_timeout: Duration,
        acquire_timeout: Duration,
        global_total: Arc<AtomicUsize>,
        max_total_connections: usize,
    ) -> Self {
        Self {
            device_id,
            max_per_device,
            idle_timeout,
            acquire_timeout,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                total: 0,
                active: 0,
                last_health_check: Instant::now(),
                waiters: VecDeque::new(),
            }),
            global_total,
            max_total_connections,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns a leased connection or `timeout` / `pool-exhausted` /
    /// `factory-failed` (spec §4.3).
    pub async fn acquire(&self, factory: &dyn ConnectionFactory) -> Result<Box<dyn Connection>> {
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            // Step 1: drain idle, skipping stale/unhealthy entries.
            {
                let mut inner = self.inner.lock().await;
                while let Some(conn) = inner.idle.pop_front() {
                    let stale = conn.stats().idle_for(Instant::now()) > self.idle_timeout;
                    if stale || !conn.is_healthy() {
                        inner.total -= 1;
                        self.global_total.fetch_sub(1, Ordering::SeqCst);
                        debug!(device_id = %self.device_id, stale, "dropped idle connection on acquire");
                        continue;
                    }
                    inner.active += 1;
                    return Ok(conn);
                }

                // Step 2: open a new connection if under both local and
                // global caps.
                if inner.total < self.max_per_device {
                    if self.global_total.load(Ordering::SeqCst) >= self.max_total_connections {
                        // fall through to waiting rather than failing
                        // immediately; another device may release first.
                    } else {
                        inner.total += 1;
                        self.global_total.fetch_add(1, Ordering::SeqCst);
                        drop(inner);
                        return match factory.open().await {
                            Ok(mut conn) => match conn.open().await {
                                Ok(()) => {
                                    let mut inner = self.inner.lock().await;
                                    inner.active += 1;
                                    drop(inner);
                                    Ok(conn)
                                }
                                Err(e) => {
                                    let mut inner = self.inner.lock().await;
                                    inner.total -= 1;
                                    self.global_total.fetch_sub(1, Ordering::SeqCst);
                                    drop(inner);
                                    Err(GatewayError::FactoryFailed {
                                        device_id: self.device_id.to_string(),
                                        reason: e.to_string(),
                                    })
                                }
                            },
                            Err(e) => {
                                let mut inner = self.inner.lock().await;
                                inner.total -= 1;
                                self.global_total.fetch_sub(1, Ordering::SeqCst);
                                drop(inner);
                                Err(GatewayError::FactoryFailed {
                                    device_id: self.device_id.to_string(),
                                    reason: e.to_string(),
                                })
                            }
                        };
                    }
                }

                // Step 3: queue as a FIFO waiter.
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                drop(inner);

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(GatewayError::Timeout(self.acquire_timeout));
                }
                match tokio::time::timeout(remaining, rx).await {
                    Ok(Ok(())) => continue, // woken; re-validate from the top
                    Ok(Err(_)) => return Err(GatewayError::PoolExhausted {
                        device_id: self.device_id.to_string(),
                    }),
                    Err(_) => return Err(GatewayError::Timeout(self.acquire_timeout)),
                }
            }
        }
    }

    /// Marks `conn` released: returned to the idle queue if healthy, else
    /// closed (spec §4.3 release semantics). Wakes at most one FIFO
    /// waiter.
    pub async fn release(&self, mut conn: Box<dyn Connection>) {
        let healthy = conn.is_healthy();
        let mut inner = self.inner.lock().await;
        inner.active -= 1;

        if healthy && inner.idle.len() < self.max_per_device {
            inner.idle.push_back(conn);
        } else {
            inner.total -= 1;
            self.global_total.fetch_sub(1, Ordering::SeqCst);
            drop(inner);
            let _ = conn.close().await;
            inner = self.inner.lock().await;
        }

        if let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.send(());
        }
    }

    /// Health check + staleness sweep (spec §4.3), run on a fixed cadence
    /// by the owning registry's maintenance task.
    pub async fn run_maintenance(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_health_check = Instant::now();
        let mut survivors = VecDeque::with_capacity(inner.idle.len());
        let now = Instant::now();
        while let Some(conn) = inner.idle.pop_front() {
            let stale = conn.stats().idle_for(now) > self.idle_timeout;
            if stale {
                info!(device_id = %self.device_id, "closing stale idle connection");
                inner.total -= 1;
                self.global_total.fetch_sub(1, Ordering::SeqCst);
                let mut c = conn;
                drop(inner);
                let _ = c.close().await;
                inner = self.inner.lock().await;
                continue;
            }
            if !conn.is_healthy() {
                warn!(device_id = %self.device_id, "dropping unhealthy idle connection");
                inner.total -= 1;
                self.global_total.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            survivors.push_back(conn);
        }
        inner.idle = survivors;
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().await;
        PoolSnapshot {
            idle: inner.idle.len(),
            active: inner.active,
            total: inner.total,
            waiters: inner.waiters.len(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSnapshot {
    pub idle: usize,
    pub active: usize,
    pub total: usize,
    pub waiters: usize,
}

/// Process-global registry mapping device id to its pool, enforcing
/// `max_total_connections` across all devices (spec §4.3, §9).
pub struct PoolRegistry {
    pools: Mutex<HashMap<DeviceId, Arc<DevicePool>>>,
    global_total: Arc<AtomicUsize>,
    max_connections_per_device: usize,
    max_total_connections: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
}

impl PoolRegistry {
    pub fn new(
        max_connections_per_device: usize,
        max_total_connections: usize,
        idle_timeout: Duration,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            global_total: Arc::new(AtomicUsize::new(0)),
            max_connections_per_device,
            max_total_connections,
            idle_timeout,
            acquire_timeout,
        }
    }

    pub async fn pool_for(&self, device_id: &DeviceId) -> Arc<DevicePool> {
        let mut pools = self.pools.lock().await;
        pools
            .entry(device_id.clone())
            .or_insert_with(|| {
                Arc::new(DevicePool::new(
                    device_id.clone(),
                    self.max_connections_per_device,
                    self.idle_timeout,
                    self.acquire_timeout,
                    self.global_total.clone(),
                    self.max_total_connections,
                ))
            })
            .clone()
    }

    pub async fn run_maintenance_all(&self) {
        let pools: Vec<Arc<DevicePool>> = self.pools.lock().await.values().cloned().collect();
        for pool in pools {
            pool.run_maintenance().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionStats;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct FakeConnection {
        device_id: DeviceId,
        healthy: Arc<AtomicBool>,
        stats: ConnectionStats,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        async fn execute(&mut self, _request: &[u8]) -> Result<Vec<u8>> {
            self.stats.record(Duration::from_micros(1));
            Ok(Vec::new())
        }
        fn stats(&self) -> ConnectionStats {
            self.stats
        }
        fn device_id(&self) -> &DeviceId {
            &self.device_id
        }
    }

    struct FakeFactory {
        device_id: DeviceId,
        should_fail: bool,
        healthy: Arc<AtomicBool>,
    }

    impl FakeFactory {
        fn new(device_id: DeviceId, should_fail: bool) -> Self {
            Self {
                device_id,
                should_fail,
                healthy: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        async fn open(&self) -> Result<Box<dyn Connection>> {
            if self.should_fail {
                return Err(GatewayError::TransportError("refused".into()));
            }
            Ok(Box::new(FakeConnection {
                device_id: self.device_id.clone(),
                healthy: self.healthy.clone(),
                stats: ConnectionStats::new(),
            }))
        }
    }

    #[tokio::test]
    async fn acquire_then_release_never_drifts_total() {
        let global = Arc::new(AtomicUsize::new(0));
        let pool = DevicePool::new(
            DeviceId::from("dev-1"),
            4,
            Duration::from_secs(60),
            Duration::from_millis(500),
            global,
            256,
        );
        let factory = FakeFactory::new(DeviceId::from("dev-1"), false);
        let conn = pool.acquire(&factory).await.unwrap();
        let snap = pool.snapshot().await;
        assert_eq!(snap.active, 1);
        assert_eq!(snap.total, 1);
        pool.release(conn).await;
        let snap = pool.snapshot().await;
        assert_eq!(snap.active, 0);
        assert_eq!(snap.total, 1);
        assert_eq!(snap.idle, 1);
    }

    #[tokio::test]
    async fn acquire_never_exceeds_max_per_device() {
        let global = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(DevicePool::new(
            DeviceId::from("dev-1"),
            2,
            Duration::from_secs(60),
            Duration::from_millis(50),
            global,
            256,
        ));
        let factory = Arc::new(FakeFactory::new(DeviceId::from("dev-1"), false));

        let c1 = pool.acquire(factory.as_ref()).await.unwrap();
        let c2 = pool.acquire(factory.as_ref()).await.unwrap();
        let third = pool.acquire(factory.as_ref()).await;
        assert!(matches!(third, Err(GatewayError::Timeout(_))));
        pool.release(c1).await;
        pool.release(c2).await;
    }

    #[tokio::test]
    async fn factory_failure_propagates_and_does_not_leak_total() {
        let global = Arc::new(AtomicUsize::new(0));
        let pool = DevicePool::new(
            DeviceId::from("dev-1"),
            4,
            Duration::from_secs(60),
            Duration::from_millis(50),
            global,
            256,
        );
        let factory = FakeFactory::new(DeviceId::from("dev-1"), true);
        let result = pool.acquire(&factory).await;
        assert!(matches!(result, Err(GatewayError::FactoryFailed { .. })));
        let snap = pool.snapshot().await;
        assert_eq!(snap.total, 0);
    }

    #[tokio::test]
    async fn unhealthy_release_closes_instead_of_idling() {
        let global = Arc::new(AtomicUsize::new(0));
        let pool = DevicePool::new(
            DeviceId::from("dev-1"),
            4,
            Duration::from_secs(60),
            Duration::from_millis(500),
            global,
            256,
        );
        let factory = FakeFactory::new(DeviceId::from("dev-1"), false);
        let conn = pool.acquire(&factory).await.unwrap();
        factory.healthy.store(false, Ordering::SeqCst);
        pool.release(conn).await;
        let snap = pool.snapshot().await;
        assert_eq!(snap.total, 0);
        assert_eq!(snap.idle, 0);
    }
}
