//! # Batch Scheduler
//!
//! The throughput multiplier (spec §4.5). One bounded FIFO queue per
//! (device-id, op-kind); a long-lived dispatch task per queue pops ready
//! batches, acquires a connection through the breaker+pool, and asks the
//! protocol handler to execute one wire exchange for the whole group.

use crate::breaker::CircuitBreaker;
use crate::connection::{Connection, ConnectionFactory};
use crate::config::{BatchConfig, WordOrder};
use crate::error::{GatewayError, Result};
use crate::handler::{apply_outcome, HandlerContext};
use crate::pool::DevicePool;
use crate::value::{DeviceId, Scalar, Tag, TagId, Value};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Read,
    Write,
}

/// The operation a `BatchRequest` carries, independent of its sink.
#[derive(Debug, Clone)]
pub enum Op {
    Read,
    Write(Scalar),
}

/// A single queued tag operation (spec §3 BatchRequest).
pub struct BatchRequest {
    pub id: Uuid,
    pub device_id: DeviceId,
    pub tag: Tag,
    pub op: Op,
    pub deadline: Instant,
    pub priority: i32,
    /// Word order to apply when this request's tag is a multi-register
    /// Modbus numeric type, resolved once at enqueue time from the device's
    /// protocol (spec §4.1) — carried on the request itself so the batch
    /// codec path doesn't need a registry lookup deep inside the executor.
    pub word_order: WordOrder,
    enqueued_at: Instant,
    sequence: u64,
    sink: oneshot::Sender<Result<Value>>,
}

impl BatchRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: DeviceId,
        tag: Tag,
        op: Op,
        deadline: Instant,
        priority: i32,
        sequence: u64,
        word_order: WordOrder,
    ) -> (Self, oneshot::Receiver<Result<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                device_id,
                tag,
                op,
                deadline,
                priority,
                word_order,
                enqueued_at: Instant::now(),
                sequence,
                sink: tx,
            },
            rx,
        )
    }

    pub fn op_kind(&self) -> OpKind {
        match self.op {
            Op::Read => OpKind::Read,
            Op::Write(_) => OpKind::Write,
        }
    }

    pub fn tag_id(&self) -> &TagId {
        &self.tag.id
    }

    /// Resolves the sink exactly once; a request is only ever resolved by
    /// the scheduler or by cancellation, never both (spec §8 invariant).
    pub fn resolve(self, result: Result<Value>) {
        let _ = self.sink.send(result);
    }
}

/// What a protocol handler exposes to the scheduler for grouping and
/// executing one wire exchange (spec §4.5, §4.6). Concrete handlers
/// implement this alongside the `ProtocolHandler` facade.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// Whether `a` and `b` may be coalesced into the same wire operation.
    fn can_batch(&self, a: &BatchRequest, b: &BatchRequest) -> bool;

    /// Upper bound on requests per wire exchange for this protocol (spec
    /// §4.5: Modbus 125 registers, CIP ~50 symbols, OPC-UA 1000 nodes).
    fn max_wire_batch(&self) -> usize;

    /// Execute one wire exchange for `batch`, resolving every request's
    /// sink on success. On a batch-level transport failure, returns the
    /// untouched requests and the error so the caller can fall back to
    /// per-request execution (spec §4.5 dispatch).
    async fn execute_batch(
        &self,
        conn: &mut dyn Connection,
        batch: Vec<BatchRequest>,
    ) -> std::result::Result<(), (Vec<BatchRequest>, GatewayError)>;

    /// Execute a single request against its own wire exchange (the
    /// fallback path, and the path for the common single-request queue
    /// drain). Borrows rather than consumes so the caller can retry before
    /// resolving the request's sink exactly once (spec §8 invariant).
    async fn execute_one(&self, conn: &mut dyn Connection, request: &BatchRequest) -> Result<Value>;
}

struct DeviceOpQueue {
    requests: VecDeque<BatchRequest>,
    capacity: usize,
}

impl DeviceOpQueue {
    fn new(capacity: usize) -> Self {
        Self {
            requests: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, request: BatchRequest) -> std::result::Result<(), BatchRequest> {
        if self.requests.len() >= self.capacity {
            return Err(request);
        }
        self.requests.push_back(request);
        Ok(())
    }

    fn should_flush(&self, cfg: &BatchConfig) -> bool {
        if self.requests.is_empty() {
            return false;
        }
        if self.requests.len() >= cfg.max_size {
            return true;
        }
        let oldest = self.requests.front().unwrap();
        if oldest.enqueued_at.elapsed() >= cfg.timeout {
            return true;
        }
        let now = Instant::now();
        self.requests.iter().any(|r| r.deadline.saturating_duration_since(now) <= cfg.deadline_slack)
    }

    /// Pulls up to `target_size` requests out, preferring deadline-urgent
    /// requests first (in original order), then higher priority, with
    /// enqueue order as the final tie-break (spec §4.5: "work-conserving
    /// with priority aging", "never violate deadlines of already-queued
    /// requests").
    fn take_batch(&mut self, target_size: usize, slack: std::time::Duration) -> Vec<BatchRequest> {
        let now = Instant::now();
        let mut items: Vec<BatchRequest> = self.requests.drain(..).collect();
        items.sort_by(|a, b| {
            let a_urgent = a.deadline.saturating_duration_since(now) <= slack;
            let b_urgent = b.deadline.saturating_duration_since(now) <= slack;
            b_urgent
                .cmp(&a_urgent)
                .then(b.priority.cmp(&a.priority))
                .then(a.sequence.cmp(&b.sequence))
        });
        let take = target_size.min(items.len());
        let rest = items.split_off(take);
        for leftover in rest {
            self.requests.push_back(leftover);
        }
        items
    }
}

struct BatchSample {
    size: usize,
    latency: std::time::Duration,
    success: bool,
}

/// Groups pending tag operations by device and dispatches one wire
/// exchange per group (spec §4.5).
pub struct BatchScheduler {
    config: BatchConfig,
    queues: Mutex<std::collections::HashMap<(DeviceId, OpKind), DeviceOpQueue>>,
    target_batch_size: AtomicU64,
    last_adjustment: AtomicI64,
    samples: Mutex<VecDeque<BatchSample>>,
    sequence: AtomicU64,
}

impl BatchScheduler {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            target_batch_size: AtomicU64::new(config.max_size as u64),
            last_adjustment: AtomicI64::new(0),
            config,
            queues: Mutex::new(std::collections::HashMap::new()),
            samples: Mutex::new(VecDeque::with_capacity(32)),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueues a request or fails with `queue-full` (spec §5 backpressure).
    pub async fn enqueue(&self, request: BatchRequest) -> std::result::Result<(), GatewayError> {
        let key = (request.device_id.clone(), request.op_kind());
        let capacity = self.config.queue_capacity;
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(key).or_insert_with(|| DeviceOpQueue::new(capacity));
        queue.push(request).map_err(|req| GatewayError::QueueFull {
            device_id: req.device_id.to_string(),
        })
    }

    /// Returns a ready batch for `(device_id, op_kind)`, or `None` if no
    /// flush trigger has fired (spec §4.5 flush triggers).
    pub async fn try_take_batch(&self, device_id: &DeviceId, op_kind: OpKind) -> Option<Vec<BatchRequest>> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(&(device_id.clone(), op_kind))?;
        if !queue.should_flush(&self.config) {
            return None;
        }
        let target = self.target_batch_size.load(Ordering::Relaxed) as usize;
        let target = target.max(self.config.min_size).min(self.config.max_size);
        Some(queue.take_batch(target, self.config.deadline_slack))
    }

    /// List of (device, op-kind) pairs with at least one queued request,
    /// used by the owning gateway to drive per-queue dispatch tasks
    /// without polling devices it has never seen traffic for.
    pub async fn active_queues(&self) -> Vec<(DeviceId, OpKind)> {
        self.queues.lock().await.keys().cloned().collect()
    }

    /// Adaptive sizing feedback (spec §4.5): one monotonic step per
    /// interval, never oscillating within it.
    pub async fn record_outcome(&self, size: usize, latency: std::time::Duration, success: bool) {
        if !self.config.adaptive {
            return;
        }
        let mut samples = self.samples.lock().await;
        if samples.len() >= 32 {
            samples.pop_front();
        }
        samples.push_back(BatchSample { size, latency, success });

        let now_ms = Instant::now().elapsed().as_millis() as i64;
        let last = self.last_adjustment.load(Ordering::Relaxed);
        let interval_ms = self.config.timeout.as_millis() as i64 * 4;
        if now_ms - last < interval_ms {
            return;
        }
        self.last_adjustment.store(now_ms, Ordering::Relaxed);

        let recent_failure_heavy = samples.iter().rev().take(8).filter(|s| !s.success).count() >= 2;
        let current = self.target_batch_size.load(Ordering::Relaxed) as usize;
        let next = if recent_failure_heavy {
            current.saturating_sub(1).max(self.config.min_size)
        } else {
            (current + 1).min(self.config.max_size)
        };
        if next != current {
            debug!(current, next, "adaptive batch size adjustment");
            self.target_batch_size.store(next as u64, Ordering::Relaxed);
        }
    }

    pub fn target_batch_size(&self) -> usize {
        self.target_batch_size.load(Ordering::Relaxed) as usize
    }
}

/// Runs one dispatch cycle for `(device_id, op_kind)`: take a ready batch,
/// acquire a connection through the breaker and pool, execute it, and fall
/// back to per-request execution once on a batch-level transport failure
/// (spec §4.5). The per-request fallback retries transient failures up to
/// `ctx.retry_count` times (spec §4.6 "failure semantics") and feeds every
/// outcome into the device state machine and the breaker-trip counter.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_once(
    scheduler: &BatchScheduler,
    device_id: &DeviceId,
    op_kind: OpKind,
    executor: &dyn BatchExecutor,
    breaker: &CircuitBreaker,
    pool: &DevicePool,
    factory: &dyn ConnectionFactory,
    ctx: &HandlerContext,
) {
    let Some(batch) = scheduler.try_take_batch(device_id, op_kind).await else {
        return;
    };
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let diagnostics = ctx.diagnostics.for_device(device_id);

    if breaker.allow().is_err() {
        for req in batch {
            req.resolve(Err(GatewayError::BreakerOpen {
                device_id: device_id.to_string(),
            }));
        }
        return;
    }

    let started = Instant::now();
    let mut conn = match pool.acquire(factory).await {
        Ok(conn) => conn,
        Err(e) => {
            if breaker.record(false) {
                diagnostics.record_breaker_trip();
            }
            for req in batch {
                req.resolve(Err(GatewayError::PoolExhausted {
                    device_id: device_id.to_string(),
                }));
            }
            let _ = e;
            return;
        }
    };

    match executor.execute_batch(conn.as_mut(), batch).await {
        Ok(()) => {
            breaker.record(true);
            apply_outcome(ctx, device_id, &Ok(()));
            scheduler.record_outcome(size, started.elapsed(), true).await;
            pool.release(conn).await;
        }
        Err((requests, error)) => {
            warn!(device_id = %device_id, %error, "batch dispatch failed, falling back to per-request");
            let counts = error.counts_against_breaker();
            if breaker.record(!counts) {
                diagnostics.record_breaker_trip();
            }
            scheduler.record_outcome(size, started.elapsed(), false).await;
            pool.release(conn).await;

            for req in requests {
                match pool.acquire(factory).await {
                    Ok(mut c) => {
                        let result = dispatch_one_with_retry(executor, c.as_mut(), &req, ctx, breaker, &diagnostics).await;
                        pool.release(c).await;
                        req.resolve(result);
                    }
                    Err(_) => req.resolve(Err(GatewayError::PoolExhausted {
                        device_id: device_id.to_string(),
                    })),
                }
            }
        }
    }
}

/// Executes one request, retrying retryable errors up to `ctx.retry_count`
/// times, then folds the final outcome into the breaker and the device
/// state machine. Does not resolve `request`'s sink — the caller owns that,
/// since `execute_one` now only borrows the request.
async fn dispatch_one_with_retry(
    executor: &dyn BatchExecutor,
    conn: &mut dyn Connection,
    request: &BatchRequest,
    ctx: &HandlerContext,
    breaker: &CircuitBreaker,
    diagnostics: &crate::diagnostics::Diagnostics,
) -> Result<Value> {
    let mut attempt = 0;
    loop {
        let result = executor.execute_one(conn, request).await;
        match &result {
            Ok(_) => {
                breaker.record(true);
            }
            Err(e) => {
                if breaker.record(!e.counts_against_breaker()) {
                    diagnostics.record_breaker_trip();
                }
                if e.is_retryable() && attempt < ctx.retry_count {
                    attempt += 1;
                    tokio::time::sleep(ctx.retry_delay).await;
                    continue;
                }
            }
        }
        apply_outcome(ctx, &request.device_id, &result);
        return result;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DataType, Protocol};
    use std::time::Duration;

    fn sample_tag() -> Tag {
        Tag::new("t1", DeviceId::from("dev-1"), "40001", DataType::UInt16, false)
    }

    fn make_request(seq: u64, priority: i32, deadline_in: Duration) -> (BatchRequest, oneshot::Receiver<Result<Value>>) {
        BatchRequest::new(DeviceId::from("dev-1"), sample_tag(), Op::Read, Instant::now() + deadline_in, priority, seq, WordOrder::BigEndian)
    }

    #[tokio::test]
    async fn enqueue_fails_with_queue_full_past_capacity() {
        let mut cfg = BatchConfig {
            max_size: 64,
            min_size: 1,
            timeout: Duration::from_millis(5),
            adaptive: false,
            queue_capacity: 2,
            deadline_slack: Duration::from_millis(2),
        };
        cfg.queue_capacity = 2;
        let scheduler = BatchScheduler::new(cfg);
        let (r1, _rx1) = make_request(0, 0, Duration::from_secs(5));
        let (r2, _rx2) = make_request(1, 0, Duration::from_secs(5));
        let (r3, _rx3) = make_request(2, 0, Duration::from_secs(5));
        scheduler.enqueue(r1).await.unwrap();
        scheduler.enqueue(r2).await.unwrap();
        let err = scheduler.enqueue(r3).await.unwrap_err();
        assert!(matches!(err, GatewayError::QueueFull { .. }));
    }

    #[tokio::test]
    async fn flushes_once_max_size_reached() {
        let cfg = BatchConfig {
            max_size: 2,
            min_size: 1,
            timeout: Duration::from_secs(60),
            adaptive: false,
            queue_capacity: 64,
            deadline_slack: Duration::from_millis(2),
        };
        let scheduler = BatchScheduler::new(cfg);
        let (r1, _rx1) = make_request(0, 0, Duration::from_secs(5));
        let (r2, _rx2) = make_request(1, 0, Duration::from_secs(5));
        scheduler.enqueue(r1).await.unwrap();
        assert!(scheduler.try_take_batch(&DeviceId::from("dev-1"), OpKind::Read).await.is_none());
        scheduler.enqueue(r2).await.unwrap();
        let batch = scheduler.try_take_batch(&DeviceId::from("dev-1"), OpKind::Read).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn deadline_urgent_requests_are_taken_first() {
        let cfg = BatchConfig {
            max_size: 64,
            min_size: 1,
            timeout: Duration::from_secs(60),
            adaptive: false,
            queue_capacity: 64,
            deadline_slack: Duration::from_millis(50),
        };
        let scheduler = BatchScheduler::new(cfg);
        let (normal, _rx1) = make_request(0, 5, Duration::from_secs(5));
        let (urgent, _rx2) = make_request(1, 0, Duration::from_millis(1));
        scheduler.enqueue(normal).await.unwrap();
        scheduler.enqueue(urgent).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let batch = scheduler.try_take_batch(&DeviceId::from("dev-1"), OpKind::Read).await.unwrap();
        assert_eq!(batch[0].sequence, 1);
    }
}
