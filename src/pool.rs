//! Bounded connection pool: acquire/release, health revalidation, idle
//! eviction, scoped guard, background maintenance loop.
//!
//! Grounded on the `bb8`-style `ManageConnection` trait split (a `connect`
//! factory plus an `is_valid` health check) seen in the pack's
//! `other_examples/` connection-pool reference, adapted to the teacher's
//! `Arc<Mutex<..>>` + telemetry-on-transition idiom.

use crate::error::PipelineError;
use crate::telemetry::{emit_best_effort, FabricEvent, NullSink, PoolEvent, TelemetrySink};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Connection factory + health checker the pool manages.
#[async_trait]
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Error: std::fmt::Display + Send;

    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
    async fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub max_idle: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(5),
            max_idle: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

struct Idle<C> {
    conn: C,
    idle_since: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolCounters {
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub total_destroyed: u64,
}

struct Shared<C> {
    idle: VecDeque<Idle<C>>,
    current_size: usize,
}

/// Bounded pool of `M::Connection`s. Cheap to clone: internal state is
/// reference-counted, so every clone manages the same pool.
pub struct Pool<M, Sink = NullSink>
where
    M: ManageConnection,
{
    name: String,
    manager: Arc<M>,
    config: PoolConfig,
    shared: Arc<Mutex<Shared<M::Connection>>>,
    growth_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
    acquired: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
    created: Arc<AtomicU64>,
    destroyed: Arc<AtomicU64>,
    sink: Sink,
}

impl<M> Clone for Pool<M, NullSink>
where
    M: ManageConnection,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            manager: Arc::clone(&self.manager),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            growth_lock: Arc::clone(&self.growth_lock),
            closed: Arc::clone(&self.closed),
            acquired: Arc::clone(&self.acquired),
            released: Arc::clone(&self.released),
            created: Arc::clone(&self.created),
            destroyed: Arc::clone(&self.destroyed),
            sink: self.sink.clone(),
        }
    }
}

impl<M> Pool<M, NullSink>
where
    M: ManageConnection,
{
    pub fn new(name: impl Into<String>, manager: M, config: PoolConfig) -> Self {
        Self {
            name: name.into(),
            manager: Arc::new(manager),
            config,
            shared: Arc::new(Mutex::new(Shared { idle: VecDeque::new(), current_size: 0 })),
            growth_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
            acquired: Arc::new(AtomicU64::new(0)),
            released: Arc::new(AtomicU64::new(0)),
            created: Arc::new(AtomicU64::new(0)),
            destroyed: Arc::new(AtomicU64::new(0)),
            sink: NullSink,
        }
    }
}

impl<M, Sink> Pool<M, Sink>
where
    M: ManageConnection,
    Sink: Clone,
{
    pub fn with_sink<NewSink: Clone>(self, sink: NewSink) -> Pool<M, NewSink> {
        Pool {
            name: self.name,
            manager: self.manager,
            config: self.config,
            shared: self.shared,
            growth_lock: self.growth_lock,
            closed: self.closed,
            acquired: self.acquired,
            released: self.released,
            created: self.created,
            destroyed: self.destroyed,
            sink,
        }
    }
}

impl<M, Sink> Pool<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            total_acquired: self.acquired.load(Ordering::Relaxed),
            total_released: self.released.load(Ordering::Relaxed),
            total_created: self.created.load(Ordering::Relaxed),
            total_destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }

    pub async fn current_size(&self) -> usize {
        self.shared.lock().await.current_size
    }

    pub async fn available(&self) -> usize {
        self.shared.lock().await.idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Acquire a connection, waiting up to `acquire_timeout` if the pool is
    /// at capacity. The guard releases the connection back to the idle
    /// queue (or destroys it if the pool has since closed) when dropped.
    ///
    /// Fails with `PoolClosed` immediately against a closed pool, and with
    /// `PoolExhausted` if no connection becomes available within
    /// `acquire_timeout`.
    pub async fn acquire(&self) -> Result<PoolGuard<M, Sink>, PipelineError<String>> {
        if self.is_closed() {
            return Err(PipelineError::PoolClosed);
        }
        match timeout(self.config.acquire_timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::PoolExhausted),
        }
    }

    async fn acquire_inner(&self) -> Result<PoolGuard<M, Sink>, PipelineError<String>> {
        loop {
            if self.is_closed() {
                return Err(PipelineError::PoolClosed);
            }
            if let Some(conn) = self.try_take_idle().await {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                self.emit(FabricEvent::Pool(PoolEvent::Acquired {
                    name: self.name.clone(),
                    current_size: self.shared.lock().await.current_size,
                }));
                return Ok(PoolGuard { pool: self.clone_handle(), conn: Some(conn) });
            }

            let _growth = self.growth_lock.lock().await;
            let mut shared = self.shared.lock().await;
            if shared.current_size < self.config.max_size {
                shared.current_size += 1;
                drop(shared);
                match self.manager.connect().await {
                    Ok(conn) => {
                        self.created.fetch_add(1, Ordering::Relaxed);
                        self.acquired.fetch_add(1, Ordering::Relaxed);
                        return Ok(PoolGuard { pool: self.clone_handle(), conn: Some(conn) });
                    }
                    Err(e) => {
                        let mut shared = self.shared.lock().await;
                        shared.current_size = shared.current_size.saturating_sub(1);
                        return Err(PipelineError::ApplicationError(e.to_string()));
                    }
                }
            }
            drop(shared);
            self.emit(FabricEvent::Pool(PoolEvent::Exhausted { name: self.name.clone() }));
            tokio::task::yield_now().await;
        }
    }

    async fn try_take_idle(&self) -> Option<M::Connection> {
        loop {
            let mut shared = self.shared.lock().await;
            let idle = shared.idle.pop_front()?;
            drop(shared);
            let mut conn = idle.conn;
            if self.manager.is_valid(&mut conn).await {
                return Some(conn);
            }
            self.destroy_one().await;
        }
    }

    async fn destroy_one(&self) {
        let mut shared = self.shared.lock().await;
        shared.current_size = shared.current_size.saturating_sub(1);
        drop(shared);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.emit(FabricEvent::Pool(PoolEvent::Destroyed { name: self.name.clone(), reason: "unhealthy" }));
    }

    async fn release(&self, conn: M::Connection) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if self.is_closed() {
            self.destroy_one().await;
            return;
        }
        let mut shared = self.shared.lock().await;
        shared.idle.push_back(Idle { conn, idle_since: Instant::now() });
    }

    /// Run the background maintenance loop until `stop` fires. Revalidates
    /// idle connections and evicts those idle past `max_idle`, never
    /// shrinking below `min_size`.
    pub async fn run_maintenance(&self, stop: &tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = interval.tick() => self.sweep_idle().await,
            }
        }
    }

    async fn sweep_idle(&self) {
        let _growth = self.growth_lock.lock().await;
        let mut shared = self.shared.lock().await;
        let min_size = self.config.min_size;
        let max_idle = self.config.max_idle;
        let now = Instant::now();

        let mut kept = VecDeque::new();
        let mut to_destroy = Vec::new();
        while let Some(mut entry) = shared.idle.pop_front() {
            let healthy = self.manager.is_valid(&mut entry.conn).await;
            let past_idle = now.saturating_duration_since(entry.idle_since) > max_idle;
            if !healthy || (past_idle && shared.current_size > min_size) {
                to_destroy.push(());
                shared.current_size = shared.current_size.saturating_sub(1);
            } else {
                kept.push_back(entry);
            }
        }
        shared.idle = kept;
        drop(shared);
        for _ in &to_destroy {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.emit(FabricEvent::Pool(PoolEvent::Destroyed { name: self.name.clone(), reason: "idle_expired" }));
        }
    }

    /// Mark closed, drain and destroy every idle connection. Connections
    /// currently checked out are destroyed as they're released.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut shared = self.shared.lock().await;
        let drained = shared.idle.len();
        shared.idle.clear();
        shared.current_size = shared.current_size.saturating_sub(drained);
        drop(shared);
        for _ in 0..drained {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
        self.emit(FabricEvent::Pool(PoolEvent::Destroyed { name: self.name.clone(), reason: "pool_closed" }));
    }

    fn clone_handle(&self) -> PoolHandle<M, Sink> {
        PoolHandle {
            name: self.name.clone(),
            manager: Arc::clone(&self.manager),
            shared: Arc::clone(&self.shared),
            closed: Arc::clone(&self.closed),
            released: Arc::clone(&self.released),
            destroyed: Arc::clone(&self.destroyed),
            sink: self.sink.clone(),
        }
    }

    fn emit(&self, event: FabricEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            emit_best_effort(sink, event).await;
        });
    }
}

/// A handle cheap enough to embed in a `PoolGuard` without borrowing the
/// pool itself, so the guard can outlive the call site that acquired it.
struct PoolHandle<M, Sink>
where
    M: ManageConnection,
{
    name: String,
    manager: Arc<M>,
    shared: Arc<Mutex<Shared<M::Connection>>>,
    closed: Arc<AtomicBool>,
    released: Arc<AtomicU64>,
    destroyed: Arc<AtomicU64>,
    sink: Sink,
}

impl<M, Sink> PoolHandle<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    async fn release(&self, conn: M::Connection) {
        self.released.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            let mut shared = self.shared.lock().await;
            shared.current_size = shared.current_size.saturating_sub(1);
            drop(shared);
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            let sink = self.sink.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                emit_best_effort(sink, FabricEvent::Pool(PoolEvent::Destroyed { name, reason: "pool_closed" })).await;
            });
            return;
        }
        let mut shared = self.shared.lock().await;
        shared.idle.push_back(Idle { conn, idle_since: Instant::now() });
    }
}

/// RAII guard releasing its connection back to the pool (or destroying it
/// on a closed pool) when dropped, guaranteeing release on every exit path
/// including cancellation of the holding task.
pub struct PoolGuard<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    pool: PoolHandle<M, Sink>,
    conn: Option<M::Connection>,
}

impl<M, Sink> std::ops::Deref for PoolGuard<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken only on drop")
    }
}

impl<M, Sink> std::ops::DerefMut for PoolGuard<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken only on drop")
    }
}

impl<M, Sink> Drop for PoolGuard<M, Sink>
where
    M: ManageConnection,
    Sink: TelemetrySink + Clone + Send + Sync + 'static,
    <Sink as tower::Service<FabricEvent>>::Future: Send,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = PoolHandle {
                name: self.pool.name.clone(),
                manager: Arc::clone(&self.pool.manager),
                shared: Arc::clone(&self.pool.shared),
                closed: Arc::clone(&self.pool.closed),
                released: Arc::clone(&self.pool.released),
                destroyed: Arc::clone(&self.pool.destroyed),
                sink: self.pool.sink.clone(),
            };
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}
