//! Bounded connection pool with rollback-before-reuse.
//!
//! Physical connections live in a fixed-capacity arena of slots indexed by a
//! stable [`ConnectionHandle`]. Every slot carries an explicit
//! [`ConnectionState`] and is only mutated through pool methods.
//!
//! # Design Decisions
//!
//! - **`Semaphore` for leases**: one permit per leased (or connecting)
//!   connection. Waiting for capacity is bounded by `acquire_timeout` and
//!   reported as [`DbError::PoolExhausted`], never retried inside the pool
//! - **`std::sync::Mutex` for the arena**: bookkeeping is synchronous and the
//!   lock is never held across an await point
//! - **Generation counters**: a handle from a freed slot can never touch the
//!   slot's next occupant
//! - **[`SlotGuard`]**: a future cancelled mid-connect, mid-validation or
//!   mid-rollback frees its slot instead of leaking it
//!
//! # Invariants
//!
//! - leased + idle <= `max_connections`
//! - a permit is returned only after its slot is back in the idle set or freed
//! - a connection only re-enters the idle set after a successful `rollback()`
//! - a [`PooledConnection`] dropped without [`ConnectionPool::release`] is
//!   rolled back and closed in the background, never reused

use crate::config::PoolOptions;
use crate::db::connection::{Connection, Connector};
use crate::db::validator::ConnectionValidator;
use crate::error::{DbError, DbResult};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stable identity of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionHandle {
    pub index: usize,
    pub generation: u64,
}

/// Lifecycle state of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// In the idle set, ready for the next lease.
    Idle,
    /// Owned by exactly one caller (or being opened for one).
    Leased,
    /// Returned with a possibly aborted transaction; rollback pending.
    Aborted,
    /// No connection in this slot.
    Closed,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub min_connections: u32,
    pub leased: usize,
    pub idle: usize,
    pub closed: bool,
}

struct Slot<T> {
    state: ConnectionState,
    generation: u64,
    created_at: Instant,
    conn: Option<T>,
}

struct Arena<T> {
    slots: Vec<Slot<T>>,
    capacity: usize,
    idle: VecDeque<usize>,
    closed: bool,
}

impl<T> Arena<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            idle: VecDeque::new(),
            closed: false,
        }
    }

    fn slot_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Slot<T>> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
    }

    /// Pop the oldest idle connection and mark its slot leased.
    fn take_idle(&mut self) -> Option<(ConnectionHandle, T, Instant)> {
        while let Some(index) = self.idle.pop_front() {
            let slot = &mut self.slots[index];
            if slot.state != ConnectionState::Idle {
                continue;
            }
            if let Some(conn) = slot.conn.take() {
                slot.state = ConnectionState::Leased;
                let handle = ConnectionHandle {
                    index,
                    generation: slot.generation,
                };
                return Some((handle, conn, slot.created_at));
            }
        }
        None
    }

    /// Claim an empty slot for a connection about to be opened.
    fn reserve(&mut self) -> Option<(ConnectionHandle, Instant)> {
        let now = Instant::now();
        let index = match self
            .slots
            .iter()
            .position(|slot| slot.state == ConnectionState::Closed)
        {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot {
                    state: ConnectionState::Closed,
                    generation: 0,
                    created_at: now,
                    conn: None,
                });
                self.slots.len() - 1
            }
            None => return None,
        };

        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.state = ConnectionState::Leased;
        slot.created_at = now;
        Some((
            ConnectionHandle {
                index,
                generation: slot.generation,
            },
            now,
        ))
    }

    fn set_state(&mut self, handle: ConnectionHandle, state: ConnectionState) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.state = state;
        }
    }

    /// Put a rolled-back connection back in the idle set. Hands the
    /// connection back when the pool is closed or the handle is stale.
    fn restore_idle(&mut self, handle: ConnectionHandle, conn: T) -> Result<(), T> {
        if self.closed {
            return Err(conn);
        }
        let Some(slot) = self.slot_mut(handle) else {
            return Err(conn);
        };
        slot.state = ConnectionState::Idle;
        slot.conn = Some(conn);
        self.idle.push_back(handle.index);
        Ok(())
    }

    fn free(&mut self, handle: ConnectionHandle) {
        if let Some(slot) = self.slot_mut(handle) {
            slot.state = ConnectionState::Closed;
            slot.conn = None;
        }
    }

    fn drain_idle(&mut self) -> Vec<T> {
        let mut drained = Vec::with_capacity(self.idle.len());
        while let Some(index) = self.idle.pop_front() {
            let slot = &mut self.slots[index];
            if slot.state == ConnectionState::Idle {
                slot.state = ConnectionState::Closed;
                if let Some(conn) = slot.conn.take() {
                    drained.push(conn);
                }
            }
        }
        drained
    }

    fn state_of(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| slot.state)
    }

    fn count(&self, pred: impl Fn(ConnectionState) -> bool) -> usize {
        self.slots.iter().filter(|slot| pred(slot.state)).count()
    }
}

fn lock_arena<T>(arena: &Mutex<Arena<T>>) -> MutexGuard<'_, Arena<T>> {
    arena.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees a reserved slot on drop unless disarmed.
struct SlotGuard<'a, T> {
    arena: &'a Mutex<Arena<T>>,
    handle: ConnectionHandle,
    armed: bool,
}

impl<'a, T> SlotGuard<'a, T> {
    fn new(arena: &'a Mutex<Arena<T>>, handle: ConnectionHandle) -> Self {
        Self {
            arena,
            handle,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            lock_arena(self.arena).free(self.handle);
        }
    }
}

enum Checkout<T> {
    Idle {
        handle: ConnectionHandle,
        conn: T,
        created_at: Instant,
    },
    Create {
        handle: ConnectionHandle,
        created_at: Instant,
    },
}

/// Bounded set of physical connections.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    options: PoolOptions,
    validator: ConnectionValidator,
    arena: Mutex<Arena<C::Connection>>,
    leases: Arc<Semaphore>,
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool. No connection is opened until first use or [`warm_up`](Self::warm_up).
    pub fn new(connector: C, options: PoolOptions) -> Arc<Self> {
        Self::with_validator(connector, options, ConnectionValidator::default())
    }

    pub fn with_validator(
        connector: C,
        options: PoolOptions,
        validator: ConnectionValidator,
    ) -> Arc<Self> {
        let capacity = options.max_connections as usize;
        Arc::new(Self {
            connector,
            validator,
            arena: Mutex::new(Arena::new(capacity)),
            leases: Arc::new(Semaphore::new(capacity)),
            options,
        })
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn validator(&self) -> &ConnectionValidator {
        &self.validator
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn status(&self) -> PoolStatus {
        let arena = self.lock();
        PoolStatus {
            max_connections: self.options.max_connections,
            min_connections: self.options.min_connections,
            leased: arena.count(|s| matches!(s, ConnectionState::Leased | ConnectionState::Aborted)),
            idle: arena.count(|s| s == ConnectionState::Idle),
            closed: arena.closed,
        }
    }

    /// Current state of the slot behind `handle`, or `None` once the slot was reused.
    pub fn connection_state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.lock().state_of(handle)
    }

    /// Lease a connection.
    ///
    /// Waits up to `acquire_timeout` for capacity, then fails with
    /// [`DbError::PoolExhausted`]. Idle connections past their recycle age, or
    /// failing validation when `pre_ping` is set, are closed and skipped.
    pub async fn acquire(self: &Arc<Self>) -> DbResult<PooledConnection<C>> {
        let permit = self.acquire_permit().await?;

        loop {
            let checkout = {
                let mut arena = self.lock();
                if arena.closed {
                    return Err(DbError::PoolClosed);
                }
                match arena.take_idle() {
                    Some((handle, conn, created_at)) => Checkout::Idle {
                        handle,
                        conn,
                        created_at,
                    },
                    None => match arena.reserve() {
                        Some((handle, created_at)) => Checkout::Create { handle, created_at },
                        None => {
                            return Err(DbError::internal(
                                "connection pool has no free slot for a granted lease",
                            ));
                        }
                    },
                }
            };

            match checkout {
                Checkout::Idle {
                    handle,
                    mut conn,
                    created_at,
                } => {
                    let guard = SlotGuard::new(&self.arena, handle);
                    if self.is_expired(created_at) {
                        debug!(
                            connection = handle.index,
                            age_secs = created_at.elapsed().as_secs(),
                            "Recycling idle connection past its recycle age"
                        );
                        self.close_connection(conn).await;
                        continue;
                    }
                    if self.options.pre_ping && !self.validator.is_valid(Some(&mut conn)).await {
                        warn!(
                            connection = handle.index,
                            "Discarding idle connection that failed validation"
                        );
                        self.close_connection(conn).await;
                        continue;
                    }
                    guard.disarm();
                    return Ok(PooledConnection::new(
                        conn,
                        handle,
                        created_at,
                        permit,
                        Arc::clone(self),
                    ));
                }
                Checkout::Create { handle, created_at } => {
                    let guard = SlotGuard::new(&self.arena, handle);
                    let conn = self.connector.connect().await?;
                    guard.disarm();
                    debug!(
                        connection = handle.index,
                        generation = handle.generation,
                        "Opened new connection"
                    );
                    return Ok(PooledConnection::new(
                        conn,
                        handle,
                        created_at,
                        permit,
                        Arc::clone(self),
                    ));
                }
            }
        }
    }

    /// Lease an already idle connection without waiting or opening a new one.
    ///
    /// Used by the keepalive pinger; no validation or recycling is applied.
    pub fn try_acquire_idle(self: &Arc<Self>) -> Option<PooledConnection<C>> {
        let permit = Arc::clone(&self.leases).try_acquire_owned().ok()?;
        let (handle, conn, created_at) = self.lock().take_idle()?;
        Some(PooledConnection::new(
            conn,
            handle,
            created_at,
            permit,
            Arc::clone(self),
        ))
    }

    /// Return a leased connection.
    ///
    /// `rollback()` is always attempted first. A failed rollback closes the
    /// connection whatever `discard` says. Otherwise the connection goes back
    /// to the idle set, unless `discard` is set or it has outlived the
    /// recycle age, in which case it is closed. `None` is a no-op.
    pub async fn release(&self, connection: Option<PooledConnection<C>>, discard: bool) {
        let Some(lease) = connection else {
            return;
        };
        let Some((mut conn, handle, created_at, permit)) = lease.detach() else {
            return;
        };

        // Dropped in reverse order: the slot is settled before the permit is returned.
        let _permit = permit;
        let guard = SlotGuard::new(&self.arena, handle);
        self.lock().set_state(handle, ConnectionState::Aborted);

        let rolled_back = match conn.rollback().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    connection = handle.index,
                    error = %e,
                    "Rollback failed, closing connection"
                );
                false
            }
        };

        if rolled_back && !discard {
            if self.is_expired(created_at) {
                debug!(
                    connection = handle.index,
                    age_secs = created_at.elapsed().as_secs(),
                    "Recycling connection past its recycle age"
                );
            } else {
                let restored = self.lock().restore_idle(handle, conn);
                match restored {
                    Ok(()) => {
                        guard.disarm();
                        return;
                    }
                    Err(returned) => conn = returned,
                }
            }
        }

        debug!(connection = handle.index, discard, "Closing released connection");
        self.close_connection(conn).await;
    }

    /// Open idle connections until `min_connections` exist. Best effort:
    /// stops at the first failure. Returns how many were opened.
    pub async fn warm_up(&self) -> usize {
        let target = self.options.min_connections.min(self.options.max_connections) as usize;
        let mut opened = 0;

        loop {
            let Ok(_permit) = Arc::clone(&self.leases).try_acquire_owned() else {
                break;
            };
            let reserved = {
                let mut arena = self.lock();
                let live = arena.count(|s| s != ConnectionState::Closed);
                if arena.closed || live >= target {
                    None
                } else {
                    arena.reserve()
                }
            };
            let Some((handle, _)) = reserved else {
                break;
            };

            let guard = SlotGuard::new(&self.arena, handle);
            let conn = match self.connector.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to open connection during warm-up");
                    break;
                }
            };
            let restored = self.lock().restore_idle(handle, conn);
            match restored {
                Ok(()) => {
                    guard.disarm();
                    opened += 1;
                }
                Err(conn) => {
                    self.close_connection(conn).await;
                    break;
                }
            }
        }

        if opened > 0 {
            debug!(opened, target, "Pool warmed up");
        }
        opened
    }

    /// Stop leasing and close every idle connection. Safe to call repeatedly.
    ///
    /// Connections still leased are closed when they are released.
    pub async fn close(&self) {
        let (first, idle) = {
            let mut arena = self.lock();
            let first = !arena.closed;
            arena.closed = true;
            (first, arena.drain_idle())
        };
        self.leases.close();

        if first {
            info!(idle = idle.len(), "Closing connection pool");
        } else {
            debug!("Connection pool already closed");
        }
        for conn in idle {
            self.close_connection(conn).await;
        }
    }

    async fn acquire_permit(&self) -> DbResult<OwnedSemaphorePermit> {
        let timeout = self.options.acquire_timeout;
        let leases = Arc::clone(&self.leases);

        let result = if timeout.is_zero() {
            leases.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => DbError::PoolClosed,
                TryAcquireError::NoPermits => {
                    DbError::pool_exhausted(self.options.max_connections, Duration::ZERO)
                }
            })
        } else {
            match tokio::time::timeout(timeout, leases.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(DbError::PoolClosed),
                Err(_) => Err(DbError::pool_exhausted(self.options.max_connections, timeout)),
            }
        };

        if let Err(DbError::PoolExhausted { waited_ms, .. }) = &result {
            warn!(
                max_connections = self.options.max_connections,
                waited_ms = *waited_ms,
                "Connection pool exhausted"
            );
        }
        result
    }

    fn is_expired(&self, created_at: Instant) -> bool {
        created_at.elapsed() >= self.options.recycle
    }

    async fn close_connection(&self, conn: C::Connection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error while closing connection");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena<C::Connection>> {
        lock_arena(&self.arena)
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("target", &self.connector.target())
            .field("options", &self.options)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A leased connection, exclusively owned by one caller.
///
/// Hand it back with [`ConnectionPool::release`]. Dropping it instead is
/// treated as a discard: the connection is rolled back and closed by a
/// background task and never returns to the idle set.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Connection>,
    handle: ConnectionHandle,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool<C>>,
}

impl<C: Connector> PooledConnection<C> {
    fn new(
        conn: C::Connection,
        handle: ConnectionHandle,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
        pool: Arc<ConnectionPool<C>>,
    ) -> Self {
        Self {
            conn: Some(conn),
            handle,
            created_at,
            permit: Some(permit),
            pool,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Time since the physical connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[allow(clippy::type_complexity)]
    fn detach(
        mut self,
    ) -> Option<(
        C::Connection,
        ConnectionHandle,
        Instant,
        OwnedSemaphorePermit,
    )> {
        let conn = self.conn.take()?;
        let permit = self.permit.take()?;
        Some((conn, self.handle, self.created_at, permit))
    }
}

impl<C: Connector> std::ops::Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("connection is present until released")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("connection is present until released")
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("handle", &self.handle)
            .field("age", &self.created_at.elapsed())
            .field("released", &self.conn.is_none())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let permit = self.permit.take();
        let pool = Arc::clone(&self.pool);
        let handle = self.handle;

        pool.lock().set_state(handle, ConnectionState::Aborted);
        warn!(
            connection = handle.index,
            "Connection dropped without release, discarding"
        );

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _permit = permit;
                    if let Err(e) = conn.rollback().await {
                        debug!(error = %e, "Rollback of dropped connection failed");
                    }
                    pool.close_connection(conn).await;
                    pool.lock().free(handle);
                });
            }
            Err(_) => {
                pool.lock().free(handle);
                drop(conn);
                drop(permit);
            }
        }
    }
}
