//! A bounded pool of connections to a single upstream.
//!
//! `size` counts idle connections, connections handed out to callers and
//! dials in flight; it never exceeds `max_size`. A connection is owned by
//! exactly one side at a time: the idle queue, or the [`Pooled`] handle held
//! by a caller. Dropping a `Pooled` without releasing it counts as an
//! unhealthy release.

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    ops::{Deref, DerefMut},
    pin::pin,
    sync::{Arc, Mutex, MutexGuard},
};

use log::{debug, trace, warn};
use tokio::{sync::Notify, time::Instant};

use crate::{
    error::{Error, TimedOut},
    retry::{Classified, Failure},
};

/// Opens new connections for the pool.
pub(crate) trait Connect: Send + Sync + 'static {
    type Conn: Poolable;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, Classified>> + Send;
}

pub(crate) trait Poolable: Send + 'static {
    /// False once the peer has gone away.
    fn is_open(&self) -> bool;
}

pub(crate) struct Pool<C: Connect> {
    inner: Arc<PoolInner<C>>,
}

struct PoolInner<C: Connect> {
    connector: C,
    initial_size: usize,
    max_size: usize,
    max_idle: usize,
    state: Mutex<State<C::Conn>>,
    available: Notify,
}

struct State<T> {
    idle: VecDeque<Idle<T>>,
    size: usize,
    next_id: u64,
}

struct Idle<T> {
    id: u64,
    conn: T,
}

/// A connection checked out of a [`Pool`].
pub(crate) struct Pooled<C: Connect> {
    id: u64,
    conn: Option<C::Conn>,
    reused: bool,
    /// `None` when pooling is bypassed.
    pool: Option<Arc<PoolInner<C>>>,
}

/// A slot counted in `size` while its dial is in flight.
struct Reservation<'a, C: Connect> {
    pool: &'a Arc<PoolInner<C>>,
    id: u64,
    armed: bool,
}

impl<C: Connect> Pool<C> {
    pub(crate) fn new(connector: C, initial_size: usize, max_size: usize, max_idle: usize) -> Self {
        Pool {
            inner: Arc::new(PoolInner {
                connector,
                initial_size: initial_size.min(max_size),
                max_size,
                max_idle,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    size: 0,
                    next_id: 0,
                }),
                available: Notify::new(),
            }),
        }
    }

    /// Pooling is bypassed when the pool may not hold any connection.
    pub(crate) fn is_enabled(&self) -> bool {
        self.inner.max_size > 0
    }

    /// Dials until `initial_size` connections exist.
    ///
    /// Failures are logged and skipped; later acquires dial on demand.
    /// Returns the number of connections opened.
    pub(crate) async fn prewarm(&self) -> usize {
        let mut warmed = 0;

        while let Some(reservation) = self.inner.reserve(self.inner.initial_size) {
            match self.inner.connector.connect().await {
                Ok(conn) => {
                    let id = reservation.disarm();
                    self.inner.put(id, conn, true, true);
                    warmed += 1;
                }
                Err(failed) => {
                    warn!("pool pre-warm dial failed: {}", failed.error);
                    drop(reservation);
                    break;
                }
            }
        }

        if warmed > 0 {
            debug!("pre-warmed {} connection(s)", warmed);
        }
        warmed
    }

    /// Checks out a connection.
    ///
    /// Returns an idle connection if one is open, dials a new one if the pool
    /// has room, and otherwise waits for a release. The wait ends with a
    /// `PoolExhausted` error once `deadline` passes; dials are bounded by the
    /// dialer's own clocks only.
    pub(crate) async fn acquire(&self, deadline: Option<Instant>) -> Result<Pooled<C>, Classified> {
        if !self.is_enabled() {
            let conn = self.inner.connector.connect().await?;
            return Ok(Pooled {
                id: 0,
                conn: Some(conn),
                reused: false,
                pool: None,
            });
        }

        loop {
            // Registered as a waiter before the check, so every release
            // after it wakes this acquire or another registered one.
            let mut notified = pin!(self.inner.available.notified());
            notified.as_mut().enable();

            let reservation = {
                let mut state = self.inner.lock();
                if let Some(idle) = self.inner.pop_idle(&mut state) {
                    return Ok(Pooled {
                        id: idle.id,
                        conn: Some(idle.conn),
                        reused: true,
                        pool: Some(self.inner.clone()),
                    });
                }
                self.inner.reserve_locked(&mut state, self.inner.max_size)
            };

            if let Some(reservation) = reservation {
                let conn = self.inner.connector.connect().await?;
                let id = reservation.disarm();
                debug!("pool opened connection #{}", id);
                return Ok(Pooled {
                    id,
                    conn: Some(conn),
                    reused: false,
                    pool: Some(self.inner.clone()),
                });
            }

            trace!("pool is full, waiting for a release");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(Classified::new(
                            Failure::Timeout,
                            Error::pool_exhausted(TimedOut),
                        ));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Hands a connection back.
    ///
    /// A healthy, still open connection becomes idle unless `max_idle`
    /// connections already are; any other connection is closed and its slot
    /// freed.
    pub(crate) fn release(&self, mut pooled: Pooled<C>, healthy: bool) {
        match pooled.pool {
            Some(ref pool) if Arc::ptr_eq(pool, &self.inner) => {}
            Some(_) => {
                warn!("connection released to a pool it does not belong to");
                // Its own pool reclaims the slot on drop.
                return;
            }
            None => return,
        }

        if let Some(conn) = pooled.conn.take() {
            self.inner.put(pooled.id, conn, healthy, false);
        }
    }

    /// Connections counted against `max_size`.
    #[cfg(test)]
    pub(crate) fn size(&self) -> usize {
        self.inner.lock().size
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.inner.lock().idle.len()
    }
}

impl<C: Connect> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connect> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Pool")
            .field("size", &state.size)
            .field("idle", &state.idle.len())
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

impl<C: Connect> PoolInner<C> {
    fn lock(&self) -> MutexGuard<'_, State<C::Conn>> {
        // A panic while holding the lock cannot leave `State` half-updated,
        // every critical section is a handful of field writes.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pop_idle(&self, state: &mut State<C::Conn>) -> Option<Idle<C::Conn>> {
        // Most recently released first, it is the least likely to have timed out.
        while let Some(idle) = state.idle.pop_back() {
            if idle.conn.is_open() {
                return Some(idle);
            }
            trace!("discarding closed idle connection #{}", idle.id);
            state.size -= 1;
        }
        None
    }

    fn reserve<'a>(self: &'a Arc<Self>, limit: usize) -> Option<Reservation<'a, C>> {
        let mut state = self.lock();
        self.reserve_locked(&mut state, limit)
    }

    fn reserve_locked<'a>(
        self: &'a Arc<Self>,
        state: &mut State<C::Conn>,
        limit: usize,
    ) -> Option<Reservation<'a, C>> {
        if state.size >= limit {
            return None;
        }
        state.size += 1;
        state.next_id += 1;
        Some(Reservation {
            pool: self,
            id: state.next_id,
            armed: true,
        })
    }

    fn put(&self, id: u64, conn: C::Conn, healthy: bool, prewarm: bool) {
        let mut state = self.lock();

        let keep = healthy
            && conn.is_open()
            && (prewarm || state.idle.len() < self.max_idle);

        if keep {
            if state.idle.iter().any(|idle| idle.id == id) {
                warn!("connection #{} released twice, ignoring", id);
                return;
            }
            state.idle.push_back(Idle { id, conn });
        } else {
            trace!("closing connection #{} (healthy: {})", id, healthy);
            state.size -= 1;
            drop(state);
            drop(conn);
        }

        self.available.notify_one();
    }

    fn forget(&self) {
        self.lock().size -= 1;
        self.available.notify_one();
    }
}

impl<C: Connect> Reservation<'_, C> {
    fn disarm(mut self) -> u64 {
        self.armed = false;
        self.id
    }
}

impl<C: Connect> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        // The dial failed or its future was dropped.
        if self.armed {
            self.pool.forget();
        }
    }
}

// ===== impl Pooled =====

impl<C: Connect> Pooled<C> {
    /// Whether the connection served an earlier request.
    pub(crate) fn is_reused(&self) -> bool {
        self.reused
    }
}

impl<C: Connect> Deref for Pooled<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("not dropped")
    }
}

impl<C: Connect> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("not dropped")
    }
}

impl<C: Connect> Drop for Pooled<C> {
    fn drop(&mut self) {
        if let (Some(conn), Some(pool)) = (self.conn.take(), self.pool.as_ref()) {
            pool.put(self.id, conn, false, false);
        }
    }
}

impl<C: Connect> fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.id)
            .field("reused", &self.reused)
            .finish()
    }
}
