//! Per-address pool of multiplexed connections.
//!
//! Each address owns an arena of connection entries threaded onto two
//! intrusive lists:
//!
//! ```text
//! available:  [c3] ⇄ [c1]        streams < max_streams
//! saturated:  [c2]               streams == max_streams
//! ```
//!
//! Acquire walks `available` once, retiring dead or expired idle entries
//! on the way. Release moves a connection back to the head of
//! `available` and decides whether an idle connection is kept.
//! Eviction is lazy; no timer touches the pool.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::net::ConnectionId;
use crate::observability::metrics;

/// Connectivity state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

/// A physical, multiplexed connection.
pub trait Transport: Clone + Send + Sync + 'static {
    fn state(&self) -> ConnState;

    /// Close the connection. Must be idempotent.
    fn close(&self);
}

/// Dials new transports.
pub trait Connector: Send + Sync + 'static {
    type Conn: Transport;

    fn connect(&self, addr: &str) -> impl Future<Output = Result<Self::Conn, PoolError>> + Send;
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum tracked connections per address.
    pub capacity: usize,
    /// Maximum connection age.
    pub ttl: Duration,
    /// Maximum idle (zero-stream) connections kept per address.
    pub max_idle: usize,
    /// Maximum concurrent calls per connection.
    pub max_streams: usize,
}

impl PoolConfig {
    pub fn new(capacity: usize, ttl: Duration, max_idle: usize, max_streams: usize) -> Self {
        Self {
            capacity,
            ttl,
            max_idle,
            max_streams: max_streams.max(1),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60), 50, 20)
    }
}

/// Snapshot of one address pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub available: usize,
    pub saturated: usize,
    pub open: usize,
    pub idle: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Available = 0,
    Saturated = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotRef {
    index: usize,
    generation: u64,
}

struct Entry<T> {
    conn: T,
    id: ConnectionId,
    created: Instant,
    streams: usize,
    list: List,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Entry<T>>,
}

/// Index-addressed storage for the two lists. Moving an entry between
/// lists is O(1).
struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    heads: [Option<usize>; 2],
    lens: [usize; 2],
    idle: usize,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heads: [None, None],
            lens: [0, 0],
            idle: 0,
        }
    }

    fn open(&self) -> usize {
        self.lens[0] + self.lens[1]
    }

    fn get(&self, index: usize) -> Option<&Entry<T>> {
        self.slots.get(index)?.entry.as_ref()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut Entry<T>> {
        self.slots.get_mut(index)?.entry.as_mut()
    }

    fn slot_ref(&self, index: usize) -> Option<SlotRef> {
        let slot = self.slots.get(index)?;
        slot.entry.as_ref()?;
        Some(SlotRef {
            index,
            generation: slot.generation,
        })
    }

    /// Index of a live entry, if the reference still points at it.
    fn resolve(&self, slot: SlotRef) -> Option<usize> {
        let current = self.slots.get(slot.index)?;
        (current.generation == slot.generation && current.entry.is_some()).then_some(slot.index)
    }

    fn push_front(&mut self, index: usize, list: List) {
        let head = self.heads[list as usize];
        let Some(entry) = self.get_mut(index) else { return };
        entry.list = list;
        entry.prev = None;
        entry.next = head;
        if let Some(old) = head.and_then(|h| self.get_mut(h)) {
            old.prev = Some(index);
        }
        self.heads[list as usize] = Some(index);
        self.lens[list as usize] += 1;
    }

    fn unlink(&mut self, index: usize) {
        let Some(entry) = self.get(index) else { return };
        let (list, prev, next) = (entry.list, entry.prev, entry.next);

        match prev {
            Some(p) => {
                if let Some(e) = self.get_mut(p) {
                    e.next = next;
                }
            }
            None => self.heads[list as usize] = next,
        }
        if let Some(e) = next.and_then(|n| self.get_mut(n)) {
            e.prev = prev;
        }
        if let Some(e) = self.get_mut(index) {
            e.prev = None;
            e.next = None;
        }
        self.lens[list as usize] -= 1;
    }

    fn move_to_front(&mut self, index: usize, list: List) {
        self.unlink(index);
        self.push_front(index, list);
    }

    fn insert(&mut self, entry: Entry<T>) -> SlotRef {
        let list = entry.list;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.generation += 1;
        slot.entry = Some(entry);
        let generation = slot.generation;
        self.push_front(index, list);
        SlotRef { index, generation }
    }

    fn remove(&mut self, index: usize) -> Option<Entry<T>> {
        self.unlink(index);
        let entry = self.slots.get_mut(index)?.entry.take();
        if entry.is_some() {
            self.free.push(index);
        }
        entry
    }

    fn indices(&self, list: List) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.lens[list as usize]);
        let mut cursor = self.heads[list as usize];
        while let Some(index) = cursor {
            out.push(index);
            cursor = self.get(index).and_then(|e| e.next);
        }
        out
    }
}

/// Connections to one destination address.
pub struct AddressPool<T: Transport> {
    addr: String,
    config: PoolConfig,
    arena: Mutex<Arena<T>>,
}

impl<T: Transport> AddressPool<T> {
    fn new(addr: &str, config: PoolConfig) -> Self {
        Self {
            addr: addr.to_string(),
            config,
            arena: Mutex::new(Arena::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn lock(&self) -> MutexGuard<'_, Arena<T>> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        let arena = self.lock();
        PoolStats {
            available: arena.lens[List::Available as usize],
            saturated: arena.lens[List::Saturated as usize],
            open: arena.open(),
            idle: arena.idle,
        }
    }

    /// Claim a stream on an existing connection, if one has room.
    fn try_claim(self: &Arc<Self>) -> Option<PooledConn<T>> {
        let now = Instant::now();
        let mut retired = Vec::new();

        let claimed = {
            let mut arena = self.lock();
            let mut cursor = arena.heads[List::Available as usize];
            let mut claimed = None;

            while let Some(index) = cursor {
                let Some(entry) = arena.get(index) else { break };
                cursor = entry.next;
                let idle = entry.streams == 0;
                let streams = entry.streams;
                let expired = now.duration_since(entry.created) > self.config.ttl;

                match entry.conn.state() {
                    ConnState::Connecting => continue,
                    ConnState::Shutdown => {
                        if idle {
                            arena.remove(index);
                            arena.idle = arena.idle.saturating_sub(1);
                        }
                        continue;
                    }
                    ConnState::TransientFailure => {
                        if idle {
                            retired.extend(arena.remove(index).map(|e| e.conn));
                            arena.idle = arena.idle.saturating_sub(1);
                        }
                        continue;
                    }
                    ConnState::Idle | ConnState::Ready => {}
                }

                if expired {
                    if idle {
                        retired.extend(arena.remove(index).map(|e| e.conn));
                        arena.idle = arena.idle.saturating_sub(1);
                    }
                    continue;
                }

                if streams >= self.config.max_streams {
                    arena.move_to_front(index, List::Saturated);
                    continue;
                }

                if idle {
                    arena.idle = arena.idle.saturating_sub(1);
                }
                let Some(entry) = arena.get_mut(index) else { break };
                entry.streams += 1;
                let at_cap = entry.streams >= self.config.max_streams;
                let (conn, id, created) = (entry.conn.clone(), entry.id, entry.created);
                if at_cap {
                    arena.move_to_front(index, List::Saturated);
                }
                claimed = arena
                    .slot_ref(index)
                    .map(|slot| (conn, id, created, slot));
                break;
            }
            claimed
        };

        for conn in retired {
            conn.close();
        }

        claimed.map(|(conn, id, created, slot)| PooledConn {
            pool: Arc::clone(self),
            conn,
            id,
            created,
            slot: Some(slot),
            released: false,
        })
    }

    /// Take ownership of a freshly dialed connection carrying one stream.
    /// It is tracked only while the pool is below capacity.
    fn admit(self: &Arc<Self>, conn: T) -> PooledConn<T> {
        let id = ConnectionId::new();
        let created = Instant::now();
        let slot = {
            let mut arena = self.lock();
            (arena.open() < self.config.capacity).then(|| {
                arena.insert(Entry {
                    conn: conn.clone(),
                    id,
                    created,
                    streams: 1,
                    list: List::Available,
                    prev: None,
                    next: None,
                })
            })
        };
        if slot.is_none() {
            debug!(addr = %self.addr, connection_id = %id, "Pool at capacity, connection is unpooled");
        }
        PooledConn {
            pool: Arc::clone(self),
            conn,
            id,
            created,
            slot,
            released: false,
        }
    }

    fn release(&self, slot: Option<SlotRef>, conn: &T, id: ConnectionId, created: Instant, failed: bool) {
        let close = {
            let mut arena = self.lock();
            self.release_locked(&mut arena, slot, conn, id, created, failed)
        };
        if close {
            conn.close();
        }
    }

    /// Returns whether the connection must be closed.
    fn release_locked(
        &self,
        arena: &mut Arena<T>,
        slot: Option<SlotRef>,
        conn: &T,
        id: ConnectionId,
        created: Instant,
        failed: bool,
    ) -> bool {
        let index = match slot.and_then(|s| arena.resolve(s)) {
            Some(index) => index,
            None => {
                if arena.open() >= self.config.capacity {
                    return true;
                }
                arena
                    .insert(Entry {
                        conn: conn.clone(),
                        id,
                        created,
                        streams: 1,
                        list: List::Available,
                        prev: None,
                        next: None,
                    })
                    .index
            }
        };

        let Some(entry) = arena.get(index) else { return true };
        if entry.list == List::Saturated || entry.streams >= self.config.max_streams {
            arena.move_to_front(index, List::Available);
        }

        let Some(entry) = arena.get_mut(index) else { return true };
        entry.streams = entry.streams.saturating_sub(1);
        if entry.streams > 0 {
            return false;
        }

        let expired = Instant::now().duration_since(entry.created) > self.config.ttl;
        if failed || arena.idle >= self.config.max_idle || expired {
            arena.remove(index);
            return true;
        }
        arena.idle += 1;
        false
    }

    /// Close and forget every idle connection.
    fn close_idle(&self) {
        let retired: Vec<T> = {
            let mut arena = self.lock();
            let mut retired = Vec::new();
            for list in [List::Available, List::Saturated] {
                for index in arena.indices(list) {
                    if arena.get(index).is_some_and(|e| e.streams == 0) {
                        retired.extend(arena.remove(index).map(|e| e.conn));
                    }
                }
            }
            arena.idle = 0;
            retired
        };
        for conn in retired {
            conn.close();
        }
    }
}

/// A claimed stream slot on a pooled connection.
///
/// Hand it back with [`PooledConn::release`]. Dropping it unreleased
/// counts as a failed call.
pub struct PooledConn<T: Transport> {
    pool: Arc<AddressPool<T>>,
    conn: T,
    id: ConnectionId,
    created: Instant,
    slot: Option<SlotRef>,
    released: bool,
}

impl<T: Transport> PooledConn<T> {
    pub fn transport(&self) -> &T {
        &self.conn
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        self.pool.addr()
    }

    /// Whether the pool tracked this connection when it was handed out.
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }

    pub fn release(mut self, failed: bool) {
        self.finish(failed);
    }

    fn finish(&mut self, failed: bool) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool
            .release(self.slot.take(), &self.conn, self.id, self.created, failed);
    }
}

impl<T: Transport> Drop for PooledConn<T> {
    fn drop(&mut self) {
        if !self.released {
            debug!(addr = %self.pool.addr, connection_id = %self.id, "Pooled connection dropped without release");
            self.finish(true);
        }
    }
}

impl<T: Transport> std::fmt::Debug for PooledConn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("addr", &self.pool.addr)
            .field("id", &self.id)
            .field("pooled", &self.slot.is_some())
            .finish()
    }
}

/// Address → pool map. Owned by the client; pools are created on first
/// use of an address.
pub struct PoolManager<C: Connector> {
    connector: C,
    config: PoolConfig,
    pools: DashMap<String, Arc<AddressPool<C::Conn>>>,
}

impl<C: Connector> PoolManager<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            pools: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn pool(&self, addr: &str) -> Arc<AddressPool<C::Conn>> {
        if let Some(pool) = self.pools.get(addr) {
            return Arc::clone(pool.value());
        }
        let entry = self
            .pools
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(AddressPool::new(addr, self.config.clone())));
        Arc::clone(entry.value())
    }

    /// Get a connection with a free stream slot, dialing if needed.
    pub async fn acquire(&self, addr: &str) -> Result<PooledConn<C::Conn>, PoolError> {
        let pool = self.pool(addr);
        if let Some(conn) = pool.try_claim() {
            return Ok(conn);
        }

        let conn = match self.connector.connect(addr).await {
            Ok(conn) => {
                metrics::record_pool_dial(addr, true);
                conn
            }
            Err(e) => {
                metrics::record_pool_dial(addr, false);
                return Err(e);
            }
        };

        let handle = pool.admit(conn);
        let stats = pool.stats();
        metrics::record_pool_state(addr, &stats);
        debug!(
            addr,
            connection_id = %handle.id(),
            open = stats.open,
            pooled = handle.is_pooled(),
            "Dialed new connection"
        );
        Ok(handle)
    }

    /// Drop the whole pool for an address. Idle connections are closed;
    /// connections still in use are closed when released.
    pub fn evict(&self, addr: &str) -> bool {
        match self.pools.remove(addr) {
            Some((_, pool)) => {
                pool.close_idle();
                metrics::record_pool_eviction(addr);
                warn!(addr, "Evicted connection pool");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self, addr: &str) -> Option<PoolStats> {
        self.pools.get(addr).map(|pool| pool.stats())
    }

    pub fn addresses(&self) -> Vec<String> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone)]
    struct MockConn {
        serial: usize,
        state: Arc<Mutex<ConnState>>,
        closed: Arc<AtomicBool>,
    }

    impl MockConn {
        fn set_state(&self, state: ConnState) {
            *self.state.lock().unwrap() = state;
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockConn {
        fn state(&self) -> ConnState {
            *self.state.lock().unwrap()
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            *self.state.lock().unwrap() = ConnState::Shutdown;
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        dialed: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
        conns: Arc<Mutex<Vec<MockConn>>>,
    }

    impl MockConnector {
        fn dialed(&self) -> usize {
            self.dialed.load(Ordering::SeqCst)
        }

        fn conn(&self, serial: usize) -> MockConn {
            self.conns.lock().unwrap()[serial].clone()
        }
    }

    impl Connector for MockConnector {
        type Conn = MockConn;

        async fn connect(&self, addr: &str) -> Result<MockConn, PoolError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(PoolError::Dial {
                    addr: addr.to_string(),
                    reason: "refused".into(),
                });
            }
            let serial = self.dialed.fetch_add(1, Ordering::SeqCst);
            let conn = MockConn {
                serial,
                state: Arc::new(Mutex::new(ConnState::Ready)),
                closed: Arc::new(AtomicBool::new(false)),
            };
            self.conns.lock().unwrap().push(conn.clone());
            Ok(conn)
        }
    }

    const ADDR: &str = "10.0.0.1:10000";

    fn manager(config: PoolConfig) -> (PoolManager<MockConnector>, MockConnector) {
        let connector = MockConnector::default();
        (PoolManager::new(connector.clone(), config), connector)
    }

    fn assert_invariants(pools: &PoolManager<MockConnector>) {
        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.available + stats.saturated, stats.open);
        assert!(stats.open <= pools.config().capacity);
        assert!(stats.idle <= pools.config().max_idle);

        let pool = pools.pool(ADDR);
        let arena = pool.lock();
        for index in arena.indices(List::Available) {
            assert!(arena.get(index).unwrap().streams < pools.config().max_streams);
        }
        for index in arena.indices(List::Saturated) {
            assert!(arena.get(index).unwrap().streams <= pools.config().max_streams);
        }
    }

    #[tokio::test]
    async fn streams_share_one_connection_until_cap() {
        let (pools, connector) = manager(PoolConfig::new(10, Duration::from_secs(60), 5, 3));

        let a = pools.acquire(ADDR).await.unwrap();
        let b = pools.acquire(ADDR).await.unwrap();
        let c = pools.acquire(ADDR).await.unwrap();
        assert_eq!(connector.dialed(), 1);
        assert_eq!(a.transport().serial, c.transport().serial);

        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.saturated, 1);
        assert_eq!(stats.available, 0);
        assert_invariants(&pools);

        for conn in [a, b, c] {
            conn.release(false);
        }
        assert_invariants(&pools);
    }

    #[tokio::test]
    async fn second_connection_opened_past_stream_cap() {
        let (pools, connector) = manager(PoolConfig::new(10, Duration::from_secs(60), 5, 2));

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pools.acquire(ADDR).await.unwrap());
        }
        assert_eq!(connector.dialed(), 2);
        assert_ne!(held[0].transport().serial, held[2].transport().serial);

        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.open, 2);
        assert_eq!(stats.saturated, 1);
        assert_invariants(&pools);

        for conn in held {
            conn.release(false);
        }
        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.saturated, 0);
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test]
    async fn released_connection_is_reused() {
        let (pools, connector) = manager(PoolConfig::default());

        pools.acquire(ADDR).await.unwrap().release(false);
        assert_eq!(pools.stats(ADDR).unwrap().idle, 1);

        let again = pools.acquire(ADDR).await.unwrap();
        assert_eq!(connector.dialed(), 1);
        assert_eq!(pools.stats(ADDR).unwrap().idle, 0);
        again.release(false);
    }

    #[tokio::test]
    async fn idle_ceiling_closes_extra_connections() {
        let (pools, connector) = manager(PoolConfig::new(10, Duration::from_secs(60), 1, 1));

        let a = pools.acquire(ADDR).await.unwrap();
        let b = pools.acquire(ADDR).await.unwrap();
        a.release(false);
        b.release(false);

        assert!(!connector.conn(0).is_closed());
        assert!(connector.conn(1).is_closed());
        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);
        assert_invariants(&pools);
    }

    #[tokio::test]
    async fn failed_call_closes_idle_connection() {
        let (pools, connector) = manager(PoolConfig::default());

        pools.acquire(ADDR).await.unwrap().release(true);
        assert!(connector.conn(0).is_closed());
        assert_eq!(pools.stats(ADDR).unwrap().open, 0);
    }

    #[tokio::test]
    async fn dropped_handle_counts_as_failure() {
        let (pools, connector) = manager(PoolConfig::default());

        drop(pools.acquire(ADDR).await.unwrap());
        assert!(connector.conn(0).is_closed());
        assert_eq!(pools.stats(ADDR).unwrap().open, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_idle_connection_is_retired() {
        let (pools, connector) = manager(PoolConfig::new(10, Duration::from_secs(60), 5, 5));

        pools.acquire(ADDR).await.unwrap().release(false);
        tokio::time::advance(Duration::from_secs(61)).await;

        let fresh = pools.acquire(ADDR).await.unwrap();
        assert_eq!(connector.dialed(), 2);
        assert!(connector.conn(0).is_closed());
        assert_eq!(fresh.transport().serial, 1);
        fresh.release(false);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_busy_connection_closes_on_last_release() {
        let (pools, connector) = manager(PoolConfig::new(10, Duration::from_secs(60), 5, 5));

        let busy = pools.acquire(ADDR).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        // Not retired while a stream is in flight.
        let other = pools.acquire(ADDR).await.unwrap();
        assert_eq!(connector.dialed(), 2);
        assert!(!connector.conn(0).is_closed());

        busy.release(false);
        assert!(connector.conn(0).is_closed());
        other.release(false);
    }

    #[tokio::test]
    async fn unhealthy_idle_connections_are_skipped() {
        let (pools, connector) = manager(PoolConfig::default());

        pools.acquire(ADDR).await.unwrap().release(false);
        connector.conn(0).set_state(ConnState::TransientFailure);

        let next = pools.acquire(ADDR).await.unwrap();
        assert_eq!(next.transport().serial, 1);
        assert!(connector.conn(0).is_closed());
        assert_eq!(pools.stats(ADDR).unwrap().open, 1);
        next.release(false);
        assert_invariants(&pools);
    }

    #[tokio::test]
    async fn connecting_entries_are_left_alone() {
        let (pools, connector) = manager(PoolConfig::default());

        pools.acquire(ADDR).await.unwrap().release(false);
        connector.conn(0).set_state(ConnState::Connecting);

        let next = pools.acquire(ADDR).await.unwrap();
        assert_eq!(next.transport().serial, 1);
        assert!(!connector.conn(0).is_closed());
        assert_eq!(pools.stats(ADDR).unwrap().open, 2);
        next.release(false);
    }

    #[tokio::test]
    async fn over_capacity_connections_are_unpooled() {
        let (pools, connector) = manager(PoolConfig::new(1, Duration::from_secs(60), 5, 1));

        let first = pools.acquire(ADDR).await.unwrap();
        let second = pools.acquire(ADDR).await.unwrap();
        assert!(first.is_pooled());
        assert!(!second.is_pooled());
        assert_eq!(pools.stats(ADDR).unwrap().open, 1);

        second.release(false);
        assert!(connector.conn(1).is_closed());
        first.release(false);
        assert_eq!(pools.stats(ADDR).unwrap().idle, 1);
    }

    #[tokio::test]
    async fn unpooled_connection_readmitted_when_room() {
        let (pools, connector) = manager(PoolConfig::new(1, Duration::from_secs(60), 5, 1));

        let first = pools.acquire(ADDR).await.unwrap();
        let second = pools.acquire(ADDR).await.unwrap();
        first.release(true);
        second.release(false);

        assert!(connector.conn(0).is_closed());
        assert!(!connector.conn(1).is_closed());
        let stats = pools.stats(ADDR).unwrap();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.idle, 1);
        assert_invariants(&pools);
    }

    #[tokio::test]
    async fn dial_failure_surfaces() {
        let (pools, connector) = manager(PoolConfig::default());
        connector.fail.store(true, Ordering::SeqCst);

        let err = pools.acquire(ADDR).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(pools.stats(ADDR).unwrap().open, 0);
    }

    #[tokio::test]
    async fn evict_drops_pool_and_idle_connections() {
        let (pools, connector) = manager(PoolConfig::default());

        let busy = pools.acquire(ADDR).await.unwrap();
        let done = pools.acquire(ADDR).await.unwrap();
        assert_eq!(connector.dialed(), 1);
        done.release(false);

        assert!(pools.evict(ADDR));
        assert!(pools.stats(ADDR).is_none());
        assert!(!connector.conn(0).is_closed());

        busy.release(true);
        assert!(connector.conn(0).is_closed());

        pools.acquire(ADDR).await.unwrap().release(false);
        assert_eq!(connector.dialed(), 2);
        assert!(!pools.evict("unknown:1"));
    }

    #[tokio::test]
    async fn churn_keeps_invariants() {
        let (pools, _connector) = manager(PoolConfig::new(4, Duration::from_secs(60), 2, 3));
        let mut held = Vec::new();

        for round in 0..60 {
            if round % 3 == 2 {
                if let Some(conn) = held.pop() {
                    let conn: PooledConn<MockConn> = conn;
                    conn.release(round % 7 == 0);
                }
            } else {
                held.push(pools.acquire(ADDR).await.unwrap());
            }
            assert_invariants(&pools);
        }

        for conn in held.drain(..) {
            conn.release(false);
            assert_invariants(&pools);
        }
    }
}
