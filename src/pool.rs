//! Warm connection pool
//!
//! Setting up a call takes seconds, so each contact keeps a few connections
//! established ahead of time. A maintenance task tops the pool up to its
//! target size one connection per tick and evicts dead entries; callers take
//! a ready connection with [`ConnectionPool::get_best_available_connection`].
//!
//! The pool never plans more than `target_size` connections: the count of
//! live entries plus creations in flight is checked and reserved under the
//! same lock that commits new entries.

use crate::client::{ClientConfig, ProtocolClient};
use crate::credentials::TokenProvider;
use crate::protocol::ProtocolError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection failed: {0}")]
    Connect(#[from] ProtocolError),

    #[error("Pool has no credential provider")]
    NotInitialized,

    #[error("Pool is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Entry numbers are unique across every pool in the process.
static NEXT_ENTRY_SEQ: AtomicU64 = AtomicU64::new(1);

/// What the pool needs from a pooled connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Ready to carry a call.
    fn is_connected(&self) -> bool;
    /// Close the connection. Must be idempotent.
    async fn disconnect(&self);
    /// Resolves once the connection has ended for good.
    async fn closed(&self);
}

/// Builds connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Start a connection. It need not be ready yet; the pool polls
    /// [`Connection::is_connected`] afterwards.
    async fn connect(&self, key: &PoolKey, credential: String) -> Result<Self::Conn>;
}

#[async_trait]
impl Connection for ProtocolClient {
    fn is_connected(&self) -> bool {
        ProtocolClient::is_connected(self)
    }

    async fn disconnect(&self) {
        ProtocolClient::disconnect(self).await
    }

    async fn closed(&self) {
        self.wait_until_closed().await
    }
}

/// Opens real WebSocket connections.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: ClientConfig,
}

impl WsConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Conn = ProtocolClient;

    async fn connect(&self, key: &PoolKey, credential: String) -> Result<ProtocolClient> {
        let client = ProtocolClient::new(self.config.clone(), credential, key.character.clone());
        client.connect().await?;
        Ok(client)
    }
}

/// Identifies which calls a pooled connection can serve.
///
/// Contacts are written `Character-LANG`, e.g. `Miles-EN`. The language
/// defaults to `EN`. Some contacts are aliases for a backend character.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub contact: String,
    /// Backend character name, after alias mapping.
    pub character: String,
    pub language: String,
}

impl PoolKey {
    pub fn parse(contact: &str, aliases: &HashMap<String, String>) -> Self {
        let mut parts = contact.split('-');
        let name = parts.next().filter(|s| !s.is_empty()).unwrap_or(contact);
        let language = parts.next().filter(|s| !s.is_empty()).unwrap_or("EN");
        let character = aliases
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_else(|| name.to_string());
        Self {
            contact: contact.to_string(),
            character,
            language: language.to_string(),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contact)
    }
}

fn default_aliases() -> HashMap<String, String> {
    HashMap::from([
        ("kira".to_string(), "Maya".to_string()),
        ("hugo".to_string(), "Maya".to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub target_size: usize,
    /// Defaults to one minute divided by the target size.
    pub maintenance_interval_ms: Option<u64>,
    pub stagger_base_ms: u64,
    pub stagger_jitter_min_ms: u64,
    pub stagger_jitter_max_ms: u64,
    pub connect_attempts: u32,
    pub connect_poll_ms: u64,
    /// Dead entries younger than this are left alone.
    pub grace_period_ms: u64,
    pub error_backoff_ms: u64,
    /// Lower-case contact name → backend character.
    pub aliases: HashMap<String, String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_size: 3,
            maintenance_interval_ms: None,
            stagger_base_ms: 500,
            stagger_jitter_min_ms: 100,
            stagger_jitter_max_ms: 500,
            connect_attempts: 100,
            connect_poll_ms: 100,
            grace_period_ms: 15_000,
            error_backoff_ms: 10_000,
            aliases: default_aliases(),
        }
    }
}

impl PoolConfig {
    pub fn maintenance_interval(&self) -> Duration {
        match self.maintenance_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(60_000 / self.target_size.max(1) as u64),
        }
    }

    fn stagger(&self) -> Duration {
        let jitter = if self.stagger_jitter_max_ms > self.stagger_jitter_min_ms {
            rand::rng().random_range(self.stagger_jitter_min_ms..=self.stagger_jitter_max_ms)
        } else {
            self.stagger_jitter_min_ms
        };
        Duration::from_millis(self.stagger_base_ms + jitter)
    }
}

/// One pooled connection.
pub struct PoolEntry<T> {
    seq: u64,
    connection: Arc<T>,
    key: PoolKey,
    created_at: Instant,
    available: AtomicBool,
    in_use: AtomicBool,
    watch: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Connection> PoolEntry<T> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn connection(&self) -> &Arc<T> {
        &self.connection
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn is_ready(&self) -> bool {
        self.is_available() && !self.is_in_use() && self.connection.is_connected()
    }

    fn cancel_watch(&self) {
        if let Some(watch) = self.watch.lock().take() {
            watch.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub ready: usize,
    pub in_use: usize,
    pub pending: usize,
    pub target: usize,
    pub running: bool,
}

struct PoolState<T> {
    entries: Vec<Arc<PoolEntry<T>>>,
    pending: usize,
}

struct PoolInner<C: Connector> {
    key: PoolKey,
    config: PoolConfig,
    connector: Arc<C>,
    state: Mutex<PoolState<C::Conn>>,
    running: AtomicBool,
    tokens: Mutex<Option<Arc<dyn TokenProvider>>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Pool of warm connections for one contact.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(key: PoolKey, config: PoolConfig, connector: Arc<C>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                key,
                config,
                connector,
                state: Mutex::new(PoolState {
                    entries: Vec::new(),
                    pending: 0,
                }),
                running: AtomicBool::new(false),
                tokens: Mutex::new(None),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.inner.key
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Set the credential source and start maintenance if not yet running.
    pub fn initialize(&self, tokens: Arc<dyn TokenProvider>) {
        *self.inner.tokens.lock() = Some(tokens);
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(
                pool = %self.inner.key,
                size = self.inner.config.target_size,
                "Initializing connection pool"
            );
            let handle = tokio::spawn(maintain(self.inner.clone()));
            *self.inner.maintenance.lock() = Some(handle);
        }
    }

    /// Claim a ready connection for `key`. First match wins.
    pub fn get_best_available_connection(&self, key: &PoolKey) -> Option<Arc<PoolEntry<C::Conn>>> {
        let state = self.inner.state.lock();
        state
            .entries
            .iter()
            .find(|entry| {
                entry.key == *key
                    && entry.is_available()
                    && entry.connection.is_connected()
                    && entry.try_acquire()
            })
            .cloned()
    }

    /// Give a claimed connection back for reuse.
    pub fn return_connection(&self, entry: &PoolEntry<C::Conn>) {
        entry.in_use.store(false, Ordering::SeqCst);
    }

    /// Drop a connection from the pool and disconnect it. Idempotent.
    pub async fn remove_connection(&self, entry: &PoolEntry<C::Conn>) {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.entries.len();
            state.entries.retain(|e| e.seq != entry.seq);
            state.entries.len() != before
        };
        if removed {
            entry.cancel_watch();
            entry.available.store(false, Ordering::SeqCst);
            entry.connection.disconnect().await;
            debug!(pool = %self.inner.key, seq = entry.seq, "Connection removed");
        }
    }

    /// Stop maintenance and disconnect everything. Creations in flight
    /// notice the stop and disconnect their own connection.
    pub async fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        let entries = {
            let mut state = self.inner.state.lock();
            state.pending = 0;
            std::mem::take(&mut state.entries)
        };
        for entry in &entries {
            entry.cancel_watch();
            entry.connection.disconnect().await;
        }
        info!(pool = %self.inner.key, closed = entries.len(), "Connection pool shut down");
    }

    /// Entries plus creations in flight.
    pub fn planned(&self) -> usize {
        let state = self.inner.state.lock();
        state.entries.len() + state.pending
    }

    pub fn ready_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.entries.iter().filter(|e| e.is_ready()).count()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            total: state.entries.len(),
            ready: state.entries.iter().filter(|e| e.is_ready()).count(),
            in_use: state.entries.iter().filter(|e| e.is_in_use()).count(),
            pending: state.pending,
            target: self.inner.config.target_size,
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }
}

impl<C: Connector> Drop for ConnectionPool<C> {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
    }
}

async fn maintain<C: Connector>(inner: Arc<PoolInner<C>>) {
    let interval = inner.config.maintenance_interval();
    let backoff = Duration::from_millis(inner.config.error_backoff_ms);
    while inner.running.load(Ordering::SeqCst) {
        let delay = match inner.tick().await {
            Ok(()) => interval,
            Err(e) => {
                error!(pool = %inner.key, "Pool maintenance error: {}", e);
                backoff
            }
        };
        tokio::time::sleep(delay).await;
    }
}

impl<C: Connector> PoolInner<C> {
    async fn tick(self: &Arc<Self>) -> Result<()> {
        if !self.try_reserve() {
            self.evict_dead();
            return Ok(());
        }

        let tokens = self.tokens.lock().clone();
        let Some(tokens) = tokens else {
            self.release();
            return Err(PoolError::NotInitialized);
        };
        let Some(credential) = tokens.valid_token().await else {
            error!(pool = %self.key, "Cannot create connection: no valid token");
            self.release();
            return Ok(());
        };

        let stagger = self.config.stagger();
        if !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }
        if !self.running.load(Ordering::SeqCst) {
            self.release();
            return Err(PoolError::ShutDown);
        }

        let seq = NEXT_ENTRY_SEQ.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(create(self.clone(), credential, seq));
        Ok(())
    }

    /// Reserve a creation slot if the pool is below target.
    fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if state.entries.len() + state.pending < self.config.target_size {
            state.pending += 1;
            true
        } else {
            false
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Turn a reservation into an entry. False if the pool shut down meanwhile.
    fn commit(&self, entry: Arc<PoolEntry<C::Conn>>) -> bool {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        state.entries.push(entry);
        true
    }

    fn evict_dead(&self) {
        let grace = Duration::from_millis(self.config.grace_period_ms);
        let evicted: Vec<_> = {
            let mut state = self.state.lock();
            let (dead, live): (Vec<_>, Vec<_>) = state.entries.drain(..).partition(|e| {
                let expired = e.age() > grace && !e.connection.is_connected();
                let abandoned = !e.is_available() && !e.is_in_use();
                expired || abandoned
            });
            state.entries = live;
            dead
        };
        for entry in evicted {
            debug!(pool = %self.key, seq = entry.seq, "Evicting dead connection");
            entry.cancel_watch();
            tokio::spawn(async move { entry.connection.disconnect().await });
        }
    }
}

async fn create<C: Connector>(inner: Arc<PoolInner<C>>, credential: String, seq: u64) {
    info!(pool = %inner.key, seq, "Creating connection");
    let conn = match inner.connector.connect(&inner.key, credential).await {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            error!(pool = %inner.key, seq, "Error creating connection: {}", e);
            inner.release();
            return;
        }
    };

    let poll = Duration::from_millis(inner.config.connect_poll_ms);
    let mut attempts = 0;
    while !conn.is_connected()
        && attempts < inner.config.connect_attempts
        && inner.running.load(Ordering::SeqCst)
    {
        tokio::time::sleep(poll).await;
        attempts += 1;
    }
    if !inner.running.load(Ordering::SeqCst) {
        debug!(pool = %inner.key, seq, "Pool stopped during creation, discarding");
        conn.disconnect().await;
        inner.release();
        return;
    }
    if !conn.is_connected() {
        warn!(pool = %inner.key, seq, attempts, "Connection not ready in time, discarding");
        conn.disconnect().await;
        inner.release();
        return;
    }

    let entry = Arc::new(PoolEntry {
        seq,
        connection: conn.clone(),
        key: inner.key.clone(),
        created_at: Instant::now(),
        available: AtomicBool::new(true),
        in_use: AtomicBool::new(false),
        watch: Mutex::new(None),
    });

    let watched = Arc::downgrade(&entry);
    let watch = tokio::spawn(async move {
        conn.closed().await;
        if let Some(entry) = watched.upgrade() {
            entry.available.store(false, Ordering::SeqCst);
            debug!(seq = entry.seq, "Pooled connection closed");
        }
    });
    *entry.watch.lock() = Some(watch);

    if inner.commit(entry.clone()) {
        info!(pool = %inner.key, seq, "Connection ready");
    } else {
        entry.cancel_watch();
        entry.connection.disconnect().await;
    }
}

/// Caller-owned map from contact to its pool.
pub struct PoolRegistry<C: Connector> {
    config: PoolConfig,
    connector: Arc<C>,
    pools: Mutex<HashMap<String, Arc<ConnectionPool<C>>>>,
}

impl<C: Connector> PoolRegistry<C> {
    pub fn new(config: PoolConfig, connector: Arc<C>) -> Self {
        Self {
            config,
            connector,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn key_for(&self, contact: &str) -> PoolKey {
        PoolKey::parse(contact, &self.config.aliases)
    }

    pub fn get_or_create(&self, contact: &str) -> Arc<ConnectionPool<C>> {
        let mut pools = self.pools.lock();
        pools
            .entry(contact.to_string())
            .or_insert_with(|| {
                Arc::new(ConnectionPool::new(
                    self.key_for(contact),
                    self.config.clone(),
                    self.connector.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, contact: &str) -> Option<Arc<ConnectionPool<C>>> {
        self.pools.lock().get(contact).cloned()
    }

    /// Remove a pool and shut it down.
    pub async fn remove(&self, contact: &str) -> Option<Arc<ConnectionPool<C>>> {
        let pool = self.pools.lock().remove(contact)?;
        pool.shutdown().await;
        Some(pool)
    }

    pub async fn shutdown_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown().await;
        }
    }
}
