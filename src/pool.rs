//! ConnectionPool - health-checked pool of database sessions
//!
//! # Architecture
//!
//! - A LIFO free list under a single mutex; the most recently released
//!   connection is handed out first so warm sessions stay warm
//! - `acquire` probes validity before returning and synchronously
//!   replaces a dead or missing connection, so callers never see an
//!   invalid handle; the pool may transiently exceed its target size
//!   under load (there is no blocking/waiting policy)
//! - `PooledConn` releases on drop: a valid connection rejoins the
//!   free list, an invalid one is closed
//! - A heartbeat thread sweeps the free list every interval and evicts
//!   dead connections; checked-out connections are never touched
//!
//! The mutex is held for list bookkeeping only; connect and execute
//! always run outside it. The sweep probes under the mutex, which is
//! acceptable because probes are cheap and the sweep competes only
//! with acquire/release bookkeeping.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{Connection, Connector};
use crate::error::Result;

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    free: Mutex<Vec<Box<dyn Connection>>>,
    size: usize,
    heartbeat_interval: Duration,
    /// Stop flag + wakeup for the heartbeat thread.
    stop: Mutex<bool>,
    stop_signal: Condvar,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Open `size` connections synchronously, then start the heartbeat
    /// thread. Fails if any initial connection cannot be established:
    /// an unreachable database at startup is fatal to the caller.
    pub fn new(
        connector: Arc<dyn Connector>,
        size: usize,
        heartbeat_interval: Duration,
    ) -> Result<Arc<Self>> {
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(connector.connect()?);
        }
        info!(size, "connection pool populated");

        let pool = Arc::new(Self {
            connector,
            free: Mutex::new(free),
            size,
            heartbeat_interval,
            stop: Mutex::new(false),
            stop_signal: Condvar::new(),
            heartbeat: Mutex::new(None),
        });

        let sweeper = Arc::clone(&pool);
        let handle = thread::Builder::new()
            .name("pool-heartbeat".to_string())
            .spawn(move || sweeper.heartbeat_loop())
            .expect("spawn heartbeat thread");
        *pool.heartbeat.lock().unwrap() = Some(handle);

        Ok(pool)
    }

    /// Hand out a valid connection.
    ///
    /// LIFO pop under the mutex; the validity probe and any
    /// replacement connect happen outside it. An empty free list opens
    /// a fresh connection rather than waiting.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledConn> {
        let popped = self.free.lock().unwrap().pop();

        let conn = match popped {
            Some(mut conn) => {
                if conn.is_valid() {
                    conn
                } else {
                    // Dead in the free list: close it and open a
                    // replacement in its place.
                    drop(conn);
                    debug!("discarded invalid pooled connection, reconnecting");
                    self.connector.connect()?
                }
            }
            None => self.connector.connect()?,
        };

        Ok(PooledConn {
            pool: Arc::clone(self),
            conn: Some(conn),
        })
    }

    /// Return path used by `PooledConn::drop`.
    fn release(&self, mut conn: Box<dyn Connection>) {
        if conn.is_valid() {
            self.free.lock().unwrap().push(conn);
        } else {
            debug!("released connection was invalid, closing");
            drop(conn);
        }
    }

    /// Probe every free connection and evict the dead ones. Returns
    /// the number evicted.
    pub fn sweep_now(&self) -> usize {
        let mut free = self.free.lock().unwrap();
        let before = free.len();
        free.retain_mut(|conn| conn.is_valid());
        let evicted = before - free.len();
        if evicted > 0 {
            warn!(evicted, remaining = free.len(), "heartbeat evicted dead connections");
        }
        evicted
    }

    fn heartbeat_loop(&self) {
        debug!(interval_secs = self.heartbeat_interval.as_secs(), "heartbeat started");
        let mut stopped = self.stop.lock().unwrap();
        while !*stopped {
            let (guard, timeout) = self
                .stop_signal
                .wait_timeout(stopped, self.heartbeat_interval)
                .unwrap();
            stopped = guard;
            if !*stopped && timeout.timed_out() {
                drop(stopped);
                self.sweep_now();
                stopped = self.stop.lock().unwrap();
            }
        }
        debug!("heartbeat stopped");
    }

    /// Stop the heartbeat thread (signal, then wait for it to exit)
    /// and close every connection still in the free list. Connections
    /// checked out at shutdown time are not tracked and close when
    /// their guards drop.
    pub fn shutdown(&self) {
        {
            let mut stopped = self.stop.lock().unwrap();
            *stopped = true;
        }
        self.stop_signal.notify_all();

        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            let _ = handle.join();
        }

        let mut free = self.free.lock().unwrap();
        let closed = free.len();
        free.clear();
        info!(closed, "connection pool shut down");
    }

    /// Connections currently in the free list.
    pub fn idle_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Configured target size (the free list may briefly exceed it).
    pub fn target_size(&self) -> usize {
        self.size
    }
}

/// Exclusive handle to a pooled connection.
///
/// Dropping the guard returns the connection to the pool, so every
/// exit path of a request handler (including a panic unwind)
/// releases exactly once.
pub struct PooledConn {
    pool: Arc<ConnectionPool>,
    conn: Option<Box<dyn Connection>>,
}

impl Deref for PooledConn {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection already released")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection already released")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
