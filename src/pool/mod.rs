//! Bounded pool of authenticated FTP connections.
//!
//! Connections are created on demand up to a cap, handed out as exclusive
//! leases, and quit by a reaper thread once idle past the TTL. An address
//! change bumps the pool epoch: stale idle connections are quit on sight
//! and stale busy connections are quit when released.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::{Error, Result};
use crate::ftp::conn::{Connector, RemoteConn};

/// How a borrower hands a connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Broken,
}

struct PooledConn {
    id: u64,
    epoch: u64,
    conn: Box<dyn RemoteConn>,
    last_used: Instant,
}

/// Exclusive borrow of one pooled connection. Must be handed back with
/// [`ConnPool::release`]; dropping it without releasing leaks a pool slot.
pub struct Lease {
    id: u64,
    epoch: u64,
    conn: Box<dyn RemoteConn>,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Epoch of the address this connection was created against.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn conn(&mut self) -> &mut dyn RemoteConn {
        self.conn.as_mut()
    }
}

struct PoolState {
    addr: SocketAddr,
    idle: VecDeque<PooledConn>,
    busy: usize,
    next_id: u64,
}

pub struct ConnPool {
    connector: Box<dyn Connector>,
    state: Mutex<PoolState>,
    slot_freed: Condvar,
    reaper_tick: Condvar,
    epoch: AtomicU64,
    cap: usize,
    idle_ttl: Duration,
    connect_timeout: Duration,
    shutdown: AtomicBool,
    reaper: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ConnPool {
    pub fn new(
        connector: Box<dyn Connector>,
        addr: SocketAddr,
        cap: usize,
        idle_ttl: Duration,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            connector,
            state: Mutex::new(PoolState {
                addr,
                idle: VecDeque::new(),
                busy: 0,
                next_id: 1,
            }),
            slot_freed: Condvar::new(),
            reaper_tick: Condvar::new(),
            epoch: AtomicU64::new(0),
            cap,
            idle_ttl,
            connect_timeout,
            shutdown: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });
        let weak = Arc::downgrade(&pool);
        let handle = thread::Builder::new()
            .name("ftpfs-reaper".to_string())
            .spawn(move || reap_loop(weak))
            .expect("spawn reaper thread");
        *pool.reaper.lock().unwrap() = Some(handle);
        pool
    }

    /// Current address epoch; bumped by every [`ConnPool::invalidate_all`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Total connections, idle and leased.
    pub fn size(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.idle.len() + state.busy
    }

    /// Borrow an idle connection, or create one when the pool is under cap.
    /// Blocks until a slot frees or `deadline` passes.
    pub fn lease(&self, deadline: Duration) -> Result<Lease> {
        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Unavailable("connection pool is shut down".to_string()));
            }
            let epoch = self.epoch.load(Ordering::SeqCst);

            // Quit idle connections left over from a previous address.
            if state.idle.iter().any(|c| c.epoch != epoch) {
                let mut stale = Vec::new();
                let idle = std::mem::take(&mut state.idle);
                for c in idle {
                    if c.epoch == epoch {
                        state.idle.push_back(c);
                    } else {
                        stale.push(c);
                    }
                }
                drop(state);
                for mut c in stale {
                    tracing::debug!("conn {} is from epoch {}, quitting", c.id, c.epoch);
                    let _ = c.conn.quit();
                }
                state = self.state.lock().unwrap();
                continue;
            }

            if let Some(c) = state.idle.pop_front() {
                state.busy += 1;
                tracing::debug!("conn {} leased from pool", c.id);
                return Ok(Lease {
                    id: c.id,
                    epoch: c.epoch,
                    conn: c.conn,
                });
            }

            if state.idle.len() + state.busy < self.cap {
                // Reserve the slot before connecting so the cap holds even
                // while the lock is dropped for the handshake.
                state.busy += 1;
                let id = state.next_id;
                state.next_id += 1;
                let addr = state.addr;
                drop(state);
                return self.connect_slot(id, addr, epoch);
            }

            let waited = start.elapsed();
            if waited >= deadline {
                return Err(Error::Timeout(format!(
                    "no free pool slot within {:?}",
                    deadline
                )));
            }
            let (guard, _) = self
                .slot_freed
                .wait_timeout(state, deadline - waited)
                .unwrap();
            state = guard;
        }
    }

    fn connect_slot(&self, id: u64, addr: SocketAddr, epoch: u64) -> Result<Lease> {
        match self.connector.connect(addr, self.connect_timeout) {
            Ok(mut conn) => {
                if self.epoch.load(Ordering::SeqCst) != epoch
                    || self.shutdown.load(Ordering::SeqCst)
                {
                    // The address changed under us; this connection targets
                    // the old server.
                    let _ = conn.quit();
                    self.free_slot();
                    return Err(Error::BrokenConnection(
                        "address changed during connect".to_string(),
                    ));
                }
                tracing::debug!("conn {} connected to {}", id, addr);
                Ok(Lease { id, epoch, conn })
            }
            Err(e) => {
                self.free_slot();
                Err(e)
            }
        }
    }

    fn free_slot(&self) {
        let mut state = self.state.lock().unwrap();
        state.busy -= 1;
        drop(state);
        self.slot_freed.notify_one();
    }

    /// Hand a leased connection back.
    pub fn release(&self, lease: Lease, outcome: Outcome) {
        let Lease {
            id,
            epoch,
            mut conn,
        } = lease;
        let keep = outcome == Outcome::Ok
            && epoch == self.epoch.load(Ordering::SeqCst)
            && !self.shutdown.load(Ordering::SeqCst)
            && !conn.has_stream();
        if keep {
            let mut state = self.state.lock().unwrap();
            state.busy -= 1;
            state.idle.push_back(PooledConn {
                id,
                epoch,
                conn,
                last_used: Instant::now(),
            });
            drop(state);
            tracing::debug!("conn {} returned to pool", id);
        } else {
            let _ = conn.quit();
            let mut state = self.state.lock().unwrap();
            state.busy -= 1;
            drop(state);
            tracing::debug!("conn {} dropped on release ({:?})", id, outcome);
        }
        self.slot_freed.notify_one();
    }

    /// Bump the epoch (optionally installing a new address) and quit all
    /// idle connections. Busy connections are dropped when next released.
    pub fn invalidate_all(&self, new_addr: Option<SocketAddr>) {
        let drained: Vec<PooledConn> = {
            let mut state = self.state.lock().unwrap();
            if let Some(addr) = new_addr {
                state.addr = addr;
            }
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::info!(
                "pool invalidated (epoch {}, addr {})",
                epoch,
                state.addr
            );
            state.idle.drain(..).collect()
        };
        for mut c in drained {
            let _ = c.conn.quit();
        }
        self.slot_freed.notify_all();
    }

    /// Shut the pool down and join the reaper. Subsequent leases fail.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.invalidate_all(None);
        self.slot_freed.notify_all();
        self.reaper_tick.notify_all();
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn reap_loop(pool: Weak<ConnPool>) {
    loop {
        let Some(pool) = pool.upgrade() else { return };
        if pool.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let expired: Vec<PooledConn> = {
            let mut state = pool.state.lock().unwrap();
            let ttl = pool.idle_ttl;
            let mut expired = Vec::new();
            let mut i = 0;
            while i < state.idle.len() {
                if state.idle[i].last_used.elapsed() > ttl {
                    expired.push(state.idle.remove(i).unwrap());
                } else {
                    i += 1;
                }
            }
            expired
        };
        for mut c in expired {
            tracing::debug!("conn {} idle past TTL, quitting", c.id);
            let _ = c.conn.quit();
        }

        let state = pool.state.lock().unwrap();
        if pool.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = pool
            .reaper_tick
            .wait_timeout(state, pool.idle_ttl / 2)
            .unwrap();
    }
}
