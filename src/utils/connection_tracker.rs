//! Per-connection activity tracking.
//!
//! Each accepted connection keeps a small record of how many requests are in
//! flight on it and when it last finished one. The server uses it to close
//! keep-alive connections that have sat idle longer than the configured
//! idle timeout.
use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, sleep};

/// Activity record for one accepted connection.
#[derive(Debug)]
pub struct ConnectionActivity {
    remote_addr: SocketAddr,
    established_at: Instant,
    in_flight: AtomicUsize,
    last_active: Mutex<Instant>,
}

impl ConnectionActivity {
    pub fn new(remote_addr: SocketAddr) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            remote_addr,
            established_at: now,
            in_flight: AtomicUsize::new(0),
            last_active: Mutex::new(now),
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Mark a request as started. The connection counts as busy until the
    /// returned guard is dropped.
    pub fn begin_request(self: &Arc<Self>) -> RequestActivity {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        RequestActivity {
            connection: self.clone(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since the last request on this connection finished, or since the
    /// connection was accepted if none has.
    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    /// Resolve once the connection has had no request in flight for `idle`.
    pub async fn idle_expired(&self, idle: Duration) {
        loop {
            if self.in_flight() > 0 {
                sleep(idle).await;
                continue;
            }

            let elapsed = self.idle_for();
            if elapsed >= idle && self.in_flight() == 0 {
                return;
            }
            sleep(idle.saturating_sub(elapsed)).await;
        }
    }

    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

/// Drop guard for one in-flight request.
#[derive(Debug)]
pub struct RequestActivity {
    connection: Arc<ConnectionActivity>,
}

impl Drop for RequestActivity {
    fn drop(&mut self) {
        self.connection.touch();
        self.connection.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
