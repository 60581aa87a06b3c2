//! Process-wide transport handle and writer identity.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::env_vars;
use crate::error::{Error, Result};
use crate::sample::Origin;
use crate::session::SessionInner;
use crate::time::TimeService;
use crate::transport::Transport;

struct DomainInner {
    transport: Arc<dyn Transport>,
    time: Arc<TimeService>,
    host: i32,
    origin: u32,
    default_identity: String,
    num_read_loops: AtomicUsize,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
}

/// Shared by every session of a process.
///
/// Holds the transport, the time service and the identity stamped on
/// outgoing messages. Cloning is cheap.
#[derive(Clone)]
pub struct Domain {
    inner: Arc<DomainInner>,
}

impl Domain {
    /// Create a domain, taking the host id from [`env_vars::HOST_IP`] if set.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self> {
        let host = match std::env::var(env_vars::HOST_IP) {
            Ok(ip) => host_from_ip(&ip)?,
            Err(_) => rand::random::<i32>(),
        };
        Ok(Self::with_parts(
            transport,
            Arc::new(TimeService::builtin()),
            host,
        ))
    }

    /// Create a domain from explicit parts.
    pub fn with_parts(transport: Arc<dyn Transport>, time: Arc<TimeService>, host: i32) -> Self {
        let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
        let default_identity = format!("{user}@{}", Ipv4Addr::from(host as u32));
        Self {
            inner: Arc::new(DomainInner {
                transport,
                time,
                host,
                origin: std::process::id(),
                default_identity,
                num_read_loops: AtomicUsize::new(0),
                sessions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn time(&self) -> &Arc<TimeService> {
        &self.inner.time
    }

    pub fn host(&self) -> i32 {
        self.inner.host
    }

    pub fn origin(&self) -> u32 {
        self.inner.origin
    }

    /// Identity used by sessions that do not configure their own.
    pub fn default_identity(&self) -> &str {
        &self.inner.default_identity
    }

    /// Origin stamped on messages written with `identity`.
    pub fn origin_for(&self, identity: &str) -> Origin {
        Origin {
            identity: identity.to_string(),
            origin: self.inner.origin,
            host: self.inner.host,
        }
    }

    /// Number of session wait workers currently running.
    pub fn num_read_loops(&self) -> usize {
        self.inner.num_read_loops.load(Ordering::SeqCst)
    }

    pub(crate) fn read_loop_started(&self) {
        self.inner.num_read_loops.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn read_loop_stopped(&self) {
        self.inner.num_read_loops.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn register_session(&self, session: Weak<SessionInner>) {
        let mut sessions = self.inner.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(session);
    }

    /// Number of sessions that are still alive.
    pub fn num_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|s| s.strong_count() > 0)
            .count()
    }

    /// Close every session created on this domain.
    pub async fn close(&self) {
        let sessions: Vec<Arc<SessionInner>> = self
            .inner
            .sessions
            .lock()
            .drain(..)
            .filter_map(|s| s.upgrade())
            .collect();
        for session in sessions {
            SessionInner::close(&session).await;
        }
    }
}

fn host_from_ip(ip: &str) -> Result<i32> {
    let addr: Ipv4Addr = ip.trim().parse().map_err(|_| {
        Error::Config(format!("{}={ip:?} is not an IPv4 address", env_vars::HOST_IP))
    })?;
    Ok(u32::from(addr) as i32)
}
