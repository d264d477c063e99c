//! Session table: the sessions of one local endpoint

use super::session::{Collaborators, Reception, Session, SessionOptions, SessionParams};
use super::stats::SessionStats;
use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::media::timer::FiredTimer;
use crate::infrastructure::metrics;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sessions are looked up by remote address and local RTP port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub remote: IpAddr,
    pub local_port: u16,
}

impl SessionKey {
    pub fn new(remote: IpAddr, local_port: u16) -> Self {
        Self { remote, local_port }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.remote, self.local_port)
    }
}

/// Session table
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionKey, Session>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and register it. An inactive session under the same key is replaced.
    pub fn create(
        &mut self,
        params: SessionParams,
        options: SessionOptions,
        collaborators: Collaborators,
        now: Duration,
    ) -> Result<SessionKey> {
        let key = SessionKey::new(params.remote.ip(), params.local.port());
        if self.sessions.get(&key).is_some_and(Session::is_active) {
            return Err(EngineError::InvalidOperation(format!(
                "session {} already exists",
                key
            )));
        }

        let session = Session::new(params, options, collaborators, now)?;
        self.insert(session)?;
        Ok(key)
    }

    /// Register an existing session
    pub fn insert(&mut self, session: Session) -> Result<()> {
        let key = session.key();
        if self.sessions.get(&key).is_some_and(Session::is_active) {
            return Err(EngineError::InvalidOperation(format!(
                "session {} already exists",
                key
            )));
        }
        self.sessions.insert(key, session);
        metrics::update_active_sessions(self.active_count());
        Ok(())
    }

    pub fn remove(&mut self, key: SessionKey) -> Option<Session> {
        let removed = self.sessions.remove(&key);
        if removed.is_some() {
            debug!("Session {} removed from table", key);
            metrics::update_active_sessions(self.active_count());
        }
        removed
    }

    pub fn get(&self, key: SessionKey) -> Option<&Session> {
        self.sessions.get(&key)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(&key)
    }

    /// Find the session for a datagram from `remote` arriving on `local_port`
    pub fn lookup(&self, remote: SocketAddr, local_port: u16) -> Option<&Session> {
        self.get(SessionKey::new(remote.ip(), local_port))
    }

    /// Active session under `key`, or the matching error
    pub fn active_mut(&mut self, key: SessionKey) -> Result<&mut Session> {
        match self.sessions.get_mut(&key) {
            Some(session) if session.is_active() => Ok(session),
            Some(_) => Err(EngineError::SessionInactive {
                remote: key.remote,
                local_port: key.local_port,
            }),
            None => Err(EngineError::SessionNotFound {
                remote: key.remote,
                local_port: key.local_port,
            }),
        }
    }

    /// Statistics of the session under `key`, active or not
    pub fn stats(&self, key: SessionKey) -> Result<SessionStats> {
        self.sessions
            .get(&key)
            .map(Session::stats)
            .ok_or(EngineError::SessionNotFound {
                remote: key.remote,
                local_port: key.local_port,
            })
    }

    /// Terminate the session under `key`; it stays in the table, inactive
    pub fn terminate(&mut self, key: SessionKey, now: Duration) -> Result<()> {
        let result = self.active_mut(key).and_then(|session| session.terminate(now));
        match &result {
            Ok(()) => {
                info!("Terminated session {}", key);
                metrics::update_active_sessions(self.active_count());
            }
            Err(e) => warn!("Terminate failed: {}", e),
        }
        result
    }

    pub fn dispatch_rtp(
        &mut self,
        local_port: u16,
        datagram: &[u8],
        source: SocketAddr,
        now: Duration,
    ) -> Result<Reception> {
        let key = SessionKey::new(source.ip(), local_port);
        self.active_mut(key)?.on_rtp(datagram, source, now)
    }

    pub fn dispatch_rtcp(
        &mut self,
        local_port: u16,
        datagram: &[u8],
        source: SocketAddr,
        now: Duration,
    ) -> Result<()> {
        let key = SessionKey::new(source.ip(), local_port);
        let session = self.active_mut(key)?;
        session.on_rtcp(datagram, source, now)?;
        if !session.is_active() {
            metrics::update_active_sessions(self.active_count());
        }
        Ok(())
    }

    /// Route a fired timer. Timers of removed sessions are dropped.
    pub fn dispatch_timer(&mut self, timer: &FiredTimer, now: Duration) -> Result<()> {
        match self.sessions.get_mut(&timer.key) {
            Some(session) => session.on_timer(timer, now),
            None => {
                debug!("Dropping {:?} timer for unknown session {}", timer.kind, timer.key);
                Ok(())
            }
        }
    }

    /// Remove inactive sessions, returning their final statistics
    pub fn purge_inactive(&mut self) -> Vec<(SessionKey, SessionStats)> {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| !s.is_active())
            .map(|(k, _)| *k)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.sessions.remove(&key).map(|s| (key, s.stats())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SessionKey> {
        self.sessions.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionKey, &Session)> {
        self.sessions.iter()
    }
}
