//! In-process storage collaborator

use parking_lot::Mutex;
use std::collections::HashMap;

use super::{SessionRecord, SessionStats, Storage};
use crate::types::{FlowId, FlowKey, Sample, SessionId};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    sessions: Vec<SessionRecord>,
    flows: HashMap<(SessionId, FlowKey), FlowId>,
    flow_sessions: HashMap<FlowId, SessionId>,
    pending: Vec<Sample>,
    committed: Vec<Sample>,
    commits: usize,
    registrations: usize,
}

/// Storage that keeps everything in memory.
///
/// Used when no database is configured, and by tests to inspect what a
/// session persisted. Staged samples only become visible through
/// [`MemoryStorage::committed`] after a commit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples made durable so far, in commit order.
    pub fn committed(&self) -> Vec<Sample> {
        self.inner.lock().committed.clone()
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    /// Number of flows registered since creation, across cache clears.
    pub fn flow_registrations(&self) -> usize {
        self.inner.lock().registrations
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.inner.lock().sessions.clone()
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn register_session(&self, session: &SessionRecord) -> Result<SessionId> {
        let mut inner = self.inner.lock();
        inner.sessions.push(session.clone());
        Ok(inner.sessions.len() as SessionId)
    }

    async fn register_flow(&self, session: SessionId, flow: &FlowKey) -> Result<FlowId> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.flows.get(&(session, flow.clone())) {
            return Ok(*id);
        }
        inner.registrations += 1;
        let id = inner.registrations as FlowId;
        inner.flows.insert((session, flow.clone()), id);
        inner.flow_sessions.insert(id, session);
        Ok(id)
    }

    async fn persist(&self, sample: &Sample) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Sample::Packet(summary) = sample {
            if !inner.flow_sessions.contains_key(&summary.flow_id) {
                return Err(Error::persistence(format!(
                    "packet summary references unknown flow {}",
                    summary.flow_id
                )));
            }
        }
        inner.pending.push(sample.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        inner.committed.extend(pending);
        inner.commits += 1;
        Ok(())
    }

    async fn clear_cache(&self) {
        self.inner.lock().flows.clear();
    }

    async fn session_stats(&self, session: SessionId) -> Result<SessionStats> {
        let inner = self.inner.lock();
        let mut stats = SessionStats { load_kbits: None, start_ms: 0, end_ms: 0 };
        let mut seen = false;

        for sample in &inner.committed {
            let Sample::Packet(summary) = sample else { continue };
            if inner.flow_sessions.get(&summary.flow_id) != Some(&session) {
                continue;
            }
            stats.load_kbits = Some(stats.load_kbits.unwrap_or(0).max(summary.load_kbits));
            if !seen {
                stats.start_ms = summary.timestamp_ms;
                stats.end_ms = summary.timestamp_ms;
                seen = true;
            } else {
                stats.start_ms = stats.start_ms.min(summary.timestamp_ms);
                stats.end_ms = stats.end_ms.max(summary.timestamp_ms);
            }
        }
        Ok(stats)
    }

    fn has_db_connection(&self) -> bool {
        false
    }
}
