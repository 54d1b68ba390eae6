//! Local Rendezvous
//!
//! In-process [`RendezvousService`] backed by a shared directory.
//!
//! Each process identity is acquired once with [`LocalRendezvous::acquire`]
//! and released when the handle drops, so two handles can never act as the
//! same user at the same time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::ids::{ExternalId, SessionId};
use crate::network::rendezvous::{RendezvousError, RendezvousEvent, RendezvousService};

/// One hosted session.
#[derive(Debug, Clone)]
struct SessionRecord {
    owner: ExternalId,
    capacity: u32,
    members: BTreeSet<ExternalId>,
    metadata: BTreeMap<String, String>,
    joinable: bool,
}

#[derive(Debug, Default)]
struct Directory {
    sessions: BTreeMap<SessionId, SessionRecord>,
    queues: HashMap<ExternalId, VecDeque<RendezvousEvent>>,
    acquired: HashSet<ExternalId>,
    fail_next_create: bool,
}

impl Directory {
    fn push(&mut self, identity: ExternalId, event: RendezvousEvent) {
        self.queues.entry(identity).or_default().push_back(event);
    }

    fn owned(&mut self, session: SessionId, identity: ExternalId) -> Result<&mut SessionRecord, RendezvousError> {
        let record = self
            .sessions
            .get_mut(&session)
            .ok_or(RendezvousError::UnknownSession(session))?;
        if record.owner != identity {
            return Err(RendezvousError::NotHost);
        }
        Ok(record)
    }
}

/// Shared session directory.
#[derive(Debug, Clone, Default)]
pub struct RendezvousDirectory {
    inner: Arc<Mutex<Directory>>,
}

impl RendezvousDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an invite: `identity` gets a `JoinRequested` event.
    pub fn invite(&self, session: SessionId, identity: ExternalId) {
        self.lock().push(identity, RendezvousEvent::JoinRequested { session });
    }

    /// Make the next `create` fail.
    #[cfg(test)]
    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = true;
    }

    /// Read metadata directly.
    pub fn metadata(&self, session: SessionId, key: &str) -> Option<String> {
        self.lock().sessions.get(&session)?.metadata.get(key).cloned()
    }

    /// Delete a metadata key.
    #[cfg(test)]
    pub fn remove_metadata(&self, session: SessionId, key: &str) {
        if let Some(record) = self.lock().sessions.get_mut(&session) {
            record.metadata.remove(key);
        }
    }

    /// Joinable flag.
    #[cfg(test)]
    pub fn is_joinable(&self, session: SessionId) -> Option<bool> {
        self.lock().sessions.get(&session).map(|r| r.joinable)
    }

    /// Capacity.
    #[cfg(test)]
    pub fn capacity(&self, session: SessionId) -> Option<u32> {
        self.lock().sessions.get(&session).map(|r| r.capacity)
    }

    /// Current members.
    #[cfg(test)]
    pub fn members(&self, session: SessionId) -> Vec<ExternalId> {
        self.lock()
            .sessions
            .get(&session)
            .map(|r| r.members.iter().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Directory> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One process's handle on the directory.
pub struct LocalRendezvous {
    directory: RendezvousDirectory,
    identity: ExternalId,
}

impl LocalRendezvous {
    /// Acquire `identity`. Fails if another live handle holds it.
    pub fn acquire(directory: &RendezvousDirectory, identity: ExternalId) -> Result<Self, RendezvousError> {
        let mut dir = directory.lock();
        if !dir.acquired.insert(identity) {
            return Err(RendezvousError::IdentityInUse(identity));
        }
        info!("Rendezvous acquired for {}", identity);
        Ok(Self { directory: directory.clone(), identity })
    }
}

impl Drop for LocalRendezvous {
    fn drop(&mut self) {
        let mut dir = self.directory.lock();
        dir.acquired.remove(&self.identity);
        dir.queues.remove(&self.identity);

        let identity = self.identity;
        for record in dir.sessions.values_mut() {
            record.members.remove(&identity);
        }
        dir.sessions.retain(|_, r| !r.members.is_empty());
        debug!("Rendezvous released for {}", identity);
    }
}

impl RendezvousService for LocalRendezvous {
    fn local_identity(&self) -> ExternalId {
        self.identity
    }

    fn create(&mut self, capacity: u32) {
        let mut dir = self.directory.lock();
        if std::mem::take(&mut dir.fail_next_create) {
            let error = RendezvousError::CreateFailed("service unavailable".to_string());
            dir.push(self.identity, RendezvousEvent::Created(Err(error)));
            return;
        }

        let bytes = Uuid::new_v4().into_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let id = SessionId(u64::from_be_bytes(head));
        dir.sessions.insert(id, SessionRecord {
            owner: self.identity,
            capacity,
            members: BTreeSet::from([self.identity]),
            metadata: BTreeMap::new(),
            joinable: false,
        });
        debug!("Session {} created by {} for {} members", id, self.identity, capacity);
        dir.push(self.identity, RendezvousEvent::Created(Ok(id)));
        dir.push(self.identity, RendezvousEvent::Entered { session: id });
    }

    fn join(&mut self, session: SessionId) {
        let mut dir = self.directory.lock();
        let identity = self.identity;

        let outcome = match dir.sessions.get_mut(&session) {
            None => Err(RendezvousError::UnknownSession(session)),
            Some(r) if r.members.contains(&identity) => Ok(()),
            Some(r) if !r.joinable => Err(RendezvousError::NotJoinable(session)),
            Some(r) if r.members.len() as u32 >= r.capacity => Err(RendezvousError::SessionFull(session)),
            Some(r) => {
                r.members.insert(identity);
                Ok(())
            }
        };

        let event = match outcome {
            Ok(()) => RendezvousEvent::Entered { session },
            Err(error) => RendezvousEvent::JoinFailed { session, error },
        };
        dir.push(identity, event);
    }

    fn leave(&mut self, session: SessionId) {
        let mut dir = self.directory.lock();
        let now_empty = match dir.sessions.get_mut(&session) {
            Some(r) => {
                r.members.remove(&self.identity);
                r.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            dir.sessions.remove(&session);
        }
    }

    fn metadata(&self, session: SessionId, key: &str) -> Option<String> {
        self.directory.metadata(session, key)
    }

    fn set_metadata(&mut self, session: SessionId, key: &str, value: &str) -> Result<(), RendezvousError> {
        let mut dir = self.directory.lock();
        let record = dir.owned(session, self.identity)?;
        record.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_joinable(&mut self, session: SessionId, joinable: bool) -> Result<(), RendezvousError> {
        let mut dir = self.directory.lock();
        dir.owned(session, self.identity)?.joinable = joinable;
        Ok(())
    }

    fn poll(&mut self) -> Vec<RendezvousEvent> {
        let mut dir = self.directory.lock();
        dir.queues
            .get_mut(&self.identity)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }
}
