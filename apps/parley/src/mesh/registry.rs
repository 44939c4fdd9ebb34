use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{PeerNotice, PeerSession, SessionContext};
use crate::media::{TrackChange, TrackManager};
use crate::transport::{TransportError, TransportFactory};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("refusing to connect to self")]
    SelfConnectionRefused,
    #[error("peer limit of {max} reached")]
    CapacityExceeded { max: usize },
    #[error("peer {0} was closed during setup")]
    ClosedDuringSetup(String),
    #[error("mesh is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Changes made by one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub closed: Vec<String>,
    pub failed: Vec<(String, RegistryError)>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.closed.is_empty() && self.failed.is_empty()
    }
}

type SessionCell = Arc<OnceCell<Arc<PeerSession>>>;

/// Peer sessions keyed by peer id, kept in line with room membership.
///
/// Entries are inserted before their session is built, so concurrent creates for one
/// peer share a single transport and in-flight builds count toward capacity.
pub struct PeerRegistry {
    ctx: SessionContext,
    max_peers: usize,
    debounce: Duration,
    transports: Arc<dyn TransportFactory>,
    tracks: Arc<TrackManager>,
    sessions: Mutex<HashMap<String, SessionCell>>,
    members: Mutex<BTreeSet<String>>,
    pending: Mutex<Option<BTreeSet<String>>>,
    last_reconciled: AsyncMutex<Option<BTreeSet<String>>>,
    cancel: CancellationToken,
}

impl PeerRegistry {
    pub fn new(
        ctx: SessionContext,
        max_peers: usize,
        debounce: Duration,
        transports: Arc<dyn TransportFactory>,
        tracks: Arc<TrackManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            max_peers,
            debounce,
            transports,
            tracks,
            sessions: Mutex::new(HashMap::new()),
            members: Mutex::new(BTreeSet::new()),
            pending: Mutex::new(None),
            last_reconciled: AsyncMutex::new(None),
            cancel,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.ctx.local_id
    }

    pub fn is_member(&self, peer_id: &str) -> bool {
        self.members.lock().contains(peer_id)
    }

    pub fn members(&self) -> BTreeSet<String> {
        self.members.lock().clone()
    }

    /// Live plus in-flight sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.sessions
            .lock()
            .get(peer_id)
            .and_then(|cell| cell.get().cloned())
    }

    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Records a membership snapshot and schedules a debounced reconcile. Snapshots
    /// arriving before the timer fires replace the pending one.
    pub fn update_membership<I>(self: &Arc<Self>, members: I)
    where
        I: IntoIterator<Item = String>,
    {
        let members: BTreeSet<String> = members
            .into_iter()
            .filter(|id| *id != self.ctx.local_id)
            .collect();
        *self.members.lock() = members.clone();
        let schedule = self.pending.lock().replace(members).is_none();
        if !schedule {
            return;
        }
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = registry.cancel.cancelled() => return,
                _ = tokio::time::sleep(registry.debounce) => {}
            }
            let Some(snapshot) = registry.pending.lock().take() else {
                return;
            };
            let report = registry.reconcile(snapshot).await;
            if !report.is_empty() {
                debug!(
                    target: "parley::mesh",
                    created = report.created.len(),
                    closed = report.closed.len(),
                    failed = report.failed.len(),
                    "membership reconciled"
                );
            }
        });
    }

    /// Closes sessions for departed peers, then creates sessions for new ones. A
    /// snapshot equal to the last reconciled one does nothing.
    pub async fn reconcile(&self, members: BTreeSet<String>) -> ReconcileReport {
        let mut last = self.last_reconciled.lock().await;
        let mut report = ReconcileReport::default();
        if self.cancel.is_cancelled() || last.as_ref() == Some(&members) {
            return report;
        }

        let stale: Vec<String> = self
            .sessions
            .lock()
            .keys()
            .filter(|peer_id| !members.contains(*peer_id))
            .cloned()
            .collect();
        for peer_id in stale {
            if self.close(&peer_id).await {
                report.closed.push(peer_id);
            }
        }

        let missing: Vec<&String> = {
            let sessions = self.sessions.lock();
            members
                .iter()
                .filter(|peer_id| **peer_id != self.ctx.local_id && !sessions.contains_key(*peer_id))
                .collect()
        };
        let results = join_all(missing.iter().map(|peer_id| self.create(peer_id))).await;
        for (peer_id, result) in missing.into_iter().zip(results) {
            match result {
                Ok(_) => report.created.push(peer_id.clone()),
                Err(err) => {
                    warn!(
                        target: "parley::mesh",
                        peer_id = %peer_id,
                        error = %err,
                        "failed to create peer session"
                    );
                    report.failed.push((peer_id.clone(), err));
                }
            }
        }

        *last = Some(members);
        report
    }

    /// Returns the session for `peer_id`, building it if needed.
    pub async fn create(&self, peer_id: &str) -> Result<Arc<PeerSession>, RegistryError> {
        if peer_id == self.ctx.local_id {
            return Err(RegistryError::SelfConnectionRefused);
        }
        if self.cancel.is_cancelled() {
            return Err(RegistryError::ShuttingDown);
        }
        let cell = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer_id) {
                Some(cell) => Arc::clone(cell),
                None => {
                    if sessions.len() >= self.max_peers {
                        return Err(RegistryError::CapacityExceeded {
                            max: self.max_peers,
                        });
                    }
                    let cell = SessionCell::default();
                    sessions.insert(peer_id.to_string(), Arc::clone(&cell));
                    cell
                }
            }
        };

        match cell.get_or_try_init(|| self.build(peer_id)).await {
            Ok(session) => {
                let session = Arc::clone(session);
                if self.is_current(peer_id, &cell) {
                    Ok(session)
                } else {
                    self.teardown(&session).await;
                    Err(RegistryError::ClosedDuringSetup(peer_id.to_string()))
                }
            }
            Err(err) => {
                let mut sessions = self.sessions.lock();
                if sessions
                    .get(peer_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &cell))
                {
                    sessions.remove(peer_id);
                }
                Err(err)
            }
        }
    }

    /// Idempotent; unknown peers are a no-op. Returns whether an entry was removed.
    pub async fn close(&self, peer_id: &str) -> bool {
        let Some(cell) = self.sessions.lock().remove(peer_id) else {
            return false;
        };
        // An in-flight build notices the removal and tears itself down.
        if let Some(session) = cell.get() {
            self.teardown(session).await;
        }
        true
    }

    /// Pushes a slot change onto every session.
    pub async fn publish(&self, change: &TrackChange) {
        let sessions = self.sessions();
        join_all(sessions.iter().map(|session| async move {
            if let Err(err) = session.set_sender(change.slot, change.track.clone()).await {
                warn!(
                    target: "parley::media",
                    peer_id = %session.peer_id(),
                    slot = %change.slot,
                    error = %err,
                    "failed to update sender"
                );
            }
        }))
        .await;
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pending.lock().take();
        let cells: Vec<SessionCell> = self.sessions.lock().drain().map(|(_, cell)| cell).collect();
        join_all(
            cells
                .iter()
                .filter_map(|cell| cell.get())
                .map(|session| self.teardown(session)),
        )
        .await;
    }

    fn is_current(&self, peer_id: &str, cell: &SessionCell) -> bool {
        self.sessions
            .lock()
            .get(peer_id)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
    }

    async fn build(&self, peer_id: &str) -> Result<Arc<PeerSession>, RegistryError> {
        if let Err(err) = self.tracks.ensure_audio_track().await {
            debug!(
                target: "parley::media",
                peer_id,
                error = %err,
                "continuing without microphone"
            );
        }
        let transport = self.transports.create(&self.ctx.local_id, peer_id).await?;
        let session = PeerSession::start(
            self.ctx.clone(),
            peer_id,
            transport,
            self.cancel.child_token(),
        );
        for (slot, track) in self.tracks.live_tracks() {
            if let Err(err) = session.set_sender(slot, Some(track)).await {
                warn!(
                    target: "parley::media",
                    peer_id,
                    slot = %slot,
                    error = %err,
                    "failed to attach local track"
                );
            }
        }
        if self.ctx.local_id.as_str() < peer_id {
            if let Err(err) = session.open_aux_channel().await {
                warn!(
                    target: "parley::mesh",
                    peer_id,
                    error = %err,
                    "failed to open aux channel"
                );
            }
        }
        info!(
            target: "parley::mesh",
            peer_id,
            politeness = ?session.politeness(),
            "peer session created"
        );
        let _ = self.ctx.notices.send(PeerNotice::Added {
            peer_id: peer_id.to_string(),
        });
        Ok(session)
    }

    async fn teardown(&self, session: &Arc<PeerSession>) {
        if session.close().await {
            info!(target: "parley::mesh", peer_id = %session.peer_id(), "peer session closed");
            let _ = self.ctx.notices.send(PeerNotice::Removed {
                peer_id: session.peer_id().to_string(),
            });
        }
    }
}
