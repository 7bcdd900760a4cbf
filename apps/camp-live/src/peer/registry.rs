use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::link::PeerLink;
use crate::media::LocalTrack;
use crate::negotiation::{NegotiationState, PeerRole};
use crate::transport::{PeerNotice, PeerTransportFactory};

/// The set of live peer links, keyed by remote peer id.
///
/// Each link carries a generation drawn from a counter that never repeats for
/// the life of the registry, so completions from a replaced or removed link
/// can be told apart from the current one.
pub struct PeerConnectionRegistry {
    links: BTreeMap<String, PeerLink>,
    generation_counter: u64,
    factory: Arc<dyn PeerTransportFactory>,
    notices: mpsc::UnboundedSender<PeerNotice>,
}

impl PeerConnectionRegistry {
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        notices: mpsc::UnboundedSender<PeerNotice>,
    ) -> Self {
        Self {
            links: BTreeMap::new(),
            generation_counter: 0,
            factory,
            notices,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub(crate) fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.links.contains_key(peer_id)
    }

    /// Whether `generation` is still the current link for `peer_id`.
    pub fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.links
            .get(peer_id)
            .is_some_and(|link| link.generation() == generation)
    }

    /// Existing link for `peer_id`, or a fresh one with `role`. The flag is
    /// true when the link was created by this call.
    pub(crate) fn get_or_create(&mut self, peer_id: &str, role: PeerRole) -> (&mut PeerLink, bool) {
        let mut created = false;
        let counter = &mut self.generation_counter;
        let factory = &self.factory;
        let notices = &self.notices;
        let link = self.links.entry(peer_id.to_string()).or_insert_with(|| {
            created = true;
            *counter += 1;
            tracing::debug!(
                target = "camp_live::negotiation",
                peer = %peer_id,
                generation = *counter,
                ?role,
                "peer link created"
            );
            PeerLink::spawn(peer_id, role, *counter, factory.clone(), notices.clone())
        });
        (link, created)
    }

    /// Bind the currently acquired local tracks to a link.
    pub(crate) fn attach_local_tracks(&mut self, peer_id: &str, tracks: &[Arc<LocalTrack>]) {
        if let Some(link) = self.links.get_mut(peer_id) {
            link.lend_tracks(tracks);
        }
    }

    /// Drop the link for `peer_id`, abandoning its queued work and closing its
    /// transport.
    pub(crate) fn remove(&mut self, peer_id: &str) -> bool {
        match self.links.remove(peer_id) {
            Some(link) => {
                let _ = link.shutdown();
                tracing::debug!(
                    target = "camp_live::negotiation",
                    peer = %peer_id,
                    "peer link removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn for_each(&self, mut visit: impl FnMut(&PeerLink)) {
        for link in self.links.values() {
            visit(link);
        }
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn states(&self) -> BTreeMap<String, NegotiationState> {
        self.links
            .iter()
            .map(|(id, link)| (id.clone(), link.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Bulk teardown. Waits up to `grace` for transports to finish closing.
    pub(crate) async fn close_all(&mut self, grace: Duration) {
        let links = std::mem::take(&mut self.links);
        let count = links.len();
        let handles: Vec<_> = links.into_values().map(PeerLink::shutdown).collect();
        let all = join_workers(handles);
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!(
                target = "camp_live::negotiation",
                links = count,
                "peer transports still closing after grace period"
            );
        }
    }
}

async fn join_workers(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}
