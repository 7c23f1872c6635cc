use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use tracing::{debug, warn};
use crate::atomic_map::AtomicMap;
use crate::member::MemberId;
use crate::peer_state::PeerState;

/// The transport's view of cluster membership. Membership itself (joining, failure detection,
///  agreement) is managed elsewhere; the transport only looks peers up.
#[cfg_attr(test, automock)]
pub trait MemberDirectory: Send + Sync + 'static {
    fn lookup(&self, id: MemberId) -> Option<Arc<PeerState>>;

    /// all current peers, not including this node
    fn peers(&self) -> Vec<Arc<PeerState>>;

    /// the number of cluster members including this node
    fn cluster_size(&self) -> usize {
        self.peers().len() + 1
    }
}

/// Callbacks for peers that do not acknowledge packets. Deciding whether such a peer is
///  actually dead is up to the membership layer.
#[cfg_attr(test, automock)]
pub trait PeerHealthListener: Send + Sync + 'static {
    /// a packet to the peer has been unacknowledged for a large part of the resend timeout
    fn on_peer_slow(&self, peer: MemberId);

    /// a packet to the peer timed out, and the transport stopped resending it
    fn on_peer_undeliverable(&self, peer: MemberId);
}

pub struct LoggingHealthListener;

impl PeerHealthListener for LoggingHealthListener {
    fn on_peer_slow(&self, peer: MemberId) {
        warn!("peer {} is slow to acknowledge packets", peer);
    }

    fn on_peer_undeliverable(&self, peer: MemberId) {
        warn!("packets to peer {} are undeliverable", peer);
    }
}

/// Member directory backed by a copy-on-write map
#[derive(Default)]
pub struct Members {
    peers: AtomicMap<MemberId, Arc<PeerState>>,
}

impl Members {
    pub fn new() -> Members {
        Members::default()
    }

    pub fn add(&self, peer: PeerState) -> Arc<PeerState> {
        let peer = Arc::new(peer);
        debug!("adding peer {:?}", peer);
        let prev = self.peers.update(|m| m.insert(peer.id(), peer.clone()));
        if let Some(prev) = prev {
            prev.mark_departed();
        }
        peer
    }

    /// Removes a peer, marking it as departed for anyone still holding a reference to it
    pub fn remove(&self, id: MemberId) -> Option<Arc<PeerState>> {
        let removed = self.peers.update(|m| m.remove(&id));
        if let Some(peer) = &removed {
            peer.mark_departed();
        }
        removed
    }
}

impl MemberDirectory for Members {
    fn lookup(&self, id: MemberId) -> Option<Arc<PeerState>> {
        self.peers.get(&id)
    }

    fn peers(&self) -> Vec<Arc<PeerState>> {
        let mut result = self.peers.load()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        result.sort_by_key(|p| p.id());
        result
    }

    fn cluster_size(&self) -> usize {
        self.peers.load().len() + 1
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use super::*;
    use crate::config::FlowControlConfig;

    fn peer(id: u16) -> PeerState {
        PeerState::new(MemberId::from_raw(id), SocketAddr::from(([127, 0, 0, 1], 9000 + id)), &FlowControlConfig::default())
    }

    #[test]
    fn test_add_lookup_remove() {
        let members = Members::new();
        assert_eq!(members.cluster_size(), 1);

        members.add(peer(3));
        let two = members.add(peer(2));
        assert_eq!(members.cluster_size(), 3);
        assert_eq!(members.peers().iter().map(|p| p.id().to_raw()).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(members.lookup(MemberId::from_raw(2)).unwrap().address().port(), 9002);

        let removed = members.remove(MemberId::from_raw(2)).unwrap();
        assert!(!removed.is_alive());
        assert!(!two.is_alive());
        assert!(members.lookup(MemberId::from_raw(2)).is_none());
        assert!(members.remove(MemberId::from_raw(2)).is_none());
    }

    #[test]
    fn test_replace_marks_previous_departed() {
        let members = Members::new();
        let old = members.add(peer(2));
        let new = members.add(peer(2));
        assert!(!old.is_alive());
        assert!(new.is_alive());
    }
}
