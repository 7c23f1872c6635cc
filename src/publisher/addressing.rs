use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;
use crate::peer_state::PeerState;

/// Whether a packet for this many destinations goes to the multicast group rather than to
///  each destination separately
pub fn is_multicast_eligible(num_destinations: usize, cluster_size: usize, threshold: f64) -> bool {
    if num_destinations < 2 || cluster_size < 2 {
        return false;
    }
    num_destinations as f64 / (cluster_size - 1) as f64 > threshold
}

/// Keeps traffic away from the multicast group for a while after a multicast packet had to be
///  resent. Multicast is tried again once the cooldown passes.
pub struct MulticastBypass {
    cooldown: u32,
    remaining: u32,
}

impl MulticastBypass {
    pub fn new(cooldown: u32) -> MulticastBypass {
        MulticastBypass {
            cooldown,
            remaining: 0,
        }
    }

    pub fn on_multicast_resend(&mut self) {
        if !self.is_active() {
            debug!("resending a multicast packet: bypassing multicast for the next {} packets", self.cooldown);
        }
        self.remaining = self.cooldown;
    }

    /// Counts down the cooldown, returning `true` while it lasts
    fn take(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }
}

/// Where a packet goes
#[derive(Debug, Eq, PartialEq)]
pub enum Route {
    Unicast(Vec<SocketAddr>),
    Multicast(SocketAddr),
}

impl Route {
    pub fn addresses(self) -> Vec<SocketAddr> {
        match self {
            Route::Unicast(addresses) => addresses,
            Route::Multicast(group) => vec![group],
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(self, Route::Multicast(_))
    }
}

/// Chooses between the multicast group and per-destination unicast. Resends always go by
///  unicast since they are for the destinations that missed the packet.
pub fn choose_route(
    destinations: &[Arc<PeerState>],
    cluster_size: usize,
    multicast_group: Option<SocketAddr>,
    threshold: f64,
    bypass: &mut MulticastBypass,
    is_resend: bool,
) -> Route {
    let unicast = || Route::Unicast(destinations.iter().map(|p| p.send_address()).collect());

    let Some(group) = multicast_group else {
        return unicast();
    };
    if !is_multicast_eligible(destinations.len(), cluster_size, threshold) {
        return unicast();
    }

    if is_resend {
        bypass.on_multicast_resend();
        return unicast();
    }
    if bypass.take() {
        return unicast();
    }
    Route::Multicast(group)
}
