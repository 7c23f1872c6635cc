use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use crate::queues::wakeup::Wakeup;

/// Key for bundling packets into datagrams. Packets for a single destination are bundled per
///  address, everything that goes to several addresses shares one key so that it does not hold
///  up single-destination traffic.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum BundleTarget {
    Address(SocketAddr),
    Multipoint,
}

/// Encoded packets that go to the same set of addresses, in one datagram
#[derive(Clone, Debug)]
pub struct PacketBundle {
    pub addresses: Vec<SocketAddr>,
    pub packets: Vec<Bytes>,
    len: usize,
}

impl PacketBundle {
    pub fn new(addresses: Vec<SocketAddr>, packet: Bytes) -> PacketBundle {
        PacketBundle {
            addresses,
            len: packet.len(),
            packets: vec![packet],
        }
    }

    pub fn target(&self) -> BundleTarget {
        match self.addresses.as_slice() {
            [single] => BundleTarget::Address(*single),
            _ => BundleTarget::Multipoint,
        }
    }

    /// the combined length of the encoded packets, without datagram header
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn num_packets(&self) -> usize {
        self.packets.len()
    }

    fn append(&mut self, other: PacketBundle) {
        self.len += other.len;
        self.packets.extend(other.packets);
    }
}

#[derive(Default)]
struct BundlingQueueInner {
    bundles: FxHashMap<BundleTarget, VecDeque<PacketBundle>>,
    round_robin: VecDeque<BundleTarget>,
    num_packets: usize,
}

/// Packets waiting for the speaker task. Targets are served round robin, and consecutive
///  packets for the same addresses are combined into a single datagram when they fit.
pub struct BundlingQueue {
    inner: Mutex<BundlingQueueInner>,
    wakeup: Arc<Wakeup>,
}

impl BundlingQueue {
    pub fn new(wakeup: Arc<Wakeup>) -> BundlingQueue {
        BundlingQueue {
            inner: Mutex::new(BundlingQueueInner::default()),
            wakeup,
        }
    }

    pub fn wakeup(&self) -> &Arc<Wakeup> {
        &self.wakeup
    }

    /// Adds a bundle without waking up the speaker. Returns the number of queued packets.
    pub fn push(&self, bundle: PacketBundle) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let target = bundle.target();
        inner.num_packets += bundle.num_packets();

        let queue = inner.bundles.entry(target).or_default();
        let is_new_target = queue.is_empty();
        queue.push_back(bundle);
        if is_new_target {
            inner.round_robin.push_back(target);
        }
        inner.num_packets
    }

    /// The next datagram's worth of packets for the next target in turn, combining queued
    ///  bundles for the same addresses up to `max_len` bytes
    pub fn pop_bundled(&self, max_len: usize) -> Option<PacketBundle> {
        let mut inner = self.inner.lock().unwrap();
        let target = inner.round_robin.pop_front()?;
        let queue = inner.bundles.get_mut(&target)?;

        let mut result = queue.pop_front()?;
        while let Some(next) = queue.front() {
            if next.addresses != result.addresses || result.len + next.len > max_len {
                break;
            }
            if let Some(next) = queue.pop_front() {
                result.append(next);
            }
        }

        if queue.is_empty() {
            inner.bundles.remove(&target);
        }
        else {
            inner.round_robin.push_back(target);
        }
        inner.num_packets -= result.num_packets();
        Some(result)
    }

    /// the number of queued packets
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().num_packets
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn bundle(ports: &[u16], payload: &'static [u8]) -> PacketBundle {
        PacketBundle::new(ports.iter().map(|&p| addr(p)).collect(), Bytes::from_static(payload))
    }

    #[rstest]
    #[case::single(vec![1], BundleTarget::Address(addr(1)))]
    #[case::two(vec![1, 2], BundleTarget::Multipoint)]
    #[case::none(vec![], BundleTarget::Multipoint)]
    fn test_target(#[case] ports: Vec<u16>, #[case] expected: BundleTarget) {
        assert_eq!(bundle(&ports, b"x").target(), expected);
    }

    #[test]
    fn test_bundling_up_to_max_len() {
        let queue = BundlingQueue::new(Arc::new(Wakeup::new()));
        queue.push(bundle(&[1], b"aaa"));
        queue.push(bundle(&[1], b"bbb"));
        assert_eq!(queue.push(bundle(&[1], b"ccc")), 3);

        let first = queue.pop_bundled(6).unwrap();
        assert_eq!(first.packets, vec![Bytes::from_static(b"aaa"), Bytes::from_static(b"bbb")]);
        assert_eq!(first.len(), 6);
        assert_eq!(queue.len(), 1);

        let second = queue.pop_bundled(6).unwrap();
        assert_eq!(second.num_packets(), 1);
        assert!(queue.pop_bundled(6).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_round_robin_between_targets() {
        let queue = BundlingQueue::new(Arc::new(Wakeup::new()));
        queue.push(bundle(&[1], b"a1"));
        queue.push(bundle(&[1], b"a2"));
        queue.push(bundle(&[2], b"b1"));
        queue.push(bundle(&[1, 2], b"m1"));

        let order = std::iter::from_fn(|| queue.pop_bundled(2))
            .map(|b| b.packets[0].clone())
            .collect::<Vec<_>>();
        assert_eq!(order, vec![
            Bytes::from_static(b"a1"),
            Bytes::from_static(b"b1"),
            Bytes::from_static(b"m1"),
            Bytes::from_static(b"a2"),
        ]);
    }

    #[test]
    fn test_multipoint_bundles_only_with_same_addresses() {
        let queue = BundlingQueue::new(Arc::new(Wakeup::new()));
        queue.push(bundle(&[1, 2], b"x"));
        queue.push(bundle(&[1, 3], b"y"));

        assert_eq!(queue.pop_bundled(100).unwrap().num_packets(), 1);
        assert_eq!(queue.pop_bundled(100).unwrap().addresses, vec![addr(1), addr(3)]);
    }
}
