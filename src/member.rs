use std::fmt::{Debug, Display, Formatter};
use bit_set::BitSet;

/// Cluster-wide identifier of a member. Id 0 is reserved for 'no member', e.g. a sender that
///  is not (or not yet) part of the cluster.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(u16);

impl MemberId {
    pub const NONE: MemberId = MemberId(0);

    pub const fn from_raw(id: u16) -> MemberId {
        MemberId(id)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "M{}", self.0)
    }
}


/// A set of members, e.g. the destinations of a packet that have not acknowledged it yet
#[derive(Clone, Default)]
pub struct MemberSet(BitSet);

impl MemberSet {
    pub fn new() -> MemberSet {
        MemberSet(BitSet::new())
    }

    pub fn insert(&mut self, id: MemberId) -> bool {
        self.0.insert(id.0 as usize)
    }

    pub fn remove(&mut self, id: MemberId) -> bool {
        self.0.remove(id.0 as usize)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.0.contains(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// members in ascending order of their ids
    pub fn iter(&self) -> impl Iterator<Item = MemberId> + Clone + '_ {
        self.0.iter().map(|raw| MemberId(raw as u16))
    }

    pub fn first(&self) -> Option<MemberId> {
        self.iter().next()
    }

    pub fn max(&self) -> Option<MemberId> {
        self.iter().last()
    }
}

impl FromIterator<MemberId> for MemberSet {
    fn from_iter<T: IntoIterator<Item=MemberId>>(iter: T) -> Self {
        let mut result = MemberSet::new();
        for id in iter {
            result.insert(id);
        }
        result
    }
}

impl PartialEq for MemberSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().eq(other.iter())
    }
}
impl Eq for MemberSet {}

impl Debug for MemberSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
