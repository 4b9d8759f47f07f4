//! Which member owns which segment of an index.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::cluster::MemberId;
use crate::error::{ClusterError, Result};

/// Segment a unique id routes to.
///
/// A 32-bit polynomial (×31) hash over the UTF-16 code units, so routing is
/// stable across members and restarts.
pub fn segment_for_unique_id(unique_id: &str, number_of_segments: u32) -> u32 {
    let hash = unique_id
        .encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)));
    hash.unsigned_abs() % number_of_segments.max(1)
}

/// Segment number to owning member for one index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwnershipMap {
    number_of_segments: u32,
    segment_to_member: BTreeMap<u32, MemberId>,
}

impl ShardOwnershipMap {
    pub fn new(number_of_segments: u32) -> Self {
        Self {
            number_of_segments,
            segment_to_member: BTreeMap::new(),
        }
    }

    pub fn from_assignments(
        number_of_segments: u32,
        segment_to_member: BTreeMap<u32, MemberId>,
    ) -> Result<Self> {
        if let Some(segment) = segment_to_member
            .keys()
            .find(|s| **s >= number_of_segments)
        {
            return Err(ClusterError::invalid_argument(format!(
                "Segment <{}> is out of range for <{}> segments",
                segment, number_of_segments
            )));
        }
        Ok(Self {
            number_of_segments,
            segment_to_member,
        })
    }

    pub fn number_of_segments(&self) -> u32 {
        self.number_of_segments
    }

    pub fn assignments(&self) -> &BTreeMap<u32, MemberId> {
        &self.segment_to_member
    }

    pub fn assign(&mut self, segment: u32, member: MemberId) {
        if segment < self.number_of_segments {
            self.segment_to_member.insert(segment, member);
        }
    }

    pub fn resolve_owner(&self, segment: u32) -> Option<&MemberId> {
        self.segment_to_member.get(&segment)
    }

    pub fn owner_for_key(&self, unique_id: &str) -> Option<&MemberId> {
        self.resolve_owner(segment_for_unique_id(unique_id, self.number_of_segments))
    }

    /// Members owning at least one segment.
    pub fn members(&self) -> BTreeSet<MemberId> {
        self.segment_to_member.values().cloned().collect()
    }

    pub fn segments_for(&self, member: &MemberId) -> BTreeSet<u32> {
        self.segment_to_member
            .iter()
            .filter(|(_, m)| *m == member)
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn member_to_segments(&self) -> BTreeMap<MemberId, BTreeSet<u32>> {
        let mut out: BTreeMap<MemberId, BTreeSet<u32>> = BTreeMap::new();
        for (segment, member) in &self.segment_to_member {
            out.entry(member.clone()).or_default().insert(*segment);
        }
        out
    }

    /// Every segment has an owner.
    pub fn is_complete(&self) -> bool {
        (0..self.number_of_segments).all(|s| self.segment_to_member.contains_key(&s))
    }
}

/// Decides segment ownership when the member set changes.
pub trait BalancePolicy: Send + Sync + std::fmt::Debug {
    /// A complete map over `members`, starting from `current`.
    fn balance(
        &self,
        current: &ShardOwnershipMap,
        members: &BTreeSet<MemberId>,
    ) -> Result<ShardOwnershipMap>;

    fn member_added(
        &self,
        current: &ShardOwnershipMap,
        members: &BTreeSet<MemberId>,
        _added: &MemberId,
    ) -> Result<ShardOwnershipMap> {
        self.balance(current, members)
    }

    fn member_removed(
        &self,
        current: &ShardOwnershipMap,
        members: &BTreeSet<MemberId>,
        _removed: &MemberId,
    ) -> Result<ShardOwnershipMap> {
        self.balance(current, members)
    }
}

/// Keeps live assignments and evens segment counts to within one.
///
/// Deterministic for a given map and member set, so every member computes
/// the same result.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvenBalancePolicy;

impl BalancePolicy for EvenBalancePolicy {
    fn balance(
        &self,
        current: &ShardOwnershipMap,
        members: &BTreeSet<MemberId>,
    ) -> Result<ShardOwnershipMap> {
        if members.is_empty() {
            return Err(ClusterError::invalid_argument(
                "Cannot assign segments without members",
            ));
        }
        let n = current.number_of_segments;

        // 1. Keep segments owned by live members
        let mut load: BTreeMap<&MemberId, Vec<u32>> =
            members.iter().map(|m| (m, Vec::new())).collect();
        let mut orphans = Vec::new();
        for segment in 0..n {
            match current.resolve_owner(segment).and_then(|m| load.get_mut(m)) {
                Some(segments) => segments.push(segment),
                None => orphans.push(segment),
            }
        }

        // 2. Hand orphans to the least loaded member
        for segment in orphans {
            if let Some(segments) = least_loaded(&mut load) {
                segments.push(segment);
            }
        }

        // 3. Move segments from the most to the least loaded until even
        loop {
            let (max_member, max_len) = load
                .iter()
                .map(|(m, s)| (*m, s.len()))
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
                .ok_or_else(|| ClusterError::internal("empty member load"))?;
            let (min_member, min_len) = load
                .iter()
                .map(|(m, s)| (*m, s.len()))
                .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)))
                .ok_or_else(|| ClusterError::internal("empty member load"))?;
            if max_len <= min_len + 1 {
                break;
            }
            let moved = load
                .get_mut(max_member)
                .and_then(|segments| segments.pop())
                .ok_or_else(|| ClusterError::internal("empty member load"))?;
            if let Some(segments) = load.get_mut(min_member) {
                segments.push(moved);
            }
        }

        let mut balanced = ShardOwnershipMap::new(n);
        for (member, segments) in load {
            for segment in segments {
                balanced.assign(segment, member.clone());
            }
        }
        Ok(balanced)
    }
}

fn least_loaded<'a, 'm>(load: &'a mut BTreeMap<&'m MemberId, Vec<u32>>) -> Option<&'a mut Vec<u32>> {
    let member = *load
        .iter()
        .min_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| a.0.cmp(b.0)))?
        .0;
    load.get_mut(member)
}
