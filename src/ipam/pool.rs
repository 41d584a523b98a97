//! Free-address computation for one segment

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use super::Segment;
use crate::config::PoolRange;

/// Snapshot view of a segment's usable range against its used set.
///
/// Free addresses always come out in ascending order, so allocation is
/// deterministic: the smallest free address wins.
#[derive(Debug)]
pub struct SegmentPool<'a> {
    range: &'a PoolRange,
    segment: &'a Segment,
    used_offsets: BTreeSet<u32>,
    used_count: usize,
}

impl<'a> SegmentPool<'a> {
    pub fn new(range: &'a PoolRange, segment: &'a Segment, used: &BTreeSet<Ipv4Addr>) -> Self {
        let used_offsets = used.iter().filter_map(|addr| segment.offset_of(*addr)).collect();

        Self {
            range,
            segment,
            used_offsets,
            used_count: used.len(),
        }
    }

    /// Number of addresses currently claimed in the segment
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.range.capacity
    }

    /// Unclaimed addresses of the usable range, ascending
    pub fn free_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.range
            .offsets()
            .filter(move |offset| !self.used_offsets.contains(offset))
            .map(move |offset| self.segment.address(offset))
    }

    pub fn first_free(&self) -> Option<Ipv4Addr> {
        self.free_addresses().next()
    }
}
