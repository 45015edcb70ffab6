//! Group registry.
//!
//! Tracks named membership sets of connections and produces the
//! latency-ordered peer list handed to a joining member.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A named membership set.
///
/// Members are kept in join order; ordering ties in `fastest` resolve
/// by insertion.
pub struct Group {
    id: Vec<u8>,
    members: Vec<u32>,
    touched: Instant,
}

impl Group {
    fn new(id: Vec<u8>) -> Self {
        Group { id, members: Vec::new(), touched: Instant::now() }
    }

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    pub fn add(&mut self, connection: u32) {
        if !self.members.contains(&connection) {
            self.members.push(connection);
        }
        self.touch();
    }

    pub fn remove(&mut self, connection: u32) {
        self.members.retain(|&m| m != connection);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.touched = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.touched.elapsed()
    }

    /// Members excluding `exclude`, ordered by ascending latency.
    ///
    /// `latency_of` resolves a member id to its measured latency; the
    /// sort is stable, so equal latencies keep join order.
    pub fn fastest(&self, exclude: u32, latency_of: impl Fn(u32) -> u32) -> Vec<u32> {
        let mut ordered: Vec<u32> =
            self.members.iter().copied().filter(|&m| m != exclude).collect();
        ordered.sort_by_key(|&m| latency_of(m));
        ordered
    }
}

/// All live groups, keyed by their opaque id.
pub struct GroupRegistry {
    groups: BTreeMap<Vec<u8>, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        GroupRegistry { groups: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, id: &[u8]) -> Option<&Group> {
        self.groups.get(id)
    }

    /// The group for `id`, created on first reference.
    pub fn get_or_create(&mut self, id: &[u8]) -> &mut Group {
        self.groups.entry(id.to_vec()).or_insert_with(|| Group::new(id.to_vec()))
    }

    pub fn get_mut(&mut self, id: &[u8]) -> Option<&mut Group> {
        self.groups.get_mut(id)
    }

    /// Drop a connection from a specific group.
    pub fn remove_member(&mut self, id: &[u8], connection: u32) {
        if let Some(group) = self.groups.get_mut(id) {
            group.remove(connection);
        }
    }

    /// Remove groups that are empty and idle longer than `timeout`.
    /// Returns how many were dropped.
    pub fn sweep(&mut self, timeout: Duration) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| !(group.is_empty() && group.idle() > timeout));
        before - self.groups.len()
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        GroupRegistry::new()
    }
}
