use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::config::Role;

/// Generation counter shared between the render thread and the socket threads.
///
/// Only the render thread advances it; the advance happens before any frame stamped
/// with the new value is queued.
#[derive(Clone, Debug, Default)]
pub struct TicketCounter(Arc<AtomicU64>);

impl TicketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Followers adopt the authority's ticket from each applied pass-graph message.
    pub fn set(&self, ticket: u64) {
        self.0.store(ticket, Ordering::Release);
    }
}

/// Per-tick state threaded through the render tick.
#[derive(Debug, Default)]
pub struct TickContext {
    pub frame: u64,
    in_dist: bool,
    active: bool,
}

impl TickContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The authority is always active; a follower only while it runs a received graph.
    pub fn is_active(&self, role: Option<Role>) -> bool {
        role == Some(Role::Authority) || self.active
    }

    pub fn activate(&mut self) {
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn in_dist(&self) -> bool {
        self.in_dist
    }

    /// Returns false when distribution work is already running in this tick.
    pub(crate) fn enter(&mut self) -> bool {
        !std::mem::replace(&mut self.in_dist, true)
    }

    pub(crate) fn leave(&mut self) {
        self.in_dist = false;
    }

    pub(crate) fn end_frame(&mut self) {
        self.frame += 1;
        self.in_dist = false;
        self.active = false;
    }
}
