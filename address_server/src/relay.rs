use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use log::{info, warn};

#[derive(Debug)]
struct Allocation {
    base_id: String,
    port: i32,
    created: Instant,
}

/// Relay identity bookkeeping. A full identity is `"{base}.{serial}"` with
/// a process-lifetime monotonic serial, so a released identity can never be
/// handed to a different job.
#[derive(Debug)]
pub struct RelayPool {
    active: HashMap<String, Allocation>,
    next_serial: u64,
    ttl: Duration,
}

impl RelayPool {
    pub fn new(ttl: Duration) -> Self {
        Self {
            active: HashMap::new(),
            next_serial: 0,
            ttl,
        }
    }

    /// Allocates a fresh full identity under `base_id`.
    pub fn allocate(&mut self, base_id: &str, port: i32) -> String {
        let full_id = format!("{base_id}.{}", self.next_serial);
        self.next_serial += 1;
        self.active.insert(
            full_id.clone(),
            Allocation {
                base_id: base_id.to_string(),
                port,
                created: Instant::now(),
            },
        );
        info!("allocated relay identity {full_id} (port {port})");
        full_id
    }

    /// Frees a full identity; false if it was not handed out or already
    /// released.
    pub fn release(&mut self, full_id: &str) -> bool {
        self.active.remove(full_id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drops identities whose holder never released them in time.
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.active.len();
        self.active.retain(|full_id, alloc| {
            let keep = alloc.created.elapsed() < ttl;
            if !keep {
                warn!("relay identity {full_id} expired unreleased");
            }
            keep
        });
        before - self.active.len()
    }

    /// Drops every identity under a base, for machines that deregister.
    pub fn drop_base(&mut self, base_id: &str) {
        self.active.retain(|_, alloc| alloc.base_id != base_id);
    }
}
