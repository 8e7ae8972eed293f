use std::collections::HashMap;

use comms::msg::MachineInfo;
use log::info;

/// The list of dispatch machines known to the directory, keyed by the
/// address they registered with. Each machine gets a relay base identity
/// on first registration and keeps it across re-registrations.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: HashMap<String, MachineInfo>,
    next_base: u32,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a machine as available and returns its relay base identity.
    pub fn register(&mut self, address: String, description: String, num_slots: u32) -> String {
        if let Some(existing) = self.machines.get_mut(&address) {
            existing.description = description;
            existing.num_slots = num_slots;
            return existing.relay_base_id.clone();
        }

        let base_id = self.next_base.to_string();
        self.next_base += 1;
        info!("machine {address} registered with base identity {base_id}");
        self.machines.insert(
            address.clone(),
            MachineInfo {
                address,
                relay_base_id: base_id.clone(),
                description,
                num_slots,
                benchmark_time: 0.0,
            },
        );
        base_id
    }

    /// Forgets a machine; returns its relay base identity if it was known.
    pub fn deregister(&mut self, address: &str) -> Option<String> {
        self.machines
            .remove(address)
            .map(|machine| machine.relay_base_id)
    }

    pub fn has_base(&self, base_id: &str) -> bool {
        self.machines
            .values()
            .any(|machine| machine.relay_base_id == base_id)
    }

    /// Up to `count` machines at or under the benchmark-time ceiling,
    /// fastest first.
    pub fn pick(&self, count: u32, max_benchmark_secs: f64) -> Vec<MachineInfo> {
        let mut machines: Vec<_> = self
            .machines
            .values()
            .filter(|machine| machine.benchmark_time <= max_benchmark_secs)
            .cloned()
            .collect();
        machines.sort_by(|a, b| a.benchmark_time.total_cmp(&b.benchmark_time));
        machines.truncate(count as usize);
        machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_identity_survives_re_registration() {
        let mut registry = MachineRegistry::new();
        let base = registry.register("10.0.0.1:23300".into(), "fast box".into(), 8);
        let again = registry.register("10.0.0.1:23300".into(), "renamed".into(), 4);
        assert_eq!(base, again);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pick(10, 1e9)[0].num_slots, 4);
    }

    #[test]
    fn pick_truncates_and_filters() {
        let mut registry = MachineRegistry::new();
        registry.register("a:1".into(), String::new(), 1);
        registry.register("b:1".into(), String::new(), 2);
        registry.register("c:1".into(), String::new(), 3);

        assert_eq!(registry.pick(2, 1e9).len(), 2);
        assert_eq!(registry.pick(10, 1e9).len(), 3);
        // Every machine reports a zero benchmark until measured.
        assert!(registry.pick(10, -1.0).is_empty());
    }

    #[test]
    fn deregistered_machines_disappear() {
        let mut registry = MachineRegistry::new();
        let base = registry.register("a:1".into(), String::new(), 1);
        assert!(registry.has_base(&base));

        assert_eq!(registry.deregister("a:1"), Some(base.clone()));
        assert!(!registry.has_base(&base));
        assert!(registry.deregister("a:1").is_none());

        // A later machine never inherits the freed base identity.
        let next = registry.register("b:1".into(), String::new(), 1);
        assert_ne!(next, base);
    }
}
