//! Eviction policies — choose which instance a scale-down removes.

use kinetik_core::InstanceRecord;
use rand::Rng;

pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index of the instance to remove, or `None` when there is none.
    fn select_victim(&self, instances: &[InstanceRecord]) -> Option<usize>;
}

/// Uniform choice with no preference for age, load or health.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomEviction;

impl EvictionPolicy for RandomEviction {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select_victim(&self, instances: &[InstanceRecord]) -> Option<usize> {
        if instances.is_empty() {
            return None;
        }
        Some(rand::rng().random_range(0..instances.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetik_core::HealthState;

    fn instance(id: &str) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            service_id: "shop/web".to_string(),
            node_id: "n1".to_string(),
            address: None,
            state: HealthState::Ok,
            reservation: None,
            metrics: Vec::new(),
            timeout: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn empty_list_has_no_victim() {
        assert_eq!(RandomEviction.select_victim(&[]), None);
    }

    #[test]
    fn victim_is_always_in_range() {
        let instances = vec![instance("a"), instance("b"), instance("c")];
        for _ in 0..50 {
            let idx = RandomEviction.select_victim(&instances).unwrap();
            assert!(idx < instances.len());
        }
        assert_eq!(RandomEviction.select_victim(&instances[..1]), Some(0));
    }
}
