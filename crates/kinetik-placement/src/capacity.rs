//! Free-capacity arithmetic for a single node.
//!
//! CPU is accounted in percent of one core (`100` per core), memory in
//! bytes. The formulas are fixed because operator tooling reads the same
//! numbers:
//!
//! ```text
//! free_cpu      = 100 * cpu_count - cpu_used_percent
//! real_free_cpu = free_cpu - reserved_cpu * 100
//! cpu fits      = requested_cpu * 100 < real_free_cpu
//! mem_free      = (mem_used / mem_used_ratio) * (1 - mem_used_ratio)
//! mem fits      = requested_mem < mem_free - reserved_mem
//! ```

use std::fmt;

use kinetik_core::{NodeRecord, ResourceRequest};

/// Outcome of checking a request against a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fit {
    Fits,
    InsufficientCpu { requested: f64, available: f64 },
    InsufficientMemory { requested: u64, available: i128 },
    /// Utilization is unknown or unusable, so nothing fits.
    InsufficientData,
}

impl Fit {
    pub fn fits(&self) -> bool {
        matches!(self, Fit::Fits)
    }
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fit::Fits => write!(f, "fits"),
            Fit::InsufficientCpu {
                requested,
                available,
            } => write!(f, "cpu {requested}% requested, {available}% free"),
            Fit::InsufficientMemory {
                requested,
                available,
            } => write!(f, "memory {requested}B requested, {available}B free"),
            Fit::InsufficientData => write!(f, "insufficient utilization data"),
        }
    }
}

/// CPU percent still free after utilization and reservations.
///
/// `None` when the report carries no usable CPU figures.
pub fn real_free_cpu(node: &NodeRecord) -> Option<f64> {
    let used = node.cpu_used_percent;
    let reserved = node.reservation.cpu;
    if !used.is_finite() || !reserved.is_finite() {
        return None;
    }
    let free = 100.0 * f64::from(node.cpu_count) - used;
    Some(free - reserved * 100.0)
}

/// Memory bytes free according to the last report, before reservations.
///
/// `None` for a zero, negative or non-finite used ratio, which would
/// otherwise divide by zero.
pub fn free_memory(node: &NodeRecord) -> Option<i128> {
    let ratio = node.mem_used_percent;
    if !ratio.is_finite() || ratio <= 0.0 {
        return None;
    }
    let free = (node.mem_used_bytes as f64 / ratio) * (1.0 - ratio);
    if !free.is_finite() {
        return None;
    }
    // Truncate toward zero, as the integer conversion always has.
    Some(free as i128)
}

/// Check whether `request` fits on `node` given its current reservation.
pub fn check_fit(node: &NodeRecord, request: &ResourceRequest) -> Fit {
    let (Some(cpu_free), Some(mem_free)) = (real_free_cpu(node), free_memory(node)) else {
        return Fit::InsufficientData;
    };

    let cpu_requested = request.cpu * 100.0;
    if !(cpu_requested < cpu_free) {
        return Fit::InsufficientCpu {
            requested: cpu_requested,
            available: cpu_free,
        };
    }

    // The reservation counter is a u64; never promise more than it can hold.
    let headroom = i128::from(u64::MAX - node.reservation.memory_bytes);
    let mem_available = (mem_free - i128::from(node.reservation.memory_bytes)).min(headroom);
    if i128::from(request.memory_bytes) >= mem_available {
        return Fit::InsufficientMemory {
            requested: request.memory_bytes,
            available: mem_available,
        };
    }

    Fit::Fits
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetik_core::Reservation;

    fn node(cpu_count: u32, cpu_used: f64, mem_used: u64, mem_ratio: f64) -> NodeRecord {
        NodeRecord {
            id: "10.0.0.1".to_string(),
            cpu_count,
            cpu_used_percent: cpu_used,
            mem_used_bytes: mem_used,
            mem_used_percent: mem_ratio,
            ..NodeRecord::default()
        }
    }

    #[test]
    fn reference_node_fits_one_core() {
        let n = node(4, 50.0, 2_000_000_000, 0.5);
        assert_eq!(real_free_cpu(&n), Some(350.0));
        assert_eq!(free_memory(&n), Some(2_000_000_000));
        assert!(check_fit(&n, &ResourceRequest::new(1.0, 500_000_000)).fits());
    }

    #[test]
    fn reservation_reduces_free_cpu() {
        let mut n = node(4, 50.0, 2_000_000_000, 0.5);
        n.reservation = Reservation {
            cpu: 1.0,
            memory_bytes: 500_000_000,
        };
        assert_eq!(
            check_fit(&n, &ResourceRequest::new(3.5, 0)),
            Fit::InsufficientCpu {
                requested: 350.0,
                available: 250.0
            }
        );
        assert!(check_fit(&n, &ResourceRequest::new(2.4, 0)).fits());
    }

    #[test]
    fn cpu_comparison_is_strict() {
        let n = node(1, 0.0, 1_000, 0.5);
        assert!(!check_fit(&n, &ResourceRequest::new(1.0, 0)).fits());
        assert!(check_fit(&n, &ResourceRequest::new(0.99, 0)).fits());
    }

    #[test]
    fn memory_comparison_is_strict_and_counts_reservation() {
        let mut n = node(8, 0.0, 1_000, 0.5);
        // 1000 B free
        assert!(!check_fit(&n, &ResourceRequest::new(0.0, 1_000)).fits());
        assert!(check_fit(&n, &ResourceRequest::new(0.0, 999)).fits());

        n.reservation.memory_bytes = 600;
        assert_eq!(
            check_fit(&n, &ResourceRequest::new(0.0, 400)),
            Fit::InsufficientMemory {
                requested: 400,
                available: 400
            }
        );
    }

    #[test]
    fn zero_or_unknown_memory_ratio_is_insufficient_data() {
        let req = ResourceRequest::new(0.1, 1);
        assert_eq!(check_fit(&node(4, 0.0, 1_000, 0.0), &req), Fit::InsufficientData);
        assert_eq!(check_fit(&node(4, 0.0, 1_000, f64::NAN), &req), Fit::InsufficientData);
        assert_eq!(check_fit(&node(4, 0.0, 1_000, -0.2), &req), Fit::InsufficientData);
        assert_eq!(
            check_fit(&node(4, f64::INFINITY, 1_000, 0.5), &req),
            Fit::InsufficientData
        );
    }

    #[test]
    fn fresh_node_without_report_fits_nothing() {
        let n = NodeRecord::new("10.0.0.9");
        assert_eq!(
            check_fit(&n, &ResourceRequest::new(0.0, 0)),
            Fit::InsufficientData
        );
    }

    #[test]
    fn huge_free_memory_is_capped_by_the_reservation_counter() {
        // ~1e20 B free by the formula, more than a u64 can count.
        let mut n = node(8, 0.0, 10_000_000_000_000, 1e-7);
        assert!(check_fit(&n, &ResourceRequest::new(0.0, 15_000_000_000_000_000_000)).fits());

        n.reservation.memory_bytes = 15_000_000_000_000_000_000;
        assert_eq!(
            check_fit(&n, &ResourceRequest::new(0.0, 15_000_000_000_000_000_000)),
            Fit::InsufficientMemory {
                requested: 15_000_000_000_000_000_000,
                available: i128::from(u64::MAX - 15_000_000_000_000_000_000),
            }
        );
    }
}
