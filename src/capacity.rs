//! Per-drone capacity tracking and placement.
//!
//! Drones are ordered by used-capacity ratio in a binary min-heap; placement
//! pops in increasing-load order and always restores full heap membership
//! before returning, whatever the outcome.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use crate::drone::Drone;

/// Heap entry: one drone's load snapshot at push time.
///
/// Ratios are compared by cross-multiplication so no float ordering is
/// involved; ties break by insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DroneLoad {
    hostname: String,
    active_processes: usize,
    max_processes: usize,
    order: u64,
}

impl Ord for DroneLoad {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = self.active_processes * other.max_processes;
        let rhs = other.active_processes * self.max_processes;
        lhs.cmp(&rhs).then(self.order.cmp(&other.order))
    }
}

impl PartialOrd for DroneLoad {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Placement constraints for one dispatch.
#[derive(Debug, Clone, Default)]
pub struct PlacementConstraints<'a> {
    pub user: Option<&'a str>,
    pub allowed_hostnames: Option<&'a HashSet<String>>,
    pub require_ssp: bool,
}

/// Min-heap of enabled drones ordered by load ratio.
#[derive(Debug, Default)]
pub struct CapacityTracker {
    heap: BinaryHeap<Reverse<DroneLoad>>,
    next_order: u64,
}

impl CapacityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn push_drone(&mut self, drone: &Drone) {
        self.heap.push(Reverse(DroneLoad {
            hostname: drone.hostname().to_string(),
            active_processes: drone.active_processes,
            max_processes: drone.max_processes,
            order: self.next_order,
        }));
        self.next_order += 1;
    }

    /// Rebuild the heap from current drone state. Disabled drones and drones
    /// whose last refresh failed stay out.
    pub fn rebuild<'a>(&mut self, drones: impl Iterator<Item = &'a Drone>) {
        self.clear();
        for drone in drones {
            if drone.is_schedulable() {
                self.push_drone(drone);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Current heap membership, for consistency checks.
    pub fn hostnames(&self) -> HashSet<String> {
        self.heap
            .iter()
            .map(|Reverse(entry)| entry.hostname.clone())
            .collect()
    }

    /// Pick a drone able to run `num_processes` more slots.
    ///
    /// Pops in increasing-load order, skipping drones the constraints rule
    /// out. If every usable drone is full, the least-loaded usable one is
    /// returned anyway with an overload warning: the process ceiling is a
    /// soft target, not admission control. If packaging support is required
    /// but no usable drone has it, the least-loaded non-supporting drone is
    /// the fallback. Heap membership is identical before and after the call.
    pub fn choose_drone(
        &mut self,
        num_processes: usize,
        constraints: &PlacementConstraints<'_>,
        drones: &BTreeMap<String, Drone>,
    ) -> Option<String> {
        let mut popped = Vec::with_capacity(self.heap.len());
        let mut chosen = None;
        // Least-loaded usable drone, kept as the overload fallback.
        let mut least_loaded_usable: Option<String> = None;
        // Least-loaded usable drone lacking required packaging support.
        let mut least_loaded_no_ssp: Option<String> = None;

        while let Some(Reverse(entry)) = self.heap.pop() {
            let hostname = entry.hostname.clone();
            popped.push(entry);
            let Some(drone) = drones.get(&hostname) else {
                continue;
            };

            if !drone.usable_by(constraints.user) {
                continue;
            }
            if let Some(allowed) = constraints.allowed_hostnames {
                if !allowed.contains(&hostname) {
                    continue;
                }
            }
            if constraints.require_ssp && !drone.supports_ssp {
                if least_loaded_no_ssp.is_none() {
                    least_loaded_no_ssp = Some(hostname);
                }
                continue;
            }

            if least_loaded_usable.is_none() {
                least_loaded_usable = Some(hostname.clone());
            }
            if drone.active_processes + num_processes <= drone.max_processes {
                chosen = Some(hostname);
                break;
            }
        }

        for entry in popped {
            self.heap.push(Reverse(entry));
        }

        if let Some(hostname) = chosen {
            return Some(hostname);
        }
        if let Some(hostname) = least_loaded_usable {
            tracing::warn!(
                hostname = %hostname,
                num_processes,
                "All usable drones are at capacity, placing on the least loaded one"
            );
            return Some(hostname);
        }
        if let Some(hostname) = least_loaded_no_ssp {
            tracing::warn!(
                hostname = %hostname,
                "No usable drone supports server-side packaging, falling back"
            );
            return Some(hostname);
        }
        None
    }

    /// Largest single batch of process slots any usable drone could accept,
    /// 0 when no usable drone exists.
    pub fn max_runnable_processes(
        &self,
        constraints: &PlacementConstraints<'_>,
        drones: &BTreeMap<String, Drone>,
    ) -> usize {
        self.heap
            .iter()
            .filter_map(|Reverse(entry)| {
                let drone = drones.get(&entry.hostname)?;
                if !drone.usable_by(constraints.user) {
                    return None;
                }
                if let Some(allowed) = constraints.allowed_hostnames {
                    if !allowed.contains(drone.hostname()) {
                        return None;
                    }
                }
                Some(drone.max_processes.saturating_sub(drone.active_processes))
            })
            .max()
            .unwrap_or(0)
    }
}
