
use std::collections::{BTreeMap, HashSet};

use drone_dispatch::capacity::{CapacityTracker, PlacementConstraints};
use drone_dispatch::drone::Drone;
use drone_dispatch::DroneConfig;
use test_harness::test_drone;

fn drone_map(configs: &[DroneConfig]) -> BTreeMap<String, Drone> {
    configs
        .iter()
        .map(|config| (config.hostname.clone(), test_drone(config)))
        .collect()
}

fn tracker_for(drones: &BTreeMap<String, Drone>) -> CapacityTracker {
    let mut tracker = CapacityTracker::new();
    tracker.rebuild(drones.values());
    tracker
}

fn no_constraints() -> PlacementConstraints<'static> {
    PlacementConstraints::default()
}

#[test]
fn test_big_request_prefers_drone_with_room() {
    // Two idle drones, capacities 2 and 4: a 3-slot request only fits on the
    // larger one.
    let drones = drone_map(&[DroneConfig::new("small", 2), DroneConfig::new("large", 4)]);
    let mut tracker = tracker_for(&drones);

    let chosen = tracker.choose_drone(3, &no_constraints(), &drones);
    assert_eq!(chosen.as_deref(), Some("large"));
}

#[test]
fn test_single_slot_requests_balance_by_ratio() {
    let mut drones = drone_map(&[DroneConfig::new("small", 2), DroneConfig::new("large", 4)]);
    let mut tracker = tracker_for(&drones);

    let mut picks = Vec::new();
    for _ in 0..6 {
        let hostname = tracker
            .choose_drone(1, &no_constraints(), &drones)
            .expect("a drone fits a single slot");
        drones.get_mut(&hostname).unwrap().active_processes += 1;
        tracker.rebuild(drones.values());
        picks.push(hostname);
    }

    // Ties break by insertion order ("large" sorts after "small"), then load
    // ratios steer toward the larger drone.
    assert_eq!(picks, ["large", "small", "large", "large", "small", "large"]);
    assert_eq!(drones["small"].active_processes, 2);
    assert_eq!(drones["large"].active_processes, 4);
}

#[test]
fn test_never_overcommits_while_a_fitting_drone_exists() {
    let mut drones = drone_map(&[DroneConfig::new("a", 2), DroneConfig::new("b", 4)]);
    drones.get_mut("a").unwrap().active_processes = 2;
    drones.get_mut("b").unwrap().active_processes = 2;
    let mut tracker = tracker_for(&drones);

    // Only "b" has two free slots; "a" is full even though its ratio is not
    // lower.
    let chosen = tracker.choose_drone(2, &no_constraints(), &drones);
    assert_eq!(chosen.as_deref(), Some("b"));
}

#[test]
fn test_overload_falls_back_to_least_loaded() {
    let mut drones = drone_map(&[DroneConfig::new("a", 4), DroneConfig::new("b", 2)]);
    drones.get_mut("a").unwrap().active_processes = 3;
    drones.get_mut("b").unwrap().active_processes = 2;
    let mut tracker = tracker_for(&drones);

    // Nothing fits 2 more slots; placement degrades to the drone with the
    // lowest used-capacity ratio (3/4 < 2/2).
    let chosen = tracker.choose_drone(2, &no_constraints(), &drones);
    assert_eq!(chosen.as_deref(), Some("a"));
}

#[test]
fn test_heap_membership_preserved_across_choose() {
    let drones = drone_map(&[
        DroneConfig::new("a", 2),
        DroneConfig::new("b", 4),
        DroneConfig::new("c", 8),
    ]);
    let mut tracker = tracker_for(&drones);
    let before = tracker.hostnames();
    assert_eq!(before.len(), 3);

    tracker.choose_drone(1, &no_constraints(), &drones);
    assert_eq!(tracker.hostnames(), before);
    assert_eq!(tracker.len(), 3);

    // Same holds when nothing is usable at all.
    let constraints = PlacementConstraints {
        user: Some("stranger"),
        ..Default::default()
    };
    let drones_restricted = drone_map(&[
        DroneConfig::new("a", 2).with_allowed_users(["alice"]),
        DroneConfig::new("b", 4).with_allowed_users(["alice"]),
    ]);
    let mut tracker = tracker_for(&drones_restricted);
    let before = tracker.hostnames();
    assert_eq!(
        tracker.choose_drone(1, &constraints, &drones_restricted),
        None
    );
    assert_eq!(tracker.hostnames(), before);
}

#[test]
fn test_disabled_drone_is_never_placed_on() {
    let drones = drone_map(&[
        DroneConfig::new("up", 2),
        DroneConfig::new("down", 100).disabled(),
    ]);
    let mut tracker = tracker_for(&drones);

    for _ in 0..5 {
        assert_eq!(
            tracker.choose_drone(1, &no_constraints(), &drones).as_deref(),
            Some("up")
        );
    }
    assert_eq!(tracker.max_runnable_processes(&no_constraints(), &drones), 2);
}

#[test]
fn test_user_allowlist_respected() {
    let mut drones = drone_map(&[
        DroneConfig::new("restricted", 8).with_allowed_users(["alice"]),
        DroneConfig::new("open", 2),
    ]);
    // The restricted drone is the least loaded, so it is popped first and
    // must be skipped for anyone but alice.
    drones.get_mut("open").unwrap().active_processes = 1;
    let mut tracker = tracker_for(&drones);

    let bob = PlacementConstraints {
        user: Some("bob"),
        ..Default::default()
    };
    assert_eq!(
        tracker.choose_drone(1, &bob, &drones).as_deref(),
        Some("open")
    );

    let alice = PlacementConstraints {
        user: Some("alice"),
        ..Default::default()
    };
    assert_eq!(
        tracker.choose_drone(1, &alice, &drones).as_deref(),
        Some("restricted")
    );
}

#[test]
fn test_allowed_hostnames_filter() {
    let drones = drone_map(&[DroneConfig::new("a", 2), DroneConfig::new("b", 4)]);
    let mut tracker = tracker_for(&drones);

    let only_b: HashSet<String> = ["b".to_string()].into_iter().collect();
    let constraints = PlacementConstraints {
        allowed_hostnames: Some(&only_b),
        ..Default::default()
    };
    assert_eq!(
        tracker.choose_drone(1, &constraints, &drones).as_deref(),
        Some("b")
    );
}

#[test]
fn test_ssp_requirement_prefers_supporting_drone() {
    let mut drones = drone_map(&[
        DroneConfig::new("plain", 4),
        DroneConfig::new("ssp", 4).with_ssp_support(),
    ]);
    // The supporting drone is more loaded but still wins a require-ssp
    // placement.
    drones.get_mut("ssp").unwrap().active_processes = 2;
    let mut tracker = tracker_for(&drones);

    let constraints = PlacementConstraints {
        require_ssp: true,
        ..Default::default()
    };
    assert_eq!(
        tracker.choose_drone(1, &constraints, &drones).as_deref(),
        Some("ssp")
    );
}

#[test]
fn test_ssp_requirement_falls_back_when_unsupported() {
    let drones = drone_map(&[DroneConfig::new("a", 2), DroneConfig::new("b", 4)]);
    let mut tracker = tracker_for(&drones);

    let constraints = PlacementConstraints {
        require_ssp: true,
        ..Default::default()
    };
    // No drone supports packaging: best-effort falls back to the least
    // loaded usable drone instead of failing the dispatch.
    let chosen = tracker.choose_drone(1, &constraints, &drones);
    assert_eq!(chosen.as_deref(), Some("a"));
    assert_eq!(tracker.hostnames().len(), 2);
}

#[test]
fn test_max_runnable_processes() {
    let mut drones = drone_map(&[DroneConfig::new("a", 10), DroneConfig::new("b", 4)]);
    drones.get_mut("a").unwrap().active_processes = 7;
    drones.get_mut("b").unwrap().active_processes = 0;
    let tracker = tracker_for(&drones);

    assert_eq!(tracker.max_runnable_processes(&no_constraints(), &drones), 4);

    let only_a: HashSet<String> = ["a".to_string()].into_iter().collect();
    let constraints = PlacementConstraints {
        allowed_hostnames: Some(&only_a),
        ..Default::default()
    };
    assert_eq!(tracker.max_runnable_processes(&constraints, &drones), 3);
}

#[test]
fn test_max_runnable_processes_no_usable_drone() {
    let drones = drone_map(&[DroneConfig::new("a", 2).with_allowed_users(["alice"])]);
    let tracker = tracker_for(&drones);

    let constraints = PlacementConstraints {
        user: Some("bob"),
        ..Default::default()
    };
    assert_eq!(tracker.max_runnable_processes(&constraints, &drones), 0);
    assert_eq!(tracker.max_runnable_processes(&no_constraints(), &drones), 2);
}
