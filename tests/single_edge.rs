//! Tests that involve vehicles travelling along a single edge.

use assert_approx_eq::assert_approx_eq;
use microtraffic::{CarFollowModel, LaneAttributes, ModelParams, Simulation, VehicleAttributes};

fn car() -> VehicleAttributes {
    VehicleAttributes {
        length: 5.0,
        width: 2.0,
        model: CarFollowModel::Krauss(ModelParams {
            max_accel: 2.0,
            max_decel: 4.0,
            emergency_decel: 8.0,
            min_gap: 2.0,
            headway: 1.0,
            imperfection: 0.0,
        }),
    }
}

fn lane(length: f64) -> LaneAttributes {
    LaneAttributes {
        length,
        width: 3.5,
        speed_limit: 16.66,
    }
}

/// Test that a vehicle's position increases monotonically on a free road.
#[test]
fn vehicle_drives_forward() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(500.0)]).unwrap();
    let veh = sim
        .add_vehicle(&car(), sim.get_edge(edge).lanes()[0], 0.0)
        .unwrap();

    let mut pos = sim.get_vehicle(veh).pos_rear();
    for _ in 0..100 {
        sim.step(0.1);
        let next_pos = sim.get_vehicle(veh).pos_rear();
        assert!(next_pos > pos);
        pos = next_pos;
    }
}

/// Test that a vehicle never exceeds the speed limit of its lane.
#[test]
fn vehicle_obeys_speed_limit() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(2000.0)]).unwrap();
    let veh = sim
        .add_vehicle(&car(), sim.get_edge(edge).lanes()[0], 0.0)
        .unwrap();

    for _ in 0..300 {
        sim.step(0.1);
        assert!(sim.get_vehicle(veh).vel() <= 16.66 + 1e-9);
    }
    // The vehicle has had ample time to reach the limit.
    assert_approx_eq!(sim.get_vehicle(veh).vel(), 16.66, 1e-6);
}

/// Test that a vehicle approaching a stationary leader never violates the
/// minimum gap, and comes to rest exactly one minimum gap behind it.
#[test]
fn vehicle_stops_behind_stationary_leader() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(200.0)]).unwrap();
    let road = sim.get_edge(edge).lanes()[0];

    let leader = sim.add_vehicle(&car(), road, 100.0).unwrap();
    sim.set_vehicle_frozen(leader, true);
    let follower = sim.add_vehicle(&car(), road, 0.0).unwrap();

    for _ in 0..600 {
        sim.step(0.1);
        let f = sim.get_vehicle(follower);
        assert!(f.pos_front() + 2.0 <= 100.0 + 1e-6);
    }

    let f = sim.get_vehicle(follower);
    assert!(f.has_stopped());
    assert!(f.stop_ticks() > 0);
    assert_approx_eq!(f.pos_rear(), 93.0, 0.01);
}

/// Test that a queue of vehicles compresses behind a stopped one without
/// any pair ever violating the minimum gap.
#[test]
fn queue_preserves_gaps() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(200.0)]).unwrap();
    let road = sim.get_edge(edge).lanes()[0];

    let head = sim.add_vehicle(&car(), road, 150.0).unwrap();
    sim.set_vehicle_frozen(head, true);
    let queue = [100.0, 80.0, 60.0, 40.0]
        .iter()
        .map(|pos| sim.add_vehicle(&car(), road, *pos).unwrap())
        .collect::<Vec<_>>();

    for _ in 0..600 {
        sim.step(0.1);
        let mut ahead = sim.get_vehicle(head).pos_rear();
        for veh in &queue {
            let veh = sim.get_vehicle(*veh);
            assert!(veh.pos_front() + 2.0 <= ahead + 1e-6);
            ahead = veh.pos_rear();
        }
    }

    // The queue has settled nose to tail at the minimum gap.
    let expected = [143.0, 136.0, 129.0, 122.0];
    for (veh, pos) in queue.iter().zip(expected) {
        assert_approx_eq!(sim.get_vehicle(*veh).pos_rear(), pos, 0.05);
    }
}

/// Test that two identically seeded runs are bit-for-bit identical even
/// with driver imperfection enabled, and that different seeds diverge.
#[test]
fn runs_are_deterministic() {
    let run = |seed: u64| {
        let mut sim = Simulation::new(seed);
        let edge = sim.add_edge(&[lane(2000.0)]).unwrap();
        let road = sim.get_edge(edge).lanes()[0];
        let mut dawdler = car();
        dawdler.model = CarFollowModel::Krauss(ModelParams {
            imperfection: 0.5,
            ..*car().model.params()
        });
        let vehs = [0.0, 20.0, 40.0]
            .iter()
            .map(|pos| sim.add_vehicle(&dawdler, road, *pos).unwrap())
            .collect::<Vec<_>>();
        for _ in 0..200 {
            sim.step(0.1);
        }
        vehs.iter()
            .map(|veh| (sim.get_vehicle(*veh).pos_rear(), sim.get_vehicle(*veh).vel()))
            .collect::<Vec<_>>()
    };

    let a = run(42);
    let b = run(42);
    assert_eq!(a, b);

    let c = run(43);
    assert!(a.iter().zip(&c).any(|(x, y)| x != y));
}

/// Test that a speed override caps the vehicle's velocity until cleared.
#[test]
fn speed_override_caps_velocity() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(2000.0)]).unwrap();
    let veh = sim
        .add_vehicle(&car(), sim.get_edge(edge).lanes()[0], 0.0)
        .unwrap();

    sim.set_speed_override(veh, Some(5.0));
    for _ in 0..100 {
        sim.step(0.1);
        assert!(sim.get_vehicle(veh).vel() <= 5.0 + 1e-9);
    }
    assert_approx_eq!(sim.get_vehicle(veh).vel(), 5.0, 1e-6);

    sim.set_speed_override(veh, None);
    for _ in 0..100 {
        sim.step(0.1);
    }
    assert!(sim.get_vehicle(veh).vel() > 5.0);
}

/// Test that freezing a vehicle brings it to a stop and holds it there,
/// and that unfreezing lets it drive off again.
#[test]
fn frozen_vehicle_stops() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(2000.0)]).unwrap();
    let veh = sim
        .add_vehicle(&car(), sim.get_edge(edge).lanes()[0], 0.0)
        .unwrap();

    for _ in 0..50 {
        sim.step(0.1);
    }
    assert!(sim.get_vehicle(veh).vel() > 0.0);

    sim.set_vehicle_frozen(veh, true);
    assert!(sim.get_vehicle_frozen(veh));
    for _ in 0..50 {
        sim.step(0.1);
    }
    assert!(sim.get_vehicle(veh).has_stopped());
    let held = sim.get_vehicle(veh).pos_rear();

    sim.set_vehicle_frozen(veh, false);
    for _ in 0..50 {
        sim.step(0.1);
    }
    assert!(sim.get_vehicle(veh).pos_rear() > held);
}

/// Test that a vehicle at the end of its route leaves the simulation.
#[test]
fn vehicle_leaves_at_route_end() {
    let mut sim = Simulation::new(1);
    let edge = sim.add_edge(&[lane(100.0)]).unwrap();
    let veh = sim
        .add_vehicle(&car(), sim.get_edge(edge).lanes()[0], 50.0)
        .unwrap();

    for _ in 0..200 {
        sim.step(0.1);
    }
    assert!(!sim.contains_vehicle(veh));
}
