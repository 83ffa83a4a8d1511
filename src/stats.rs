use crate::{LaneId, VehicleId};

/// Why a vehicle left the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveReason {
    /// The vehicle reached the end of its route.
    Arrived,
    /// The vehicle was removed externally.
    Removed,
}

/// Receives per-vehicle notifications each tick. The simulation calls the
/// sink but does not depend on its implementation; its lifecycle is scoped
/// to one simulation run.
pub trait StatsSink {
    /// A vehicle was inserted into the network.
    fn vehicle_entered(&mut self, vehicle: VehicleId, lane: LaneId, pos: f64) {
        let _ = (vehicle, lane, pos);
    }

    /// A vehicle's position was committed this tick.
    fn vehicle_moved(&mut self, vehicle: VehicleId, lane: LaneId, pos: f64, vel: f64) {
        let _ = (vehicle, lane, pos, vel);
    }

    /// A vehicle's lane membership changed laterally.
    fn lane_changed(&mut self, vehicle: VehicleId, from: LaneId, to: LaneId) {
        let _ = (vehicle, from, to);
    }

    /// A vehicle left the simulation.
    fn vehicle_left(&mut self, vehicle: VehicleId, reason: LeaveReason) {
        let _ = (vehicle, reason);
    }
}

/// A sink that discards all notifications.
#[derive(Default)]
pub struct NullSink;

impl StatsSink for NullSink {}
