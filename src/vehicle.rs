use self::following::SpeedPlan;
pub use self::following::{CarFollowModel, ModelParams, ResolvedSpeed};
use crate::changer::{LaneChangeState, LateralDirection};
use crate::util::Interval;
use crate::{EdgeId, LaneId, VehicleId};
use rand::rngs::StdRng;

mod following;

/// The velocity below which a vehicle counts as stopped, in m/s.
const STOP_THRESHOLD: f64 = 0.1;

/// A simulated vehicle.
#[derive(Clone, Debug)]
pub struct Vehicle {
    /// The vehicle's ID.
    pub(crate) id: VehicleId,
    /// The vehicle's length in m.
    length: f64,
    /// The vehicle's width in m.
    width: f64,
    /// The car-following model.
    model: CarFollowModel,
    /// Scalar multiplied with the speed limit each tick.
    vel_adj: f64,
    /// The longitudinal position of the rear of the vehicle
    /// along its current lane, in m.
    pos: f64,
    /// The lateral offset from the lane centre line, in m.
    lat: f64,
    /// The velocity in m/s.
    vel: f64,
    /// The lane the vehicle is currently registered on.
    lane: LaneId,
    /// The vehicle's route; the first entry is the edge it is currently on.
    route: Vec<EdgeId>,
    /// The lateral negotiation state.
    lc: LaneChangeState,
    /// A vehicle this one blocked during lane changing, prompting
    /// cooperative yielding on subsequent ticks.
    yield_to: Option<VehicleId>,
    /// The speed plan for the current tick.
    plan: SpeedPlan,
    /// An externally forced speed, honoured but safety-clamped.
    speed_override: Option<f64>,
    /// An externally requested lane change direction.
    forced_change: Option<LateralDirection>,
    /// The number of ticks the vehicle has been stopped.
    stop_ticks: usize,
}

/// The attributes of a simulated vehicle.
#[derive(Clone, Debug)]
pub struct VehicleAttributes {
    /// The vehicle length in m.
    pub length: f64,
    /// The vehicle width in m.
    pub width: f64,
    /// The car-following model, including its parameters.
    pub model: CarFollowModel,
}

impl VehicleAttributes {
    /// Validates the attributes. Malformed parameters are rejected here,
    /// never clamped during simulation.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.length > 0.0, "vehicle length must be positive");
        anyhow::ensure!(self.width > 0.0, "vehicle width must be positive");
        self.model.params().validate()
    }
}

impl Vehicle {
    /// Creates a new vehicle. The attributes must have been validated.
    pub(crate) fn new(id: VehicleId, attributes: &VehicleAttributes, lane: LaneId, pos: f64) -> Self {
        Self {
            id,
            length: attributes.length,
            width: attributes.width,
            model: attributes.model.clone(),
            vel_adj: 1.0,
            pos,
            lat: 0.0,
            vel: 0.0,
            lane,
            route: vec![],
            lc: LaneChangeState::Stable,
            yield_to: None,
            plan: SpeedPlan::default(),
            speed_override: None,
            forced_change: None,
            stop_ticks: 0,
        }
    }

    /// Gets the vehicle's ID.
    pub fn id(&self) -> VehicleId {
        self.id
    }

    /// The vehicle's length in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// The vehicle's width in m.
    pub fn width(&self) -> f64 {
        self.width
    }

    /// The longitudinal position of the rear of the vehicle in m.
    pub fn pos_rear(&self) -> f64 {
        self.pos
    }

    /// The longitudinal position of the front of the vehicle in m.
    pub fn pos_front(&self) -> f64 {
        self.pos + self.length
    }

    /// The lateral offset from the lane centre line in m.
    pub fn lat(&self) -> f64 {
        self.lat
    }

    /// The vehicle's velocity in m/s.
    pub fn vel(&self) -> f64 {
        self.vel
    }

    /// The lane the vehicle is currently registered on.
    pub fn lane(&self) -> LaneId {
        self.lane
    }

    /// The vehicle's car-following model.
    pub fn model(&self) -> &CarFollowModel {
        &self.model
    }

    /// The minimum standstill gap the vehicle keeps to its leader, in m.
    pub fn min_gap(&self) -> f64 {
        self.model.params().min_gap
    }

    /// The vehicle's maximum comfortable deceleration in m/s^2.
    pub fn max_decel(&self) -> f64 {
        self.model.params().max_decel
    }

    /// The longitudinal extent occupied by the vehicle.
    pub fn footprint_long(&self) -> Interval<f64> {
        Interval::new(self.pos, self.pos + self.length)
    }

    /// The lateral extent occupied by the vehicle, relative to the
    /// centre line of its registered lane.
    pub fn footprint_lat(&self) -> Interval<f64> {
        Interval::disc(self.lat, 0.5 * self.width)
    }

    /// Whether the vehicle is stopped.
    pub fn has_stopped(&self) -> bool {
        self.vel < STOP_THRESHOLD
    }

    /// The number of consecutive ticks the vehicle has been stopped.
    pub fn stop_ticks(&self) -> usize {
        self.stop_ticks
    }

    /// The lateral negotiation state.
    pub fn change_state(&self) -> &LaneChangeState {
        &self.lc
    }

    /// The vehicle that denied this vehicle's last lane-change attempt.
    pub fn blocked_by(&self) -> Option<VehicleId> {
        match self.lc {
            LaneChangeState::Blocked { blocker } => Some(blocker),
            _ => None,
        }
    }

    /// The vehicle's route, starting at its current edge.
    pub fn route(&self) -> &[EdgeId] {
        &self.route
    }

    /// The next edge on the vehicle's route, if any.
    pub fn next_edge(&self) -> Option<EdgeId> {
        self.route.get(1).copied()
    }

    /// Set the desired velocity adjustment factor, a scalar which is
    /// multiplied with the speed limit prior to calculating the speed limit
    /// constraint each tick.
    pub fn set_velocity_adjust(&mut self, factor: f64) {
        self.vel_adj = factor;
    }

    pub(crate) fn velocity_adjust(&self) -> f64 {
        self.vel_adj
    }

    pub(crate) fn set_route(&mut self, route: Vec<EdgeId>) {
        self.route = route;
    }

    pub(crate) fn set_speed_override(&mut self, vel: Option<f64>) {
        self.speed_override = vel;
    }

    pub(crate) fn set_forced_change(&mut self, dir: Option<LateralDirection>) {
        self.forced_change = dir;
    }

    pub(crate) fn forced_change(&self) -> Option<LateralDirection> {
        self.forced_change
    }

    pub(crate) fn set_change_state(&mut self, state: LaneChangeState) {
        self.lc = state;
    }

    pub(crate) fn set_yield_to(&mut self, other: Option<VehicleId>) {
        self.yield_to = other;
    }

    pub(crate) fn yield_to(&self) -> Option<VehicleId> {
        self.yield_to
    }

    pub(crate) fn set_lane(&mut self, lane: LaneId) {
        self.lane = lane;
    }

    pub(crate) fn set_lat(&mut self, lat: f64) {
        self.lat = lat;
    }

    /// Rebases the longitudinal position onto a successor lane.
    pub(crate) fn shift_pos(&mut self, offset: f64) {
        self.pos += offset;
    }

    /// Pops the current edge off the route upon entering a new edge.
    pub(crate) fn advance_route(&mut self, edge: EdgeId) {
        if self.route.first() != Some(&edge) {
            if let Some(idx) = self.route.iter().position(|e| *e == edge) {
                self.route.drain(..idx);
            }
        }
    }

    /// Resets the speed plan in preparation for a new tick.
    pub(crate) fn reset_plan(&self, dt: f64) {
        self.plan.reset(self.vel, self.model.params(), self.speed_override, dt);
    }

    /// Constrains the vehicle to follow a leader at the given net gap.
    pub(crate) fn follow_leader(&self, gap: f64, leader_vel: f64, leader_decel: f64, dt: f64) {
        if gap < 0.0 {
            log::warn!("vehicle {:?}: transient negative gap {:.3} m clamped", self.id, gap);
        }
        self.plan
            .apply(self.model.follow_speed(self.vel, gap, leader_vel, leader_decel, dt));
    }

    /// Constrains the vehicle to stop before a line the given distance ahead.
    pub(crate) fn stop_at(&self, gap: f64, dt: f64) {
        self.plan.apply(self.model.stop_speed(self.vel, gap, dt));
    }

    /// Applies the current speed limit to the vehicle.
    pub(crate) fn apply_speed_limit(&self, speed_limit: f64) {
        self.plan.apply(self.vel_adj * speed_limit);
    }

    /// Constrains the candidate velocity from above without scaling.
    pub(crate) fn apply_speed_cap(&self, vel: f64) {
        self.plan.apply(vel);
    }

    /// Demands a full stop at the emergency rate, without a near-miss report.
    pub(crate) fn force_stop(&self) {
        self.plan.force_stop();
    }

    /// The candidate velocity accumulated so far this tick.
    pub(crate) fn planned_vel(&self) -> f64 {
        self.plan.current()
    }

    /// Integrates the vehicle's velocity and position.
    /// Returns whether the comfortable deceleration was exceeded.
    pub(crate) fn integrate(&mut self, dt: f64, rng: &mut StdRng) -> bool {
        let out = self.plan.resolve(self.vel, self.model.params(), rng, dt);
        self.pos += 0.5 * (self.vel + out.vel) * dt;
        self.vel = out.vel;
        if self.vel < STOP_THRESHOLD {
            self.stop_ticks += 1;
        } else {
            self.stop_ticks = 0;
        }
        out.emergency
    }
}
