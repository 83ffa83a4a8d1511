use crate::changer::{LaneChangeState, LaneChanger, LateralDirection, LateralPolicy};
use crate::junction::{self, LinkAttributes};
use crate::lane::LaneAttributes;
use crate::stats::{LeaveReason, NullSink, StatsSink};
use crate::vehicle::{Vehicle, VehicleAttributes};
use crate::{
    Edge, EdgeId, EdgeSet, Junction, JunctionId, JunctionSet, Lane, LaneId, LaneSet, Link, LinkId, LinkSet,
    VehicleId, VehicleSet,
};
use anyhow::ensure;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::Distribution;

/// Configuration of a simulation run.
#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    /// The distance from a junction within which an approaching
    /// vehicle files a crossing request, in m.
    pub junction_lookahead: f64,
    /// How committed lateral moves are executed.
    pub lateral: LateralPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            junction_lookahead: 50.0,
            lateral: LateralPolicy::Instant,
        }
    }
}

/// A deterministic, tick-based traffic simulation.
///
/// Every tick executes the same fixed sequence: junction admission,
/// car-following, lane changing, position commit. All randomness is drawn
/// from a seeded generator, so identical inputs produce identical runs.
pub struct Simulation {
    /// The lanes in the network, including junction-internal ones.
    lanes: LaneSet,
    /// The edges in the network.
    edges: EdgeSet,
    /// The junctions in the network.
    junctions: JunctionSet,
    /// The links in the network.
    links: LinkSet,
    /// The vehicles being simulated.
    vehicles: VehicleSet,
    /// Edges in creation order; the fixed processing order.
    edge_order: Vec<EdgeId>,
    /// The set of "frozen" vehicles, which will not move.
    frozen_vehs: Vec<VehicleId>,
    /// The next link sequence number.
    link_seq: u32,
    /// The current tick of simulation.
    frame: usize,
    config: SimConfig,
    rng: StdRng,
    stats: Box<dyn StatsSink>,
    /// Debugging information from the previously simulated tick.
    #[cfg(feature = "debug")]
    debug: serde_json::Value,
}

impl Simulation {
    /// Creates a new simulation seeded with the given value.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, SimConfig::default())
    }

    /// Creates a new simulation with an explicit configuration.
    pub fn with_config(seed: u64, config: SimConfig) -> Self {
        Self {
            lanes: LaneSet::default(),
            edges: EdgeSet::default(),
            junctions: JunctionSet::default(),
            links: LinkSet::default(),
            vehicles: VehicleSet::default(),
            edge_order: vec![],
            frozen_vehs: vec![],
            link_seq: 0,
            frame: 0,
            config,
            rng: StdRng::seed_from_u64(seed),
            stats: Box::new(NullSink),
            #[cfg(feature = "debug")]
            debug: serde_json::Value::Null,
        }
    }

    /// Installs the statistics sink for this run.
    pub fn set_stats_sink(&mut self, sink: Box<dyn StatsSink>) {
        self.stats = sink;
    }

    /// Adds an edge with the given lanes to the network.
    /// Lane 0 is the rightmost lane.
    pub fn add_edge(&mut self, lanes: &[LaneAttributes]) -> anyhow::Result<EdgeId> {
        ensure!(!lanes.is_empty(), "an edge must have at least one lane");
        for attribs in lanes {
            attribs.validate()?;
        }

        let edge_id = self.edges.insert_with_key(|id| Edge::new(id, vec![]));
        let lane_ids = lanes
            .iter()
            .enumerate()
            .map(|(index, attribs)| {
                self.lanes
                    .insert_with_key(|id| Lane::new(id, attribs, Some(edge_id), index))
            })
            .collect::<Vec<_>>();

        for pair in lane_ids.windows(2) {
            self.lanes[pair[0]].set_left(Some(pair[1]));
            self.lanes[pair[1]].set_right(Some(pair[0]));
        }

        self.edges[edge_id].set_lanes(lane_ids);
        self.edge_order.push(edge_id);
        Ok(edge_id)
    }

    /// Adds a junction to the network.
    pub fn add_junction(&mut self) -> JunctionId {
        self.junctions.insert_with_key(Junction::new)
    }

    /// Adds an internal connector lane owned by the given junction.
    pub fn add_internal_lane(&mut self, junction: JunctionId, attribs: &LaneAttributes) -> anyhow::Result<LaneId> {
        attribs.validate()?;
        ensure!(self.junctions.contains_key(junction), "no such junction");
        let lane_id = self.lanes.insert_with_key(|id| Lane::new(id, attribs, None, 0));
        self.junctions[junction].add_internal_lane(lane_id);
        Ok(lane_id)
    }

    /// Adds a link across the given junction. The link leaves `from`,
    /// is routed over the internal lane `via` and enters `to`.
    pub fn add_link(&mut self, junction: JunctionId, attribs: &LinkAttributes) -> anyhow::Result<LinkId> {
        ensure!(self.junctions.contains_key(junction), "no such junction");
        ensure!(self.lanes.contains_key(attribs.from), "no such from-lane");
        ensure!(self.lanes.contains_key(attribs.to), "no such to-lane");
        ensure!(self.lanes.contains_key(attribs.via), "no such internal lane");
        ensure!(
            self.lanes[attribs.via].is_internal(),
            "the via-lane of a link must be junction-internal"
        );
        ensure!(
            self.junctions[junction].internal_lanes().contains(&attribs.via),
            "the via-lane belongs to a different junction"
        );
        ensure!(
            !self.lanes[attribs.from].is_internal() && !self.lanes[attribs.to].is_internal(),
            "links must connect edge lanes"
        );

        let seq = self.link_seq;
        self.link_seq += 1;
        let link_id = self.links.insert_with_key(|id| Link::new(id, seq, junction, attribs));
        self.junctions[junction].add_link(link_id);
        self.lanes[attribs.from].add_link_out(link_id);
        self.lanes[attribs.via].set_continuation(attribs.to);
        Ok(link_id)
    }

    /// Declares that two links of the same junction geometrically conflict.
    /// The conflict set is kept symmetric.
    pub fn add_conflict(&mut self, a: LinkId, b: LinkId) -> anyhow::Result<()> {
        ensure!(a != b, "a link cannot conflict with itself");
        ensure!(self.links.contains_key(a), "no such link");
        ensure!(self.links.contains_key(b), "no such link");
        ensure!(
            self.links[a].junction() == self.links[b].junction(),
            "conflicting links must share a junction"
        );
        self.links[a].add_conflict(b);
        self.links[b].add_conflict(a);
        Ok(())
    }

    /// Adds a vehicle to the simulation with its rear at `pos` on the lane.
    pub fn add_vehicle(&mut self, attributes: &VehicleAttributes, lane: LaneId, pos: f64) -> anyhow::Result<VehicleId> {
        attributes.validate()?;
        ensure!(self.lanes.contains_key(lane), "no such lane");
        ensure!(
            pos >= 0.0 && pos + attributes.length <= self.lanes[lane].length(),
            "vehicle does not fit on the lane at this position"
        );
        let edge = match self.lanes[lane].edge() {
            Some(edge) => edge,
            None => anyhow::bail!("cannot insert onto an internal lane"),
        };
        let vehicle_id = self.vehicles.insert_with_key(|id| {
            let mut vehicle = Vehicle::new(id, attributes, lane, pos);
            vehicle.set_route(vec![edge]);
            vehicle
        });
        self.lanes[lane].insert_vehicle(&self.vehicles, vehicle_id);
        self.stats.vehicle_entered(vehicle_id, lane, pos);
        Ok(vehicle_id)
    }

    /// Removes a vehicle from the simulation.
    pub fn remove_vehicle(&mut self, id: VehicleId) {
        if self.vehicles.contains_key(id) {
            self.despawn(id, LeaveReason::Removed);
        }
    }

    /// Sets a vehicle's route. The first entry must be the edge the
    /// vehicle is currently on.
    pub fn set_vehicle_route(&mut self, id: VehicleId, route: &[EdgeId]) -> anyhow::Result<()> {
        ensure!(self.vehicles.contains_key(id), "no such vehicle");
        ensure!(!route.is_empty(), "a route must contain at least one edge");
        for edge in route {
            ensure!(self.edges.contains_key(*edge), "route references a missing edge");
        }
        let current = self.lanes[self.vehicles[id].lane()].edge();
        ensure!(
            current == Some(route[0]),
            "a route must start at the vehicle's current edge"
        );
        self.vehicles[id].set_route(route.to_vec());
        Ok(())
    }

    /// Forces the vehicle's desired speed for subsequent ticks, still
    /// clamped by the safe-speed and acceleration bounds.
    /// `None` restores normal behaviour.
    pub fn set_speed_override(&mut self, id: VehicleId, vel: Option<f64>) {
        self.vehicles[id].set_speed_override(vel);
    }

    /// Requests a lane change in the given direction on the next tick.
    /// The request is honoured only if the gap-acceptance check passes.
    pub fn request_lane_change(&mut self, id: VehicleId, dir: LateralDirection) {
        self.vehicles[id].set_forced_change(Some(dir));
    }

    /// Sets the `frozen` attribute of a vehicle. When a vehicle is frozen,
    /// it will maximally decelerate until its velocity is zero and remain
    /// stopped until it is no longer frozen.
    pub fn set_vehicle_frozen(&mut self, vehicle_id: VehicleId, frozen: bool) {
        let idx = self.frozen_vehs.iter().position(|id| *id == vehicle_id);
        match (frozen, idx) {
            (true, None) => {
                self.frozen_vehs.push(vehicle_id);
            }
            (false, Some(idx)) => {
                self.frozen_vehs.remove(idx);
            }
            _ => {}
        }
    }

    /// Gets the `frozen` attribute of a vehicle. [Read more](Self::set_vehicle_frozen).
    pub fn get_vehicle_frozen(&mut self, vehicle_id: VehicleId) -> bool {
        self.frozen_vehs.iter().any(|id| *id == vehicle_id)
    }

    /// Randomly assigns a desired velocity adjustment factor to each vehicle,
    /// sampled from a normal distribution with a mean of 1 and standard
    /// deviation of `stddev`, using the simulation's seeded generator.
    pub fn randomise_velocity_adjusts(&mut self, stddev: f64) {
        let distr = rand_distr::Normal::new(1.0, stddev).expect("Invalid standard deviation");
        for (_, vehicle) in &mut self.vehicles {
            let factor = distr.sample(&mut self.rng).clamp(0.75, 1.25);
            vehicle.set_velocity_adjust(factor);
        }
    }

    /// Gets the current tick index.
    pub fn frame(&self) -> usize {
        self.frame
    }

    /// Gets a reference to the vehicle with the given ID.
    pub fn get_vehicle(&self, id: VehicleId) -> &Vehicle {
        &self.vehicles[id]
    }

    /// Returns whether the vehicle is still in the simulation.
    pub fn contains_vehicle(&self, id: VehicleId) -> bool {
        self.vehicles.contains_key(id)
    }

    /// Returns an iterator over all the vehicles in the simulation.
    pub fn iter_vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.vehicles.values()
    }

    /// Gets a reference to the lane with the given ID.
    pub fn get_lane(&self, id: LaneId) -> &Lane {
        &self.lanes[id]
    }

    /// Returns an iterator over all the lanes in the simulation.
    pub fn iter_lanes(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.values()
    }

    /// Gets a reference to the edge with the given ID.
    pub fn get_edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    /// Gets a reference to the link with the given ID.
    pub fn get_link(&self, id: LinkId) -> &Link {
        &self.links[id]
    }

    /// Returns an iterator over all the links in the simulation.
    pub fn iter_links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Gets the debugging information for the previously simulated tick.
    #[cfg(feature = "debug")]
    pub fn debug(&self) -> serde_json::Value {
        self.debug.clone()
    }

    /// Advances the simulation by `dt` seconds.
    ///
    /// For a realistic simulation, do not use a time step greater than
    /// around 0.2.
    pub fn step(&mut self, dt: f64) {
        self.update_admissions();
        self.plan_speeds(dt);
        self.perform_lane_changes(dt);
        self.commit(dt);
        self.frame += 1;

        #[cfg(feature = "debug")]
        {
            use crate::Key;
            for (_, veh) in &self.vehicles {
                crate::debug::debug_vehicle(veh.id().data().as_ffi(), veh.pos_rear(), veh.lat(), veh.vel());
            }
            self.debug = crate::debug::take_debug_frame();
        }
    }

    /// Refreshes crossing requests and resolves them into grants and
    /// denials, frozen before any lane or edge pass runs.
    fn update_admissions(&mut self) {
        junction::update_approaches(
            &mut self.links,
            &self.lanes,
            &self.vehicles,
            self.config.junction_lookahead,
        );
        for (_, junction) in &self.junctions {
            junction.resolve(&mut self.links);
        }
    }

    /// Computes each vehicle's candidate speed for this tick from a
    /// consistent start-of-tick snapshot of lane occupancy.
    fn plan_speeds(&mut self, dt: f64) {
        for (_, vehicle) in &self.vehicles {
            vehicle.reset_plan(dt);
        }
        for (_, lane) in &self.lanes {
            lane.apply_car_following(&self.lanes, &self.vehicles, dt);
        }
        self.apply_junction_constraints(dt);
        self.apply_cooperative_yields(dt);
        self.apply_frozen_vehicles();
    }

    /// Constrains the front vehicle of every lane against its junction:
    /// denied vehicles decelerate toward the wait position, granted
    /// vehicles still keep a safe gap to any occupant of the internal
    /// lane and the target lane.
    fn apply_junction_constraints(&self, dt: f64) {
        for (_, lane) in &self.lanes {
            let front = match lane.front_vehicle() {
                Some(front) => front,
                None => continue,
            };
            let veh = &self.vehicles[front];
            let ahead = lane.length() - veh.pos_front();

            if lane.is_internal() {
                if let Some(next) = lane.continuation() {
                    self.follow_onto(veh, next, ahead, dt);
                }
                continue;
            }

            match junction::chosen_link(veh, lane, &self.links, &self.lanes) {
                Some(link_id) => {
                    let link = &self.links[link_id];
                    if link.is_granted_to(front) {
                        let via = &self.lanes[link.via()];
                        match via.rearmost_vehicle() {
                            Some(occupant) => {
                                let o = &self.vehicles[occupant];
                                veh.follow_leader(ahead + o.pos_rear(), o.vel(), o.max_decel(), dt);
                            }
                            None => self.follow_onto(veh, link.to(), ahead + via.length(), dt),
                        }
                    } else {
                        veh.stop_at(ahead, dt);
                    }
                }
                None => {
                    // A lane with no continuation for this route ends at a
                    // stop line; a finished route exits freely at the end.
                    if veh.next_edge().is_some() {
                        veh.stop_at(ahead, dt);
                    }
                }
            }
        }
    }

    /// Constrains `veh` behind the rearmost occupant of the given lane,
    /// `offset` metres ahead of the vehicle's front.
    fn follow_onto(&self, veh: &Vehicle, lane: LaneId, offset: f64, dt: f64) {
        if let Some(occupant) = self.lanes[lane].rearmost_vehicle() {
            let o = &self.vehicles[occupant];
            veh.follow_leader(offset + o.pos_rear(), o.vel(), o.max_decel(), dt);
        }
    }

    /// A vehicle that blocked a lane change adapts its speed slightly
    /// to open the contested gap.
    fn apply_cooperative_yields(&self, dt: f64) {
        for (_, vehicle) in &self.vehicles {
            if vehicle.yield_to().is_some() {
                let eased = f64::max(vehicle.vel() - 0.5 * vehicle.max_decel() * dt, 0.0);
                vehicle.apply_speed_cap(eased);
            }
        }
    }

    /// Demands a full stop from all frozen vehicles.
    fn apply_frozen_vehicles(&mut self) {
        self.frozen_vehs.retain(|vehicle_id| {
            if let Some(vehicle) = self.vehicles.get(*vehicle_id) {
                vehicle.force_stop();
                true
            } else {
                false
            }
        })
    }

    /// Runs the lane change negotiation over every edge, in creation order.
    fn perform_lane_changes(&mut self, dt: f64) {
        let mut events = vec![];
        let mut changer = LaneChanger::new(
            &mut self.lanes,
            &mut self.vehicles,
            &self.links,
            self.config.lateral,
            dt,
        );
        for edge_id in &self.edge_order {
            events.extend(changer.run_edge(&self.edges[*edge_id]));
        }
        let marks = changer.take_yield_marks();

        // Rebuild the yield marks from this pass: a blocker keeps easing
        // off only while some vehicle still records it. The marks are read
        // by the next tick's speed plan and desirability scoring.
        for (_, vehicle) in &mut self.vehicles {
            vehicle.set_yield_to(None);
        }
        for (blocker, blocked) in marks {
            self.vehicles[blocker].set_yield_to(Some(blocked));
        }

        for event in events {
            self.stats.lane_changed(event.vehicle, event.from, event.to);
        }
    }

    /// Integrates all speed plans, advances vehicles across links,
    /// restores lane ordering and releases cleared grants.
    fn commit(&mut self, dt: f64) {
        for (id, vehicle) in &mut self.vehicles {
            let emergency = vehicle.integrate(dt, &mut self.rng);
            if emergency {
                log::warn!("vehicle {:?}: near miss, exceeded comfortable deceleration", id);
            }
        }

        let ids = self.vehicles.keys().collect::<Vec<_>>();
        for id in ids {
            self.advance_vehicle(id);
        }

        for (_, lane) in &mut self.lanes {
            lane.resort(&self.vehicles);
        }
        #[cfg(debug_assertions)]
        for (_, lane) in &self.lanes {
            debug_assert!(lane.is_sorted(&self.vehicles));
        }

        for (_, link) in &mut self.links {
            link.release_if_cleared(&self.vehicles);
        }

        for (id, vehicle) in &self.vehicles {
            self.stats
                .vehicle_moved(id, vehicle.lane(), vehicle.pos_rear(), vehicle.vel());
        }
    }

    /// Moves a vehicle onto its next lane(s) once its rear has passed the
    /// end of the current one, or removes it upon arrival.
    fn advance_vehicle(&mut self, id: VehicleId) {
        loop {
            let veh = &self.vehicles[id];
            let lane_id = veh.lane();
            let lane = &self.lanes[lane_id];
            if veh.pos_rear() < lane.length() {
                return;
            }
            let length = lane.length();

            let next = if lane.is_internal() {
                lane.continuation()
            } else {
                match junction::chosen_link(veh, lane, &self.links, &self.lanes) {
                    Some(link_id) if self.links[link_id].is_granted_to(id) => Some(self.links[link_id].via()),
                    _ => None,
                }
            };

            match next {
                Some(next_id) => {
                    // A manoeuvre cannot span a junction; abort the shadow.
                    if let LaneChangeState::Changing { from, to, .. } = *veh.change_state() {
                        let other = if lane_id == from { to } else { from };
                        self.lanes[other].remove_vehicle(id);
                        let veh = &mut self.vehicles[id];
                        veh.set_change_state(LaneChangeState::Stable);
                        veh.set_lat(0.0);
                    }
                    self.lanes[lane_id].remove_vehicle(id);
                    let veh = &mut self.vehicles[id];
                    veh.shift_pos(-length);
                    veh.set_lane(next_id);
                    if let Some(edge) = self.lanes[next_id].edge() {
                        self.vehicles[id].advance_route(edge);
                    }
                    self.lanes[next_id].insert_vehicle(&self.vehicles, id);
                }
                None => {
                    if veh.next_edge().is_none() {
                        self.despawn(id, LeaveReason::Arrived);
                        return;
                    }
                    // Overran an ungranted stop line; hold at the lane end.
                    log::warn!("vehicle {:?}: overran stop line, clamped", id);
                    let shift = (length - veh.length()) - veh.pos_rear();
                    self.vehicles[id].shift_pos(shift);
                    return;
                }
            }
        }
    }

    /// Removes a vehicle from all lane occupancy lists and the registry.
    fn despawn(&mut self, id: VehicleId, reason: LeaveReason) {
        let veh = &self.vehicles[id];
        let lane = veh.lane();
        if let LaneChangeState::Changing { from, to, .. } = *veh.change_state() {
            let other = if lane == from { to } else { from };
            self.lanes[other].remove_vehicle(id);
        }
        self.lanes[lane].remove_vehicle(id);
        self.vehicles.remove(id);
        self.stats.vehicle_left(id, reason);
    }
}
