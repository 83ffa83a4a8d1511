use crate::lane::{lat_interval_on, Lane};
use crate::util::Interval;
use crate::vehicle::Vehicle;
use crate::{Edge, EdgeId, LaneId, LaneSet, LinkSet, VehicleId, VehicleSet};
use arrayvec::ArrayVec;
use itertools::Itertools;

/// The minimum desirability score for a voluntary lane change.
/// Acts as hysteresis against oscillating between lanes.
const CHANGE_THRESHOLD: f64 = 1.0;

/// Bonus for changing right on an otherwise free road.
const KEEP_RIGHT_BIAS: f64 = 0.2;

/// Weight of the anticipated speed gain in m/s.
const SPEED_GAIN_WEIGHT: f64 = 1.0;

/// Bonus for vacating a lane after blocking another vehicle's change.
const COOPERATIVE_BONUS: f64 = 0.5;

/// Base bonus for a change required to follow the route.
const STRATEGIC_BONUS: f64 = 2.0;

/// Gain of the strategic urgency as the remaining distance shrinks.
const URGENCY_GAIN: f64 = 200.0;

/// The remaining distance below which urgency no longer grows, in m.
const URGENCY_FLOOR: f64 = 10.0;

/// Residual lateral offset below which a manoeuvre counts as finished, in m.
const LAT_EPSILON: f64 = 0.05;

/// A lateral direction relative to the direction of travel.
/// Positive lateral offsets point left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LateralDirection {
    Left,
    Right,
}

impl LateralDirection {
    /// The sign of lateral motion in this direction.
    pub fn sign(self) -> f64 {
        match self {
            LateralDirection::Left => 1.0,
            LateralDirection::Right => -1.0,
        }
    }
}

/// How committed lateral moves are executed.
#[derive(Clone, Copy, Debug)]
pub enum LateralPolicy {
    /// Lane membership changes instantaneously on commit.
    Instant,
    /// The lateral offset moves continuously, rate-limited by the
    /// maximum lateral speed in m/s; membership changes when the
    /// reference position crosses the lane boundary.
    Sublane { max_lat_speed: f64 },
}

/// The lateral negotiation state of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneChangeState {
    /// No lateral intent.
    Stable,
    /// The last evaluated change was infeasible; the neighbour that
    /// denied it is recorded for diagnostics and cooperative yielding.
    Blocked { blocker: VehicleId },
    /// A committed manoeuvre is in progress (sub-lane execution only).
    Changing {
        dir: LateralDirection,
        from: LaneId,
        to: LaneId,
    },
}

/// A completed lane membership change, reported to the statistics sink.
pub(crate) struct ChangeEvent {
    pub vehicle: VehicleId,
    pub from: LaneId,
    pub to: LaneId,
}

/// A candidate lateral move under evaluation.
struct Candidate {
    dir: LateralDirection,
    target: LaneId,
    score: f64,
    forced: bool,
}

/// The per-edge, per-tick lane change negotiation pass.
///
/// Vehicles are visited front-to-back so that every committed move is
/// already reflected in lane occupancy when the vehicles behind evaluate
/// theirs; two vehicles can never claim the same target gap in one tick.
pub(crate) struct LaneChanger<'a> {
    lanes: &'a mut LaneSet,
    vehicles: &'a mut VehicleSet,
    links: &'a LinkSet,
    policy: LateralPolicy,
    dt: f64,
    events: Vec<ChangeEvent>,
    /// The (blocker, blocked) pairs recorded during the pass.
    marks: Vec<(VehicleId, VehicleId)>,
}

impl<'a> LaneChanger<'a> {
    pub fn new(
        lanes: &'a mut LaneSet,
        vehicles: &'a mut VehicleSet,
        links: &'a LinkSet,
        policy: LateralPolicy,
        dt: f64,
    ) -> Self {
        Self {
            lanes,
            vehicles,
            links,
            policy,
            dt,
            events: vec![],
            marks: vec![],
        }
    }

    /// The (blocker, blocked) pairs recorded since the last call.
    /// Marks carry over one tick into the next speed plan and the next
    /// desirability scoring, then lapse unless recorded again.
    pub fn take_yield_marks(&mut self) -> Vec<(VehicleId, VehicleId)> {
        std::mem::take(&mut self.marks)
    }

    /// Runs the negotiation pass over one edge and returns the
    /// membership changes that were committed.
    pub fn run_edge(&mut self, edge: &Edge) -> Vec<ChangeEvent> {
        // Deterministic order: front-to-back, ties broken by vehicle key.
        let order = edge
            .lanes()
            .iter()
            .flat_map(|lane| self.lanes[*lane].vehicles())
            .copied()
            .filter(|id| {
                // A mid-change vehicle is listed on two lanes; visit it once,
                // via the lane it is registered on.
                edge.lanes().contains(&self.vehicles[*id].lane())
            })
            .unique()
            .sorted_by(|a, b| {
                let pa = self.vehicles[*a].pos_rear();
                let pb = self.vehicles[*b].pos_rear();
                pb.partial_cmp(&pa).unwrap().then(a.cmp(b))
            })
            .collect::<Vec<_>>();

        for id in order {
            self.step_vehicle(id, edge);
        }
        std::mem::take(&mut self.events)
    }

    fn step_vehicle(&mut self, id: VehicleId, edge: &Edge) {
        match *self.vehicles[id].change_state() {
            LaneChangeState::Changing { dir, from, to } => {
                self.continue_change(id, dir, from, to);
            }
            _ => {
                self.relax_lateral_offset(id);
                self.evaluate(id, edge);
            }
        }
    }

    /// Evaluates both lateral directions and commits the best feasible move.
    fn evaluate(&mut self, id: VehicleId, edge: &Edge) {
        let ego = &self.vehicles[id];
        let lane = &self.lanes[ego.lane()];
        let forced = ego.forced_change();

        let mut candidates: ArrayVec<Candidate, 2> = ArrayVec::new();
        for dir in [LateralDirection::Left, LateralDirection::Right] {
            let target = match edge.neighbor(lane.index(), dir) {
                Some(target) => target,
                None => continue,
            };
            let is_forced = forced == Some(dir);
            let score = if is_forced {
                f64::INFINITY
            } else {
                self.desirability(ego, lane, &self.lanes[target], dir, edge)
            };
            candidates.push(Candidate {
                dir,
                target,
                score,
                forced: is_forced,
            });
        }

        let best = candidates
            .into_iter()
            .filter(|c| c.forced || c.score > CHANGE_THRESHOLD)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap());
        let best = match best {
            Some(best) => best,
            None => {
                self.vehicles[id].set_change_state(LaneChangeState::Stable);
                return;
            }
        };

        match self.find_blocker(id, best.target) {
            Some(blocker) => {
                self.vehicles[id].set_change_state(LaneChangeState::Blocked { blocker });
                self.marks.push((blocker, id));
                log::debug!("vehicle {:?}: change {:?} blocked by {:?}", id, best.dir, blocker);
            }
            None => self.commit(id, best.dir, best.target),
        }
    }

    /// The lateral region of the given lane the vehicle sweeps while moving
    /// onto its centre line, used to project gap queries in sub-lane mode.
    /// Whole-lane mode contests the entire lane.
    fn sweep_band(&self, ego: &Vehicle, lane: LaneId) -> Option<Interval<f64>> {
        match self.policy {
            LateralPolicy::Instant => None,
            LateralPolicy::Sublane { .. } => {
                let dest = Interval::disc(0.0, 0.5 * ego.width());
                Some(match lat_interval_on(ego, lane, self.lanes) {
                    Some(current) => Interval::new(
                        f64::min(current.min, dest.min),
                        f64::max(current.max, dest.max),
                    ),
                    None => dest,
                })
            }
        }
    }

    /// Computes the desirability of changing one lane in the given direction
    /// from strategic, tactical and cooperative motives.
    fn desirability(&self, ego: &Vehicle, lane: &Lane, target: &Lane, dir: LateralDirection, edge: &Edge) -> f64 {
        let mut score = 0.0;

        // Tactical: anticipated speed gain.
        let v_here = self.anticipated_speed(ego, lane);
        let v_there = self.anticipated_speed(ego, target);
        score += SPEED_GAIN_WEIGHT * (v_there - v_here);

        if dir == LateralDirection::Right {
            score += KEEP_RIGHT_BIAS;
        }

        // Cooperative: vacating helps a vehicle this one blocked earlier.
        if ego.yield_to().is_some() {
            score += COOPERATIVE_BONUS;
        }

        // Strategic: the route decides which lanes have a continuation.
        if let Some(next) = ego.next_edge() {
            let dist_to_end = f64::max(lane.length() - ego.pos_front(), 0.0);
            let urgency = URGENCY_GAIN / f64::max(dist_to_end, URGENCY_FLOOR);
            let here_ok = self.connects(lane, next);
            let there_ok = self.connects(target, next);
            match (here_ok, there_ok) {
                (true, false) => score -= STRATEGIC_BONUS + urgency,
                (false, _) => {
                    if self.is_toward_connection(lane.index(), dir, edge, next) {
                        score += STRATEGIC_BONUS + urgency;
                    } else {
                        score -= STRATEGIC_BONUS + urgency;
                    }
                }
                _ => {}
            }
        }

        score
    }

    /// The speed the vehicle could sustain on the given lane next tick.
    fn anticipated_speed(&self, ego: &Vehicle, lane: &Lane) -> f64 {
        let free = ego.vel() + ego.model().params().max_accel * self.dt;
        let v = f64::min(ego.velocity_adjust() * lane.speed_limit(), free);
        let leader = lane.leader(
            self.lanes,
            self.vehicles,
            ego.pos_rear(),
            ego.pos_front(),
            self.sweep_band(ego, lane.id()),
            Some(ego.id()),
        );
        match leader {
            Some(l) => f64::min(v, ego.model().follow_speed(ego.vel(), l.gap, l.vel, l.max_decel, self.dt)),
            None => v,
        }
    }

    /// Whether the lane has a link onto the given edge.
    fn connects(&self, lane: &Lane, next: EdgeId) -> bool {
        lane.links_out()
            .iter()
            .any(|id| self.lanes[self.links[*id].to()].edge() == Some(next))
    }

    /// Whether moving in `dir` brings the vehicle closer to a lane
    /// that connects onto the next route edge.
    fn is_toward_connection(&self, index: usize, dir: LateralDirection, edge: &Edge, next: EdgeId) -> bool {
        let nearest = edge
            .lanes()
            .iter()
            .enumerate()
            .filter(|(_, lane)| self.connects(&self.lanes[**lane], next))
            .map(|(idx, _)| idx)
            .min_by_key(|idx| idx.abs_diff(index));
        match nearest {
            Some(nearest) => match dir {
                LateralDirection::Left => nearest > index,
                LateralDirection::Right => nearest < index,
            },
            None => false,
        }
    }

    /// Gap acceptance: both the prospective leader and follower on the
    /// target lane must keep the same safe gap the car-following model
    /// enforces longitudinally. Returns the neighbour that fails, if any.
    fn find_blocker(&self, id: VehicleId, target: LaneId) -> Option<VehicleId> {
        let ego = &self.vehicles[id];
        let lane = &self.lanes[target];
        let band = self.sweep_band(ego, target);

        if let Some(leader) = lane.leader(
            self.lanes,
            self.vehicles,
            ego.pos_rear(),
            ego.pos_front(),
            band,
            Some(id),
        ) {
            let secure = ego.model().secure_gap(ego.vel(), leader.vel, leader.max_decel);
            if leader.gap < secure {
                return Some(leader.vehicle);
            }
        }

        if let Some(follower) = lane.follower(self.lanes, self.vehicles, ego.pos_rear(), band, Some(id)) {
            let them = &self.vehicles[follower.vehicle];
            let secure = them.model().secure_gap(follower.vel, ego.vel(), ego.max_decel());
            if follower.gap < secure {
                return Some(follower.vehicle);
            }
        }

        None
    }

    /// Applies a committed move according to the lateral policy.
    fn commit(&mut self, id: VehicleId, dir: LateralDirection, target: LaneId) {
        let from = self.vehicles[id].lane();
        match self.policy {
            LateralPolicy::Instant => {
                self.lanes[from].remove_vehicle(id);
                self.lanes[target].insert_vehicle(self.vehicles, id);
                let veh = &mut self.vehicles[id];
                veh.set_lane(target);
                veh.set_lat(0.0);
                veh.set_change_state(LaneChangeState::Stable);
                if veh.forced_change() == Some(dir) {
                    veh.set_forced_change(None);
                }
                self.events.push(ChangeEvent {
                    vehicle: id,
                    from,
                    to: target,
                });
            }
            LateralPolicy::Sublane { .. } => {
                // Occupy both lanes for the duration of the manoeuvre.
                self.lanes[target].insert_vehicle(self.vehicles, id);
                self.vehicles[id].set_change_state(LaneChangeState::Changing {
                    dir,
                    from,
                    to: target,
                });
            }
        }
        log::debug!("vehicle {:?}: committed change {:?} onto {:?}", id, dir, target);
    }

    /// Advances an in-progress sub-lane manoeuvre by one tick.
    fn continue_change(&mut self, id: VehicleId, dir: LateralDirection, from: LaneId, to: LaneId) {
        let max_lat_speed = match self.policy {
            LateralPolicy::Sublane { max_lat_speed } => max_lat_speed,
            // The policy changed mid-run; finish instantly.
            LateralPolicy::Instant => {
                self.finish_change(id, from, to);
                return;
            }
        };

        let crossed = self.vehicles[id].lane() == to;

        // The feasibility snapshot can be invalidated by a newly arrived
        // vehicle; before the boundary is crossed the manoeuvre aborts.
        if !crossed {
            if let Some(blocker) = self.find_blocker(id, to) {
                self.lanes[to].remove_vehicle(id);
                self.vehicles[id].set_change_state(LaneChangeState::Blocked { blocker });
                self.marks.push((blocker, id));
                log::debug!("vehicle {:?}: change aborted, blocked by {:?}", id, blocker);
                return;
            }
        }

        let step = dir.sign() * max_lat_speed * self.dt;
        let veh = &self.vehicles[id];
        let lat = veh.lat() + step;

        if !crossed {
            let boundary = 0.5 * self.lanes[from].width();
            if lat.abs() >= boundary {
                // The reference position crossed the lane boundary:
                // membership moves to the target lane.
                let rebase = dir.sign() * 0.5 * (self.lanes[from].width() + self.lanes[to].width());
                let veh = &mut self.vehicles[id];
                veh.set_lane(to);
                veh.set_lat(lat - rebase);
                self.events.push(ChangeEvent {
                    vehicle: id,
                    from,
                    to,
                });
            } else {
                self.vehicles[id].set_lat(lat);
            }
            return;
        }

        // Past the boundary the offset converges on the new centre line.
        if (lat * dir.sign()) >= -LAT_EPSILON {
            self.finish_change(id, from, to);
        } else {
            self.vehicles[id].set_lat(lat);
        }
    }

    fn finish_change(&mut self, id: VehicleId, from: LaneId, to: LaneId) {
        self.lanes[from].remove_vehicle(id);
        let veh = &mut self.vehicles[id];
        veh.set_lane(to);
        veh.set_lat(0.0);
        veh.set_change_state(LaneChangeState::Stable);
        if veh.forced_change().is_some() {
            veh.set_forced_change(None);
        }
    }

    /// Steers a vehicle with a residual lateral offset (an aborted
    /// manoeuvre) back toward its lane centre, without teleporting.
    fn relax_lateral_offset(&mut self, id: VehicleId) {
        let lat = self.vehicles[id].lat();
        if lat == 0.0 {
            return;
        }
        let max_lat_speed = match self.policy {
            LateralPolicy::Sublane { max_lat_speed } => max_lat_speed,
            LateralPolicy::Instant => {
                self.vehicles[id].set_lat(0.0);
                return;
            }
        };
        let step = max_lat_speed * self.dt;
        let next = if lat.abs() <= step + LAT_EPSILON {
            0.0
        } else {
            lat - lat.signum() * step
        };
        self.vehicles[id].set_lat(next);
    }
}
