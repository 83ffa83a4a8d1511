use crate::util::Interval;
use crate::vehicle::Vehicle;
use crate::{EdgeId, LaneId, LaneSet, LinkId, VehicleId, VehicleSet};
use smallvec::SmallVec;

/// A lane is a single traffic-carrying strip: a position-ordered
/// view of the vehicles travelling on it. It owns no vehicles.
#[derive(Clone, Debug)]
pub struct Lane {
    /// The lane ID.
    id: LaneId,
    /// The edge this lane belongs to; `None` for junction-internal lanes.
    edge: Option<EdgeId>,
    /// The lane index within its edge; 0 is the rightmost lane.
    index: usize,
    /// The length of the lane in m.
    length: f64,
    /// The width of the lane in m.
    width: f64,
    /// The speed limit in m/s.
    speed_limit: f64,
    /// The lane to the left, if any.
    left: Option<LaneId>,
    /// The lane to the right, if any.
    right: Option<LaneId>,
    /// The links leaving the end of this lane.
    links_out: SmallVec<[LinkId; 2]>,
    /// For internal lanes, the lane a vehicle continues onto.
    continuation: Option<LaneId>,
    /// The vehicles on the lane, ordered by decreasing position
    /// (the front of the lane comes first).
    vehicles: Vec<VehicleId>,
}

/// The attributes of a lane.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LaneAttributes {
    /// The length of the lane in m.
    pub length: f64,
    /// The width of the lane in m.
    pub width: f64,
    /// The speed limit in m/s.
    pub speed_limit: f64,
}

/// The nearest vehicle ahead of a queried position, with the net gap to it.
/// Recomputed every tick, never persisted.
#[derive(Clone, Copy, Debug)]
pub struct LeaderInfo {
    pub vehicle: VehicleId,
    /// Net bumper-to-bumper gap in m; negative if the footprints overlap.
    pub gap: f64,
    pub vel: f64,
    pub max_decel: f64,
}

/// The nearest vehicle behind a queried position, with the net gap to it.
#[derive(Clone, Copy, Debug)]
pub struct FollowerInfo {
    pub vehicle: VehicleId,
    /// Net bumper-to-bumper gap in m; negative if the footprints overlap.
    pub gap: f64,
    pub vel: f64,
}

impl LaneAttributes {
    /// Validates the attributes; rejected at network construction time.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.length > 0.0, "lane length must be positive");
        anyhow::ensure!(self.width > 0.0, "lane width must be positive");
        anyhow::ensure!(self.speed_limit > 0.0, "speed limit must be positive");
        Ok(())
    }
}

impl Lane {
    pub(crate) fn new(id: LaneId, attribs: &LaneAttributes, edge: Option<EdgeId>, index: usize) -> Self {
        Self {
            id,
            edge,
            index,
            length: attribs.length,
            width: attribs.width,
            speed_limit: attribs.speed_limit,
            left: None,
            right: None,
            links_out: SmallVec::new(),
            continuation: None,
            vehicles: vec![],
        }
    }

    pub fn id(&self) -> LaneId {
        self.id
    }

    /// The edge this lane belongs to; `None` for junction-internal lanes.
    pub fn edge(&self) -> Option<EdgeId> {
        self.edge
    }

    /// The lane index within its edge; 0 is the rightmost lane.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The length of the lane in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// The width of the lane in m.
    pub fn width(&self) -> f64 {
        self.width
    }

    /// The speed limit in m/s.
    pub fn speed_limit(&self) -> f64 {
        self.speed_limit
    }

    /// The lane to the left, if any.
    pub fn left(&self) -> Option<LaneId> {
        self.left
    }

    /// The lane to the right, if any.
    pub fn right(&self) -> Option<LaneId> {
        self.right
    }

    /// Whether this is a junction-internal connector lane.
    pub fn is_internal(&self) -> bool {
        self.edge.is_none()
    }

    /// The links leaving the end of this lane.
    pub fn links_out(&self) -> &[LinkId] {
        &self.links_out
    }

    /// For internal lanes, the lane a vehicle continues onto.
    pub fn continuation(&self) -> Option<LaneId> {
        self.continuation
    }

    /// The vehicles on the lane, front of lane first.
    pub fn vehicles(&self) -> &[VehicleId] {
        &self.vehicles
    }

    /// The vehicle nearest to the end of the lane.
    pub fn front_vehicle(&self) -> Option<VehicleId> {
        self.vehicles.first().copied()
    }

    /// The vehicle nearest to the start of the lane.
    pub fn rearmost_vehicle(&self) -> Option<VehicleId> {
        self.vehicles.last().copied()
    }

    pub(crate) fn set_left(&mut self, lane: Option<LaneId>) {
        self.left = lane;
    }

    pub(crate) fn set_right(&mut self, lane: Option<LaneId>) {
        self.right = lane;
    }

    pub(crate) fn add_link_out(&mut self, link: LinkId) {
        self.links_out.push(link);
    }

    pub(crate) fn set_continuation(&mut self, lane: LaneId) {
        self.continuation = Some(lane);
    }

    /// Inserts the vehicle with the given ID into the lane,
    /// preserving the position ordering.
    pub(crate) fn insert_vehicle(&mut self, vehicles: &VehicleSet, id: VehicleId) {
        let veh_pos = vehicles[id].pos_rear();
        let idx = self
            .vehicles
            .iter()
            .position(|other| vehicles[*other].pos_rear() < veh_pos)
            .unwrap_or(self.vehicles.len());
        self.vehicles.insert(idx, id);
    }

    /// Removes the vehicle with the given ID from the lane.
    pub(crate) fn remove_vehicle(&mut self, id: VehicleId) {
        if let Some(idx) = self.vehicles.iter().rposition(|v| *v == id) {
            self.vehicles.remove(idx);
        }
    }

    /// Restores the position ordering after positions have advanced.
    pub(crate) fn resort(&mut self, vehicles: &VehicleSet) {
        self.vehicles
            .sort_by(|a, b| vehicles[*b].pos_rear().partial_cmp(&vehicles[*a].pos_rear()).unwrap());
    }

    /// Finds the nearest vehicle ahead of the given rear position whose
    /// lateral extent on this lane overlaps `band` (if one is given).
    ///
    /// `pos_front` is used to compute the net gap and may be negative to
    /// query from behind the start of the lane.
    pub(crate) fn leader(
        &self,
        lanes: &LaneSet,
        vehicles: &VehicleSet,
        pos_rear: f64,
        pos_front: f64,
        band: Option<Interval<f64>>,
        exclude: Option<VehicleId>,
    ) -> Option<LeaderInfo> {
        self.vehicles
            .iter()
            .rev()
            .map(|id| (*id, &vehicles[*id]))
            .filter(|(id, _)| Some(*id) != exclude)
            .filter(|(_, veh)| veh.pos_rear() > pos_rear)
            .find(|(_, veh)| match band {
                Some(band) => lat_interval_on(veh, self.id, lanes)
                    .map(|lat| lat.overlaps(&band))
                    .unwrap_or(true),
                None => true,
            })
            .map(|(id, veh)| LeaderInfo {
                vehicle: id,
                gap: veh.pos_rear() - pos_front,
                vel: veh.vel(),
                max_decel: veh.max_decel(),
            })
    }

    /// Finds the nearest vehicle behind the given rear position whose
    /// lateral extent on this lane overlaps `band` (if one is given).
    pub(crate) fn follower(
        &self,
        lanes: &LaneSet,
        vehicles: &VehicleSet,
        pos_rear: f64,
        band: Option<Interval<f64>>,
        exclude: Option<VehicleId>,
    ) -> Option<FollowerInfo> {
        self.vehicles
            .iter()
            .map(|id| (*id, &vehicles[*id]))
            .filter(|(id, _)| Some(*id) != exclude)
            .filter(|(_, veh)| veh.pos_rear() <= pos_rear)
            .find(|(_, veh)| match band {
                Some(band) => lat_interval_on(veh, self.id, lanes)
                    .map(|lat| lat.overlaps(&band))
                    .unwrap_or(false),
                None => true,
            })
            .map(|(id, veh)| FollowerInfo {
                vehicle: id,
                gap: pos_rear - veh.pos_front(),
                vel: veh.vel(),
            })
    }

    /// Applies the car-following model to every vehicle on this lane,
    /// constraining each one behind its nearest laterally conflicting leader.
    pub(crate) fn apply_car_following(&self, lanes: &LaneSet, vehicles: &VehicleSet, dt: f64) {
        for (idx, id) in self.vehicles.iter().enumerate() {
            let ego = &vehicles[*id];
            ego.apply_speed_limit(self.speed_limit);

            let ego_band = match lat_interval_on(ego, self.id, lanes) {
                Some(band) => band,
                None => continue,
            };

            // Scan the vehicles ahead, nearest first.
            for other in self.vehicles[..idx].iter().rev() {
                let leader = &vehicles[*other];
                let overlaps = lat_interval_on(leader, self.id, lanes)
                    .map(|lat| lat.overlaps(&ego_band))
                    .unwrap_or(true);
                if overlaps {
                    let gap = leader.pos_rear() - ego.pos_front();
                    ego.follow_leader(gap, leader.vel(), leader.max_decel(), dt);
                    break;
                }
            }
        }
    }

    /// Whether the ordering invariant holds.
    #[cfg(debug_assertions)]
    pub(crate) fn is_sorted(&self, vehicles: &VehicleSet) -> bool {
        self.vehicles
            .windows(2)
            .all(|w| vehicles[w[0]].pos_rear() >= vehicles[w[1]].pos_rear())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vehicle::{CarFollowModel, ModelParams, VehicleAttributes};
    use assert_approx_eq::assert_approx_eq;

    fn attribs() -> VehicleAttributes {
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

    fn setup(positions: &[f64]) -> (LaneSet, VehicleSet, LaneId, Vec<VehicleId>) {
        let mut lanes = LaneSet::default();
        let mut vehicles = VehicleSet::default();
        let attrs = LaneAttributes {
            length: 200.0,
            width: 3.5,
            speed_limit: 16.66,
        };
        let lane = lanes.insert_with_key(|id| Lane::new(id, &attrs, None, 0));
        let ids = positions
            .iter()
            .map(|pos| {
                let id = vehicles.insert_with_key(|id| Vehicle::new(id, &attribs(), lane, *pos));
                lanes[lane].insert_vehicle(&vehicles, id);
                id
            })
            .collect();
        (lanes, vehicles, lane, ids)
    }

    #[test]
    fn occupancy_is_ordered_front_first() {
        let (lanes, _, lane, ids) = setup(&[10.0, 50.0, 30.0]);
        assert_eq!(lanes[lane].vehicles(), &[ids[1], ids[2], ids[0]]);
        assert_eq!(lanes[lane].front_vehicle(), Some(ids[1]));
        assert_eq!(lanes[lane].rearmost_vehicle(), Some(ids[0]));
    }

    #[test]
    fn leader_and_follower_gaps() {
        let (lanes, vehicles, lane, ids) = setup(&[10.0, 50.0]);
        let lane = &lanes[lane];

        let leader = lane.leader(&lanes, &vehicles, 10.0, 15.0, None, Some(ids[0])).unwrap();
        assert_eq!(leader.vehicle, ids[1]);
        assert_approx_eq!(leader.gap, 35.0);

        let follower = lane.follower(&lanes, &vehicles, 50.0, None, Some(ids[1])).unwrap();
        assert_eq!(follower.vehicle, ids[0]);
        assert_approx_eq!(follower.gap, 35.0);
    }

    #[test]
    fn remove_and_resort() {
        let (mut lanes, vehicles, lane, ids) = setup(&[10.0, 50.0, 30.0]);
        lanes[lane].remove_vehicle(ids[2]);
        assert_eq!(lanes[lane].vehicles(), &[ids[1], ids[0]]);
        lanes[lane].resort(&vehicles);
        assert!(lanes[lane].is_sorted(&vehicles));
    }
}

/// The lateral extent of a vehicle expressed relative to the centre line of
/// the given lane. Returns `None` if the vehicle is registered on a lane that
/// is not `lane_id` or one of its immediate neighbours.
pub(crate) fn lat_interval_on(veh: &Vehicle, lane_id: LaneId, lanes: &LaneSet) -> Option<Interval<f64>> {
    if veh.lane() == lane_id {
        return Some(veh.footprint_lat());
    }
    let own = &lanes[veh.lane()];
    let target = &lanes[lane_id];
    let shift = 0.5 * (own.width() + target.width());
    if own.left() == Some(lane_id) {
        // Target is to the left; positions shift right in its frame.
        Some(veh.footprint_lat() + -shift)
    } else if own.right() == Some(lane_id) {
        Some(veh.footprint_lat() + shift)
    } else {
        None
    }
}
