use crate::lane::Lane;
use crate::vehicle::Vehicle;
use crate::{JunctionId, LaneId, LaneSet, LinkId, LinkSet, VehicleId, VehicleSet};
use smallvec::SmallVec;

/// The priority class of a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Priority {
    /// The link must yield to conflicting right-of-way links.
    Yield,
    /// The link holds the right of way.
    RightOfWay,
}

/// The admission state of a link, re-evaluated every tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No vehicle is approaching within the lookahead horizon.
    Idle,
    /// An approaching vehicle has requested crossing.
    Requesting,
    /// Crossing has been granted; held until the vehicle clears
    /// the internal lane.
    Granted,
    /// Crossing was denied this tick; the approaching vehicle is
    /// constrained toward the wait position.
    Denied,
}

/// A directed connection from the end of one lane to the start of another,
/// routed over a junction-internal lane.
#[derive(Clone, Debug)]
pub struct Link {
    id: LinkId,
    /// Stable sequence number; the final admission tie-break.
    seq: u32,
    junction: JunctionId,
    from: LaneId,
    via: LaneId,
    to: LaneId,
    priority: Priority,
    /// Links whose paths geometrically intersect this one.
    conflicts: SmallVec<[LinkId; 4]>,
    state: LinkState,
    approach: Option<Approach>,
    granted_to: Option<VehicleId>,
}

/// The attributes of a link.
#[derive(Clone, Copy, Debug)]
pub struct LinkAttributes {
    /// The lane the link leaves from.
    pub from: LaneId,
    /// The junction-internal lane the link is routed over.
    pub via: LaneId,
    /// The lane the link enters.
    pub to: LaneId,
    /// The priority class.
    pub priority: Priority,
}

/// The nearest approaching vehicle of a link, refreshed every tick.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Approach {
    pub vehicle: VehicleId,
    /// Distance from the vehicle's front to the stop line in m.
    pub dist: f64,
    /// Estimated arrival time at the stop line in s.
    pub eta: f64,
}

/// A junction arbitrates the conflict sets of its links.
#[derive(Clone, Debug)]
pub struct Junction {
    id: JunctionId,
    links: Vec<LinkId>,
    internal_lanes: Vec<LaneId>,
}

impl Link {
    pub(crate) fn new(id: LinkId, seq: u32, junction: JunctionId, attribs: &LinkAttributes) -> Self {
        Self {
            id,
            seq,
            junction,
            from: attribs.from,
            via: attribs.via,
            to: attribs.to,
            priority: attribs.priority,
            conflicts: SmallVec::new(),
            state: LinkState::Idle,
            approach: None,
            granted_to: None,
        }
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn junction(&self) -> JunctionId {
        self.junction
    }

    pub fn from(&self) -> LaneId {
        self.from
    }

    pub fn via(&self) -> LaneId {
        self.via
    }

    pub fn to(&self) -> LaneId {
        self.to
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// The links in conflict with this one.
    pub fn conflicts(&self) -> &[LinkId] {
        &self.conflicts
    }

    /// The vehicle currently holding this link's grant.
    pub fn granted_to(&self) -> Option<VehicleId> {
        self.granted_to
    }

    pub(crate) fn add_conflict(&mut self, other: LinkId) {
        if !self.conflicts.contains(&other) {
            self.conflicts.push(other);
        }
    }

    pub(crate) fn approach(&self) -> Option<&Approach> {
        self.approach.as_ref()
    }

    /// Whether this link has granted crossing to the given vehicle.
    pub(crate) fn is_granted_to(&self, vehicle: VehicleId) -> bool {
        self.state == LinkState::Granted && self.granted_to == Some(vehicle)
    }

    /// Releases the grant once the admitted vehicle has cleared the
    /// internal lane (or left the simulation).
    pub(crate) fn release_if_cleared(&mut self, vehicles: &VehicleSet) {
        if self.state != LinkState::Granted {
            return;
        }
        let cleared = match self.granted_to.and_then(|id| vehicles.get(id)) {
            Some(veh) => veh.lane() != self.from && veh.lane() != self.via,
            None => true,
        };
        if cleared {
            log::trace!("link {:?}: grant cleared", self.id);
            self.state = LinkState::Idle;
            self.granted_to = None;
            self.approach = None;
        }
    }
}

impl Junction {
    pub(crate) fn new(id: JunctionId) -> Self {
        Self {
            id,
            links: vec![],
            internal_lanes: vec![],
        }
    }

    pub fn id(&self) -> JunctionId {
        self.id
    }

    /// The incoming links of the junction, in creation order.
    pub fn links(&self) -> &[LinkId] {
        &self.links
    }

    /// The internal connector lanes owned by the junction.
    pub fn internal_lanes(&self) -> &[LaneId] {
        &self.internal_lanes
    }

    pub(crate) fn add_link(&mut self, link: LinkId) {
        self.links.push(link);
    }

    pub(crate) fn add_internal_lane(&mut self, lane: LaneId) {
        self.internal_lanes.push(lane);
    }

    /// Resolves this tick's crossing requests into grants and denials.
    ///
    /// The decision order is a strict total order over any conflicting pair:
    /// priority class, then estimated arrival time, then the stable link
    /// sequence number. This makes mutual-yield deadlock unreachable and the
    /// outcome deterministic.
    pub(crate) fn resolve(&self, links: &mut LinkSet) {
        let decisions = self
            .links
            .iter()
            .filter(|id| links[**id].state == LinkState::Requesting)
            .map(|id| {
                let link = &links[*id];
                let blocked = link.conflicts.iter().any(|c| {
                    let other = &links[*c];
                    match other.state {
                        // An uncleared grant excludes all conflicting streams.
                        LinkState::Granted => true,
                        LinkState::Requesting => beats(other, link),
                        _ => false,
                    }
                });
                let state = if blocked { LinkState::Denied } else { LinkState::Granted };
                (*id, state)
            })
            .collect::<Vec<_>>();

        for (id, state) in decisions {
            let link = &mut links[id];
            link.state = state;
            if state == LinkState::Granted {
                link.granted_to = link.approach.map(|a| a.vehicle);
                log::trace!("link {:?}: granted to {:?}", id, link.granted_to);
            }
        }
    }
}

/// Whether link `a` wins an equal-footing admission contest against `b`.
fn beats(a: &Link, b: &Link) -> bool {
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    match (&a.approach, &b.approach) {
        (Some(ra), Some(rb)) => match ra.eta.partial_cmp(&rb.eta).unwrap() {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => a.seq < b.seq,
        },
        _ => a.seq < b.seq,
    }
}

/// Refreshes the approach state of every link: the front vehicle of the
/// from-lane requests the link its route selects once it is within the
/// lookahead horizon.
pub(crate) fn update_approaches(links: &mut LinkSet, lanes: &LaneSet, vehicles: &VehicleSet, lookahead: f64) {
    let mut updates = vec![];
    for (id, link) in links.iter() {
        if link.state == LinkState::Granted {
            continue;
        }
        let lane = &lanes[link.from];
        let approach = lane
            .front_vehicle()
            .map(|vid| &vehicles[vid])
            .filter(|veh| chosen_link(veh, lane, links, lanes) == Some(id))
            .and_then(|veh| {
                let dist = f64::max(lane.length() - veh.pos_front(), 0.0);
                (dist <= lookahead).then(|| Approach {
                    vehicle: veh.id(),
                    dist,
                    eta: dist / f64::max(veh.vel(), 1.0),
                })
            });
        updates.push((id, approach));
    }

    for (id, approach) in updates {
        let link = &mut links[id];
        link.state = if approach.is_some() {
            LinkState::Requesting
        } else {
            LinkState::Idle
        };
        link.approach = approach;
    }
}


/// The link a vehicle will take at the end of the given lane: the first
/// link out whose target lane lies on the next edge of the vehicle's route.
pub(crate) fn chosen_link(veh: &Vehicle, lane: &Lane, links: &LinkSet, lanes: &LaneSet) -> Option<LinkId> {
    let next = veh.next_edge()?;
    lane.links_out()
        .iter()
        .copied()
        .find(|id| lanes[links[*id].to()].edge() == Some(next))
}
