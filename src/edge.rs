use crate::changer::LateralDirection;
use crate::{EdgeId, LaneId};

/// An edge is a fixed bundle of parallel, same-direction lanes.
/// It owns its lanes exclusively; lane 0 is the rightmost.
#[derive(Clone, Debug)]
pub struct Edge {
    id: EdgeId,
    lanes: Vec<LaneId>,
}

impl Edge {
    pub(crate) fn new(id: EdgeId, lanes: Vec<LaneId>) -> Self {
        Self { id, lanes }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    /// The lanes of the edge, rightmost first.
    pub fn lanes(&self) -> &[LaneId] {
        &self.lanes
    }

    pub(crate) fn set_lanes(&mut self, lanes: Vec<LaneId>) {
        self.lanes = lanes;
    }

    /// The lateral neighbour of the lane at `index` in the given direction.
    pub fn neighbor(&self, index: usize, dir: LateralDirection) -> Option<LaneId> {
        let idx = match dir {
            LateralDirection::Left => index.checked_add(1)?,
            LateralDirection::Right => index.checked_sub(1)?,
        };
        self.lanes.get(idx).copied()
    }
}
