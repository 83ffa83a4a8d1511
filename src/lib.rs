pub use changer::{LaneChangeState, LateralDirection, LateralPolicy};
pub use edge::Edge;
pub use junction::{Junction, Link, LinkAttributes, LinkState, Priority};
pub use lane::{FollowerInfo, Lane, LaneAttributes, LeaderInfo};
pub use simulation::{SimConfig, Simulation};
use slotmap::{new_key_type, SlotMap};
pub use slotmap::{Key, KeyData};
pub use stats::{LeaveReason, NullSink, StatsSink};
pub use util::Interval;
pub use vehicle::{CarFollowModel, ModelParams, Vehicle, VehicleAttributes};

mod changer;
mod debug;
mod edge;
mod junction;
mod lane;
mod simulation;
mod stats;
mod util;
mod vehicle;

new_key_type! {
    /// Unique ID of a [Vehicle].
    pub struct VehicleId;
    /// Unique ID of a [Lane].
    pub struct LaneId;
    /// Unique ID of an [Edge].
    pub struct EdgeId;
    /// Unique ID of a [Link].
    pub struct LinkId;
    /// Unique ID of a [Junction].
    pub struct JunctionId;
}

type VehicleSet = SlotMap<VehicleId, Vehicle>;
type LaneSet = SlotMap<LaneId, Lane>;
type EdgeSet = SlotMap<EdgeId, Edge>;
type LinkSet = SlotMap<LinkId, Link>;
type JunctionSet = SlotMap<JunctionId, Junction>;
