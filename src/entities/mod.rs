// Entity Models
// Agents are identified by a composite "<sector>:<region>" key and described
// by attributes resolved once at load time. The registry maps symbolic codes
// to store indices and back.

pub mod agent;
pub mod region_groups;
pub mod registry;

pub use agent::{
    compose_name, is_quintile, short_quintile, split_name, AgentInfo, AgentType, LONG_QUINTILES,
    SHORT_QUINTILES,
};
pub use region_groups::RegionGroups;
pub use registry::{CodeTable, CoordinateRegistry};
