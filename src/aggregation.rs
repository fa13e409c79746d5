// ➕ Aggregator
// Merges agents along region or sector into new aggregate agents, e.g.
// {AGRI:CHN, AGRI:USA} → AGRI:NAM. Aggregates are appended to the agent axis
// (optionally replacing their constituents) in data and baseline alike, and
// the registry is extended with the new identities.

use crate::dataset::AgentDataset;
use crate::entities::{AgentInfo, AgentType};
use crate::error::{PostprocError, Result};
use crate::frame::{Frame, Label, Reduction, AGENT};
use crate::resolver::{resolve, AgentQuery, Criterion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// AGGREGATION DIMENSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateDim {
    Region,
    Sector,
}

impl AggregateDim {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateDim::Region => "region",
            AggregateDim::Sector => "sector",
        }
    }

    fn attribute<'a>(&self, info: &'a AgentInfo) -> &'a str {
        match self {
            AggregateDim::Region => &info.region,
            AggregateDim::Sector => &info.sector,
        }
    }

    /// The agent with this dimension's component replaced
    fn substitute(&self, info: &AgentInfo, new_code: &str) -> AgentInfo {
        let mut next = info.clone();
        match self {
            AggregateDim::Region => next.region = new_code.to_string(),
            AggregateDim::Sector => next.sector = new_code.to_string(),
        }
        next
    }
}

impl FromStr for AggregateDim {
    type Err = PostprocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "region" => Ok(AggregateDim::Region),
            "sector" => Ok(AggregateDim::Sector),
            _ => Err(PostprocError::InvalidAggregationDimension(s.to_string())),
        }
    }
}

impl fmt::Display for AggregateDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// GROUP SPEC
// ============================================================================

/// One aggregation: members of `dim` merged under `name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub dim: AggregateDim,
    pub members: Vec<String>,
    pub name: String,

    #[serde(default)]
    pub how: Reduction,

    /// Remove the constituents, keeping only the aggregate
    #[serde(default)]
    pub drop: bool,
}

impl GroupSpec {
    pub fn new<I, S>(dim: AggregateDim, members: I, name: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GroupSpec {
            dim,
            members: members.into_iter().map(Into::into).collect(),
            name: name.to_string(),
            how: Reduction::default(),
            drop: false,
        }
    }

    pub fn reduce_with(mut self, how: Reduction) -> Self {
        self.how = how;
        self
    }

    pub fn drop_originals(mut self, drop: bool) -> Self {
        self.drop = drop;
        self
    }
}

// ============================================================================
// GROUP AGENTS
// ============================================================================

impl AgentDataset {
    pub fn group_agents(&self, spec: &GroupSpec) -> Result<AgentDataset> {
        let registry = self.registry();
        let present = self.agents();

        let taken = present
            .iter()
            .filter_map(|name| registry.agent(name))
            .any(|info| spec.dim.attribute(info) == spec.name);
        if taken {
            warn!(dim = %spec.dim, name = %spec.name, "Aggregate name already exists, dataset unchanged");
            return Ok(self.clone());
        }

        // Member codes as they appear on agents (region groups flattened)
        let mut codes: BTreeSet<String> = BTreeSet::new();
        for member in &spec.members {
            let expanded = match spec.dim {
                AggregateDim::Region => registry.expand_region(member)?,
                AggregateDim::Sector => BTreeSet::from([member.clone()]),
            };
            let found = present
                .iter()
                .filter_map(|name| registry.agent(name))
                .any(|info| expanded.contains(spec.dim.attribute(info)));
            if !found {
                warn!(dim = %spec.dim, member = %member, "Group member not found in data");
            }
            codes.extend(expanded);
        }

        let criterion = Criterion::Many(codes.into_iter().collect());
        let query = match spec.dim {
            AggregateDim::Region => AgentQuery::new().region(criterion),
            AggregateDim::Sector => AgentQuery::new().sector(criterion),
        };
        let matched = resolve(registry, present.iter().copied(), &query)?.agents;
        if matched.is_empty() {
            warn!(name = %spec.name, "Group matches no agent, nothing aggregated");
            return Ok(self.clone());
        }

        // New agents in first-appearance order along the agent axis
        let mut order: Vec<AgentInfo> = Vec::new();
        let mut groups: HashMap<String, (Vec<usize>, Vec<AgentType>)> = HashMap::new();
        for (position, name) in present.iter().enumerate() {
            if !matched.contains(*name) {
                continue;
            }
            let Some(info) = registry.agent(name) else {
                continue;
            };
            let aggregate = spec.dim.substitute(info, &spec.name);
            let entry = groups.entry(aggregate.name()).or_insert_with(|| {
                order.push(aggregate.clone());
                (Vec::new(), Vec::new())
            });
            entry.0.push(position);
            entry.1.push(info.agent_type);
        }

        let mut new_agents = Vec::with_capacity(order.len());
        let mut reduce_groups = Vec::with_capacity(order.len());
        for mut aggregate in order {
            let name = aggregate.name();
            let Some((positions, types)) = groups.remove(&name) else {
                continue;
            };
            if let Some(combined) = AgentType::combine(types) {
                if combined == AgentType::Mixed {
                    warn!(agent = %name, "Aggregate mixes firms and consumers");
                }
                aggregate.agent_type = combined;
            }
            reduce_groups.push((Label::from(name), positions));
            new_agents.push(aggregate);
        }

        let constituents: BTreeSet<usize> = reduce_groups.iter().flat_map(|(_, g)| g.iter().copied()).collect();
        let keep: Vec<usize> = (0..present.len()).filter(|i| !constituents.contains(i)).collect();

        let attach = |frame: &Frame| -> Result<Frame> {
            let aggregated = frame.group_reduce(AGENT, &reduce_groups, spec.how)?;
            let base = if spec.drop { frame.isel(AGENT, &keep)? } else { frame.clone() };
            base.concat(&aggregated, AGENT)
        };

        info!(
            dim = %spec.dim,
            name = %spec.name,
            merged = constituents.len(),
            created = new_agents.len(),
            how = %spec.how,
            "Aggregated agents"
        );
        let registry = Arc::new(registry.extended(new_agents));
        self.map_frames(registry, attach)
    }

    /// Apply several aggregations in order
    pub fn group_agents_many(&self, specs: &[GroupSpec]) -> Result<AgentDataset> {
        let mut dataset = self.clone();
        for spec in specs {
            dataset = dataset.group_agents(spec)?;
        }
        Ok(dataset)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{date, sample};
    use crate::entities::RegionGroups;
    use crate::frame::TIME;

    fn flow_of(dataset: &AgentDataset, agent: &str) -> Vec<f64> {
        dataset
            .agent_series("firms.flow", agent)
            .unwrap()
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    #[test]
    fn test_invalid_dimension_fails_fast() {
        assert!(matches!(
            "agent_type".parse::<AggregateDim>(),
            Err(PostprocError::InvalidAggregationDimension(_))
        ));
        assert_eq!("Region".parse::<AggregateDim>().unwrap(), AggregateDim::Region);
    }

    #[test]
    fn test_region_sum_keeps_originals() {
        let dataset = sample();
        let spec = GroupSpec::new(AggregateDim::Region, ["CHN", "USA"], "NAM");
        let grouped = dataset.group_agents(&spec).unwrap();

        assert_eq!(
            grouped.agents(),
            vec!["AGRI:CHN", "FOOD:CHN", "AGRI:USA", "q1:USA", "AGRI:NAM", "FOOD:NAM", "q1:NAM"]
        );
        let expected: Vec<f64> = flow_of(&dataset, "AGRI:CHN")
            .iter()
            .zip(flow_of(&dataset, "AGRI:USA"))
            .map(|(a, b)| a + b)
            .collect();
        assert_eq!(flow_of(&grouped, "AGRI:NAM"), expected);
        assert_eq!(flow_of(&grouped, "AGRI:CHN"), flow_of(&dataset, "AGRI:CHN"));
    }

    #[test]
    fn test_baseline_gets_same_aggregation() {
        let grouped = sample()
            .group_agents(&GroupSpec::new(AggregateDim::Region, ["CHN", "USA"], "NAM"))
            .unwrap();
        let baseline = grouped.baseline().unwrap();
        assert_eq!(baseline.coord(AGENT), grouped.data().coord(AGENT));
        let position = baseline.position(AGENT, &Label::from("AGRI:NAM")).unwrap();
        // AGRI:CHN = 1, AGRI:USA = 3 at the first timestep
        assert_eq!(baseline.variable("firms.flow").unwrap().get(&[position]), Some(4.0));
    }

    #[test]
    fn test_drop_removes_constituents_only() {
        let spec = GroupSpec::new(AggregateDim::Sector, ["AGRI", "FOOD"], "AGFO").drop_originals(true);
        let grouped = sample().group_agents(&spec).unwrap();
        assert_eq!(grouped.agents(), vec!["q1:USA", "AGFO:CHN", "AGFO:USA"]);
        assert_eq!(grouped.registry().agent("AGFO:CHN").unwrap().agent_type, AgentType::Firm);
    }

    #[test]
    fn test_mixed_sector_aggregate() {
        let spec = GroupSpec::new(AggregateDim::Sector, ["AGRI", "q1"], "ALL");
        let grouped = sample().group_agents(&spec).unwrap();
        let registry = grouped.registry();
        assert_eq!(registry.agent("ALL:USA").unwrap().agent_type, AgentType::Mixed);
        assert_eq!(registry.agent("ALL:CHN").unwrap().agent_type, AgentType::Firm);
    }

    #[test]
    fn test_existing_name_is_noop() {
        let dataset = sample();
        let grouped = dataset
            .group_agents(&GroupSpec::new(AggregateDim::Region, ["CHN"], "USA"))
            .unwrap();
        assert_eq!(grouped.data(), dataset.data());
        assert_eq!(grouped.registry().agent_count(), dataset.registry().agent_count());
    }

    #[test]
    fn test_no_match_is_noop() {
        let dataset = sample();
        let grouped = dataset
            .group_agents(&GroupSpec::new(AggregateDim::Sector, ["MACH"], "HEAVY"))
            .unwrap();
        assert_eq!(grouped.data(), dataset.data());
    }

    #[test]
    fn test_mean_reduction() {
        let spec = GroupSpec::new(AggregateDim::Region, ["CHN", "USA"], "NAM").reduce_with(Reduction::Mean);
        let grouped = sample().group_agents(&spec).unwrap();
        let at_start = grouped.data().sel_point(TIME, &date(1)).unwrap();
        let position = at_start.position(AGENT, &Label::from("AGRI:NAM")).unwrap();
        assert_eq!(at_start.variable("firms.flow").unwrap().get(&[position]), Some(2.0));
    }

    #[test]
    fn test_region_group_members_expand() {
        let dataset = sample();
        let mut groups = RegionGroups::new();
        groups.insert("G2", ["CHN", "USA"]);
        let registry = dataset.registry().clone().with_region_groups(groups);
        let dataset = AgentDataset::new(dataset.data().clone(), registry).unwrap();

        let grouped = dataset
            .group_agents(&GroupSpec::new(AggregateDim::Region, ["G2"], "WORLD"))
            .unwrap();
        assert!(grouped.agents().contains(&"AGRI:WORLD"));
        assert!(grouped.agents().contains(&"q1:WORLD"));
    }

    #[test]
    fn test_group_agents_many() {
        let specs = vec![
            GroupSpec::new(AggregateDim::Region, ["CHN", "USA"], "NAM"),
            GroupSpec::new(AggregateDim::Sector, ["AGRI", "FOOD"], "AGFO"),
        ];
        let grouped = sample().group_agents_many(&specs).unwrap();
        assert!(grouped.agents().contains(&"AGFO:NAM"));
        grouped.ensure_consistent().unwrap();
    }
}
