// 🔎 Agent Resolver
// Translates secondary criteria (sector, region, agent type) and an optional
// explicit agent list into the concrete set of agents satisfying all of them.
//
// Contradictions are values, not errors: the caller gets the (possibly empty)
// set plus a ContradictorySelection and one warning is logged.

use crate::entities::{AgentType, CoordinateRegistry};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

// ============================================================================
// CRITERION
// ============================================================================

/// No constraint, a single value, or a set of accepted values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Criterion<T> {
    #[default]
    Any,
    One(T),
    Many(Vec<T>),
}

impl<T: PartialEq> Criterion<T> {
    pub fn is_any(&self) -> bool {
        matches!(self, Criterion::Any)
    }

    pub fn matches(&self, value: &T) -> bool {
        match self {
            Criterion::Any => true,
            Criterion::One(v) => v == value,
            Criterion::Many(vs) => vs.contains(value),
        }
    }

    /// Accepted values (empty for Any)
    pub fn values(&self) -> Vec<&T> {
        match self {
            Criterion::Any => Vec::new(),
            Criterion::One(v) => vec![v],
            Criterion::Many(vs) => vs.iter().collect(),
        }
    }

    pub fn map<U>(self, f: impl Fn(T) -> U) -> Criterion<U> {
        match self {
            Criterion::Any => Criterion::Any,
            Criterion::One(v) => Criterion::One(f(v)),
            Criterion::Many(vs) => Criterion::Many(vs.into_iter().map(f).collect()),
        }
    }
}

impl<T> From<Option<T>> for Criterion<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Criterion::Any, Criterion::One)
    }
}

impl From<&str> for Criterion<String> {
    fn from(value: &str) -> Self {
        Criterion::One(value.to_string())
    }
}

impl From<String> for Criterion<String> {
    fn from(value: String) -> Self {
        Criterion::One(value)
    }
}

impl From<Vec<&str>> for Criterion<String> {
    fn from(values: Vec<&str>) -> Self {
        Criterion::Many(values.into_iter().map(String::from).collect())
    }
}

impl From<Vec<String>> for Criterion<String> {
    fn from(values: Vec<String>) -> Self {
        Criterion::Many(values)
    }
}

impl From<AgentType> for Criterion<AgentType> {
    fn from(value: AgentType) -> Self {
        Criterion::One(value)
    }
}

impl From<Vec<AgentType>> for Criterion<AgentType> {
    fn from(values: Vec<AgentType>) -> Self {
        Criterion::Many(values)
    }
}

// ============================================================================
// QUERY & RESOLUTION
// ============================================================================

/// Partial agent specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentQuery {
    #[serde(default)]
    pub sector: Criterion<String>,

    /// Region codes; region group names expand to their members
    #[serde(default)]
    pub region: Criterion<String>,

    #[serde(default)]
    pub agent_type: Criterion<AgentType>,

    /// Explicit agent names, intersected with the secondary criteria
    #[serde(default)]
    pub agent: Option<BTreeSet<String>>,
}

impl AgentQuery {
    pub fn new() -> Self {
        AgentQuery::default()
    }

    pub fn sector(mut self, sector: impl Into<Criterion<String>>) -> Self {
        self.sector = sector.into();
        self
    }

    pub fn region(mut self, region: impl Into<Criterion<String>>) -> Self {
        self.region = region.into();
        self
    }

    pub fn agent_type(mut self, agent_type: impl Into<Criterion<AgentType>>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    pub fn agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agent = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    /// True when no criterion constrains anything
    pub fn is_unconstrained(&self) -> bool {
        self.sector.is_any() && self.region.is_any() && self.agent_type.is_any() && self.agent.is_none()
    }

    fn has_attribute_criteria(&self) -> bool {
        !(self.sector.is_any() && self.region.is_any() && self.agent_type.is_any())
    }
}

/// Why a resolution disagrees with what was asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContradictorySelection {
    /// Non-trivial criteria whose intersection is empty
    EmptyIntersection,

    /// Explicit agents excluded by the secondary criteria (or not present)
    AgentListDisagrees { excluded: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub agents: BTreeSet<String>,
    pub conflict: Option<ContradictorySelection>,
}

impl Resolution {
    pub fn is_contradictory(&self) -> bool {
        self.conflict.is_some()
    }
}

// ============================================================================
// RESOLVE
// ============================================================================

/// Resolve a query against a universe of agent names (usually the agents
/// currently present in a dataset). Agents unknown to the registry only
/// survive when no attribute criterion is given.
pub fn resolve<'a, I>(registry: &CoordinateRegistry, universe: I, query: &AgentQuery) -> Result<Resolution>
where
    I: IntoIterator<Item = &'a str>,
{
    let regions: Option<BTreeSet<String>> = match &query.region {
        Criterion::Any => None,
        criterion => {
            let mut expanded = BTreeSet::new();
            for code in criterion.values() {
                expanded.extend(registry.expand_region(code)?);
            }
            Some(expanded)
        }
    };

    let mut resolved = BTreeSet::new();
    for name in universe {
        if let Some(explicit) = &query.agent {
            if !explicit.contains(name) {
                continue;
            }
        }
        if query.has_attribute_criteria() {
            let Some(info) = registry.agent(name) else {
                continue;
            };
            if !query.sector.matches(&info.sector)
                || !query.agent_type.matches(&info.agent_type)
                || regions.as_ref().is_some_and(|r| !r.contains(&info.region))
            {
                continue;
            }
        }
        resolved.insert(name.to_string());
    }

    let conflict = if resolved.is_empty() && !query.is_unconstrained() {
        Some(ContradictorySelection::EmptyIntersection)
    } else {
        query.agent.as_ref().and_then(|explicit| {
            let excluded: Vec<String> = explicit.difference(&resolved).cloned().collect();
            (!excluded.is_empty()).then_some(ContradictorySelection::AgentListDisagrees { excluded })
        })
    };

    match &conflict {
        Some(ContradictorySelection::EmptyIntersection) => {
            warn!(?query, "Contradictory agent selection: criteria match no agent");
        }
        Some(ContradictorySelection::AgentListDisagrees { excluded }) => {
            warn!(
                excluded = excluded.len(),
                "Contradictory agent selection: explicit agents not matched by secondary criteria: {:?}",
                excluded
            );
        }
        None => debug!(resolved = resolved.len(), "Resolved agents"),
    }

    Ok(Resolution {
        agents: resolved,
        conflict,
    })
}

// ============================================================================
// TESTS
// ============================================================================
