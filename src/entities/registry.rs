// 🗂️ Coordinate Registry
// Bidirectional maps between symbolic codes and the integer indices used by
// the on-disk store, plus the agent attribute table.
//
// Built once at load time, read-only afterwards. Aggregation produces an
// extended copy rather than mutating a shared registry.

use crate::entities::agent::{AgentInfo, AgentType};
use crate::entities::region_groups::RegionGroups;
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// CODE TABLE
// ============================================================================

/// code ↔ index, indices dense and in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeTable {
    codes: Vec<String>,
    index: HashMap<String, usize>,
}

impl CodeTable {
    pub fn new() -> Self {
        CodeTable::default()
    }

    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = CodeTable::new();
        for code in codes {
            table.insert(code);
        }
        table
    }

    /// Register a code, returning its index (existing codes keep theirs)
    pub fn insert(&mut self, code: impl Into<String>) -> usize {
        let code = code.into();
        if let Some(i) = self.index.get(&code) {
            return *i;
        }
        let i = self.codes.len();
        self.index.insert(code.clone(), i);
        self.codes.push(code);
        i
    }

    pub fn index_of(&self, code: &str) -> Option<usize> {
        self.index.get(code).copied()
    }

    pub fn code(&self, index: usize) -> Option<&str> {
        self.codes.get(index).map(|c| c.as_str())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.index.contains_key(code)
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

// ============================================================================
// COORDINATE REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CoordinateRegistry {
    regions: CodeTable,
    sectors: CodeTable,
    agent_types: CodeTable,
    agents: BTreeMap<String, AgentInfo>,
    region_groups: RegionGroups,
}

impl CoordinateRegistry {
    /// Empty registry with the three agent types registered
    pub fn new() -> Self {
        let mut registry = CoordinateRegistry::default();
        for t in [AgentType::Firm, AgentType::Consumer, AgentType::Mixed] {
            registry.agent_types.insert(t.as_str());
        }
        registry
    }

    /// Registry over raw label tables (as read from the store)
    pub fn from_tables(regions: CodeTable, sectors: CodeTable, agent_types: CodeTable) -> Self {
        let mut registry = CoordinateRegistry {
            regions,
            sectors,
            agent_types,
            ..CoordinateRegistry::default()
        };
        for t in [AgentType::Firm, AgentType::Consumer, AgentType::Mixed] {
            registry.agent_types.insert(t.as_str());
        }
        registry
    }

    /// Builder: attach named region groups
    pub fn with_region_groups(mut self, groups: RegionGroups) -> Self {
        self.region_groups = groups;
        self
    }

    /// Register an agent; its region and sector codes are registered too
    pub fn register_agent(&mut self, info: AgentInfo) -> String {
        self.regions.insert(info.region.clone());
        self.sectors.insert(info.sector.clone());
        self.agent_types.insert(info.agent_type.as_str());
        let name = info.name();
        self.agents.insert(name.clone(), info);
        name
    }

    /// Copy of this registry extended with new agents
    pub fn extended<I>(&self, agents: I) -> CoordinateRegistry
    where
        I: IntoIterator<Item = AgentInfo>,
    {
        let mut next = self.clone();
        for info in agents {
            next.register_agent(info);
        }
        next
    }

    // ========================================================================
    // LOOKUPS
    // ========================================================================

    pub fn agent(&self, name: &str) -> Option<&AgentInfo> {
        self.agents.get(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = (&str, &AgentInfo)> {
        self.agents.iter().map(|(n, i)| (n.as_str(), i))
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn regions(&self) -> &CodeTable {
        &self.regions
    }

    pub fn sectors(&self) -> &CodeTable {
        &self.sectors
    }

    pub fn agent_types(&self) -> &CodeTable {
        &self.agent_types
    }

    pub fn region_groups(&self) -> &RegionGroups {
        &self.region_groups
    }

    pub fn region_index(&self, code: &str) -> Option<usize> {
        self.regions.index_of(code)
    }

    pub fn sector_index(&self, code: &str) -> Option<usize> {
        self.sectors.index_of(code)
    }

    pub fn agent_type_index(&self, agent_type: AgentType) -> Option<usize> {
        self.agent_types.index_of(agent_type.as_str())
    }

    /// A region code, or the flattened members when it names a region group.
    /// The code itself is always included so a group sharing its name with a
    /// real region still matches that region.
    pub fn expand_region(&self, code: &str) -> Result<BTreeSet<String>> {
        let mut expanded = self.region_groups.expand(code)?;
        expanded.insert(code.to_string());
        Ok(expanded)
    }

    /// Agents of one type, by name
    pub fn by_type(&self, agent_type: AgentType) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, info)| info.agent_type == agent_type)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Agents located in a region, by name
    pub fn by_region(&self, region: &str) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, info)| info.region == region)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
