// 🧑‍🏭 Agent Identity
// An agent is identified by "<sector-or-quintile>:<region>".
// The composite key is a wire-level convention: two fields, colon-delimited.

use crate::error::{PostprocError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const AGENT_KEY_SEPARATOR: char = ':';

/// Long income quintile names as written by the simulation
pub const LONG_QUINTILES: [&str; 5] = [
    "first_income_quintile",
    "second_income_quintile",
    "third_income_quintile",
    "fourth_income_quintile",
    "fifth_income_quintile",
];

/// Short pseudo-sector codes used in composite consumer names
pub const SHORT_QUINTILES: [&str; 5] = ["q1", "q2", "q3", "q4", "q5"];

// ============================================================================
// AGENT TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Producing firm in one sector and region
    Firm,

    /// Consumer income quintile in one region
    Consumer,

    /// Aggregate whose constituents span firms and consumers
    Mixed,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Firm => "firm",
            AgentType::Consumer => "consumer",
            AgentType::Mixed => "mixed",
        }
    }

    /// Type of an aggregate built from constituents of the given types
    pub fn combine<I: IntoIterator<Item = AgentType>>(types: I) -> Option<AgentType> {
        let mut combined: Option<AgentType> = None;
        for t in types {
            combined = match (combined, t) {
                (None, t) => Some(t),
                (Some(a), b) if a == b => Some(a),
                _ => Some(AgentType::Mixed),
            };
        }
        combined
    }
}

impl FromStr for AgentType {
    type Err = PostprocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "firm" => Ok(AgentType::Firm),
            "consumer" => Ok(AgentType::Consumer),
            "mixed" => Ok(AgentType::Mixed),
            other => Err(PostprocError::UnknownAgentType(other.to_string())),
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// AGENT INFO
// ============================================================================

/// Descriptive attributes of one agent, fixed at load time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Region code (ISO-style, or an aggregate name after grouping)
    pub region: String,

    /// Production sector code, or consumer quintile pseudo-sector
    pub sector: String,

    pub agent_type: AgentType,
}

impl AgentInfo {
    pub fn new(sector: impl Into<String>, region: impl Into<String>, agent_type: AgentType) -> Self {
        AgentInfo {
            region: region.into(),
            sector: sector.into(),
            agent_type,
        }
    }

    /// Composite key for this agent
    pub fn name(&self) -> String {
        compose_name(&self.sector, &self.region)
    }
}

// ============================================================================
// COMPOSITE KEY
// ============================================================================

pub fn compose_name(sector: &str, region: &str) -> String {
    format!("{}{}{}", sector, AGENT_KEY_SEPARATOR, region)
}

/// Split a composite key into (sector, region)
pub fn split_name(name: &str) -> Result<(&str, &str)> {
    let mut parts = name.split(AGENT_KEY_SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(sector), Some(region), None) if !sector.is_empty() && !region.is_empty() => {
            Ok((sector, region))
        }
        _ => Err(PostprocError::MalformedAgentName(name.to_string())),
    }
}

/// Short quintile code for a raw consumer name or prefix.
///
/// "first_income_quintile" and "first_income_quintile:CHN" both give "q1";
/// names that are already short are returned as-is.
pub fn short_quintile(raw: &str) -> Option<&'static str> {
    let prefix = raw.split(AGENT_KEY_SEPARATOR).next().unwrap_or(raw);
    LONG_QUINTILES
        .iter()
        .position(|q| *q == prefix)
        .or_else(|| SHORT_QUINTILES.iter().position(|q| *q == prefix))
        .map(|i| SHORT_QUINTILES[i])
}

pub fn is_quintile(sector: &str) -> bool {
    SHORT_QUINTILES.contains(&sector)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_and_split() {
        let name = compose_name("AGRI", "CHN");
        assert_eq!(name, "AGRI:CHN");
        assert_eq!(split_name(&name).unwrap(), ("AGRI", "CHN"));
    }

    #[test]
    fn test_split_rejects_extra_fields() {
        assert!(split_name("AGRI:CHN:X").is_err());
        assert!(split_name("AGRI").is_err());
        assert!(split_name(":CHN").is_err());
    }

    #[test]
    fn test_regions_with_dots_are_kept() {
        assert_eq!(split_name("AGRI:US.CA").unwrap(), ("AGRI", "US.CA"));
    }

    #[test]
    fn test_short_quintile() {
        assert_eq!(short_quintile("first_income_quintile"), Some("q1"));
        assert_eq!(short_quintile("fifth_income_quintile:DEU"), Some("q5"));
        assert_eq!(short_quintile("q3"), Some("q3"));
        assert_eq!(short_quintile("AGRI"), None);
        assert!(is_quintile("q2"));
        assert!(!is_quintile("FOOD"));
    }

    #[test]
    fn test_agent_type_parsing() {
        assert_eq!("Firm".parse::<AgentType>().unwrap(), AgentType::Firm);
        assert_eq!("consumer".parse::<AgentType>().unwrap(), AgentType::Consumer);
        assert!("storage".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_combine_types() {
        use AgentType::*;
        assert_eq!(AgentType::combine([Firm, Firm]), Some(Firm));
        assert_eq!(AgentType::combine([Consumer]), Some(Consumer));
        assert_eq!(AgentType::combine([Firm, Consumer]), Some(Mixed));
        assert_eq!(AgentType::combine([Mixed, Mixed]), Some(Mixed));
        assert_eq!(AgentType::combine(Vec::new()), None);
    }

    #[test]
    fn test_info_name() {
        let info = AgentInfo::new("q1", "DEU", AgentType::Consumer);
        assert_eq!(info.name(), "q1:DEU");
    }
}
