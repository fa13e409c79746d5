// ⚙️ Configuration - Postprocessing settings as data
// Groups to load, baseline date, aggregation defaults and named region /
// sector groups, read from a JSON file.

use crate::aggregation::{AggregateDim, GroupSpec};
use crate::entities::RegionGroups;
use crate::error::Result;
use crate::frame::Reduction;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

// ============================================================================
// CONSUMPTION BASKETS
// ============================================================================

pub const NECESSARY_BASKET: [&str; 5] = ["AGRI", "FOOD", "ELWA", "FISH", "EDHE"];

pub const RELEVANT_BASKET: [&str; 12] = [
    "OILC", "TRAN", "WOOD", "COMM", "RETT", "TEXL", "METL", "MACH", "TREQ", "MANU", "CONS", "WHOT",
];

pub const OTHER_BASKET: [&str; 9] = ["GAST", "MINQ", "REXI", "RECY", "OTHE", "FINC", "HOUS", "ADMI", "REPA"];

pub fn consumption_baskets() -> BTreeMap<String, Vec<String>> {
    let basket = |codes: &[&str]| codes.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        ("necessary".to_string(), basket(&NECESSARY_BASKET)),
        ("relevant".to_string(), basket(&RELEVANT_BASKET)),
        ("other".to_string(), basket(&OTHER_BASKET)),
    ])
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON-formatted log lines
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocConfig {
    /// Output groups to load
    #[serde(default = "default_groups")]
    pub groups: Vec<String>,

    /// Baseline date (first timestep when unset)
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,

    /// Aggregation replaces constituents instead of adding alongside them
    #[serde(default)]
    pub drop_originals: bool,

    #[serde(default)]
    pub reduction: Reduction,

    /// Named region aggregates, members may name other groups
    #[serde(default)]
    pub region_groups: BTreeMap<String, Vec<String>>,

    #[serde(default = "consumption_baskets")]
    pub sector_groups: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_groups() -> Vec<String> {
    vec!["firms".to_string(), "consumers".to_string()]
}

impl Default for PostprocConfig {
    fn default() -> Self {
        PostprocConfig {
            groups: default_groups(),
            reference_date: None,
            drop_originals: false,
            reduction: Reduction::default(),
            region_groups: BTreeMap::new(),
            sector_groups: consumption_baskets(),
            log: LogConfig::default(),
        }
    }
}

impl PostprocConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let config: PostprocConfig = serde_json::from_str(&content)?;
        info!(path = %path.as_ref().display(), groups = config.groups.len(), "Loaded config");
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)?;
        Ok(())
    }

    pub fn region_groups(&self) -> RegionGroups {
        RegionGroups::from_map(self.region_groups.clone())
    }

    /// Aggregation of one configured group, with the configured defaults
    pub fn group_spec(&self, dim: AggregateDim, group: &str) -> Option<GroupSpec> {
        let members = match dim {
            AggregateDim::Region => self.region_groups.get(group)?,
            AggregateDim::Sector => self.sector_groups.get(group)?,
        };
        Some(
            GroupSpec::new(dim, members.iter().cloned(), group)
                .reduce_with(self.reduction)
                .drop_originals(self.drop_originals),
        )
    }

    /// Every configured sector group as an aggregation
    pub fn sector_group_specs(&self) -> Vec<GroupSpec> {
        self.sector_groups
            .keys()
            .filter_map(|name| self.group_spec(AggregateDim::Sector, name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PostprocConfig::default();
        assert_eq!(config.groups, vec!["firms", "consumers"]);
        assert!(!config.drop_originals);
        assert_eq!(config.reduction, Reduction::Sum);
        assert_eq!(config.sector_groups["necessary"].len(), 5);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: PostprocConfig = serde_json::from_str(
            r#"{"reference_date": "2030-01-01", "reduction": "mean", "region_groups": {"NAM": ["USA", "CAN"]}}"#,
        )
        .unwrap();
        assert_eq!(config.reference_date, NaiveDate::from_ymd_opt(2030, 1, 1));
        assert_eq!(config.reduction, Reduction::Mean);
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.sector_groups.len(), 3);
        assert!(config.region_groups().contains("NAM"));
    }

    #[test]
    fn test_group_spec_uses_defaults() {
        let mut config = PostprocConfig::default();
        config.drop_originals = true;
        let spec = config.group_spec(AggregateDim::Sector, "relevant").unwrap();
        assert_eq!(spec.members.len(), 12);
        assert_eq!(spec.name, "relevant");
        assert!(spec.drop);
        assert!(config.group_spec(AggregateDim::Region, "relevant").is_none());
        assert_eq!(config.sector_group_specs().len(), 3);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("postproc.json");
        let mut config = PostprocConfig::default();
        config.log.json = true;
        config.save_to_file(&path).unwrap();
        assert_eq!(PostprocConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_reduction_rejected() {
        let result: std::result::Result<PostprocConfig, _> = serde_json::from_str(r#"{"reduction": "median"}"#);
        assert!(result.is_err());
    }
}
