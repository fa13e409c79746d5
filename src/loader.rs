// 📥 Loader
// Reads named groups from an output store into one coordinate space:
// variables become "<group>.<variable>", the composite agent coordinate is
// derived from the per-agent attribute table, and the registry is built once.
// Missing or unreadable groups are skipped with a warning.

use crate::dataset::AgentDataset;
use crate::entities::{short_quintile, AgentInfo, AgentType, CodeTable, CoordinateRegistry, RegionGroups};
use crate::error::{PostprocError, Result};
use crate::frame::{Frame, Label, AGENT, REGION, SECTOR, TIME};
use crate::store::{encode_names, LabelTable, Store, StoredAgent, ROLE_BASELINE, ROLE_DATA};
use chrono::{Duration, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

pub const GROUP_SEPARATOR: char = '.';

/// Group used for variables written without a group prefix
pub const DEFAULT_GROUP: &str = "data";

// ============================================================================
// TIME UNITS
// ============================================================================

fn time_units_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"^\s*days\s+since\s+(\d{4}-\d{1,2}-\d{1,2})(?:[ T]\d{1,2}:\d{2}(?::\d{2}(?:\.\d+)?)?)?\s*$")?;
    Ok(PATTERN.get_or_init(|| re))
}

/// Start date encoded in "days since YYYY-MM-DD[ HH:MM:SS]"
pub fn parse_time_units(units: &str) -> Result<NaiveDate> {
    let captures = time_units_pattern()?
        .captures(units)
        .ok_or_else(|| PostprocError::InvalidTimeUnits(units.to_string()))?;
    NaiveDate::parse_from_str(&captures[1], "%Y-%m-%d").map_err(|_| PostprocError::InvalidTimeUnits(units.to_string()))
}

pub fn format_time_units(start: NaiveDate) -> String {
    format!("days since {}", start.format("%Y-%m-%d"))
}

// ============================================================================
// LOAD REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded_groups: Vec<String>,
    pub skipped_groups: Vec<String>,
}

impl LoadReport {
    pub fn is_empty(&self) -> bool {
        self.loaded_groups.is_empty()
    }
}

// ============================================================================
// LOADER
// ============================================================================

pub struct Loader {
    store: Store,
    path: PathBuf,
    region_groups: RegionGroups,
}

/// Agent names per store index (None where the row could not be decoded)
struct AgentTable {
    names: Vec<Option<String>>,
}

impl Loader {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Loader {
            store: Store::open(path)?,
            path: path.to_path_buf(),
            region_groups: RegionGroups::new(),
        })
    }

    /// Builder: region groups attached to every loaded registry
    pub fn with_region_groups(mut self, groups: RegionGroups) -> Self {
        self.region_groups = groups;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn groups(&self) -> Result<Vec<String>> {
        self.store.groups()
    }

    /// Time axis as dates
    pub fn time_labels(&self) -> Result<Vec<Label>> {
        let offsets = self.store.read_time()?;
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        let units = self
            .store
            .meta("time_units")?
            .ok_or_else(|| PostprocError::InvalidTimeUnits("missing time units".to_string()))?;
        let start = parse_time_units(&units)?;
        Ok(offsets
            .into_iter()
            .map(|days| Label::Date(start + Duration::days(days)))
            .collect())
    }

    pub fn stored_reference_date(&self) -> Result<Option<NaiveDate>> {
        match self.store.meta("reference_date")? {
            Some(raw) => NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| PostprocError::CorruptStore(format!("bad reference date '{}'", raw))),
            None => Ok(None),
        }
    }

    /// Build the registry from the auxiliary agent tables
    pub fn registry(&self) -> Result<CoordinateRegistry> {
        Ok(self.read_agent_table()?.1)
    }

    fn read_agent_table(&self) -> Result<(AgentTable, CoordinateRegistry)> {
        let regions = self.store.read_labels(LabelTable::Region)?;
        let sectors = self.store.read_labels(LabelTable::Sector)?;
        let agent_types = self.store.read_labels(LabelTable::AgentType)?;

        let mut registry = CoordinateRegistry::from_tables(
            CodeTable::from_codes(regions.iter().cloned()),
            CodeTable::from_codes(sectors.iter().cloned()),
            CodeTable::from_codes(agent_types.iter().cloned()),
        )
        .with_region_groups(self.region_groups.clone());

        let rows = self.store.read_agents()?;
        let mut names = Vec::with_capacity(rows.len());
        let mut undecodable = 0usize;
        for row in &rows {
            match decode_agent(row, &regions, &sectors, &agent_types) {
                Ok(info) => names.push(Some(registry.register_agent(info))),
                Err(e) => {
                    undecodable += 1;
                    warn!(agent = %row.decoded_name(), error = %e, "Skipping undecodable agent");
                    names.push(None);
                }
            }
        }
        if undecodable > 0 {
            warn!(undecodable, "Agent table had rows that could not be decoded");
        }
        Ok((AgentTable { names }, registry))
    }

    /// Load groups into one frame. Variables are prefixed with their group.
    pub fn load<S: AsRef<str>>(&self, groups: &[S]) -> Result<(Frame, CoordinateRegistry, LoadReport)> {
        let (agents, registry) = self.read_agent_table()?;
        let (frame, report) = self.load_with(groups, &agents)?;
        Ok((frame, registry, report))
    }

    fn load_with<S: AsRef<str>>(&self, groups: &[S], agents: &AgentTable) -> Result<(Frame, LoadReport)> {
        let time = self.time_labels()?;
        let mut report = LoadReport::default();
        let mut merged = Frame::new();

        for group in groups {
            let group = group.as_ref();
            match self.load_group(group, ROLE_DATA, agents, &time) {
                Ok(Some(frame)) => {
                    merged = merged.merge(&frame)?;
                    report.loaded_groups.push(group.to_string());
                }
                Ok(None) => {
                    warn!(group, path = %self.path.display(), "Group not found, skipping");
                    report.skipped_groups.push(group.to_string());
                }
                Err(e) => {
                    warn!(group, error = %e, "Group unreadable, skipping");
                    report.skipped_groups.push(group.to_string());
                }
            }
        }

        info!(
            path = %self.path.display(),
            loaded = report.loaded_groups.len(),
            skipped = report.skipped_groups.len(),
            agents = merged.len_of(AGENT),
            timesteps = merged.len_of(TIME),
            "Loaded output"
        );
        Ok((merged, report))
    }

    /// Load groups and wrap them with a baseline. A baseline stored for every
    /// loaded group wins; otherwise it is taken at `reference_date` (or the
    /// first timestep).
    pub fn load_dataset<S: AsRef<str>>(
        &self,
        groups: &[S],
        reference_date: Option<NaiveDate>,
    ) -> Result<(AgentDataset, LoadReport)> {
        let (agents, registry) = self.read_agent_table()?;
        let (data, report) = self.load_with(groups, &agents)?;

        if let Some(baseline) = self.load_stored_baseline(&report.loaded_groups, &agents)? {
            let reference = self.stored_reference_date()?.map(Label::Date);
            let dataset = AgentDataset::from_parts(data, Some(baseline), Arc::new(registry), reference)?;
            return Ok((dataset, report));
        }

        let dataset = match reference_date {
            Some(date) => AgentDataset::with_reference_date(data, registry, date)?,
            None if data.has_dim(TIME) => AgentDataset::new(data, registry)?,
            None => AgentDataset::without_baseline(data, registry),
        };
        Ok((dataset, report))
    }

    fn load_stored_baseline(&self, groups: &[String], agents: &AgentTable) -> Result<Option<Frame>> {
        if groups.is_empty() {
            return Ok(None);
        }
        let mut merged = Frame::new();
        for group in groups {
            match self.load_group(group, ROLE_BASELINE, agents, &[])? {
                Some(frame) => merged = merged.merge(&frame)?,
                None => return Ok(None),
            }
        }
        Ok(Some(merged))
    }

    fn load_group(&self, group: &str, role: &str, agents: &AgentTable, time: &[Label]) -> Result<Option<Frame>> {
        let variables = self.store.read_variables(group, role)?;
        if variables.is_empty() {
            return Ok(None);
        }
        let stored = self.store.read_coords(group)?;

        let mut frame = Frame::new();
        for (name, variable) in variables {
            for dim in variable.dims() {
                if frame.has_dim(dim) {
                    continue;
                }
                let labels = if dim == TIME {
                    time.to_vec()
                } else {
                    let indices = stored
                        .get(dim.as_str())
                        .ok_or_else(|| PostprocError::CorruptStore(format!("{} has no '{}' coordinate", group, dim)))?;
                    self.decode_coord(dim, indices, agents)?
                };
                frame.set_coord(dim, labels)?;
            }
            frame.insert_variable(&format!("{}{}{}", group, GROUP_SEPARATOR, name), variable)?;
        }
        Ok(Some(frame))
    }

    fn decode_coord(&self, dim: &str, indices: &[i64], agents: &AgentTable) -> Result<Vec<Label>> {
        let table: Vec<Option<String>> = match dim {
            AGENT => agents.names.clone(),
            REGION => self.store.read_labels(LabelTable::Region)?.into_iter().map(Some).collect(),
            SECTOR => self.store.read_labels(LabelTable::Sector)?.into_iter().map(Some).collect(),
            other => self.store.read_dim_labels(other)?.into_iter().map(Some).collect(),
        };
        indices
            .iter()
            .map(|i| {
                usize::try_from(*i)
                    .ok()
                    .and_then(|i| table.get(i).cloned().flatten())
                    .map(Label::Text)
                    .ok_or_else(|| PostprocError::CorruptStore(format!("'{}' label index {} unresolved", dim, i)))
            })
            .collect()
    }
}

/// Registry entry for one stored agent. Consumers take their short income
/// quintile as pseudo-sector.
fn decode_agent(row: &StoredAgent, regions: &[String], sectors: &[String], agent_types: &[String]) -> Result<AgentInfo> {
    let lookup = |table: &[String], index: i64, what: &str| -> Result<String> {
        usize::try_from(index)
            .ok()
            .and_then(|i| table.get(i).cloned())
            .ok_or_else(|| PostprocError::CorruptStore(format!("{} index {} out of range", what, index)))
    };

    let agent_type: AgentType = lookup(agent_types, row.agent_type, "agent_type")?.parse()?;
    let region = lookup(regions, row.region, "region")?;
    let raw_name = row.decoded_name();

    let sector = match agent_type {
        AgentType::Consumer => match short_quintile(&raw_name) {
            Some(q) => q.to_string(),
            None => lookup(sectors, row.sector, "sector")?,
        },
        _ => lookup(sectors, row.sector, "sector")?,
    };
    Ok(AgentInfo::new(sector, region, agent_type))
}

// ============================================================================
// WRITER
// ============================================================================

/// Split "<group>.<variable>" (ungrouped names land in DEFAULT_GROUP)
pub fn split_variable_name(name: &str) -> (&str, &str) {
    name.split_once(GROUP_SEPARATOR).unwrap_or((DEFAULT_GROUP, name))
}

/// Write a dataset and its baseline to a fresh store
pub fn write_dataset(path: &Path, dataset: &AgentDataset) -> Result<()> {
    let mut store = Store::create(path)?;
    store.transaction(|store| write_into(store, dataset))?;
    info!(
        path = %path.display(),
        agents = dataset.agents().len(),
        variables = dataset.data().variable_names().len(),
        "Wrote dataset"
    );
    Ok(())
}

fn write_into(store: &Store, dataset: &AgentDataset) -> Result<()> {
    let data = dataset.data();
    let registry = dataset.registry();

    // time axis
    if let Some(time) = data.coord(TIME) {
        let dates = time
            .iter()
            .map(|l| l.as_date().ok_or_else(|| PostprocError::InvalidTimeUnits(format!("non-date time label {}", l))))
            .collect::<Result<Vec<_>>>()?;
        if let Some(start) = dates.first() {
            store.set_meta("time_units", &format_time_units(*start))?;
            let offsets: Vec<i64> = dates.iter().map(|d| (*d - *start).num_days()).collect();
            store.write_time(&offsets)?;
        }
    }
    if let Some(date) = dataset.reference_date().and_then(|l| l.as_date()) {
        store.set_meta("reference_date", &date.format("%Y-%m-%d").to_string())?;
    }

    // label tables
    let regions = registry.regions().codes();
    let sectors = registry.sectors().codes();
    let agent_types = registry.agent_types().codes();
    store.write_labels(LabelTable::Region, regions)?;
    store.write_labels(LabelTable::Sector, sectors)?;
    store.write_labels(LabelTable::AgentType, agent_types)?;

    // agent table
    let agents: Vec<(&str, &AgentInfo)> = registry.agents().collect();
    let raw_names: Vec<String> = agents.iter().map(|(name, _)| name.to_string()).collect();
    let mut rows = Vec::with_capacity(agents.len());
    let mut agent_index: BTreeMap<&str, i64> = BTreeMap::new();
    for (idx, ((name, info), bytes)) in agents.iter().zip(encode_names(&raw_names)).enumerate() {
        let missing = |what: &str, code: &str| PostprocError::CorruptStore(format!("{} '{}' not registered", what, code));
        rows.push(StoredAgent {
            name: bytes,
            agent_type: registry
                .agent_type_index(info.agent_type)
                .ok_or_else(|| missing("agent type", info.agent_type.as_str()))? as i64,
            sector: registry.sector_index(&info.sector).ok_or_else(|| missing("sector", &info.sector))? as i64,
            region: registry.region_index(&info.region).ok_or_else(|| missing("region", &info.region))? as i64,
        });
        agent_index.insert(*name, idx as i64);
    }
    store.write_agents(&rows)?;

    // variables and their coordinates, per group
    let mut written_dims: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut frames = vec![(ROLE_DATA, data)];
    if let Some(baseline) = dataset.baseline() {
        frames.push((ROLE_BASELINE, baseline));
    }
    for (role, frame) in frames {
        for (full_name, variable) in frame.variables() {
            let (group, name) = split_variable_name(full_name);
            store.write_variable(group, name, role, variable)?;

            for dim in variable.dims() {
                if dim == TIME {
                    continue;
                }
                let done = written_dims.entry(group.to_string()).or_default();
                if done.contains(dim) {
                    continue;
                }
                let labels = frame.coord(dim).ok_or_else(|| PostprocError::UnknownDimension(dim.clone()))?;
                let indices = encode_coord(store, dim, labels, &agent_index, registry)?;
                store.write_coord(group, dim, &indices)?;
                done.push(dim.clone());
            }
        }
    }
    Ok(())
}

fn encode_coord(
    store: &Store,
    dim: &str,
    labels: &[Label],
    agent_index: &BTreeMap<&str, i64>,
    registry: &CoordinateRegistry,
) -> Result<Vec<i64>> {
    let unresolved = |label: &Label| PostprocError::CorruptStore(format!("'{}' label {} has no index", dim, label));
    match dim {
        AGENT => labels
            .iter()
            .map(|l| l.as_text().and_then(|n| agent_index.get(n).copied()).ok_or_else(|| unresolved(l)))
            .collect(),
        REGION => labels
            .iter()
            .map(|l| l.as_text().and_then(|c| registry.region_index(c)).map(|i| i as i64).ok_or_else(|| unresolved(l)))
            .collect(),
        SECTOR => labels
            .iter()
            .map(|l| l.as_text().and_then(|c| registry.sector_index(c)).map(|i| i as i64).ok_or_else(|| unresolved(l)))
            .collect(),
        other => {
            let mut known = store.read_dim_labels(other)?;
            let mut indices = Vec::with_capacity(labels.len());
            for label in labels {
                let text = label.to_string();
                let idx = match known.iter().position(|k| *k == text) {
                    Some(i) => i,
                    None => {
                        known.push(text);
                        known.len() - 1
                    }
                };
                indices.push(idx as i64);
            }
            store.write_dim_labels(other, &known)?;
            Ok(indices)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::Variable;
    use crate::logging::capture::count_warnings;
    use crate::selection::Selection;
    use tempfile::TempDir;

    /// Store with 3 timesteps, firms AGRI:CHN / FOOD:USA, consumer q1:CHN
    pub(crate) fn write_fixture(path: &Path) {
        let store = Store::create(path).unwrap();
        store.set_meta("time_units", "days since 2020-01-01 00:00:00").unwrap();
        store.write_time(&[0, 1, 2]).unwrap();
        store
            .write_labels(LabelTable::Region, &["CHN".to_string(), "USA".to_string()])
            .unwrap();
        store
            .write_labels(LabelTable::Sector, &["AGRI".to_string(), "FOOD".to_string(), "FCON".to_string()])
            .unwrap();
        store
            .write_labels(LabelTable::AgentType, &["firm".to_string(), "consumer".to_string()])
            .unwrap();

        let names = encode_names(&[
            "AGRI:CHN".to_string(),
            "FOOD:USA".to_string(),
            "first_income_quintile:CHN".to_string(),
        ]);
        store
            .write_agents(&[
                StoredAgent { name: names[0].clone(), agent_type: 0, sector: 0, region: 0 },
                StoredAgent { name: names[1].clone(), agent_type: 0, sector: 1, region: 1 },
                StoredAgent { name: names[2].clone(), agent_type: 1, sector: 2, region: 0 },
            ])
            .unwrap();

        let production = Variable::new(
            vec![TIME.into(), AGENT.into()],
            vec![3, 2],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        )
        .unwrap();
        store.write_variable("firms", "production", ROLE_DATA, &production).unwrap();
        store.write_coord("firms", AGENT, &[0, 1]).unwrap();

        let consumption = Variable::new(vec![TIME.into(), AGENT.into()], vec![3, 1], vec![10.0, 0.0, 30.0]).unwrap();
        store.write_variable("consumers", "consumption", ROLE_DATA, &consumption).unwrap();
        store.write_coord("consumers", AGENT, &[2]).unwrap();
    }

    fn fixture() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.sqlite");
        write_fixture(&path);
        (dir, path)
    }

    fn date(d: u32) -> Label {
        Label::Date(NaiveDate::from_ymd_opt(2020, 1, d).unwrap())
    }

    #[test]
    fn test_parse_time_units() {
        let start = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        assert_eq!(parse_time_units("days since 2000-01-01").unwrap(), start);
        assert_eq!(parse_time_units("days since 2000-01-01 00:00:00").unwrap(), start);
        assert_eq!(parse_time_units("days since 2000-01-01T12:00").unwrap(), start);
        assert!(matches!(
            parse_time_units("hours since 2000-01-01"),
            Err(PostprocError::InvalidTimeUnits(_))
        ));
        assert!(parse_time_units("days since 2000-13-01").is_err());
    }

    #[test]
    fn test_registry_from_agent_table() {
        let (_dir, path) = fixture();
        let registry = Loader::open(&path).unwrap().registry().unwrap();
        assert_eq!(registry.agent_count(), 3);
        let consumer = registry.agent("q1:CHN").unwrap();
        assert_eq!(consumer.agent_type, AgentType::Consumer);
        assert!(registry.sectors().contains("q1"));
        assert_eq!(registry.agent("FOOD:USA").unwrap().region, "USA");
    }

    #[test]
    fn test_load_merges_groups() {
        let (_dir, path) = fixture();
        let loader = Loader::open(&path).unwrap();
        let (frame, _, report) = loader.load(&["firms", "consumers", "storages"]).unwrap();

        assert_eq!(report.loaded_groups, vec!["firms", "consumers"]);
        assert_eq!(report.skipped_groups, vec!["storages"]);
        assert_eq!(frame.variable_names(), vec!["consumers.consumption", "firms.production"]);
        assert_eq!(frame.coord(TIME).unwrap(), &[date(1), date(2), date(3)]);
        assert_eq!(frame.len_of(AGENT), 3);

        // outer join: firm variables are NaN for the consumer
        let production = frame.variable("firms.production").unwrap();
        let q1 = frame.position(AGENT, &Label::from("q1:CHN")).unwrap();
        assert!(production.get(&[0, q1]).unwrap().is_nan());
    }

    #[test]
    fn test_load_dataset_takes_first_timestep() {
        let (_dir, path) = fixture();
        let (dataset, _) = Loader::open(&path).unwrap().load_dataset(&["firms"], None).unwrap();
        assert_eq!(dataset.reference_date(), Some(&date(1)));
        assert_eq!(
            dataset.baseline().unwrap().variable("firms.production").unwrap().values(),
            &[1.0, 2.0]
        );
    }

    #[test]
    fn test_load_with_no_groups_found() {
        let (_dir, path) = fixture();
        let (frame, _, report) = Loader::open(&path).unwrap().load(&["regions"]).unwrap();
        assert!(frame.is_empty());
        assert!(report.is_empty());
    }

    #[test]
    fn test_write_keeps_original_baseline() {
        let (dir, path) = fixture();
        let (dataset, _) = Loader::open(&path)
            .unwrap()
            .load_dataset(&["firms"], None)
            .unwrap();
        let later = dataset.select(&Selection::new().time_range(date(2), date(3))).unwrap();

        let out = dir.path().join("later.sqlite");
        write_dataset(&out, &later).unwrap();

        let (reloaded, report) = Loader::open(&out)
            .unwrap()
            .load_dataset(&["firms", "consumers"], None)
            .unwrap();
        assert_eq!(report.loaded_groups, vec!["firms"]);
        assert_eq!(report.skipped_groups, vec!["consumers"]);
        assert_eq!(reloaded.data().coord(TIME).unwrap(), &[date(2), date(3)]);
        assert_eq!(reloaded.baseline(), dataset.baseline());
        assert_eq!(reloaded.reference_date(), Some(&date(1)));
    }

    #[test]
    fn test_stored_baseline_reads_agent_table_once() {
        let (dir, path) = fixture();
        let (dataset, _) = Loader::open(&path).unwrap().load_dataset(&["firms"], None).unwrap();
        let out = dir.path().join("stored.sqlite");
        write_dataset(&out, &dataset).unwrap();

        // an agent row pointing past the region table cannot be decoded
        let conn = rusqlite::Connection::open(&out).unwrap();
        conn.execute(
            "INSERT INTO agent (idx, name, agent_type, sector, region) VALUES (1000, ?1, 0, 0, 99)",
            rusqlite::params![encode_names(&["AGRI:XXX".to_string()])[0].clone()],
        )
        .unwrap();
        drop(conn);

        let loader = Loader::open(&out).unwrap();
        let (loaded, warnings) = count_warnings(|| loader.load_dataset(&["firms"], None));
        assert!(loaded.unwrap().0.baseline().is_some());
        // one skip warning and one summary, not repeated for the baseline
        assert_eq!(warnings, 2);
    }

    #[test]
    fn test_write_round_trips_aggregates() {
        use crate::aggregation::{AggregateDim, GroupSpec};

        let (dir, path) = fixture();
        let (dataset, _) = Loader::open(&path)
            .unwrap()
            .load_dataset(&["firms", "consumers"], None)
            .unwrap();
        let grouped = dataset
            .group_agents(&GroupSpec::new(AggregateDim::Sector, ["AGRI", "q1"], "ALL"))
            .unwrap();

        let out = dir.path().join("grouped.sqlite");
        write_dataset(&out, &grouped).unwrap();
        let (reloaded, _) = Loader::open(&out)
            .unwrap()
            .load_dataset(&["firms", "consumers"], None)
            .unwrap();
        assert_eq!(reloaded.registry().agent("ALL:CHN").unwrap().agent_type, AgentType::Mixed);
        assert_eq!(reloaded.agents(), grouped.agents());
    }
}
