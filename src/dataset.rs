// 📦 Agent Dataset
// Owns a dataset, its baseline snapshot and the coordinate registry.
// Every transform returns a new instance and applies the same non-temporal
// operation to data and baseline, so the two never drift apart.

use crate::entities::CoordinateRegistry;
use crate::error::{PostprocError, Result};
use crate::frame::{Frame, Label, Variable, AGENT, TIME};
use crate::resolver::{resolve, Resolution};
use crate::selection::{apply_agents, Selection};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, warn};

// ============================================================================
// CAPABILITY INTERFACE
// ============================================================================

/// Read-only surface shared by plain frames and agent datasets
pub trait DatasetView {
    fn frame(&self) -> &Frame;

    fn dims(&self) -> Vec<&str> {
        self.frame().dims()
    }

    fn coord(&self, dim: &str) -> Option<&[Label]> {
        self.frame().coord(dim)
    }

    fn len_of(&self, dim: &str) -> usize {
        self.frame().len_of(dim)
    }

    fn variable_names(&self) -> Vec<&str> {
        self.frame().variable_names()
    }

    fn variable(&self, name: &str) -> Option<&Variable> {
        self.frame().variable(name)
    }
}

impl DatasetView for Frame {
    fn frame(&self) -> &Frame {
        self
    }
}

impl DatasetView for AgentDataset {
    fn frame(&self) -> &Frame {
        &self.data
    }
}

// ============================================================================
// AGENT DATASET
// ============================================================================

#[derive(Debug, Clone)]
pub struct AgentDataset {
    data: Frame,
    baseline: Option<Frame>,
    registry: Arc<CoordinateRegistry>,
    reference_date: Option<Label>,
}

impl AgentDataset {
    /// Wrap a dataset; the baseline is its first timestep
    pub fn new(data: Frame, registry: CoordinateRegistry) -> Result<Self> {
        let first = data
            .coord(TIME)
            .ok_or_else(|| PostprocError::UnknownDimension(TIME.to_string()))?
            .first()
            .cloned();
        match first {
            Some(reference) => Self::at_reference(data, Arc::new(registry), reference),
            None => {
                warn!("Dataset has no timesteps, continuing without baseline");
                Ok(Self::without_baseline(data, registry))
            }
        }
    }

    /// Wrap a dataset with the baseline taken at an explicit date
    pub fn with_reference_date(data: Frame, registry: CoordinateRegistry, date: NaiveDate) -> Result<Self> {
        Self::at_reference(data, Arc::new(registry), Label::Date(date))
    }

    pub fn without_baseline(data: Frame, registry: CoordinateRegistry) -> Self {
        AgentDataset {
            data,
            baseline: None,
            registry: Arc::new(registry),
            reference_date: None,
        }
    }

    fn at_reference(data: Frame, registry: Arc<CoordinateRegistry>, reference: Label) -> Result<Self> {
        let baseline = data.sel_point(TIME, &reference)?;
        debug!(reference = %reference, "Baseline taken");
        Ok(AgentDataset {
            data,
            baseline: Some(baseline),
            registry,
            reference_date: Some(reference),
        })
    }

    /// Assemble from already-synchronized parts (stored baseline, transforms)
    pub fn from_parts(
        data: Frame,
        baseline: Option<Frame>,
        registry: Arc<CoordinateRegistry>,
        reference_date: Option<Label>,
    ) -> Result<Self> {
        let dataset = AgentDataset {
            data,
            baseline,
            registry,
            reference_date,
        };
        dataset.ensure_consistent()?;
        Ok(dataset)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn data(&self) -> &Frame {
        &self.data
    }

    pub fn baseline(&self) -> Option<&Frame> {
        self.baseline.as_ref()
    }

    pub fn registry(&self) -> &CoordinateRegistry {
        &self.registry
    }

    pub(crate) fn shared_registry(&self) -> Arc<CoordinateRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn reference_date(&self) -> Option<&Label> {
        self.reference_date.as_ref()
    }

    /// Agent names currently on the agent axis
    pub fn agents(&self) -> Vec<&str> {
        self.data
            .coord(AGENT)
            .map(|c| c.iter().filter_map(|l| l.as_text()).collect())
            .unwrap_or_default()
    }

    /// Check the baseline against the dataset: no time axis, and every other
    /// dimension with identical labels.
    pub fn ensure_consistent(&self) -> Result<()> {
        let Some(baseline) = &self.baseline else {
            return Ok(());
        };
        if baseline.has_dim(TIME) {
            return Err(PostprocError::DimensionMismatch {
                dim: TIME.to_string(),
                data: self.data.len_of(TIME),
                baseline: baseline.len_of(TIME),
            });
        }
        let data_dims: Vec<&str> = self.data.dims().into_iter().filter(|d| *d != TIME).collect();
        for dim in data_dims.iter().chain(baseline.dims().iter()) {
            if self.data.coord(dim) != baseline.coord(dim) {
                return Err(PostprocError::DimensionMismatch {
                    dim: dim.to_string(),
                    data: self.data.len_of(dim),
                    baseline: baseline.len_of(dim),
                });
            }
        }
        Ok(())
    }

    // ========================================================================
    // TRANSFORMS
    // ========================================================================

    /// Apply one frame transform to data and baseline alike
    pub(crate) fn map_frames(
        &self,
        registry: Arc<CoordinateRegistry>,
        f: impl Fn(&Frame) -> Result<Frame>,
    ) -> Result<AgentDataset> {
        let data = f(&self.data)?;
        let baseline = self.baseline.as_ref().map(&f).transpose()?;
        let next = AgentDataset {
            data,
            baseline,
            registry,
            reference_date: self.reference_date.clone(),
        };
        next.ensure_consistent()?;
        Ok(next)
    }

    /// Resolve the agent part of a selection against the agents present
    pub fn resolve_agents(&self, selection: &Selection) -> Result<Resolution> {
        resolve(&self.registry, self.agents(), selection.agent_query())
    }

    /// Select on axes and agents. The baseline receives the same selection
    /// without its time criterion. The registry is shared, not copied.
    pub fn select(&self, selection: &Selection) -> Result<AgentDataset> {
        let agents = if selection.selects_agents() {
            Some(self.resolve_agents(selection)?.agents)
        } else {
            None
        };

        let data = selection.apply_axes(&self.data)?;
        let data = match &agents {
            Some(agents) => {
                let before = data.len_of(AGENT);
                let data = apply_agents(&data, agents)?;
                if data.len_of(AGENT) < before {
                    warn!(from = before, to = data.len_of(AGENT), "Agent selection narrows agent axis");
                }
                data
            }
            None => data,
        };

        let untimed = selection.without_time();
        let baseline = match &self.baseline {
            Some(baseline) => {
                let baseline = untimed.apply_axes_quietly(baseline)?;
                Some(match &agents {
                    Some(agents) => apply_agents(&baseline, agents)?,
                    None => baseline,
                })
            }
            None => None,
        };

        let next = AgentDataset {
            data,
            baseline,
            registry: self.shared_registry(),
            reference_date: self.reference_date.clone(),
        };
        next.ensure_consistent()?;
        Ok(next)
    }

    /// In-place selection. Takes `&mut self`, so callers sharing one instance
    /// must clone first; the registry stays shared.
    pub fn select_mut(&mut self, selection: &Selection) -> Result<()> {
        *self = self.select(selection)?;
        Ok(())
    }

    /// Divide the dataset by its baseline, broadcasting over time. The new
    /// baseline is baseline / baseline (1, or NaN where the baseline is 0).
    pub fn baseline_relative(&self) -> Result<AgentDataset> {
        let baseline = self.baseline.as_ref().ok_or(PostprocError::MissingBaseline)?;
        let relative = self.data.divide(baseline)?;
        let dropped = self.data.variable_names().len() - relative.variable_names().len();
        if dropped > 0 {
            warn!(dropped, "Variables without baseline dropped from baseline-relative result");
        }
        let next = AgentDataset {
            data: relative,
            baseline: Some(baseline.divide(baseline)?),
            registry: self.shared_registry(),
            reference_date: self.reference_date.clone(),
        };
        next.ensure_consistent()?;
        Ok(next)
    }

    pub fn select_variables<S: AsRef<str>>(&self, names: &[S]) -> Result<AgentDataset> {
        let data = self.data.select_variables(names)?;
        let baseline = match &self.baseline {
            Some(baseline) => {
                let present: Vec<&str> = names
                    .iter()
                    .map(|n| n.as_ref())
                    .filter(|n| baseline.variable(n).is_some())
                    .collect();
                Some(baseline.select_variables(&present)?)
            }
            None => None,
        };
        Ok(AgentDataset {
            data,
            baseline,
            registry: self.shared_registry(),
            reference_date: self.reference_date.clone(),
        })
    }

    /// Add a length-1 leading dimension to data and baseline
    pub fn expand_dim(&self, dim: &str, label: Label) -> Result<AgentDataset> {
        self.map_frames(self.shared_registry(), |frame| frame.expand_dim(dim, label.clone()))
    }

    /// Outer-join two datasets. Registries are unioned; the baseline is kept
    /// only when both sides have one.
    pub fn merge(&self, other: &AgentDataset) -> Result<AgentDataset> {
        let data = self.data.merge(&other.data)?;
        let baseline = match (&self.baseline, &other.baseline) {
            (Some(a), Some(b)) => Some(a.merge(b)?),
            (None, None) => None,
            _ => {
                warn!("Merging a dataset without baseline, result has no baseline");
                None
            }
        };

        let mut registry = self
            .registry
            .extended(other.registry.agents().map(|(_, info)| info.clone()));
        if registry.region_groups().is_empty() {
            registry = registry.with_region_groups(other.registry.region_groups().clone());
        }

        let next = AgentDataset {
            data,
            baseline,
            registry: Arc::new(registry),
            reference_date: self.reference_date.clone().or_else(|| other.reference_date.clone()),
        };
        next.ensure_consistent()?;
        Ok(next)
    }

    /// Series of one variable for one agent, along time
    pub fn agent_series(&self, variable: &str, agent: &str) -> Result<Vec<(Label, f64)>> {
        self.data.series(variable, TIME, &[(AGENT, Label::from(agent))])
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::{AgentInfo, AgentType};
    use crate::frame::text_labels;
    use crate::logging::capture::count_warnings;
    use crate::resolver::Criterion;

    pub(crate) fn date(d: u32) -> Label {
        Label::Date(NaiveDate::from_ymd_opt(2020, 1, d).unwrap())
    }

    /// time (3) x agent (4); flow = (t + 1) * (a + 1), consumer q1:USA is 0 at t0
    pub(crate) fn sample() -> AgentDataset {
        let mut registry = CoordinateRegistry::new();
        let names: Vec<String> = [
            AgentInfo::new("AGRI", "CHN", AgentType::Firm),
            AgentInfo::new("FOOD", "CHN", AgentType::Firm),
            AgentInfo::new("AGRI", "USA", AgentType::Firm),
            AgentInfo::new("q1", "USA", AgentType::Consumer),
        ]
        .into_iter()
        .map(|info| registry.register_agent(info))
        .collect();

        let mut flow = Vec::new();
        for t in 0..3 {
            for a in 0..4 {
                flow.push(if t == 0 && a == 3 { 0.0 } else { ((t + 1) * (a + 1)) as f64 });
            }
        }
        let frame = Frame::new()
            .with_coord(TIME, vec![date(1), date(2), date(3)])
            .unwrap()
            .with_coord(AGENT, text_labels(names))
            .unwrap()
            .with_variable("firms.flow", &[TIME, AGENT], flow)
            .unwrap();
        AgentDataset::new(frame, registry).unwrap()
    }

    #[test]
    fn test_baseline_is_first_timestep() {
        let dataset = sample();
        assert_eq!(dataset.reference_date(), Some(&date(1)));
        let baseline = dataset.baseline().unwrap();
        assert!(!baseline.has_dim(TIME));
        assert_eq!(baseline.variable("firms.flow").unwrap().values(), &[1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn test_explicit_reference_date() {
        let dataset = sample();
        let again = AgentDataset::with_reference_date(
            dataset.data().clone(),
            dataset.registry().clone(),
            NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
        )
        .unwrap();
        assert_eq!(again.baseline().unwrap().variable("firms.flow").unwrap().values(), &[2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_select_keeps_baseline_in_sync() {
        let dataset = sample();
        let selection = Selection::new().agent_sector("AGRI").time_range(date(2), date(3));
        let selected = dataset.select(&selection).unwrap();

        assert_eq!(selected.agents(), vec!["AGRI:CHN", "AGRI:USA"]);
        assert_eq!(selected.data().len_of(TIME), 2);
        let baseline = selected.baseline().unwrap();
        assert_eq!(baseline.coord(AGENT), selected.data().coord(AGENT));

        // equals selecting the original baseline directly
        let kept: std::collections::BTreeSet<String> = selected.agents().iter().map(|s| s.to_string()).collect();
        let direct = crate::selection::apply_agents(dataset.baseline().unwrap(), &kept).unwrap();
        assert_eq!(baseline, &direct);
    }

    #[test]
    fn test_agent_narrowing_warns_once() {
        let dataset = sample();
        let (selected, warnings) = count_warnings(|| dataset.select(&Selection::new().agent_sector("AGRI")));
        assert_eq!(selected.unwrap().data().len_of(AGENT), 2);
        // the baseline follows silently
        assert_eq!(warnings, 1);

        let (_, none) = count_warnings(|| dataset.select(&Selection::new().agent_region(vec!["CHN", "USA"])));
        assert_eq!(none, 0);
    }

    #[test]
    fn test_baseline_survives_time_truncation() {
        let dataset = sample();
        let later = dataset.select(&Selection::new().time_range(date(3), date(3))).unwrap();
        assert_eq!(later.baseline(), dataset.baseline());
    }

    #[test]
    fn test_empty_agent_selection_is_not_an_error() {
        let dataset = sample();
        let selection = Selection::new().agent_sector("FOOD").agent_region("USA");
        let selected = dataset.select(&selection).unwrap();
        assert_eq!(selected.data().len_of(AGENT), 0);
        assert_eq!(selected.baseline().unwrap().len_of(AGENT), 0);
    }

    #[test]
    fn test_select_is_associative() {
        let dataset = sample();
        let chained = dataset
            .select(&Selection::new().agent_type(AgentType::Firm))
            .unwrap()
            .select(&Selection::new().agent_region("CHN"))
            .unwrap();
        let combined = dataset
            .select(&Selection::new().agent_type(AgentType::Firm).agent_region("CHN"))
            .unwrap();
        assert_eq!(chained.data(), combined.data());
        assert_eq!(chained.baseline(), combined.baseline());
    }

    #[test]
    fn test_select_mut() {
        let mut dataset = sample();
        dataset.select_mut(&Selection::new().agents(["q1:USA"])).unwrap();
        assert_eq!(dataset.agents(), vec!["q1:USA"]);
    }

    #[test]
    fn test_baseline_relative_is_one_at_reference() {
        let relative = sample().baseline_relative().unwrap();
        let at_start = relative.data().sel_point(TIME, &date(1)).unwrap();
        let values = at_start.variable("firms.flow").unwrap().values();
        assert_eq!(&values[..3], &[1.0, 1.0, 1.0]);
        // zero baseline gives NaN, not an error
        assert!(values[3].is_nan());

        let series = relative.agent_series("firms.flow", "AGRI:USA").unwrap();
        assert_eq!(series[2].1, 3.0);
    }

    #[test]
    fn test_baseline_relative_without_baseline_fails() {
        let dataset = sample();
        let bare = AgentDataset::without_baseline(dataset.data().clone(), dataset.registry().clone());
        assert!(matches!(bare.baseline_relative(), Err(PostprocError::MissingBaseline)));
    }

    #[test]
    fn test_out_of_sync_parts_are_rejected() {
        let dataset = sample();
        let narrowed = dataset.data().isel(AGENT, &[0]).unwrap();
        let result = AgentDataset::from_parts(
            narrowed,
            dataset.baseline().cloned(),
            dataset.shared_registry(),
            None,
        );
        let err = result.unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn test_expand_dim_applies_to_baseline() {
        let expanded = sample().expand_dim("ssp", Label::from("ssp585")).unwrap();
        assert!(expanded.data().has_dim("ssp"));
        assert!(expanded.baseline().unwrap().has_dim("ssp"));
    }

    #[test]
    fn test_view_trait_on_both_types() {
        let dataset = sample();
        fn count<V: DatasetView>(view: &V) -> usize {
            view.len_of(AGENT)
        }
        assert_eq!(count(&dataset), 4);
        assert_eq!(count(dataset.data()), 4);
        assert_eq!(dataset.variable_names(), vec!["firms.flow"]);
    }

    #[test]
    fn test_explicit_agents_disagreeing_with_criteria_take_intersection() {
        let dataset = sample();
        let selection = Selection::new()
            .agents(["AGRI:CHN", "q1:USA"])
            .agent_type(Criterion::One(AgentType::Firm));
        let selected = dataset.select(&selection).unwrap();
        assert_eq!(selected.agents(), vec!["AGRI:CHN"]);
    }
}
