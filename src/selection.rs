// 🎯 Selection Criteria
// One selection addresses axes directly (time, region, sector, any other
// dimension) and agents indirectly through the resolver. The two namespaces
// are distinct: `region` filters the region axis, `agent_region` filters
// agents by their home region.

use crate::entities::AgentType;
use crate::error::{PostprocError, Result};
use crate::frame::{Frame, Label, AGENT, REGION, SECTOR, TIME};
use crate::resolver::{AgentQuery, Criterion};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

// ============================================================================
// TIME SELECTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum TimeSelector {
    /// One timestep; the time dimension is dropped
    At(Label),

    /// Explicit timesteps, in the given order
    Dates(Vec<Label>),

    /// Inclusive range over the time labels
    Between(Label, Label),
}

impl TimeSelector {
    fn apply(&self, frame: &Frame) -> Result<Frame> {
        match self {
            TimeSelector::At(label) => frame.sel_point(TIME, label),
            TimeSelector::Dates(labels) => frame.sel(TIME, labels),
            TimeSelector::Between(start, end) => {
                let coord = frame
                    .coord(TIME)
                    .ok_or_else(|| PostprocError::UnknownDimension(TIME.to_string()))?;
                let positions: Vec<usize> = coord
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| *l >= start && *l <= end)
                    .map(|(i, _)| i)
                    .collect();
                frame.isel(TIME, &positions)
            }
        }
    }
}

// ============================================================================
// SELECTION
// ============================================================================

/// Builder for a combined axis + agent selection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    time: Option<TimeSelector>,
    axes: BTreeMap<String, Criterion<Label>>,
    agents: AgentQuery,
}

impl Selection {
    pub fn new() -> Self {
        Selection::default()
    }

    pub fn time_at(mut self, label: impl Into<Label>) -> Self {
        self.time = Some(TimeSelector::At(label.into()));
        self
    }

    pub fn time_dates<I, L>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<Label>,
    {
        self.time = Some(TimeSelector::Dates(labels.into_iter().map(Into::into).collect()));
        self
    }

    pub fn time_range(mut self, start: impl Into<Label>, end: impl Into<Label>) -> Self {
        self.time = Some(TimeSelector::Between(start.into(), end.into()));
        self
    }

    /// Filter the region axis
    pub fn region(self, criterion: impl Into<Criterion<String>>) -> Self {
        self.axis(REGION, criterion.into().map(Label::from))
    }

    /// Filter the sector axis
    pub fn sector(self, criterion: impl Into<Criterion<String>>) -> Self {
        self.axis(SECTOR, criterion.into().map(Label::from))
    }

    /// Filter any dimension by label. `time` and `agent` are routed to their
    /// dedicated selectors.
    pub fn axis(mut self, dim: &str, criterion: Criterion<Label>) -> Self {
        match dim {
            TIME => {
                self.time = match criterion {
                    Criterion::Any => None,
                    Criterion::One(label) => Some(TimeSelector::At(label)),
                    Criterion::Many(labels) => Some(TimeSelector::Dates(labels)),
                };
            }
            AGENT => {
                self.agents.agent = match criterion {
                    Criterion::Any => None,
                    other => Some(other.values().into_iter().map(|l| l.to_string()).collect()),
                };
            }
            _ => {
                self.axes.insert(dim.to_string(), criterion);
            }
        }
        self
    }

    /// Explicit agent names
    pub fn agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents = self.agents.agents(agents);
        self
    }

    /// Agents located in the given region(s)
    pub fn agent_region(mut self, criterion: impl Into<Criterion<String>>) -> Self {
        self.agents = self.agents.region(criterion);
        self
    }

    /// Agents of the given sector(s) or quintile pseudo-sector(s)
    pub fn agent_sector(mut self, criterion: impl Into<Criterion<String>>) -> Self {
        self.agents = self.agents.sector(criterion);
        self
    }

    pub fn agent_type(mut self, criterion: impl Into<Criterion<AgentType>>) -> Self {
        self.agents = self.agents.agent_type(criterion);
        self
    }

    // ========================================================================
    // PARTITION
    // ========================================================================

    pub fn time(&self) -> Option<&TimeSelector> {
        self.time.as_ref()
    }

    /// Criteria applied directly to axes (time excluded)
    pub fn axis_criteria(&self) -> impl Iterator<Item = (&str, &Criterion<Label>)> {
        self.axes.iter().map(|(d, c)| (d.as_str(), c))
    }

    /// Criteria delegated to the agent resolver
    pub fn agent_query(&self) -> &AgentQuery {
        &self.agents
    }

    pub fn selects_agents(&self) -> bool {
        !self.agents.is_unconstrained()
    }

    /// The same selection with its time criterion removed
    pub fn without_time(&self) -> Selection {
        Selection {
            time: None,
            ..self.clone()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_none() && self.axes.values().all(|c| c.is_any()) && !self.selects_agents()
    }

    // ========================================================================
    // APPLICATION
    // ========================================================================

    /// Apply the time criterion (if any) and the axis criteria to a frame.
    /// Agent criteria are not touched here; see `apply_agents`.
    pub(crate) fn apply_axes(&self, frame: &Frame) -> Result<Frame> {
        self.narrow(frame, true)
    }

    /// `apply_axes` without warnings, for a frame that mirrors one already
    /// reported on (the baseline)
    pub(crate) fn apply_axes_quietly(&self, frame: &Frame) -> Result<Frame> {
        self.narrow(frame, false)
    }

    fn narrow(&self, frame: &Frame, report: bool) -> Result<Frame> {
        let mut frame = match &self.time {
            Some(time) => time.apply(frame)?,
            None => frame.clone(),
        };
        for (dim, criterion) in &self.axes {
            frame = apply_axis(&frame, dim, criterion, report)?;
        }
        Ok(frame)
    }
}

fn apply_axis(frame: &Frame, dim: &str, criterion: &Criterion<Label>, report: bool) -> Result<Frame> {
    let coord = frame
        .coord(dim)
        .ok_or_else(|| PostprocError::UnknownDimension(dim.to_string()))?;
    match criterion {
        Criterion::Any => Ok(frame.clone()),
        Criterion::One(label) => {
            if report {
                warn!(dim, %label, "Scalar selection drops dimension '{}'", dim);
            }
            frame.sel_point(dim, label)
        }
        Criterion::Many(labels) => {
            let present: BTreeSet<&Label> = coord.iter().collect();
            let mut seen = BTreeSet::new();
            let (kept, missing): (Vec<Label>, Vec<Label>) = labels
                .iter()
                .filter(|l| seen.insert(*l))
                .cloned()
                .partition(|l| present.contains(&l));
            if report && !missing.is_empty() {
                warn!(dim, missing = missing.len(), "Selection labels not present on '{}': {:?}", dim, missing);
            }
            if report && kept.len() < coord.len() {
                warn!(dim, from = coord.len(), to = kept.len(), "Selection narrows dimension '{}'", dim);
            }
            frame.sel(dim, &kept)
        }
    }
}

/// Keep the given agents, in the agent axis' own order
pub(crate) fn apply_agents(frame: &Frame, agents: &BTreeSet<String>) -> Result<Frame> {
    let coord = frame
        .coord(AGENT)
        .ok_or_else(|| PostprocError::UnknownDimension(AGENT.to_string()))?;
    let positions: Vec<usize> = coord
        .iter()
        .enumerate()
        .filter(|(_, l)| l.as_text().is_some_and(|name| agents.contains(name)))
        .map(|(i, _)| i)
        .collect();
    if positions.len() < coord.len() {
        debug!(from = coord.len(), to = positions.len(), "Agent selection narrows agent axis");
    }
    frame.isel(AGENT, &positions)
}

// ============================================================================
// TESTS
// ============================================================================
