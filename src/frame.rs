// 🧮 Frame - Labeled N-dimensional arrays
// Minimal labeled-array engine: named dimensions with ordered label
// coordinates, dense f64 variables, selection, reduction, concatenation,
// outer merge and broadcasting division.
//
// Buffers are shared (Arc) and never mutated: every operation returns a new
// Frame, so handing out clones is cheap and transforms compose safely.

use crate::error::{PostprocError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{concatenate, ArcArray, ArrayD, ArrayViewD, Axis, IxDyn, Zip};

pub const TIME: &str = "time";
pub const AGENT: &str = "agent";
pub const REGION: &str = "region";
pub const SECTOR: &str = "sector";

// ============================================================================
// LABELS
// ============================================================================

/// One coordinate label: a code/name or a calendar date
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Label {
    Date(NaiveDate),
    Text(String),
}

impl Label {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Label::Text(s) => Some(s),
            Label::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Label::Date(d) => Some(*d),
            Label::Text(_) => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Label::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Label {
    fn from(s: &str) -> Self {
        Label::Text(s.to_string())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        Label::Text(s)
    }
}

impl From<&String> for Label {
    fn from(s: &String) -> Self {
        Label::Text(s.clone())
    }
}

impl From<NaiveDate> for Label {
    fn from(d: NaiveDate) -> Self {
        Label::Date(d)
    }
}

/// Build a text label list from anything string-like
pub fn text_labels<I, S>(items: I) -> Vec<Label>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(|s| Label::Text(s.into())).collect()
}

// ============================================================================
// REDUCTION
// ============================================================================

/// How values are combined along a dimension. All variants skip NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Sum of non-missing values (0.0 when all are missing)
    #[default]
    Sum,
    Mean,
    Min,
    Max,
    /// Population standard deviation
    Std,
}

impl Reduction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reduction::Sum => "sum",
            Reduction::Mean => "mean",
            Reduction::Min => "min",
            Reduction::Max => "max",
            Reduction::Std => "std",
        }
    }

    /// Reduce a sequence of values, ignoring NaN
    pub fn apply<I: IntoIterator<Item = f64>>(&self, values: I) -> f64 {
        let present: Vec<f64> = values.into_iter().filter(|v| !v.is_nan()).collect();

        match self {
            Reduction::Sum => present.iter().sum(),
            _ if present.is_empty() => f64::NAN,
            Reduction::Mean => present.iter().sum::<f64>() / present.len() as f64,
            Reduction::Min => present.iter().copied().fold(f64::INFINITY, f64::min),
            Reduction::Max => present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Std => {
                let n = present.len() as f64;
                let mean = present.iter().sum::<f64>() / n;
                let var = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                var.sqrt()
            }
        }
    }
}

impl FromStr for Reduction {
    type Err = PostprocError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(Reduction::Sum),
            "mean" => Ok(Reduction::Mean),
            "min" => Ok(Reduction::Min),
            "max" => Ok(Reduction::Max),
            "std" => Ok(Reduction::Std),
            other => Err(PostprocError::UnsupportedReduction(other.to_string())),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// VARIABLE
// ============================================================================

/// N-d array with named dimensions. The buffer is kept in standard
/// (row-major) layout and shared between clones.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    dims: Vec<String>,
    data: ArcArray<f64, IxDyn>,
}

impl Variable {
    pub fn new(dims: Vec<String>, shape: Vec<usize>, values: Vec<f64>) -> Result<Self> {
        let name = dims.join(",");
        if dims.len() != shape.len() {
            return Err(PostprocError::shape(&name, "dims and shape differ in rank"));
        }
        let unique: HashSet<&String> = dims.iter().collect();
        if unique.len() != dims.len() {
            return Err(PostprocError::shape(&name, "repeated dimension"));
        }
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(PostprocError::shape(
                &name,
                format!("expected {} values, got {}", expected, values.len()),
            ));
        }
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| PostprocError::shape(&name, e.to_string()))?;
        Ok(Variable::from_array(dims, data))
    }

    fn from_array(dims: Vec<String>, data: ArrayD<f64>) -> Variable {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Variable {
            dims,
            data: data.into_shared(),
        }
    }

    pub fn dims(&self) -> &[String] {
        &self.dims
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Values in row-major order
    pub fn values(&self) -> &[f64] {
        self.data.as_slice().unwrap_or_default()
    }

    pub fn view(&self) -> ArrayViewD<'_, f64> {
        self.data.view()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn axis(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    /// Value at a multi-index (one entry per dim)
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.data.ndim() {
            return None;
        }
        self.data.get(index).copied()
    }

    /// Gather positions along an axis; `None` yields a NaN slab
    fn take(&self, axis: usize, indices: &[Option<usize>]) -> Variable {
        if let Some(positions) = indices.iter().copied().collect::<Option<Vec<usize>>>() {
            return Variable::from_array(self.dims.clone(), self.data.select(Axis(axis), &positions));
        }
        let mut shape = self.shape().to_vec();
        shape[axis] = indices.len();
        let mut out = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        for (slot, index) in indices.iter().enumerate() {
            if let Some(i) = index {
                out.index_axis_mut(Axis(axis), slot)
                    .assign(&self.data.index_axis(Axis(axis), *i));
            }
        }
        Variable::from_array(self.dims.clone(), out)
    }

    /// One slot per group along `axis`, reduced with `how`. Empty groups are
    /// NaN when `empty_is_missing`, otherwise `how` of nothing.
    fn reduce_groups(&self, axis: usize, groups: &[Vec<usize>], how: Reduction, empty_is_missing: bool) -> ArrayD<f64> {
        let mut shape = self.shape().to_vec();
        shape[axis] = groups.len();
        let mut out = ArrayD::from_elem(IxDyn(&shape), f64::NAN);
        for (slot, group) in groups.iter().enumerate() {
            if group.is_empty() && empty_is_missing {
                continue;
            }
            let reduced = self
                .data
                .select(Axis(axis), group)
                .map_axis(Axis(axis), |lane| how.apply(lane.iter().copied()));
            out.index_axis_mut(Axis(axis), slot).assign(&reduced);
        }
        out
    }

    fn group_axis(&self, axis: usize, groups: &[Vec<usize>], how: Reduction) -> Variable {
        Variable::from_array(self.dims.clone(), self.reduce_groups(axis, groups, how, false))
    }

    /// Split an axis into two, reducing positions that land in the same cell.
    /// `cells[j]` is the flat (row * cols + col) cell of position j; empty
    /// cells are NaN.
    fn unstack_axis(&self, axis: usize, cells: &[usize], rows: (String, usize), cols: (String, usize), how: Reduction) -> Result<Variable> {
        let mut members = vec![Vec::new(); rows.1 * cols.1];
        for (j, cell) in cells.iter().enumerate() {
            members[*cell].push(j);
        }
        let flat = self.reduce_groups(axis, &members, how, true);

        let mut shape = flat.shape().to_vec();
        shape.splice(axis..=axis, [rows.1, cols.1]);
        let split = flat
            .into_shape_with_order(IxDyn(&shape))
            .map_err(|e| PostprocError::shape(&rows.0, e.to_string()))?;
        let mut dims = self.dims.clone();
        dims.splice(axis..=axis, [rows.0, cols.0]);
        Ok(Variable::from_array(dims, split))
    }

    fn remove_axis(mut self, axis: usize) -> Variable {
        debug_assert_eq!(self.shape()[axis], 1);
        self.dims.remove(axis);
        Variable {
            dims: self.dims,
            data: self.data.index_axis_move(Axis(axis), 0),
        }
    }

    fn reduce_axis(&self, axis: usize, how: Reduction) -> Variable {
        let mut dims = self.dims.clone();
        dims.remove(axis);
        let reduced = self.data.map_axis(Axis(axis), |lane| how.apply(lane.iter().copied()));
        Variable::from_array(dims, reduced)
    }

    /// Trailing window of `window` positions along an axis. Positions with
    /// fewer predecessors than the window are NaN.
    fn rolling_axis(&self, axis: usize, window: usize, how: Reduction) -> Variable {
        let mut out = ArrayD::from_elem(self.data.raw_dim(), f64::NAN);
        Zip::from(self.data.lanes(Axis(axis)))
            .and(out.lanes_mut(Axis(axis)))
            .for_each(|lane, mut target| {
                for (i, w) in lane.windows(window).into_iter().enumerate() {
                    target[i + window - 1] = how.apply(w.iter().copied());
                }
            });
        Variable::from_array(self.dims.clone(), out)
    }

    fn concat_axis(&self, other: &Variable, axis: usize, name: &str) -> Result<Variable> {
        if self.dims != other.dims {
            return Err(PostprocError::shape(name, "cannot concatenate variables with different dims"));
        }
        let joined = concatenate(Axis(axis), &[self.data.view(), other.data.view()])
            .map_err(|e| PostprocError::shape(name, e.to_string()))?;
        Ok(Variable::from_array(self.dims.clone(), joined))
    }

    pub(crate) fn map(&self, f: impl Fn(f64) -> f64) -> Variable {
        Variable::from_array(self.dims.clone(), self.data.mapv(f))
    }

    /// Element-wise combination of two variables with the same layout
    pub(crate) fn zip_with(&self, other: &Variable, name: &str, f: impl Fn(f64, f64) -> f64) -> Result<Variable> {
        if self.dims != other.dims || self.shape() != other.shape() {
            return Err(PostprocError::shape(name, "variables have different layout"));
        }
        let out = Zip::from(&self.data).and(&other.data).map_collect(|a, b| f(*a, *b));
        Ok(Variable::from_array(self.dims.clone(), out))
    }

    /// Element-wise division with the denominator's axes reordered to ours
    /// and broadcast over dims it lacks. Zero denominators give NaN.
    fn broadcast_divide(&self, denom: &Variable, name: &str) -> Result<Variable> {
        let order: Vec<usize> = self.dims.iter().filter_map(|d| denom.axis(d)).collect();
        if order.len() != denom.dims.len() {
            return Err(PostprocError::shape(name, "denominator has dims the numerator lacks"));
        }
        let mut aligned = denom.data.view().permuted_axes(IxDyn(&order));
        for (i, dim) in self.dims.iter().enumerate() {
            if denom.axis(dim).is_none() {
                aligned = aligned.insert_axis(Axis(i));
            }
        }
        let den = aligned
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| PostprocError::shape(name, "denominator does not broadcast"))?;
        let out = Zip::from(&self.data)
            .and(&den)
            .map_collect(|x, d| if *d == 0.0 { f64::NAN } else { x / d });
        Ok(Variable::from_array(self.dims.clone(), out))
    }

    /// Fill NaN slots of self from other (same dims and shape)
    fn combine_first(&self, other: &Variable, name: &str) -> Result<Variable> {
        if self.dims != other.dims || self.shape() != other.shape() {
            return Err(PostprocError::shape(name, "cannot merge variables with different layout"));
        }
        self.zip_with(other, name, |a, b| if a.is_nan() { b } else { a })
    }
}

// ============================================================================
// FRAME
// ============================================================================

/// A set of variables sharing one coordinate space
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    coords: BTreeMap<String, Arc<[Label]>>,
    variables: BTreeMap<String, Variable>,
}

fn ensure_unique(dim: &str, labels: &[Label]) -> Result<()> {
    let mut seen = HashSet::with_capacity(labels.len());
    for label in labels {
        if !seen.insert(label) {
            return Err(PostprocError::shape(dim, format!("duplicate label {}", label)));
        }
    }
    Ok(())
}

impl Frame {
    pub fn new() -> Self {
        Frame::default()
    }

    /// Builder: add (or replace) a coordinate
    pub fn with_coord(mut self, dim: &str, labels: Vec<Label>) -> Result<Self> {
        self.set_coord(dim, labels)?;
        Ok(self)
    }

    /// Builder: add a variable laid out over existing coordinates
    pub fn with_variable(mut self, name: &str, dims: &[&str], values: Vec<f64>) -> Result<Self> {
        let shape = dims
            .iter()
            .map(|d| {
                self.coords
                    .get(*d)
                    .map(|c| c.len())
                    .ok_or_else(|| PostprocError::UnknownDimension(d.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let variable = Variable::new(dims.iter().map(|d| d.to_string()).collect(), shape, values)?;
        self.insert_variable(name, variable)?;
        Ok(self)
    }

    pub fn set_coord(&mut self, dim: &str, labels: Vec<Label>) -> Result<()> {
        ensure_unique(dim, &labels)?;
        let used_with_other_len = self
            .variables
            .values()
            .filter_map(|v| v.axis(dim).map(|a| v.shape()[a]))
            .any(|n| n != labels.len());
        if used_with_other_len {
            return Err(PostprocError::shape(dim, "coordinate length differs from variables"));
        }
        self.coords.insert(dim.to_string(), labels.into());
        Ok(())
    }

    pub fn insert_variable(&mut self, name: &str, variable: Variable) -> Result<()> {
        if self.variables.contains_key(name) {
            return Err(PostprocError::DuplicateVariable(name.to_string()));
        }
        for (dim, n) in variable.dims.iter().zip(variable.shape()) {
            let coord = self
                .coords
                .get(dim)
                .ok_or_else(|| PostprocError::UnknownDimension(dim.clone()))?;
            if coord.len() != *n {
                return Err(PostprocError::shape(
                    name,
                    format!("dim '{}' has {} labels, variable has {}", dim, coord.len(), n),
                ));
            }
        }
        self.variables.insert(name.to_string(), variable);
        Ok(())
    }

    // ========================================================================
    // INSPECTION
    // ========================================================================

    pub fn dims(&self) -> Vec<&str> {
        self.coords.keys().map(|d| d.as_str()).collect()
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.coords.contains_key(dim)
    }

    pub fn coord(&self, dim: &str) -> Option<&[Label]> {
        self.coords.get(dim).map(|c| &c[..])
    }

    /// Number of labels along a dimension (0 if absent)
    pub fn len_of(&self, dim: &str) -> usize {
        self.coords.get(dim).map_or(0, |c| c.len())
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.keys().map(|n| n.as_str()).collect()
    }

    pub fn variables(&self) -> impl Iterator<Item = (&str, &Variable)> {
        self.variables.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn position(&self, dim: &str, label: &Label) -> Option<usize> {
        self.coords.get(dim)?.iter().position(|l| l == label)
    }

    fn require_coord(&self, dim: &str) -> Result<&Arc<[Label]>> {
        self.coords
            .get(dim)
            .ok_or_else(|| PostprocError::UnknownDimension(dim.to_string()))
    }

    pub fn positions(&self, dim: &str, labels: &[Label]) -> Result<Vec<usize>> {
        let coord = self.require_coord(dim)?;
        let lookup: HashMap<&Label, usize> = coord.iter().enumerate().map(|(i, l)| (l, i)).collect();
        labels
            .iter()
            .map(|l| lookup.get(l).copied().ok_or_else(|| PostprocError::missing_label(dim, l)))
            .collect()
    }

    // ========================================================================
    // SELECTION
    // ========================================================================

    fn take(&self, dim: &str, indices: &[Option<usize>], labels: Vec<Label>) -> Result<Frame> {
        let mut coords = self.coords.clone();
        ensure_unique(dim, &labels)?;
        coords.insert(dim.to_string(), labels.into());
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.take(axis, indices),
                    None => var.clone(),
                };
                (name.clone(), var)
            })
            .collect();
        Ok(Frame { coords, variables })
    }

    /// Select positions along a dimension (the dimension is kept)
    pub fn isel(&self, dim: &str, indices: &[usize]) -> Result<Frame> {
        let coord = self.require_coord(dim)?;
        if let Some(bad) = indices.iter().find(|i| **i >= coord.len()) {
            return Err(PostprocError::missing_label(dim, format!("#{}", bad)));
        }
        let labels = indices.iter().map(|i| coord[*i].clone()).collect();
        let indices: Vec<Option<usize>> = indices.iter().map(|i| Some(*i)).collect();
        self.take(dim, &indices, labels)
    }

    /// Select labels along a dimension (the dimension is kept)
    pub fn sel(&self, dim: &str, labels: &[Label]) -> Result<Frame> {
        let positions = self.positions(dim, labels)?;
        self.isel(dim, &positions)
    }

    /// Select one label; the dimension is dropped
    pub fn sel_point(&self, dim: &str, label: &Label) -> Result<Frame> {
        let position = self
            .position(dim, label)
            .ok_or_else(|| PostprocError::missing_label(dim, label))?;
        let picked = self.isel(dim, &[position])?;

        let mut coords = picked.coords;
        coords.remove(dim);
        let variables = picked
            .variables
            .into_iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.remove_axis(axis),
                    None => var,
                };
                (name, var)
            })
            .collect();
        Ok(Frame { coords, variables })
    }

    /// Conform to a new label list; labels not present become NaN
    pub fn reindex(&self, dim: &str, labels: &[Label]) -> Result<Frame> {
        let coord = self.require_coord(dim)?;
        if &coord[..] == labels {
            return Ok(self.clone());
        }
        let lookup: HashMap<&Label, usize> = coord.iter().enumerate().map(|(i, l)| (l, i)).collect();
        let indices: Vec<Option<usize>> = labels.iter().map(|l| lookup.get(l).copied()).collect();
        self.take(dim, &indices, labels.to_vec())
    }

    /// Keep only the named variables
    pub fn select_variables<S: AsRef<str>>(&self, names: &[S]) -> Result<Frame> {
        let mut variables = BTreeMap::new();
        for name in names {
            let name = name.as_ref();
            let var = self
                .variables
                .get(name)
                .ok_or_else(|| PostprocError::UnknownVariable(name.to_string()))?;
            variables.insert(name.to_string(), var.clone());
        }
        Ok(Frame {
            coords: self.coords.clone(),
            variables,
        })
    }

    /// One-dimensional series of a variable along `along`, fixing every other dim
    pub fn series(&self, name: &str, along: &str, at: &[(&str, Label)]) -> Result<Vec<(Label, f64)>> {
        let mut frame = self.select_variables(&[name])?;
        for (dim, label) in at {
            frame = frame.sel_point(dim, label)?;
        }
        let var = frame
            .variable(name)
            .ok_or_else(|| PostprocError::UnknownVariable(name.to_string()))?;
        if var.dims() != [along.to_string()] {
            return Err(PostprocError::shape(
                name,
                format!("expected only '{}' left, got {:?}", along, var.dims()),
            ));
        }
        let coord = frame.require_coord(along)?;
        Ok(coord.iter().cloned().zip(var.values().iter().copied()).collect())
    }

    // ========================================================================
    // REDUCTION
    // ========================================================================

    /// Reduce along a dimension; the dimension is dropped
    pub fn reduce(&self, dim: &str, how: Reduction) -> Result<Frame> {
        self.require_coord(dim)?;
        let mut coords = self.coords.clone();
        coords.remove(dim);
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.reduce_axis(axis, how),
                    None => var.clone(),
                };
                (name.clone(), var)
            })
            .collect();
        Ok(Frame { coords, variables })
    }

    /// Reduce groups of positions into new labels; the dimension is kept
    pub fn group_reduce(&self, dim: &str, groups: &[(Label, Vec<usize>)], how: Reduction) -> Result<Frame> {
        let coord = self.require_coord(dim)?;
        if groups.iter().flat_map(|(_, g)| g).any(|i| *i >= coord.len()) {
            return Err(PostprocError::shape(dim, "group position out of range"));
        }
        let labels: Vec<Label> = groups.iter().map(|(l, _)| l.clone()).collect();
        ensure_unique(dim, &labels)?;
        let positions: Vec<Vec<usize>> = groups.iter().map(|(_, g)| g.clone()).collect();

        let mut coords = self.coords.clone();
        coords.insert(dim.to_string(), labels.into());
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.group_axis(axis, &positions, how),
                    None => var.clone(),
                };
                (name.clone(), var)
            })
            .collect();
        Ok(Frame { coords, variables })
    }

    /// Trailing window reduction along a dimension; the dimension is kept.
    /// The first `window - 1` positions are NaN.
    pub fn rolling(&self, dim: &str, window: usize, how: Reduction) -> Result<Frame> {
        self.require_coord(dim)?;
        if window == 0 {
            return Err(PostprocError::shape(dim, "rolling window must be at least 1"));
        }
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.rolling_axis(axis, window, how),
                    None => var.clone(),
                };
                (name.clone(), var)
            })
            .collect();
        Ok(Frame {
            coords: self.coords.clone(),
            variables,
        })
    }

    // ========================================================================
    // COMBINATION
    // ========================================================================

    /// Append `other` along `dim`. Both frames must share every other
    /// coordinate and the same variable set.
    pub fn concat(&self, other: &Frame, dim: &str) -> Result<Frame> {
        let left = self.require_coord(dim)?;
        let right = other.require_coord(dim)?;

        if self.coords.keys().ne(other.coords.keys()) {
            return Err(PostprocError::shape(dim, "cannot concatenate frames with different dimensions"));
        }
        for (d, labels) in &self.coords {
            if d != dim && other.coords.get(d) != Some(labels) {
                return Err(PostprocError::shape(d, "coordinates differ between concatenated frames"));
            }
        }
        if self.variables.keys().ne(other.variables.keys()) {
            return Err(PostprocError::shape(dim, "cannot concatenate frames with different variables"));
        }

        let labels: Vec<Label> = left.iter().chain(right.iter()).cloned().collect();
        ensure_unique(dim, &labels)?;

        let mut variables = BTreeMap::new();
        for (name, var) in &self.variables {
            let joined = match (var.axis(dim), other.variables.get(name)) {
                (Some(axis), Some(rhs)) => var.concat_axis(rhs, axis, name)?,
                _ => var.clone(),
            };
            variables.insert(name.clone(), joined);
        }

        let mut coords = self.coords.clone();
        coords.insert(dim.to_string(), labels.into());
        Ok(Frame { coords, variables })
    }

    /// Outer-join merge: coordinates are unioned (self's order first),
    /// missing cells are NaN, variables present in both are combined
    /// preferring self's non-missing values.
    pub fn merge(&self, other: &Frame) -> Result<Frame> {
        let mut coords = self.coords.clone();
        for (dim, labels) in &other.coords {
            match coords.get(dim) {
                None => {
                    coords.insert(dim.clone(), labels.clone());
                }
                Some(existing) if existing == labels => {}
                Some(existing) => {
                    let known: HashSet<&Label> = existing.iter().collect();
                    let union: Vec<Label> = existing
                        .iter()
                        .chain(labels.iter().filter(|l| !known.contains(l)))
                        .cloned()
                        .collect();
                    coords.insert(dim.clone(), union.into());
                }
            }
        }

        let left = self.conform(&coords)?;
        let right = other.conform(&coords)?;

        let mut variables = left.variables;
        for (name, var) in right.variables {
            let merged = match variables.get(&name) {
                Some(existing) => existing.combine_first(&var, &name)?,
                None => var,
            };
            variables.insert(name, merged);
        }
        Ok(Frame { coords, variables })
    }

    fn conform(&self, coords: &BTreeMap<String, Arc<[Label]>>) -> Result<Frame> {
        let mut frame = self.clone();
        for (dim, labels) in &self.coords {
            if let Some(target) = coords.get(dim) {
                if target != labels {
                    frame = frame.reindex(dim, target)?;
                }
            }
        }
        frame.coords = coords.clone();
        Ok(frame)
    }

    /// Divide every variable by the same-named variable of `denom`, broadcasting
    /// over dims the denominator lacks. Variables missing from `denom` are dropped.
    pub fn divide(&self, denom: &Frame) -> Result<Frame> {
        let mut variables = BTreeMap::new();
        for (name, num) in &self.variables {
            let Some(den) = denom.variables.get(name) else {
                continue;
            };
            for dim in &den.dims {
                if num.axis(dim).is_none() {
                    return Err(PostprocError::shape(name, format!("denominator has extra dim '{}'", dim)));
                }
                if self.coords.get(dim) != denom.coords.get(dim) {
                    return Err(PostprocError::shape(name, format!("coordinates differ on '{}'", dim)));
                }
            }
            variables.insert(name.clone(), num.broadcast_divide(den, name)?);
        }
        Ok(Frame {
            coords: self.coords.clone(),
            variables,
        })
    }

    // ========================================================================
    // RESHAPING & RENAMING
    // ========================================================================

    /// Add a new leading length-1 dimension to every variable
    pub fn expand_dim(&self, dim: &str, label: Label) -> Result<Frame> {
        if self.has_dim(dim) {
            return Err(PostprocError::shape(dim, "dimension already exists"));
        }
        let mut coords = self.coords.clone();
        coords.insert(dim.to_string(), vec![label].into());
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let mut dims = vec![dim.to_string()];
                dims.extend(var.dims.iter().cloned());
                let var = Variable {
                    dims,
                    data: var.data.clone().insert_axis(Axis(0)),
                };
                (name.clone(), var)
            })
            .collect();
        Ok(Frame { coords, variables })
    }

    /// Replace `dim` by two new dimensions. `keys[j]` gives the (row, col)
    /// labels of position j; positions sharing a cell are reduced with `how`.
    pub fn unstack(&self, dim: &str, rows: &str, cols: &str, keys: &[(Label, Label)], how: Reduction) -> Result<Frame> {
        let coord = self.require_coord(dim)?;
        if keys.len() != coord.len() {
            return Err(PostprocError::shape(dim, "one key pair per position required"));
        }
        for new_dim in [rows, cols] {
            if self.has_dim(new_dim) && new_dim != dim {
                return Err(PostprocError::shape(new_dim, "dimension already exists"));
            }
        }

        let mut row_labels: Vec<Label> = Vec::new();
        let mut col_labels: Vec<Label> = Vec::new();
        for (r, c) in keys {
            if !row_labels.contains(r) {
                row_labels.push(r.clone());
            }
            if !col_labels.contains(c) {
                col_labels.push(c.clone());
            }
        }
        let cells: Vec<usize> = keys
            .iter()
            .map(|(r, c)| {
                let i = row_labels.iter().position(|l| l == r).unwrap_or(0);
                let j = col_labels.iter().position(|l| l == c).unwrap_or(0);
                i * col_labels.len() + j
            })
            .collect();

        let mut coords = self.coords.clone();
        coords.remove(dim);
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis(dim) {
                    Some(axis) => var.unstack_axis(
                        axis,
                        &cells,
                        (rows.to_string(), row_labels.len()),
                        (cols.to_string(), col_labels.len()),
                        how,
                    )?,
                    None => var.clone(),
                };
                Ok((name.clone(), var))
            })
            .collect::<Result<_>>()?;
        coords.insert(rows.to_string(), row_labels.into());
        coords.insert(cols.to_string(), col_labels.into());
        Ok(Frame { coords, variables })
    }

    pub fn rename_variables(&self, rename: impl Fn(&str) -> String) -> Result<Frame> {
        let mut variables = BTreeMap::new();
        for (name, var) in &self.variables {
            let new_name = rename(name);
            if variables.insert(new_name.clone(), var.clone()).is_some() {
                return Err(PostprocError::DuplicateVariable(new_name));
            }
        }
        Ok(Frame {
            coords: self.coords.clone(),
            variables,
        })
    }

    /// Relabel a coordinate; labels must stay unique
    pub fn map_labels(&self, dim: &str, relabel: impl Fn(&Label) -> Label) -> Result<Frame> {
        let labels: Vec<Label> = self.require_coord(dim)?.iter().map(relabel).collect();
        let mut frame = self.clone();
        frame.set_coord(dim, labels)?;
        Ok(frame)
    }

    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Frame {
        Frame {
            coords: self.coords.clone(),
            variables: self
                .variables
                .iter()
                .map(|(name, var)| (name.clone(), var.map(&f)))
                .collect(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> Label {
        Label::Date(NaiveDate::from_ymd_opt(2020, 1, d).unwrap())
    }

    /// time (3) x agent (2), values t*10 + a
    fn sample() -> Frame {
        Frame::new()
            .with_coord(TIME, vec![date(1), date(2), date(3)])
            .unwrap()
            .with_coord(AGENT, text_labels(["AGRI:CHN", "AGRI:USA"]))
            .unwrap()
            .with_variable("flow", &[TIME, AGENT], vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0])
            .unwrap()
    }

    #[test]
    fn test_variable_rejects_bad_length() {
        let result = Variable::new(vec!["a".into()], vec![3], vec![1.0, 2.0]);
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let result = Frame::new().with_coord(AGENT, text_labels(["A:X", "A:X"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_sel_keeps_dim_and_order() {
        let frame = sample().sel(AGENT, &text_labels(["AGRI:USA"])).unwrap();
        let var = frame.variable("flow").unwrap();
        assert_eq!(var.shape(), &[3, 1]);
        assert_eq!(var.values(), &[1.0, 11.0, 21.0]);
    }

    #[test]
    fn test_sel_missing_label_errors() {
        let result = sample().sel(AGENT, &text_labels(["FOOD:CHN"]));
        assert!(matches!(result, Err(PostprocError::MissingLabel { .. })));
    }

    #[test]
    fn test_sel_point_drops_dim() {
        let frame = sample().sel_point(TIME, &date(2)).unwrap();
        assert!(!frame.has_dim(TIME));
        let var = frame.variable("flow").unwrap();
        assert_eq!(var.dims(), &[AGENT.to_string()]);
        assert_eq!(var.values(), &[10.0, 11.0]);
    }

    #[test]
    fn test_empty_selection() {
        let frame = sample().isel(AGENT, &[]).unwrap();
        assert_eq!(frame.len_of(AGENT), 0);
        assert!(frame.variable("flow").unwrap().is_empty());
    }

    #[test]
    fn test_reductions_skip_nan() {
        let values = [1.0, f64::NAN, 3.0];
        assert_eq!(Reduction::Sum.apply(values), 4.0);
        assert_eq!(Reduction::Mean.apply(values), 2.0);
        assert_eq!(Reduction::Min.apply(values), 1.0);
        assert_eq!(Reduction::Max.apply(values), 3.0);
        assert_eq!(Reduction::Std.apply(values), 1.0);

        assert_eq!(Reduction::Sum.apply([f64::NAN]), 0.0);
        assert!(Reduction::Mean.apply([f64::NAN]).is_nan());
    }

    #[test]
    fn test_reduction_from_str() {
        assert_eq!("SUM".parse::<Reduction>().unwrap(), Reduction::Sum);
        assert!(matches!(
            "median".parse::<Reduction>(),
            Err(PostprocError::UnsupportedReduction(_))
        ));
    }

    #[test]
    fn test_reduce_over_time() {
        let frame = sample().reduce(TIME, Reduction::Mean).unwrap();
        assert!(!frame.has_dim(TIME));
        assert_eq!(frame.variable("flow").unwrap().values(), &[10.0, 11.0]);
    }

    #[test]
    fn test_group_reduce() {
        let frame = sample()
            .group_reduce(AGENT, &[(Label::from("AGRI:NAM"), vec![0, 1])], Reduction::Sum)
            .unwrap();
        assert_eq!(frame.coord(AGENT).unwrap(), &[Label::from("AGRI:NAM")]);
        assert_eq!(frame.variable("flow").unwrap().values(), &[1.0, 21.0, 41.0]);
    }

    #[test]
    fn test_concat_along_agents() {
        let base = sample();
        let extra = base
            .group_reduce(AGENT, &[(Label::from("AGRI:NAM"), vec![0, 1])], Reduction::Sum)
            .unwrap();
        let joined = base.concat(&extra, AGENT).unwrap();
        assert_eq!(joined.len_of(AGENT), 3);
        let var = joined.variable("flow").unwrap();
        assert_eq!(var.values(), &[0.0, 1.0, 1.0, 10.0, 11.0, 21.0, 20.0, 21.0, 41.0]);
    }

    #[test]
    fn test_concat_rejects_duplicate_labels() {
        let base = sample();
        assert!(base.concat(&base, AGENT).is_err());
    }

    #[test]
    fn test_merge_outer_join_fills_nan() {
        let left = sample();
        let right = Frame::new()
            .with_coord(TIME, vec![date(1), date(2), date(3)])
            .unwrap()
            .with_coord(AGENT, text_labels(["q1:CHN"]))
            .unwrap()
            .with_variable("utility", &[TIME, AGENT], vec![5.0, 6.0, 7.0])
            .unwrap();

        let merged = left.merge(&right).unwrap();
        assert_eq!(merged.len_of(AGENT), 3);

        let flow = merged.variable("flow").unwrap();
        assert_eq!(flow.get(&[0, 1]), Some(1.0));
        assert!(flow.get(&[0, 2]).unwrap().is_nan());

        let utility = merged.variable("utility").unwrap();
        assert!(utility.get(&[1, 0]).unwrap().is_nan());
        assert_eq!(utility.get(&[1, 2]), Some(6.0));
    }

    #[test]
    fn test_divide_broadcasts_and_nans_zero() {
        let frame = sample();
        let base = frame.sel_point(TIME, &date(1)).unwrap();
        let relative = frame.divide(&base).unwrap();
        let var = relative.variable("flow").unwrap();

        // agent 0 has a zero baseline
        assert!(var.get(&[0, 0]).unwrap().is_nan());
        assert!(var.get(&[2, 0]).unwrap().is_nan());
        assert_eq!(var.get(&[0, 1]), Some(1.0));
        assert_eq!(var.get(&[2, 1]), Some(21.0));
    }

    #[test]
    fn test_divide_aligns_denominator_dim_order() {
        let frame = sample();
        // same values laid out agent-major
        let transposed = Frame::new()
            .with_coord(TIME, vec![date(1), date(2), date(3)])
            .unwrap()
            .with_coord(AGENT, text_labels(["AGRI:CHN", "AGRI:USA"]))
            .unwrap()
            .with_variable("flow", &[AGENT, TIME], vec![0.0, 10.0, 20.0, 1.0, 11.0, 21.0])
            .unwrap();
        let ratio = frame.divide(&transposed).unwrap();
        let var = ratio.variable("flow").unwrap();
        assert_eq!(var.dims(), &[TIME.to_string(), AGENT.to_string()]);
        assert!(var.get(&[0, 0]).unwrap().is_nan());
        assert_eq!(var.get(&[1, 0]), Some(1.0));
        assert_eq!(var.get(&[2, 1]), Some(1.0));
    }

    #[test]
    fn test_rolling_trailing_window() {
        let rolled = sample().rolling(TIME, 2, Reduction::Mean).unwrap();
        let var = rolled.variable("flow").unwrap();
        assert_eq!(var.shape(), &[3, 2]);
        assert!(var.get(&[0, 0]).unwrap().is_nan());
        assert_eq!(var.get(&[1, 0]), Some(5.0));
        assert_eq!(var.get(&[2, 1]), Some(16.0));

        let too_long = sample().rolling(TIME, 4, Reduction::Mean).unwrap();
        assert!(too_long.variable("flow").unwrap().values().iter().all(|v| v.is_nan()));
        assert!(sample().rolling(TIME, 0, Reduction::Mean).is_err());
    }

    #[test]
    fn test_expand_dim_and_series() {
        let frame = sample().expand_dim("model", Label::from("GFDL-ESM4")).unwrap();
        assert_eq!(frame.variable("flow").unwrap().shape(), &[1, 3, 2]);

        let series = frame
            .series("flow", TIME, &[("model", Label::from("GFDL-ESM4")), (AGENT, Label::from("AGRI:USA"))])
            .unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[2], (date(3), 21.0));
    }

    #[test]
    fn test_unstack_into_grid() {
        let keys = vec![
            (Label::from("AGRI"), Label::from("CHN")),
            (Label::from("AGRI"), Label::from("USA")),
        ];
        let grid = sample().unstack(AGENT, SECTOR, REGION, &keys, Reduction::Sum).unwrap();
        assert!(!grid.has_dim(AGENT));
        let var = grid.variable("flow").unwrap();
        assert_eq!(var.dims(), &[TIME.to_string(), SECTOR.to_string(), REGION.to_string()]);
        assert_eq!(var.shape(), &[3, 1, 2]);
        assert_eq!(var.get(&[2, 0, 1]), Some(21.0));
    }

    #[test]
    fn test_unstack_leaves_empty_cells_nan() {
        let keys = vec![
            (Label::from("AGRI"), Label::from("CHN")),
            (Label::from("FOOD"), Label::from("USA")),
        ];
        let grid = sample().unstack(AGENT, SECTOR, REGION, &keys, Reduction::Sum).unwrap();
        let var = grid.variable("flow").unwrap();
        assert_eq!(var.shape(), &[3, 2, 2]);
        assert_eq!(var.get(&[1, 0, 0]), Some(10.0));
        assert!(var.get(&[1, 0, 1]).unwrap().is_nan());
        assert_eq!(var.get(&[1, 1, 1]), Some(11.0));
    }

    #[test]
    fn test_rename_variables_detects_collisions() {
        let frame = sample()
            .with_variable("stock", &[AGENT], vec![1.0, 2.0])
            .unwrap();
        assert!(frame.rename_variables(|_| "same".to_string()).is_err());

        let renamed = frame.rename_variables(|n| format!("firms.{}", n)).unwrap();
        assert_eq!(renamed.variable_names(), vec!["firms.flow", "firms.stock"]);
    }
}
