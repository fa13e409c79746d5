// 📊 Analysis helpers
// Summaries computed over a dataset's time axis, a sector × region view of
// the agent axis, moving windows and empirical elasticities.

use crate::dataset::AgentDataset;
use crate::error::{PostprocError, Result};
use crate::frame::{Frame, Label, Reduction, AGENT, REGION, SECTOR, TIME};
use tracing::{debug, warn};

pub const STD_PREFIX: &str = "std_";
pub const ELASTICITY_SUFFIX: &str = "_elasticity";

/// Relative changes at or below this magnitude count as no change
pub const DEFAULT_TOLERANCE: f64 = 1e-5;

/// Window used for smoothing daily output
pub const DEFAULT_WINDOW: usize = 31;

const MAX_ELASTICITY: f64 = 10.0;

/// Mean over time, missing values skipped
pub fn time_average(dataset: &AgentDataset) -> Result<Frame> {
    dataset.data().reduce(TIME, Reduction::Mean)
}

/// Standard deviation over time; variables renamed "std_<name>"
pub fn summary_stats(dataset: &AgentDataset) -> Result<Frame> {
    dataset
        .data()
        .reduce(TIME, Reduction::Std)?
        .rename_variables(|name| format!("{}{}", STD_PREFIX, name))
}

/// Split the agent axis into sector × region, summing agents that share a
/// cell (aggregates included). Cells without an agent are NaN.
pub fn sector_region_grid(dataset: &AgentDataset) -> Result<Frame> {
    let data = dataset.data();
    if data.has_dim(SECTOR) || data.has_dim(REGION) {
        return Err(PostprocError::shape(AGENT, "dataset already has sector or region axes"));
    }
    let registry = dataset.registry();
    let keys = dataset
        .agents()
        .into_iter()
        .map(|name| {
            registry
                .agent(name)
                .map(|info| (Label::from(&info.sector), Label::from(&info.region)))
                .ok_or_else(|| PostprocError::missing_label(AGENT, name))
        })
        .collect::<Result<Vec<_>>>()?;
    data.unstack(AGENT, SECTOR, REGION, &keys, Reduction::Sum)
}

/// Trailing moving window over time. The first `window - 1` timesteps are NaN.
pub fn rolling(frame: &Frame, window: usize, how: Reduction) -> Result<Frame> {
    frame.rolling(TIME, window, how)
}

// ============================================================================
// ELASTICITIES
// ============================================================================

/// Empirical elasticities against the baseline. Each `<id>_quantity`
/// variable with a matching `<id>_value` gives `<id>_elasticity`: the
/// relative quantity change over the relative price change, with price =
/// value / quantity. Changes within `tolerance` of zero and elasticities
/// beyond ±10 are NaN.
pub fn baseline_elasticities(dataset: &AgentDataset, tolerance: f64) -> Result<Frame> {
    let relative = dataset.baseline_relative()?;
    let data = relative.data();
    let significant = |x: f64| if x.abs() > tolerance { x } else { f64::NAN };

    let mut out = data.select_variables::<&str>(&[])?;
    for name in data.variable_names() {
        let Some(identifier) = name.strip_suffix("_quantity") else {
            continue;
        };
        let value_name = format!("{}_value", identifier);
        let (Some(quantity), Some(value)) = (data.variable(name), data.variable(&value_name)) else {
            debug!(quantity = name, "No matching value variable, skipping");
            continue;
        };

        let quantity_change = quantity.map(|q| significant(q - 1.0));
        let price_change = value.zip_with(quantity, &value_name, |v, q| {
            if q == 0.0 {
                f64::NAN
            } else {
                significant(v / q - 1.0)
            }
        })?;
        let elasticity = quantity_change.zip_with(&price_change, name, |dq, dp| {
            let e = dq / dp;
            if e.abs() <= MAX_ELASTICITY {
                e
            } else {
                f64::NAN
            }
        })?;
        out.insert_variable(&format!("{}{}", identifier, ELASTICITY_SUFFIX), elasticity)?;
    }

    if out.is_empty() {
        warn!("No *_quantity / *_value variable pairs, no elasticities computed");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::{date, sample};
    use crate::entities::{AgentInfo, AgentType, CoordinateRegistry};
    use crate::frame::text_labels;

    /// time (3) x agent (2) with a quantity / value pair
    fn market() -> AgentDataset {
        let mut registry = CoordinateRegistry::new();
        let names: Vec<String> = [
            AgentInfo::new("AGRI", "CHN", AgentType::Firm),
            AgentInfo::new("AGRI", "USA", AgentType::Firm),
        ]
        .into_iter()
        .map(|info| registry.register_agent(info))
        .collect();
        let frame = Frame::new()
            .with_coord(TIME, vec![date(1), date(2), date(3)])
            .unwrap()
            .with_coord(AGENT, text_labels(names))
            .unwrap()
            .with_variable("firms.production_quantity", &[TIME, AGENT], vec![2.0, 1.0, 2.2, 1.5, 2.0, 1.0])
            .unwrap()
            .with_variable("firms.production_value", &[TIME, AGENT], vec![4.0, 1.0, 4.0, 1.515, 4.4, 1.0])
            .unwrap()
            .with_variable("firms.stock", &[TIME, AGENT], vec![1.0; 6])
            .unwrap();
        AgentDataset::new(frame, registry).unwrap()
    }

    #[test]
    fn test_time_average() {
        let averaged = time_average(&sample()).unwrap();
        assert!(!averaged.has_dim(TIME));
        // AGRI:CHN: 1, 2, 3
        assert_eq!(averaged.variable("firms.flow").unwrap().values()[0], 2.0);
    }

    #[test]
    fn test_summary_stats_prefix() {
        let stats = summary_stats(&sample()).unwrap();
        assert_eq!(stats.variable_names(), vec!["std_firms.flow"]);
        let std = stats.variable("std_firms.flow").unwrap().values()[0];
        assert!((std - (2.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_sector_region_grid() {
        let grid = sector_region_grid(&sample()).unwrap();
        assert_eq!(grid.coord(SECTOR).unwrap(), &[Label::from("AGRI"), Label::from("FOOD"), Label::from("q1")]);
        assert_eq!(grid.coord(REGION).unwrap(), &[Label::from("CHN"), Label::from("USA")]);

        let flow = grid.variable("firms.flow").unwrap();
        assert_eq!(flow.dims(), &[TIME.to_string(), SECTOR.to_string(), REGION.to_string()]);
        // AGRI:USA at t0 is 3
        assert_eq!(flow.get(&[0, 0, 1]), Some(3.0));
        // FOOD:USA does not exist
        assert!(flow.get(&[0, 1, 1]).unwrap().is_nan());
    }

    #[test]
    fn test_baseline_elasticities() {
        let elasticities = baseline_elasticities(&market(), DEFAULT_TOLERANCE).unwrap();
        assert_eq!(elasticities.variable_names(), vec!["firms.production_elasticity"]);
        let e = elasticities.variable("firms.production_elasticity").unwrap();

        // no change at the reference date
        assert!(e.get(&[0, 0]).unwrap().is_nan());
        // quantity +10%, price -1/11
        assert!((e.get(&[1, 0]).unwrap() + 1.1).abs() < 1e-9);
        // unchanged quantity is below tolerance
        assert!(e.get(&[2, 0]).unwrap().is_nan());
        // 0.5 / 0.01 = 50 is clipped
        assert!(e.get(&[1, 1]).unwrap().is_nan());
    }

    #[test]
    fn test_elasticities_without_pairs_are_empty() {
        let elasticities = baseline_elasticities(&sample(), DEFAULT_TOLERANCE).unwrap();
        assert!(elasticities.is_empty());
    }

    #[test]
    fn test_rolling_over_time() {
        let smoothed = rolling(sample().data(), 2, Reduction::Mean).unwrap();
        let series = smoothed.series("firms.flow", TIME, &[(AGENT, Label::from("AGRI:CHN"))]).unwrap();
        assert!(series[0].1.is_nan());
        assert_eq!(series[1].1, 1.5);
        assert_eq!(series[2].1, 2.5);
    }
}
