// 🎲 Ensemble Combination
// Finds simulation outputs of an ensemble (one file per climate model,
// scenario and time period) and stacks them into one dataset with extra
// `model`, `ssp` and `timeperiod` dimensions.
//
// File names carry the key, e.g. "impacts_GFDL-ESM4-ssp585_2030-2039.sqlite".

use crate::dataset::AgentDataset;
use crate::entities::RegionGroups;
use crate::error::{PostprocError, Result};
use crate::frame::Label;
use crate::loader::Loader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const MODEL: &str = "model";
pub const SSP: &str = "ssp";
pub const TIMEPERIOD: &str = "timeperiod";

pub const STORE_EXTENSION: &str = "sqlite";

/// ISIMIP main models, used when no model list is given
pub const DEFAULT_MODELS: [&str; 5] = ["UKESM1-0-LL", "GFDL-ESM4", "MPI-ESM1-2-HR", "MRI-ESM2-0", "IPSL-CM6A-LR"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnsembleKey {
    pub model: String,
    pub ssp: String,
    pub timeperiod: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnsembleIndex {
    members: BTreeMap<EnsembleKey, PathBuf>,
}

impl EnsembleIndex {
    pub fn members(&self) -> impl Iterator<Item = (&EnsembleKey, &Path)> {
        self.members.iter().map(|(k, p)| (k, p.as_path()))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, key: &EnsembleKey) -> Option<&Path> {
        self.members.get(key).map(|p| p.as_path())
    }
}

// ============================================================================
// DISCOVERY
// ============================================================================

struct KeyParser {
    models: Vec<String>,
    ssp: Regex,
    period: Regex,
}

impl KeyParser {
    fn new<S: AsRef<str>>(models: &[S]) -> Result<Self> {
        let mut models: Vec<String> = if models.is_empty() {
            DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
        } else {
            models.iter().map(|m| m.as_ref().to_string()).collect()
        };
        // longest first, so "MPI-ESM1-2-HR" wins over a shorter prefix
        models.sort_by_key(|m| std::cmp::Reverse(m.len()));
        Ok(KeyParser {
            models,
            ssp: Regex::new(r"ssp\d{3}")?,
            period: Regex::new(r"\d{4}-\d{4}")?,
        })
    }

    fn parse(&self, file_name: &str) -> Option<EnsembleKey> {
        let model = self.models.iter().find(|m| file_name.contains(m.as_str()))?;
        let rest = file_name.replacen(model.as_str(), "", 1);
        let ssp = self.ssp.find(&rest)?.as_str().to_string();
        let timeperiod = self.period.find(&rest)?.as_str().to_string();
        Some(EnsembleKey {
            model: model.clone(),
            ssp,
            timeperiod,
        })
    }
}

/// Store files under `dir`. Directory links are not followed, so a link
/// cycle cannot repeat a member; linked files are kept.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dir) {
        match entry {
            Ok(e) => {
                let is_file = e.file_type().is_file() || (e.path_is_symlink() && e.path().is_file());
                if is_file && e.path().extension().is_some_and(|ext| ext == STORE_EXTENSION) {
                    out.push(e.into_path());
                }
            }
            Err(err) if err.depth() == 0 => return Err(std::io::Error::from(err).into()),
            Err(err) => warn!(error = %err, "Directory traversal error, skipping entry"),
        }
    }
    Ok(out)
}

/// Index store files under `basedir` (recursively) by model, ssp and period.
/// Files without a complete key are ignored; keys claimed by several files
/// are reported and left out.
pub fn discover<S: AsRef<str>>(basedir: &Path, models: &[S]) -> Result<EnsembleIndex> {
    let parser = KeyParser::new(models)?;
    let mut files = collect_files(basedir)?;
    files.sort();

    let mut found: BTreeMap<EnsembleKey, Vec<PathBuf>> = BTreeMap::new();
    for path in files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match parser.parse(name) {
            Some(key) => found.entry(key).or_default().push(path),
            None => debug!(file = %path.display(), "Not an ensemble member"),
        }
    }

    let mut members = BTreeMap::new();
    for (key, mut paths) in found {
        if paths.len() > 1 {
            warn!(
                model = %key.model,
                ssp = %key.ssp,
                timeperiod = %key.timeperiod,
                files = paths.len(),
                "Multiple files for one ensemble member, skipping"
            );
            continue;
        }
        if let Some(path) = paths.pop() {
            members.insert(key, path);
        }
    }
    info!(basedir = %basedir.display(), members = members.len(), "Discovered ensemble");
    Ok(EnsembleIndex { members })
}

// ============================================================================
// COMBINATION
// ============================================================================

/// Load every member and outer-merge them along model / ssp / timeperiod.
/// Data and baseline both carry the three new dimensions.
pub fn combine<S: AsRef<str>>(index: &EnsembleIndex, groups: &[S], region_groups: &RegionGroups) -> Result<AgentDataset> {
    let mut combined: Option<AgentDataset> = None;
    let mut seen_groups: BTreeSet<String> = BTreeSet::new();

    for (key, path) in index.members() {
        let loader = Loader::open(path)?.with_region_groups(region_groups.clone());
        let (member, report) = loader.load_dataset(groups, None)?;
        if report.is_empty() {
            warn!(file = %path.display(), "Ensemble member has none of the requested groups");
            continue;
        }
        seen_groups.extend(report.loaded_groups);

        let member = member
            .expand_dim(TIMEPERIOD, Label::from(&key.timeperiod))?
            .expand_dim(SSP, Label::from(&key.ssp))?
            .expand_dim(MODEL, Label::from(&key.model))?;

        combined = Some(match combined {
            Some(acc) => acc.merge(&member)?,
            None => member,
        });
    }

    let combined = combined.ok_or_else(|| PostprocError::CorruptStore("no ensemble member could be loaded".to_string()))?;
    info!(members = index.len(), groups = seen_groups.len(), "Combined ensemble");
    Ok(combined)
}
