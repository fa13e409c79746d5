// 🌍 Region Groups - named aggregates of region codes
// e.g. "EU28" → [DEU, FRA, ...]. Members may name other groups
// ("G20" → ["USA", "CHN", "EU28", ...]), so expansion is recursive.

use crate::error::{PostprocError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionGroups {
    groups: BTreeMap<String, Vec<String>>,
}

impl RegionGroups {
    pub fn new() -> Self {
        RegionGroups::default()
    }

    pub fn from_map(groups: BTreeMap<String, Vec<String>>) -> Self {
        RegionGroups { groups }
    }

    /// Register (or replace) a group
    pub fn insert<I, S>(&mut self, name: &str, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .insert(name.to_string(), members.into_iter().map(Into::into).collect());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(|k| k.as_str())
    }

    pub fn members(&self, name: &str) -> Option<&[String]> {
        self.groups.get(name).map(|m| m.as_slice())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Flatten a code into plain region codes.
    ///
    /// A code that is not a group name expands to itself.
    pub fn expand(&self, code: &str) -> Result<BTreeSet<String>> {
        let mut out = BTreeSet::new();
        let mut path = Vec::new();
        self.expand_into(code, &mut path, &mut out)?;
        Ok(out)
    }

    fn expand_into(&self, code: &str, path: &mut Vec<String>, out: &mut BTreeSet<String>) -> Result<()> {
        let Some(members) = self.groups.get(code) else {
            out.insert(code.to_string());
            return Ok(());
        };
        if path.iter().any(|p| p == code) {
            return Err(PostprocError::RegionGroupCycle(code.to_string()));
        }
        path.push(code.to_string());
        for member in members {
            self.expand_into(member, path, out)?;
        }
        path.pop();
        Ok(())
    }

    /// Expand every code of a list, unioning the results
    pub fn expand_all<I, S>(&self, codes: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = BTreeSet::new();
        for code in codes {
            out.extend(self.expand(code.as_ref())?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> RegionGroups {
        let mut g = RegionGroups::new();
        g.insert("CHN", ["CN.BJ", "CN.SH"]);
        g.insert("USA", ["US.CA", "US.TX"]);
        g.insert("G2", ["CHN", "USA"]);
        g
    }

    #[test]
    fn test_plain_code_expands_to_itself() {
        let expanded = groups().expand("DEU").unwrap();
        assert_eq!(expanded.into_iter().collect::<Vec<_>>(), vec!["DEU"]);
    }

    #[test]
    fn test_nested_expansion() {
        let expanded = groups().expand("G2").unwrap();
        assert_eq!(expanded.len(), 4);
        assert!(expanded.contains("CN.BJ"));
        assert!(expanded.contains("US.TX"));
        assert!(!expanded.contains("CHN"));
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut g = groups();
        g.insert("A", ["B"]);
        g.insert("B", ["A"]);
        assert!(matches!(g.expand("A"), Err(PostprocError::RegionGroupCycle(_))));
    }

    #[test]
    fn test_expand_all_unions() {
        let expanded = groups().expand_all(["CHN", "DEU"]).unwrap();
        assert_eq!(expanded.len(), 3);
    }
}
