// 📤 CSV Export
// Long-format CSV: one column per dimension plus `value`, one row per cell.

use crate::dataset::DatasetView;
use crate::entities::CoordinateRegistry;
use crate::error::{PostprocError, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Write one variable as CSV to any writer
pub fn write_variable<V: DatasetView, W: Write>(view: &V, name: &str, writer: W) -> Result<usize> {
    let variable = view
        .variable(name)
        .ok_or_else(|| PostprocError::UnknownVariable(name.to_string()))?;
    let coords = variable
        .dims()
        .iter()
        .map(|d| view.coord(d).ok_or_else(|| PostprocError::UnknownDimension(d.clone())))
        .collect::<Result<Vec<_>>>()?;

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header: Vec<&str> = variable.dims().iter().map(|d| d.as_str()).collect();
    header.push("value");
    wtr.write_record(&header)?;

    let mut rows = 0;
    for (index, value) in variable.view().indexed_iter() {
        let mut record: Vec<String> = coords
            .iter()
            .enumerate()
            .map(|(axis, coord)| coord[index[axis]].to_string())
            .collect();
        record.push(if value.is_nan() { String::new() } else { value.to_string() });
        wtr.write_record(&record)?;
        rows += 1;
    }
    wtr.flush()?;
    Ok(rows)
}

pub fn write_variable_csv<V: DatasetView>(view: &V, name: &str, path: &Path) -> Result<usize> {
    let file = fs::File::create(path)?;
    write_variable(view, name, file)
}

/// Write every variable to `<dir>/<variable>.csv`
pub fn export_frame<V: DatasetView>(view: &V, dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for name in view.variable_names() {
        let path = dir.join(format!("{}.csv", name));
        let rows = write_variable_csv(view, name, &path)?;
        info!(variable = name, rows, path = %path.display(), "Exported variable");
        written.push(path);
    }
    Ok(written)
}

#[derive(Debug, Serialize)]
struct AgentRow<'a> {
    agent: &'a str,
    sector: &'a str,
    region: &'a str,
    agent_type: &'a str,
}

/// Registry agent table as CSV
pub fn write_agents_csv(registry: &CoordinateRegistry, path: &Path) -> Result<usize> {
    let mut wtr = csv::Writer::from_path(path)?;
    let mut rows = 0;
    for (name, info) in registry.agents() {
        wtr.serialize(AgentRow {
            agent: name,
            sector: &info.sector,
            region: &info.region,
            agent_type: info.agent_type.as_str(),
        })?;
        rows += 1;
    }
    wtr.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::sample;

    #[test]
    fn test_write_variable_long_format() {
        let dataset = sample();
        let mut buf = Vec::new();
        let rows = write_variable(dataset.baseline().unwrap(), "firms.flow", &mut buf).unwrap();
        assert_eq!(rows, 4);
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "agent,value");
        assert_eq!(lines[1], "AGRI:CHN,1");
        assert_eq!(lines[4], "q1:USA,0");
    }

    #[test]
    fn test_nan_written_as_empty() {
        let dataset = sample().baseline_relative().unwrap();
        let mut buf = Vec::new();
        write_variable(&dataset, "firms.flow", &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.lines().any(|l| l == "2020-01-01,q1:USA,"));
        assert!(text.lines().any(|l| l == "2020-01-03,AGRI:USA,3"));
    }

    #[test]
    fn test_unknown_variable() {
        let dataset = sample();
        let result = write_variable(&dataset, "firms.nothing", Vec::new());
        assert!(matches!(result, Err(PostprocError::UnknownVariable(_))));
    }

    #[test]
    fn test_export_frame_and_agents() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = sample();
        let written = export_frame(&dataset, &dir.path().join("out")).unwrap();
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("firms.flow.csv"));

        let agents_path = dir.path().join("agents.csv");
        assert_eq!(write_agents_csv(dataset.registry(), &agents_path).unwrap(), 4);
        let text = std::fs::read_to_string(agents_path).unwrap();
        assert!(text.starts_with("agent,sector,region,agent_type"));
        assert!(text.contains("q1:USA,q1,USA,consumer"));
    }
}
