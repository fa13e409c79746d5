// 💾 Output Store
// One SQLite file laid out like the simulation's hierarchical output:
// named groups of variables, a shared time axis with "days since" units,
// label tables for regions / sectors / agent types and a per-agent table with
// byte-encoded names.
//
// Schema:
//   meta(key, value)                         time_units, reference_date
//   time(idx, value)                         integer offsets
//   region / sector / agent_type(idx, name)  label tables
//   agent(idx, name BLOB, agent_type, sector, region)
//   dim_labels(dim, idx, name)               labels of any other dimension
//   variables(group_name, name, role, dims, shape, data BLOB)
//   coords(group_name, dim, position, label) label = idx in the table named
//                                            like the dim (dim_labels otherwise)

use crate::error::{PostprocError, Result};
use crate::frame::Variable;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

pub const ROLE_DATA: &str = "data";
pub const ROLE_BASELINE: &str = "baseline";

// ============================================================================
// LABEL TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelTable {
    Region,
    Sector,
    AgentType,
}

impl LabelTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            LabelTable::Region => "region",
            LabelTable::Sector => "sector",
            LabelTable::AgentType => "agent_type",
        }
    }
}

impl fmt::Display for LabelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// One row of the agent table, indices into the label tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAgent {
    /// Raw name bytes, NUL-padded to a fixed width
    pub name: Vec<u8>,
    pub agent_type: i64,
    pub sector: i64,
    pub region: i64,
}

impl StoredAgent {
    /// Name with trailing NUL padding removed
    pub fn decoded_name(&self) -> String {
        let end = self.name.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        String::from_utf8_lossy(&self.name[..end]).trim().to_string()
    }
}

/// NUL-pad names to a common width
pub fn encode_names(names: &[String]) -> Vec<Vec<u8>> {
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    names
        .iter()
        .map(|n| {
            let mut bytes = n.as_bytes().to_vec();
            bytes.resize(width, 0);
            bytes
        })
        .collect()
}

// ============================================================================
// STORE
// ============================================================================

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open an existing store file
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PostprocError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("store not found: {}", path.display()),
            )));
        }
        let conn = Connection::open(path)?;
        Ok(Store { conn })
    }

    /// Create a fresh store file, replacing any existing one
    pub fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let store = Store {
            conn: Connection::open(path)?,
        };
        store.setup_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Store {
            conn: Connection::open_in_memory()?,
        };
        store.setup_schema()?;
        Ok(store)
    }

    fn setup_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS time (
                idx INTEGER PRIMARY KEY,
                value INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS region (
                idx INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS sector (
                idx INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent_type (
                idx INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent (
                idx INTEGER PRIMARY KEY,
                name BLOB NOT NULL,
                agent_type INTEGER NOT NULL,
                sector INTEGER NOT NULL,
                region INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS dim_labels (
                dim TEXT NOT NULL,
                idx INTEGER NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (dim, idx)
            );
            CREATE TABLE IF NOT EXISTS variables (
                group_name TEXT NOT NULL,
                name TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('data', 'baseline')),
                dims TEXT NOT NULL,
                shape TEXT NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (group_name, name, role)
            );
            CREATE TABLE IF NOT EXISTS coords (
                group_name TEXT NOT NULL,
                dim TEXT NOT NULL,
                position INTEGER NOT NULL,
                label INTEGER NOT NULL,
                PRIMARY KEY (group_name, dim, position)
            );",
        )?;
        Ok(())
    }

    // ========================================================================
    // META & TIME
    // ========================================================================

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn meta(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn write_time(&self, offsets: &[i64]) -> Result<()> {
        let mut stmt = self.conn.prepare("INSERT INTO time (idx, value) VALUES (?1, ?2)")?;
        for (idx, value) in offsets.iter().enumerate() {
            stmt.execute(params![idx as i64, value])?;
        }
        Ok(())
    }

    pub fn read_time(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT value FROM time ORDER BY idx")?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(values)
    }

    // ========================================================================
    // LABEL TABLES & AGENTS
    // ========================================================================

    pub fn write_labels(&self, table: LabelTable, names: &[String]) -> Result<()> {
        let sql = format!("INSERT INTO {} (idx, name) VALUES (?1, ?2)", table.table_name());
        let mut stmt = self.conn.prepare(&sql)?;
        for (idx, name) in names.iter().enumerate() {
            stmt.execute(params![idx as i64, name])?;
        }
        Ok(())
    }

    pub fn read_labels(&self, table: LabelTable) -> Result<Vec<String>> {
        let sql = format!("SELECT name FROM {} ORDER BY idx", table.table_name());
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn write_dim_labels(&self, dim: &str, names: &[String]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT OR REPLACE INTO dim_labels (dim, idx, name) VALUES (?1, ?2, ?3)")?;
        for (idx, name) in names.iter().enumerate() {
            stmt.execute(params![dim, idx as i64, name])?;
        }
        Ok(())
    }

    pub fn read_dim_labels(&self, dim: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM dim_labels WHERE dim = ?1 ORDER BY idx")?;
        let names = stmt
            .query_map(params![dim], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    pub fn write_agents(&self, agents: &[StoredAgent]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO agent (idx, name, agent_type, sector, region) VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for (idx, agent) in agents.iter().enumerate() {
            stmt.execute(params![idx as i64, agent.name, agent.agent_type, agent.sector, agent.region])?;
        }
        Ok(())
    }

    pub fn read_agents(&self) -> Result<Vec<StoredAgent>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, agent_type, sector, region FROM agent ORDER BY idx")?;
        let agents = stmt
            .query_map([], |row| {
                Ok(StoredAgent {
                    name: row.get(0)?,
                    agent_type: row.get(1)?,
                    sector: row.get(2)?,
                    region: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(agents)
    }

    // ========================================================================
    // GROUPS
    // ========================================================================

    /// Group names, in alphabetical order
    pub fn groups(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT group_name FROM variables ORDER BY group_name")?;
        let groups = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(groups)
    }

    pub fn has_group(&self, group: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM variables WHERE group_name = ?1",
            params![group],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn write_variable(&self, group: &str, name: &str, role: &str, variable: &Variable) -> Result<()> {
        let shape: Vec<String> = variable.shape().iter().map(|n| n.to_string()).collect();
        self.conn.execute(
            "INSERT INTO variables (group_name, name, role, dims, shape, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                group,
                name,
                role,
                variable.dims().join(","),
                shape.join(","),
                encode_values(variable.values())
            ],
        )?;
        Ok(())
    }

    /// Variables of one group and role, by name
    pub fn read_variables(&self, group: &str, role: &str) -> Result<BTreeMap<String, Variable>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, dims, shape, data FROM variables
             WHERE group_name = ?1 AND role = ?2 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![group, role], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut variables = BTreeMap::new();
        for (name, dims, shape, data) in rows {
            let dims: Vec<String> = split_list(&dims).map(String::from).collect();
            let shape = split_list(&shape)
                .map(|n| {
                    n.parse::<usize>()
                        .map_err(|_| PostprocError::CorruptStore(format!("bad shape for {}.{}", group, name)))
                })
                .collect::<Result<Vec<_>>>()?;
            let values = decode_values(&data)
                .ok_or_else(|| PostprocError::CorruptStore(format!("bad data for {}.{}", group, name)))?;
            variables.insert(name, Variable::new(dims, shape, values)?);
        }
        debug!(group, role, count = variables.len(), "Read variables");
        Ok(variables)
    }

    pub fn write_coord(&self, group: &str, dim: &str, labels: &[i64]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO coords (group_name, dim, position, label) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, label) in labels.iter().enumerate() {
            stmt.execute(params![group, dim, position as i64, label])?;
        }
        Ok(())
    }

    /// Coordinates of a group: dim → label indices in position order
    pub fn read_coords(&self, group: &str) -> Result<BTreeMap<String, Vec<i64>>> {
        let mut stmt = self.conn.prepare(
            "SELECT dim, label FROM coords WHERE group_name = ?1 ORDER BY dim, position",
        )?;
        let rows = stmt
            .query_map(params![group], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut coords: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for (dim, label) in rows {
            coords.entry(dim).or_default().push(label);
        }
        Ok(coords)
    }

    /// Run a batch of writes in one SQLite transaction. An error from `f`
    /// drops the transaction, which rolls it back, and is returned as is.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        // `&mut self` rules out nesting; the closure still sees a shared `Store`
        let tx = self.conn.unchecked_transaction()?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').filter(|p| !p.is_empty())
}

fn encode_values(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_values(bytes: &[u8]) -> Option<Vec<f64>> {
    if bytes.len() % 8 != 0 {
        return None;
    }
    bytes
        .chunks_exact(8)
        .map(|chunk| chunk.try_into().ok().map(f64::from_le_bytes))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================
