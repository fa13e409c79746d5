// Acclimate Postprocessing - Core Library
// Agent-indexed datasets over Acclimate output: loading, agent resolution,
// selection, baseline tracking and aggregation. Used by the CLI, the API
// server and tests.

pub mod frame;          // Labelled n-dimensional arrays
pub mod entities;       // Agents, code tables, region groups
pub mod resolver;       // Agent criteria → agent set
pub mod selection;      // Axis + agent selection
pub mod dataset;        // AgentDataset with baseline tracking
pub mod aggregation;    // Region / sector groups as new agents
pub mod store;          // SQLite output store
pub mod loader;         // Store → AgentDataset
pub mod analysis;
pub mod export;
pub mod ensemble;
pub mod config;
pub mod logging;
pub mod error;

// Re-export commonly used types
pub use frame::{Frame, Label, Reduction, Variable, AGENT, REGION, SECTOR, TIME};
pub use entities::{AgentInfo, AgentType, CodeTable, CoordinateRegistry, RegionGroups};
pub use resolver::{resolve, AgentQuery, ContradictorySelection, Criterion, Resolution};
pub use selection::{Selection, TimeSelector};
pub use dataset::{AgentDataset, DatasetView};
pub use aggregation::{AggregateDim, GroupSpec};
pub use store::Store;
pub use loader::{write_dataset, LoadReport, Loader};
pub use ensemble::{EnsembleIndex, EnsembleKey};
pub use config::PostprocConfig;
pub use error::{PostprocError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
