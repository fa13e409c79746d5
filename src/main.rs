// Acclimate Postprocessing - CLI
// Load an output store, resolve / select agents, aggregate, and export.

use acclimate_postproc::aggregation::AggregateDim;
use acclimate_postproc::analysis;
use acclimate_postproc::ensemble;
use acclimate_postproc::export::{export_frame, write_agents_csv};
use acclimate_postproc::logging;
use acclimate_postproc::{
    write_dataset, AgentDataset, AgentType, Criterion, GroupSpec, Loader, PostprocConfig, Reduction,
    Selection, TIME,
};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "acclimate-postproc", version, about = "Agent-indexed postprocessing of Acclimate output")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true, env = "ACCLIMATE_POSTPROC_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct InputArgs {
    /// Output store
    path: PathBuf,

    /// Output group to load (repeatable, defaults to the configured groups)
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Baseline date, YYYY-MM-DD
    #[arg(long)]
    reference_date: Option<NaiveDate>,
}

#[derive(Args, Debug, Clone, Default)]
struct AgentArgs {
    #[arg(long)]
    sector: Vec<String>,

    /// Region code or configured region group
    #[arg(long)]
    region: Vec<String>,

    #[arg(long)]
    agent_type: Vec<AgentType>,

    /// Explicit agent names, "<sector>:<region>"
    #[arg(long)]
    agent: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Groups, time range, agents and variables of a store
    Summary {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Agents matching the criteria
    Resolve {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        agents: AgentArgs,
    },
    /// Select agents and a time window, then export or store the result
    Select {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        agents: AgentArgs,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Variable to keep (repeatable)
        #[arg(long)]
        variable: Vec<String>,
        /// CSV directory
        #[arg(long)]
        out: Option<PathBuf>,
        /// Store to write the selection to
        #[arg(long)]
        store: Option<PathBuf>,
    },
    /// Add an aggregate agent for a region or sector group
    Aggregate {
        #[command(flatten)]
        input: InputArgs,
        /// region | sector
        #[arg(long)]
        dim: AggregateDim,
        /// Group name; members come from the config unless given
        #[arg(long)]
        name: String,
        #[arg(long)]
        member: Vec<String>,
        #[arg(long)]
        reduction: Option<Reduction>,
        /// Replace the constituents instead of adding alongside them
        #[arg(long)]
        drop: bool,
        /// Store to write the result to
        #[arg(long)]
        store: PathBuf,
    },
    /// Series of one variable divided by its baseline
    BaselineRelative {
        #[command(flatten)]
        input: InputArgs,
        variable: String,
        #[arg(long)]
        agent: String,
    },
    /// Every variable as long-format CSV
    Export {
        #[command(flatten)]
        input: InputArgs,
        #[arg(long)]
        out: PathBuf,
        /// Divide by the baseline first
        #[arg(long)]
        relative: bool,
    },
    /// Empirical elasticities of *_quantity / *_value pairs against the baseline
    Elasticities {
        #[command(flatten)]
        input: InputArgs,
        /// CSV directory
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = analysis::DEFAULT_TOLERANCE)]
        tolerance: f64,
        /// Smooth the result with a trailing mean over this many timesteps
        #[arg(long)]
        window: Option<usize>,
    },
    /// Combine an ensemble of stores along model / ssp / timeperiod
    Ensemble {
        basedir: PathBuf,
        #[arg(long = "model")]
        models: Vec<String>,
        #[arg(long = "group")]
        groups: Vec<String>,
        #[arg(long)]
        store: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PostprocConfig::load_from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PostprocConfig::default(),
    };
    let level = cli.log_level.clone().unwrap_or_else(|| config.log.level.clone());
    logging::init_tracing(&level, cli.json_logs || config.log.json);

    match cli.command {
        Command::Summary { input } => run_summary(&input, &config),
        Command::Resolve { input, agents } => run_resolve(&input, &agents, &config),
        Command::Select {
            input,
            agents,
            from,
            to,
            variable,
            out,
            store,
        } => run_select(&input, &agents, (from, to), &variable, out.as_deref(), store.as_deref(), &config),
        Command::Aggregate {
            input,
            dim,
            name,
            member,
            reduction,
            drop,
            store,
        } => {
            let spec = group_spec(dim, &name, member, reduction, drop, &config)?;
            run_aggregate(&input, &spec, &store, &config)
        }
        Command::BaselineRelative { input, variable, agent } => run_baseline_relative(&input, &variable, &agent, &config),
        Command::Export { input, out, relative } => run_export(&input, &out, relative, &config),
        Command::Elasticities {
            input,
            out,
            tolerance,
            window,
        } => run_elasticities(&input, &out, tolerance, window, &config),
        Command::Ensemble {
            basedir,
            models,
            groups,
            store,
        } => run_ensemble(&basedir, &models, &groups, &store, &config),
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn load(input: &InputArgs, config: &PostprocConfig) -> Result<AgentDataset> {
    let groups = if input.groups.is_empty() { config.groups.as_slice() } else { input.groups.as_slice() };
    let loader = Loader::open(&input.path)
        .with_context(|| format!("opening {}", input.path.display()))?
        .with_region_groups(config.region_groups());
    let (dataset, report) = loader.load_dataset(groups, input.reference_date.or(config.reference_date))?;
    if report.is_empty() {
        bail!("none of the groups {:?} found in {}", groups, input.path.display());
    }
    info!(loaded = ?report.loaded_groups, skipped = ?report.skipped_groups, "Loaded store");
    Ok(dataset)
}

fn criterion<T>(mut values: Vec<T>) -> Criterion<T> {
    match values.len() {
        0 => Criterion::Any,
        1 => Criterion::One(values.remove(0)),
        _ => Criterion::Many(values),
    }
}

fn agent_selection(args: &AgentArgs) -> Selection {
    let mut selection = Selection::new()
        .agent_sector(criterion(args.sector.clone()))
        .agent_region(criterion(args.region.clone()))
        .agent_type(criterion(args.agent_type.clone()));
    if !args.agent.is_empty() {
        selection = selection.agents(args.agent.iter());
    }
    selection
}

fn group_spec(
    dim: AggregateDim,
    name: &str,
    members: Vec<String>,
    reduction: Option<Reduction>,
    drop: bool,
    config: &PostprocConfig,
) -> Result<GroupSpec> {
    let spec = if members.is_empty() {
        config
            .group_spec(dim, name)
            .with_context(|| format!("no {} group named {:?} in the config", dim, name))?
    } else {
        GroupSpec::new(dim, members, name).reduce_with(config.reduction)
    };
    let how = reduction.unwrap_or(spec.how);
    Ok(spec.reduce_with(how).drop_originals(drop || config.drop_originals))
}

fn print_summary(dataset: &AgentDataset) {
    let data = dataset.data();
    println!("📊 Dataset");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for dim in data.dims() {
        println!("  {:<12} {}", dim, data.len_of(dim));
    }
    if let Some(times) = data.coord(TIME) {
        if let (Some(first), Some(last)) = (times.first(), times.last()) {
            println!("  time range   {} .. {}", first, last);
        }
    }
    match dataset.reference_date() {
        Some(date) => println!("  baseline     {}", date),
        None if dataset.baseline().is_some() => println!("  baseline     stored"),
        None => println!("  baseline     none"),
    }
    println!("  variables:");
    for name in data.variable_names() {
        println!("    {}", name);
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn run_summary(input: &InputArgs, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    print_summary(&dataset);
    let registry = dataset.registry();
    println!(
        "  registry     {} agents, {} regions, {} sectors",
        registry.agent_count(),
        registry.regions().len(),
        registry.sectors().len()
    );
    Ok(())
}

fn run_resolve(input: &InputArgs, agents: &AgentArgs, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    let resolution = dataset.resolve_agents(&agent_selection(agents))?;
    if resolution.is_contradictory() {
        warn!(conflict = ?resolution.conflict, "Selection is contradictory");
    }
    for name in &resolution.agents {
        println!("{}", name);
    }
    println!("✓ {} agents", resolution.agents.len());
    Ok(())
}

fn run_select(
    input: &InputArgs,
    agents: &AgentArgs,
    window: (Option<NaiveDate>, Option<NaiveDate>),
    variables: &[String],
    out: Option<&Path>,
    store: Option<&Path>,
    config: &PostprocConfig,
) -> Result<()> {
    let mut dataset = load(input, config)?;
    if !variables.is_empty() {
        dataset = dataset.select_variables(variables)?;
    }

    let mut selection = agent_selection(agents);
    selection = match window {
        (Some(from), Some(to)) => selection.time_range(from, to),
        (Some(from), None) => selection.time_range(from, NaiveDate::MAX),
        (None, Some(to)) => selection.time_range(NaiveDate::MIN, to),
        (None, None) => selection,
    };
    let selected = dataset.select(&selection)?;
    print_summary(&selected);

    if let Some(dir) = out {
        let written = export_frame(&selected, dir)?;
        println!("✓ Wrote {} CSV files to {}", written.len(), dir.display());
    }
    if let Some(path) = store {
        write_dataset(path, &selected)?;
        println!("✓ Stored selection in {}", path.display());
    }
    Ok(())
}

fn run_aggregate(input: &InputArgs, spec: &GroupSpec, store: &Path, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    let before = dataset.agents().len();
    let aggregated = dataset.group_agents(spec)?;
    println!(
        "✓ {} group {:?}: {} → {} agents",
        spec.dim,
        spec.name,
        before,
        aggregated.agents().len()
    );
    write_dataset(store, &aggregated)?;
    println!("✓ Stored result in {}", store.display());
    Ok(())
}

fn run_baseline_relative(input: &InputArgs, variable: &str, agent: &str, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    let relative = dataset.baseline_relative()?;
    for (time, value) in relative.agent_series(variable, agent)? {
        println!("{}\t{}", time, value);
    }
    Ok(())
}

fn run_export(input: &InputArgs, out: &Path, relative: bool, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    let dataset = if relative { dataset.baseline_relative()? } else { dataset };
    let written = export_frame(&dataset, out)?;
    let agents = write_agents_csv(dataset.registry(), &out.join("agents.csv"))?;
    println!("✓ Wrote {} variables and {} agents to {}", written.len(), agents, out.display());
    Ok(())
}

fn run_elasticities(input: &InputArgs, out: &Path, tolerance: f64, window: Option<usize>, config: &PostprocConfig) -> Result<()> {
    let dataset = load(input, config)?;
    let elasticities = analysis::baseline_elasticities(&dataset, tolerance)?;
    let elasticities = match window {
        Some(window) => analysis::rolling(&elasticities, window, Reduction::Mean)?,
        None => elasticities,
    };
    if elasticities.is_empty() {
        bail!("no *_quantity / *_value variable pairs in the loaded groups");
    }
    let written = export_frame(&elasticities, out)?;
    println!("✓ Wrote {} elasticity variables to {}", written.len(), out.display());
    Ok(())
}

fn run_ensemble(basedir: &Path, models: &[String], groups: &[String], store: &Path, config: &PostprocConfig) -> Result<()> {
    let index = ensemble::discover(basedir, models)?;
    if index.is_empty() {
        bail!("no ensemble members under {}", basedir.display());
    }
    for (key, path) in index.members() {
        println!("  {} {} {}  {}", key.model, key.ssp, key.timeperiod, path.display());
    }
    let groups = if groups.is_empty() { config.groups.as_slice() } else { groups };
    let combined = ensemble::combine(&index, groups, &config.region_groups())?;
    print_summary(&combined);
    write_dataset(store, &combined)?;
    println!("✓ Stored ensemble in {}", store.display());
    Ok(())
}
