// Acclimate Postprocessing - Web Server
// Read-only REST API over one loaded output store

use acclimate_postproc::logging;
use acclimate_postproc::{
    AgentDataset, AgentType, Criterion, Label, Loader, PostprocConfig, PostprocError, Selection, TIME,
};
use anyhow::{bail, Context};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "postproc-server", version, about = "Read-only API over an Acclimate output store")]
struct ServerArgs {
    /// Output store to serve
    store: PathBuf,

    #[arg(long, env = "ACCLIMATE_POSTPROC_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long = "group")]
    groups: Vec<String>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    addr: String,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    dataset: Arc<AgentDataset>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

fn error_response(err: PostprocError) -> Response {
    let status = match &err {
        PostprocError::UnknownVariable(_) | PostprocError::UnknownDimension(_) | PostprocError::MissingLabel { .. } => {
            StatusCode::NOT_FOUND
        }
        PostprocError::MalformedAgentName(_) | PostprocError::UnknownAgentType(_) => StatusCode::BAD_REQUEST,
        PostprocError::MissingBaseline => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %err, "Request failed");
    }
    let body = ApiResponse {
        success: false,
        data: (),
        error: Some(err.to_string()),
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Serialize)]
struct SummaryResponse {
    dims: Vec<DimStat>,
    variables: Vec<String>,
    time_start: Option<String>,
    time_end: Option<String>,
    reference_date: Option<String>,
    has_baseline: bool,
}

#[derive(Serialize)]
struct DimStat {
    dim: String,
    len: usize,
}

#[derive(Serialize)]
struct AgentResponse {
    agent: String,
    sector: String,
    region: String,
    agent_type: AgentType,
}

#[derive(Serialize)]
struct AgentsResponse {
    agents: Vec<AgentResponse>,
    contradictory: bool,
}

#[derive(Serialize)]
struct SeriesPoint {
    time: String,
    value: Option<f64>,
}

#[derive(Deserialize)]
struct AgentFilter {
    sector: Option<String>,
    region: Option<String>,
    agent_type: Option<String>,
}

#[derive(Deserialize)]
struct SeriesQuery {
    agent: String,
}

/// Comma-separated query value as a criterion
fn parse_list<T: FromStr>(value: Option<&str>) -> std::result::Result<Criterion<T>, T::Err> {
    let Some(value) = value.filter(|v| !v.is_empty()) else {
        return Ok(Criterion::Any);
    };
    let mut items = value
        .split(',')
        .map(|v| v.trim().parse::<T>())
        .collect::<std::result::Result<Vec<T>, _>>()?;
    Ok(if items.len() == 1 {
        Criterion::One(items.remove(0))
    } else {
        Criterion::Many(items)
    })
}

fn series_points(series: Vec<(Label, f64)>) -> Vec<SeriesPoint> {
    series
        .into_iter()
        .map(|(time, value)| SeriesPoint {
            time: time.to_string(),
            value: if value.is_nan() { None } else { Some(value) },
        })
        .collect()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/summary - Dimensions, variables and time range
async fn get_summary(State(state): State<AppState>) -> impl IntoResponse {
    let dataset = &state.dataset;
    let data = dataset.data();
    let times = data.coord(TIME).unwrap_or(&[]);

    let summary = SummaryResponse {
        dims: data
            .dims()
            .into_iter()
            .map(|dim| DimStat {
                dim: dim.to_string(),
                len: data.len_of(dim),
            })
            .collect(),
        variables: data.variable_names().into_iter().map(String::from).collect(),
        time_start: times.first().map(|t| t.to_string()),
        time_end: times.last().map(|t| t.to_string()),
        reference_date: dataset.reference_date().map(|d| d.to_string()),
        has_baseline: dataset.baseline().is_some(),
    };
    Json(ApiResponse::ok(summary))
}

/// GET /api/agents?sector=&region=&agent_type= - Resolve agents
async fn get_agents(State(state): State<AppState>, Query(filter): Query<AgentFilter>) -> Response {
    let agent_type = match parse_list::<AgentType>(filter.agent_type.as_deref()) {
        Ok(criterion) => criterion,
        Err(e) => return error_response(e),
    };
    let selection = Selection::new()
        .agent_sector(parse_list::<String>(filter.sector.as_deref()).unwrap_or_default())
        .agent_region(parse_list::<String>(filter.region.as_deref()).unwrap_or_default())
        .agent_type(agent_type);

    let resolution = match state.dataset.resolve_agents(&selection) {
        Ok(resolution) => resolution,
        Err(e) => return error_response(e),
    };
    let registry = state.dataset.registry();
    let agents = resolution
        .agents
        .iter()
        .filter_map(|name| {
            registry.agent(name).map(|info| AgentResponse {
                agent: name.clone(),
                sector: info.sector.clone(),
                region: info.region.clone(),
                agent_type: info.agent_type,
            })
        })
        .collect();

    let response = AgentsResponse {
        agents,
        contradictory: resolution.is_contradictory(),
    };
    (StatusCode::OK, Json(ApiResponse::ok(response))).into_response()
}

/// GET /api/series/:variable?agent= - One agent's series
async fn get_series(
    State(state): State<AppState>,
    Path(variable): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    match state.dataset.agent_series(&variable, &query.agent) {
        Ok(series) => (StatusCode::OK, Json(ApiResponse::ok(series_points(series)))).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/baseline-relative/:variable?agent= - Series divided by its baseline
async fn get_baseline_relative(
    State(state): State<AppState>,
    Path(variable): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> Response {
    let series = state
        .dataset
        .select_variables(&[variable.as_str()])
        .and_then(|dataset| dataset.baseline_relative())
        .and_then(|relative| relative.agent_series(&variable, &query.agent));
    match series {
        Ok(series) => (StatusCode::OK, Json(ApiResponse::ok(series_points(series)))).into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let config = match &args.config {
        Some(path) => PostprocConfig::load_from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => PostprocConfig::default(),
    };
    logging::init_from_config(&config.log);

    if !args.store.exists() {
        bail!("store not found at {}", args.store.display());
    }

    let groups = if args.groups.is_empty() { config.groups.as_slice() } else { args.groups.as_slice() };
    let loader = Loader::open(&args.store)?.with_region_groups(config.region_groups());
    let (dataset, report) = loader.load_dataset(groups, config.reference_date)?;
    if report.is_empty() {
        bail!("none of the groups {:?} found in {}", groups, args.store.display());
    }
    info!(store = %args.store.display(), loaded = ?report.loaded_groups, agents = dataset.agents().len(), "Store loaded");

    // Create shared state
    let state = AppState {
        dataset: Arc::new(dataset),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/summary", get(get_summary))
        .route("/agents", get(get_agents))
        .route("/series/:variable", get(get_series))
        .route("/baseline-relative/:variable", get(get_baseline_relative))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("binding {}", args.addr))?;
    info!(addr = %args.addr, "Server running");

    axum::serve(listener, app).await?;
    Ok(())
}
