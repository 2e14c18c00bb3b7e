use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::core::{
    AggregationPolicy, Bucket, BucketSet, ReturnFactorTable, SeedPolicy, SimulationConfig,
    run_study,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliSeedPolicy {
    Unit,
    LowestCost,
}

impl From<CliSeedPolicy> for SeedPolicy {
    fn from(value: CliSeedPolicy) -> Self {
        match value {
            CliSeedPolicy::Unit => SeedPolicy::Unit,
            CliSeedPolicy::LowestCost => SeedPolicy::LowestCost,
        }
    }
}

impl From<SeedPolicy> for CliSeedPolicy {
    fn from(value: SeedPolicy) -> Self {
        match value {
            SeedPolicy::Unit => CliSeedPolicy::Unit,
            SeedPolicy::LowestCost => CliSeedPolicy::LowestCost,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    factor_columns: Option<Vec<String>>,
    factor_rows: Option<Vec<Vec<f64>>>,
    months: Option<Vec<u32>>,
    first_month: Option<u32>,
    min_horizon: Option<u32>,
    max_horizon: Option<u32>,
    start_month: Option<u32>,
    end_month: Option<u32>,
    buckets: Option<Vec<String>>,
    blend_step: Option<u8>,
    rounding_precision: Option<u32>,
    seed_policy: Option<SeedPolicy>,
    no_decrease_rule: Option<bool>,
    year_one_offset: Option<f64>,
    no_year_one_offset: Option<bool>,
    unit_horizon_drop: Option<usize>,
    no_unit_horizon_drop: Option<bool>,
    parallel: Option<bool>,
    include_audit: Option<bool>,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "glidepath",
    about = "Lowest-cost glide path study over historical monthly return factors"
)]
pub struct Cli {
    #[arg(long, help = "CSV of annual return factors, one column per bucket label")]
    factors: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    min_horizon: u32,
    #[arg(long, default_value_t = 41)]
    max_horizon: u32,
    #[arg(long, help = "First starting month (inclusive); requires --end-month")]
    start_month: Option<u32>,
    #[arg(long, help = "Last starting month (inclusive); requires --start-month")]
    end_month: Option<u32>,
    #[arg(
        long,
        value_delimiter = ',',
        help = "Restrict the study to these buckets, e.g. 100E,60E,100F"
    )]
    buckets: Vec<String>,
    #[arg(
        long,
        help = "Derive blended buckets from the 100E and 100F columns in steps of this percentage"
    )]
    blend_step: Option<u8>,
    #[arg(long, default_value_t = 1)]
    rounding_precision: u32,
    #[arg(long, value_enum, default_value_t = CliSeedPolicy::Unit)]
    seed_policy: CliSeedPolicy,
    #[arg(long, help = "Allow the glide plan to lower equity as the horizon grows")]
    no_ratchet_plan: bool,
    #[arg(long, default_value_t = 1.0, help = "Added to the year-1 total of every horizon")]
    year_one_offset: f64,
    #[arg(long)]
    no_year_one_offset: bool,
    #[arg(
        long,
        default_value_t = 12,
        help = "Latest starting months left out of the horizon-1 summary"
    )]
    unit_horizon_drop: usize,
    #[arg(long)]
    no_unit_horizon_drop: bool,
    #[arg(long, help = "Simulate starting months on one thread")]
    sequential: bool,
    #[arg(long)]
    include_audit: bool,
    #[arg(long, help = "Write the JSON report here instead of stdout")]
    output: Option<PathBuf>,
}

#[derive(Debug)]
struct ApiRequest {
    table: ReturnFactorTable,
    config: SimulationConfig,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn build_config(cli: &Cli) -> Result<SimulationConfig, String> {
    if cli.min_horizon == 0 {
        return Err("--min-horizon must be >= 1".to_string());
    }

    if cli.max_horizon < cli.min_horizon {
        return Err("--max-horizon must be >= --min-horizon".to_string());
    }

    let start_months = match (cli.start_month, cli.end_month) {
        (None, None) => None,
        (Some(start), Some(end)) if start <= end => Some((start, end)),
        (Some(_), Some(_)) => return Err("--end-month must be >= --start-month".to_string()),
        (Some(_), None) => return Err("--start-month requires --end-month".to_string()),
        (None, Some(_)) => return Err("--end-month requires --start-month".to_string()),
    };

    let buckets = if cli.buckets.is_empty() {
        None
    } else {
        let parsed = cli
            .buckets
            .iter()
            .map(|raw| raw.parse::<Bucket>().map_err(|e| format!("--buckets: {e}")))
            .collect::<Result<Vec<_>, _>>()?;
        Some(parsed)
    };

    if let Some(step) = cli.blend_step {
        if step == 0 || 100 % step != 0 {
            return Err("--blend-step must be a divisor of 100".to_string());
        }
    }

    if cli.rounding_precision > 9 {
        return Err("--rounding-precision must be between 0 and 9".to_string());
    }

    if !cli.year_one_offset.is_finite() {
        return Err("--year-one-offset must be a finite number".to_string());
    }

    Ok(SimulationConfig {
        min_horizon: cli.min_horizon,
        max_horizon: cli.max_horizon,
        start_months,
        buckets,
        blend_step_pct: cli.blend_step,
        rounding_precision: cli.rounding_precision,
        seed_policy: cli.seed_policy.into(),
        no_decrease_rule: !cli.no_ratchet_plan,
        aggregation: AggregationPolicy {
            year_one_total_offset: (!cli.no_year_one_offset).then_some(cli.year_one_offset),
            unit_horizon_trailing_drop: (!cli.no_unit_horizon_drop)
                .then_some(cli.unit_horizon_drop),
        },
        parallel: !cli.sequential,
        include_audit: cli.include_audit,
    })
}

/// One-shot run: load the factor CSV, run the study and emit the report.
pub fn run_cli() -> Result<(), String> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let path = cli
        .factors
        .as_ref()
        .ok_or_else(|| "--factors is required".to_string())?;

    let table = ReturnFactorTable::from_csv_path(path)
        .map_err(|e| format!("failed to load {}: {e}", path.display()))?;
    let report = run_study(&table, &config).map_err(|e| e.to_string())?;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("failed to serialize report: {e}"))?;

    match &cli.output {
        Some(out) => {
            std::fs::write(out, json)
                .map_err(|e| format!("failed to write {}: {e}", out.display()))?;
            info!(path = %out.display(), "wrote study report");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn router() -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/simulate", post(simulate_post_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "glidepath HTTP API listening");
    info!("local access: http://127.0.0.1:{port}/api/health");

    axum::serve(listener, router()).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, HealthResponse { status: "ok" })
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let request = match api_request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    let study = move || run_study(&request.table, &request.config);
    let joined = tokio::task::spawn_blocking(study).await;
    match joined {
        Ok(Ok(report)) => json_response(StatusCode::OK, report),
        Ok(Err(e)) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(e) => {
            error!(error = %e, "simulation task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "simulation task failed")
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn api_request_from_json(json: &str) -> Result<ApiRequest, String> {
    let payload = serde_json::from_str::<SimulatePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    api_request_from_payload(payload)
}

fn api_request_from_payload(payload: SimulatePayload) -> Result<ApiRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.min_horizon {
        cli.min_horizon = v;
    }
    if let Some(v) = payload.max_horizon {
        cli.max_horizon = v;
    }
    if payload.start_month.is_some() {
        cli.start_month = payload.start_month;
    }
    if payload.end_month.is_some() {
        cli.end_month = payload.end_month;
    }
    if let Some(v) = payload.buckets {
        cli.buckets = v;
    }
    if payload.blend_step.is_some() {
        cli.blend_step = payload.blend_step;
    }
    if let Some(v) = payload.rounding_precision {
        cli.rounding_precision = v;
    }
    if let Some(v) = payload.seed_policy {
        cli.seed_policy = v.into();
    }
    if let Some(v) = payload.no_decrease_rule {
        cli.no_ratchet_plan = !v;
    }
    if let Some(v) = payload.year_one_offset {
        cli.year_one_offset = v;
    }
    if let Some(v) = payload.no_year_one_offset {
        cli.no_year_one_offset = v;
    }
    if let Some(v) = payload.unit_horizon_drop {
        cli.unit_horizon_drop = v;
    }
    if let Some(v) = payload.no_unit_horizon_drop {
        cli.no_unit_horizon_drop = v;
    }
    if let Some(v) = payload.parallel {
        cli.sequential = !v;
    }
    if let Some(v) = payload.include_audit {
        cli.include_audit = v;
    }

    let config = build_config(&cli).map_err(|e| payload_message(&e))?;

    let columns = payload
        .factor_columns
        .ok_or_else(|| "factorColumns is required".to_string())?;
    let rows = payload
        .factor_rows
        .ok_or_else(|| "factorRows is required".to_string())?;
    let buckets = BucketSet::from_labels(&columns).map_err(|e| e.to_string())?;

    let table = match payload.months {
        Some(months) => {
            if months.len() != rows.len() {
                return Err(format!(
                    "months has {} entries but factorRows has {}",
                    months.len(),
                    rows.len()
                ));
            }
            ReturnFactorTable::from_keyed_rows(buckets, months.into_iter().zip(rows).collect())
        }
        None => ReturnFactorTable::new(buckets, payload.first_month.unwrap_or(0), rows),
    }
    .map_err(|e| e.to_string())?;

    Ok(ApiRequest { table, config })
}

/// Rewrites `--flag-name` tokens of a CLI message as `flag name` for JSON
/// callers. Hyphens anywhere else in the message are kept.
fn payload_message(message: &str) -> String {
    message
        .split(' ')
        .map(|word| match word.strip_prefix("--") {
            Some(flag) => flag.replace('-', " "),
            None => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn default_cli_for_api() -> Cli {
    Cli {
        factors: None,
        min_horizon: 1,
        max_horizon: 41,
        start_month: None,
        end_month: None,
        buckets: Vec::new(),
        blend_step: None,
        rounding_precision: 1,
        seed_policy: CliSeedPolicy::Unit,
        no_ratchet_plan: false,
        year_one_offset: 1.0,
        no_year_one_offset: false,
        unit_horizon_drop: 12,
        no_unit_horizon_drop: false,
        sequential: false,
        include_audit: false,
        output: None,
    }
}
