//! Node bridge.
//!
//! Each call runs on its own current-thread runtime. Logging goes to stderr,
//! filtered by `CONVERT_LOG` (default `warn`).

use crate::config::ConvertConfig;
use crate::job::ConversionJob;
use crate::load_order::LoadOrderEntry;
use crate::scope::{analyze_source, AnalyzeOptions};
use crate::versions::PackageSpec;
use napi_derive::napi;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env("CONVERT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn to_napi(err: crate::error::ConvertError) -> napi::Error {
    napi::Error::from_reason(format!("[{}] {}", err.code(), err.chain_report()))
}

fn runtime() -> napi::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| napi::Error::from_reason(e.to_string()))
}

fn parse_config(config: serde_json::Value) -> napi::Result<ConvertConfig> {
    serde_json::from_value(config).map_err(|e| napi::Error::from_reason(format!("invalid config: {}", e)))
}

/// Convert packages and their dependency closure. Returns the conversion
/// summary and the load order on each requested architecture.
#[napi]
pub fn convert_packages_native(
    config: serde_json::Value,
    names: Vec<String>,
    versioned_names: Vec<String>,
    archs: Option<Vec<String>>,
) -> napi::Result<serde_json::Value> {
    init_logging();
    let config = parse_config(config)?;
    let rt = runtime()?;
    let job = ConversionJob::new(config);
    let summary = rt
        .block_on(job.convert_packages(&names, &versioned_names))
        .map_err(to_napi)?;

    let roots: Vec<String> = names
        .iter()
        .cloned()
        .chain(versioned_names.iter().map(|raw| {
            PackageSpec::parse(raw).map(|spec| spec.name).unwrap_or_else(|_| raw.clone())
        }))
        .collect();
    let mut orders = serde_json::Map::new();
    for arch in archs.unwrap_or_default() {
        let order: Vec<LoadOrderEntry> = job.load_order(&arch, &roots);
        let value = serde_json::to_value(order).map_err(|e| napi::Error::from_reason(e.to_string()))?;
        orders.insert(arch, value);
    }

    Ok(serde_json::json!({
        "loaded": summary.loaded,
        "written": summary.written,
        "loadOrder": orders,
    }))
}

/// Free identifiers of one file with their read/write usage.
#[napi]
pub fn analyze_globals_native(
    source: String,
    file_path: String,
    legacy_module: Option<bool>,
) -> napi::Result<serde_json::Value> {
    init_logging();
    let options = AnalyzeOptions {
        legacy_module: legacy_module.unwrap_or(false),
    };
    let analysis = analyze_source(&source, &file_path, options).map_err(to_napi)?;
    serde_json::to_value(analysis.free).map_err(|e| napi::Error::from_reason(e.to_string()))
}

/// Load order from the dependency records of one architecture.
#[napi]
pub fn load_order_native(
    records: serde_json::Value,
    roots: Vec<String>,
) -> napi::Result<serde_json::Value> {
    let records: Vec<crate::load_order::DependencyRecord> = serde_json::from_value(records)
        .map_err(|e| napi::Error::from_reason(format!("invalid dependency records: {}", e)))?;
    let order = crate::load_order::build_load_order(&records, &roots);
    serde_json::to_value(order).map_err(|e| napi::Error::from_reason(e.to_string()))
}
