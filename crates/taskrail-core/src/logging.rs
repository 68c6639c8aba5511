use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "taskrail_core=info";

/// Installs a formatting subscriber filtered by `RUST_LOG`. Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
