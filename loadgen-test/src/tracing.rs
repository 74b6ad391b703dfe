use tracing_subscriber::EnvFilter;

/// Library targets of this workspace whose logs tests capture.
const CRATE_NAMES: &[&str] = &["loadgen_cli", "loadgen_scheduler", "loadgen_test"];

/// Initialize the logger for testing.
///
/// This logs to the stdout registered by the Rust test runner. Only errors are captured from
/// dependencies, while the workspace crates log everything.
///
/// # Example
///
/// ```
/// loadgen_test::tracing::init();
/// ```
pub fn init() {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

fn env_filter() -> EnvFilter {
    CRATE_NAMES
        .iter()
        .filter_map(|name| format!("{name}=TRACE").parse().ok())
        .fold(EnvFilter::new("ERROR"), EnvFilter::add_directive)
}
