/// Logging initialization: tracing-subscriber::fmt → stderr, env-filterable.
///
/// Called once at the start of `App::new()`, before anything else. Safe to
/// call again (e.g. several `App`s in one test binary); later calls no-op.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "naier_core=debug,info".into()),
        )
        .try_init();
}
