use tracing_subscriber::EnvFilter;

pub fn tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
