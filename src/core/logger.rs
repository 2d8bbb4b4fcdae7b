use env_logger::Env;

/// Initialize logging once at startup. `RUST_LOG` takes full control when
/// set; otherwise everything defaults to info.
pub fn setup_logging() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}
