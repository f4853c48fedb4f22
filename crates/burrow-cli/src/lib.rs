use burrow_core::config::BurrowConfig;

/// Initialize tracing on stderr; stdout is reserved for the marker lines
/// the supervisor parses.
pub fn init_logging(level: u32) {
    let filter = match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve and load the configuration, or exit 1 with a diagnostic.
pub fn load_config(explicit: Option<&str>) -> BurrowConfig {
    let Some(path) = BurrowConfig::resolve_path(explicit) else {
        eprintln!("Error: no configuration file found.");
        eprintln!("Searched: --config, $BURROW_CONFIG, ./burrow.yaml, /etc/burrow/config.yaml");
        std::process::exit(1);
    };
    match BurrowConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
