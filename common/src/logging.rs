use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` (default `info`). Setting `LOG_FORMAT=json`
/// switches to one JSON object per event.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    // try_init so tests and embedding binaries can call this more than once
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
