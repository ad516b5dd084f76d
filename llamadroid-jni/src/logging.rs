use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Install the log sink once per process.
///
/// On Android events reach logcat through tracing's `log` feature; elsewhere
/// they go to stderr, filtered by `RUST_LOG` (default `warn`).
pub(crate) fn init_logging() {
    INIT_LOGGING.call_once(|| {
        #[cfg(target_os = "android")]
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(log::LevelFilter::Info)
                .with_tag("llama-android.rs"),
        );

        #[cfg(not(target_os = "android"))]
        {
            // A host process may already own the global subscriber
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_writer(std::io::stderr)
                .try_init();
        }

        llamadroid_engine::backend::llamacpp::route_logs_to_tracing();
    });
}
