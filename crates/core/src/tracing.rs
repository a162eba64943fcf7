//! Logging setup for router binaries and tests.

#[cfg(feature = "trace")]
pub mod tracer {
    use anyhow::Context;
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

    /// Installs the global subscriber.
    ///
    /// `RUST_LOG` directives take precedence over `level`. Output is pretty-printed unless
    /// `FABRIC_LOG_FORMAT=json`; `FABRIC_DISABLE_LOGS` skips installation entirely.
    pub fn init_tracer(level: Option<LevelFilter>) -> anyhow::Result<()> {
        if std::env::var("FABRIC_DISABLE_LOGS").is_ok() {
            return Ok(());
        }

        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let use_json = std::env::var("FABRIC_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = if use_json {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .pretty()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed()
        };

        let subscriber = Registry::default().with(fmt_layer.with_filter(filter_layer));
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to install the tracing subscriber")?;
        Ok(())
    }
}
