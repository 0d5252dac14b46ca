use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{fmt, fmt::time::UtcTime, EnvFilter};

/// Installs a global `fmt` subscriber for a host application.
///
/// The filter comes from `RUST_LOG` when set, else from `default_directive`
/// (for example `"info"` or `"retrobus=debug"`). Fails if a subscriber is
/// already installed.
pub fn init_logging(default_directive: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directive))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(UtcTime::new(Rfc3339))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::debug!("Logging initialised ({})", default_directive);
    Ok(())
}
