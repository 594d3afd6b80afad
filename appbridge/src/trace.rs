use anyhow::{Context, Result};
use tracing_subscriber::filter::EnvFilter;

/// Installs the global stderr subscriber.
///
/// `directives` is an env-filter expression chosen by the embedding host,
/// e.g. `"appbridge=debug,throttle=info"`. Records emitted through the `log`
/// facade by dependencies are converted at Info and above.
pub fn init_tracing(directives: &str) -> Result<()> {
    let filter = EnvFilter::try_new(directives)
        .with_context(|| format!("Invalid filter directives: {directives}"))?;

    tracing_log::LogTracer::init_with_filter(tracing_log::log::LevelFilter::Info)?;

    let is_terminal = atty::is(atty::Stream::Stderr);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_target(false);

    if is_terminal {
        builder.init();
    } else {
        builder.without_time().init();
    }

    tracing::debug!(%directives, "Tracing initialized");

    Ok(())
}
