use crate::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(thiserror::Error, Debug)]
pub enum ObservabilityError {
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("could not install metrics recorder: {0}")]
    Recorder(String),
    #[error("could not install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Keeps the sentry client alive until shutdown so pending events are sent.
pub struct ObservabilityGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Installs the tracing subscriber, with the sentry layer when a DSN is configured.
pub fn init_logging(config: &LoggingConfig) -> Result<ObservabilityGuard, ObservabilityError> {
    let sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let sentry_layer = sentry
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(sentry_layer)
        .try_init()?;

    Ok(ObservabilityGuard { _sentry: sentry })
}

/// Installs the statsd exporter as the global metrics recorder.
pub fn init_metrics(config: &MetricsConfig) -> Result<(), ObservabilityError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))?;
    metrics::set_global_recorder(recorder)
        .map_err(|e| ObservabilityError::Recorder(e.to_string()))?;

    shared::metrics_defs::describe_metrics(batcher::metrics_defs::ALL_METRICS);
    Ok(())
}
