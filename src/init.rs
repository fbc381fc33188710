use crate::manager::Manager;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Subscriber settings used by [`init_tracing_with_config`].
///
/// **Fields**
/// - `max_level`: most verbose level recorded at all; events above it
///   never reach the dispatch layer.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt` layer is
///   stacked next to the dispatch layer so events are also printed to the
///   console, including delivery diagnostics the dispatch layer skips.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub max_level: LevelFilter,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            max_level: LevelFilter::DEBUG,
            enable_stdout: true,
        }
    }
}

/// Install a global `tracing` subscriber that routes every event through
/// the manager's dispatch hook.
///
/// **Effects**
///
/// Installs a [`Registry`] combined with the manager's
/// [`DispatchLayer`](crate::layer::DispatchLayer) as the global default
/// subscriber. Targets added to the manager later are picked up without
/// reinstalling anything.
pub fn init_tracing_with_config(manager: &Manager, config: LayerConfig) -> Result<(), SetGlobalDefaultError> {
    let fmt_layer = config.enable_stdout.then(|| tracing_subscriber::fmt::layer());
    let subscriber = Registry::default()
        .with(config.max_level)
        .with(manager.layer())
        .with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
}

/// Initialize tracing with [`LayerConfig::default`].
pub fn init_tracing(manager: &Manager) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(manager, LayerConfig::default())
}
