use std::{
    env,
    fmt::Debug,
    str::FromStr,
    sync::Once,
};

use tracing_subscriber::{
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Read a knob from the environment. An unset variable yields `default`
/// silently; a set-but-unparseable one (bad unicode included) yields
/// `default` with a warning, so a typo never takes the process down.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T {
    let Some(raw) = env::var_os(name) else {
        return default;
    };
    match raw.to_str().and_then(|s| s.parse::<T>().ok()) {
        Some(value) => {
            tracing::info!("knob {name} = {value:?} (environment override)");
            value
        },
        None => {
            tracing::warn!("knob {name} has an unusable value; keeping the default {default:?}");
            default
        },
    }
}

static INIT_TRACING: Once = Once::new();

/// Install the process-wide tracing subscriber. Safe to call more than once
/// (tests call it from every entry point).
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    });
}
