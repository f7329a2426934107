use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_tracing(filter: &str, json: bool) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

/// Reports limits lowered while the configuration was read. Runs after
/// [`init_tracing`] since the configuration is built before a subscriber exists.
pub fn log_clamp_notices(config: &Config) {
    for notice in &config.clamp_notices {
        tracing::warn!(
            setting = notice.setting,
            requested = notice.requested,
            ceiling = notice.ceiling,
            "{notice}"
        );
    }
}

pub fn log_startup(config: &Config, fts_available: bool) {
    tracing::info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        limit = config.runtime_limit,
        build_limit = crate::config::BUILD_LIMIT,
        max_file_bytes = config.max_file_bytes,
        max_text_bytes = config.max_text_bytes,
        no_auth = config.no_auth,
        trust_proxy = config.trust_proxy,
        allow_localhost = config.allow_localhost,
        base_path = %config.base_path,
        fts = fts_available,
        "karing listening"
    );
}
