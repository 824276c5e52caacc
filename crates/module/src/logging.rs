//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use ilsplice_core::CoreConfig;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level comes from `config.debug`.
/// Safe to call on every module load, later calls are ignored.
pub fn init_logging(config: &CoreConfig) {
    let filter = EnvFilter::builder()
        .with_default_directive(config.log_level().into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
