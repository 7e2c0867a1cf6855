use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static LOG_ONCE: Once = Once::new();
static LOG_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn env_level() -> LevelFilter {
    parse_level(
        std::env::var("MBT_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .as_deref(),
    )
    .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

/// Install the stderr logger, filtered by `MBT_LOG`, then `RUST_LOG`, then `info`.
///
/// Only the first call does anything. Hosts that bring their own `log`
/// implementation simply never call this.
pub fn init_logging() {
    let level = *LOG_LEVEL.get_or_init(env_level);
    LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_to_str(level));
        // Another logger may already be installed by the host.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
    });
}

/// Level chosen by [`init_logging`], or the environment default if it has not run.
pub fn log_level() -> LevelFilter {
    LOG_LEVEL.get().copied().unwrap_or_else(env_level)
}
