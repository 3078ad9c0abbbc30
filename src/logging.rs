use std::io::Write;

use chrono::Local;
use env_logger::{Builder, DEFAULT_FILTER_ENV, Env};
use log::LevelFilter;

/// Initialises the global logger at `default_level` unless `RUST_LOG` is set.
/// Calling it twice is harmless.
pub fn init(default_level: &str) {
    // Records are filtered through `log::max_level`, so `set_level` can
    // change the level once the config is loaded.
    let result = Builder::from_env(Env::default().default_filter_or("trace"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();

    if result.is_ok() {
        set_level(default_level);
        log::info!("Logging initialized");
    }
}

/// Applies a level from the config. `RUST_LOG` wins when set.
pub fn set_level(level: &str) {
    if std::env::var_os(DEFAULT_FILTER_ENV).is_some() {
        return;
    }
    match parse_level(level) {
        Some(filter) => log::set_max_level(filter),
        None => log::warn!("Unknown log level {:?}, keeping {}", level, log::max_level()),
    }
}

fn parse_level(level: &str) -> Option<LevelFilter> {
    level.trim().parse().ok()
}
