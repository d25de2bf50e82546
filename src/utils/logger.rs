//! Logging setup for the storage engine.
//!
//! A single rolling log file per database, named after the backing file's
//! stem, configured through `log4rs`. Call sites elsewhere in the crate use
//! the plain `log` macros; this module only wires up the sink.

use std::fs;
use std::path::{Path, PathBuf};

/// Initializes the logging system from a `log4rs.yaml` file in the working directory.
/// Prefer `init_for_db_in` for programmatic, per-database control.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Initializes logging to `{base_dir}/{db_name}_logs/{db_name}.log`, rolling at 10 MiB
/// with 7 retained generations.
///
/// # Errors
/// Returns an error if the directory cannot be created or the logger fails to initialize.
pub fn init_for_db_in(base_dir: &Path, db_name: &str) -> Result<(), Box<dyn std::error::Error>> {
    use log::LevelFilter;
    use log4rs::append::rolling_file::RollingFileAppender;
    use log4rs::append::rolling_file::policy::compound::{
        CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
    };
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let mut dir = PathBuf::from(base_dir);
    dir.push(format!("{db_name}_logs"));
    fs::create_dir_all(&dir)?;

    let app_log = dir.join(format!("{db_name}.log"));
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{db_name}.{{}}.log")).display()), 7)?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(10 * 1024 * 1024)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}",
        )))
        .build(app_log, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("app", Box::new(appender)))
        .build(Root::builder().appender("app").build(LevelFilter::Info))?;
    let _ = log4rs::init_config(config);
    Ok(())
}

/// Configure logging from environment variables, if present:
/// - `VAULTCORE_LOG_DIR`
/// - `VAULTCORE_LOG_LEVEL`
pub fn configure_from_env() {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let Some(dir) = std::env::var("VAULTCORE_LOG_DIR").ok().map(PathBuf::from) else {
        return;
    };
    let level = std::env::var("VAULTCORE_LOG_LEVEL").unwrap_or_default();
    let lvl = match level.to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if init_for_db_in(&dir, "vaultcore").is_err() {
        // fall back to console logging rather than leave the process silent
        let appender = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("[{l}] {t} - {m}{n}")))
            .build();
        if let Ok(config) = Config::builder()
            .appender(Appender::builder().build("console", Box::new(appender)))
            .build(Root::builder().appender("console").build(lvl))
        {
            let _ = log4rs::init_config(config);
        }
    }
}
