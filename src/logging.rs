use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Console plus a timestamped file under `log_dir`, e.g.
/// `logs/arch_web-2026-01-31-14_05.log`.
pub fn build_config(
    log_dir: &Path,
    level: &str,
    prefix: &str,
) -> Result<(Config, PathBuf), Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(level).map_err(|_| format!("invalid log level '{level}'"))?;
    std::fs::create_dir_all(log_dir)?;
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    let log_path = log_dir.join(format!("{prefix}-{timestamp}.log"));

    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(&log_path)?;

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .build(
            Root::builder()
                .appender("console")
                .appender("file")
                .build(level),
        )?;

    Ok((config, log_path))
}

pub fn setup_logging(
    log_dir: &str,
    level: &str,
    prefix: &str,
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let (config, log_path) = build_config(Path::new(log_dir), level, prefix)?;
    log4rs::init_config(config)?;
    Ok(log_path)
}
