use std::fs::OpenOptions;
use std::str::FromStr;

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};

use crate::config::Config;

/// Parse a level name, falling back to `info` for anything unrecognised.
pub fn level_filter(level: &str) -> LevelFilter {
    LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info)
}

/// Install the global logger: stderr always, plus the configured log file
/// when it can be opened.
///
/// Returns `false` if a logger was already installed. Problems opening the
/// file are reported on stderr and logging continues on the terminal only.
pub fn init(config: &Config) -> bool {
    let level = level_filter(&config.logging.level);
    let log_config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_thread_level(LevelFilter::Off)
        .add_filter_allow_str("cmdgate")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];

    if let Some(path) = config.log_file() {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            let _ = std::fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => loggers.push(WriteLogger::new(level, log_config, file)),
            Err(e) => eprintln!("cmdgate: cannot open log file {}: {e}", path.display()),
        }
    }

    CombinedLogger::init(loggers).is_ok()
}
