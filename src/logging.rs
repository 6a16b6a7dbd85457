use std::fs::File;
use std::path::PathBuf;
use std::sync::Once;

pub const LOG_FILE_ENV_VAR: &str = "CHIP8_PACER_LOG_FILE";

/// Logger configuration.
///
/// `env_filter` follows the `env_logger` filter syntax (e.g. "info",
/// "chip8_pacer=debug"). With no filter and no `RUST_LOG`, only warnings and
/// errors are shown: the terminal display owns the screen in raw mode, so
/// anything chattier belongs in `log_file`.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub env_filter: Option<String>,
    pub log_file: Option<PathBuf>,
    pub write_style: env_logger::WriteStyle,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            env_filter: None,
            log_file: None,
            write_style: env_logger::WriteStyle::Auto,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        LoggingConfig {
            log_file: std::env::var_os(LOG_FILE_ENV_VAR).map(PathBuf::from),
            ..LoggingConfig::default()
        }
    }
}

static INIT: Once = Once::new();

/// Initializes the global logger once; later calls are ignored.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();

        if let Some(filter) = &config.env_filter {
            builder.parse_filters(filter);
        } else if let Ok(filter) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filter);
        } else {
            builder.filter_level(log::LevelFilter::Warn);
        }

        let mut file_error = None;
        match &config.log_file {
            Some(path) => match File::create(path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                    builder.write_style(env_logger::WriteStyle::Never);
                }
                Err(e) => {
                    file_error = Some((path.clone(), e));
                    builder.write_style(config.write_style);
                }
            },
            None => {
                builder.write_style(config.write_style);
            }
        }

        builder.init();

        // only reportable once a logger exists
        if let Some((path, e)) = file_error {
            log::warn!("can't open log file {}: {}; logging to stderr", path.display(), e);
        }
        log::debug!("logging initialized");
    });
}
