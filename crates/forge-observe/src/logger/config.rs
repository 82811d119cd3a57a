use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

use crate::logger::{error::LoggerError, format::LoggerFormat};

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directives, e.g. `info` or `info,forge_auction=debug`.
    pub level: String,
    pub with_targets: bool,
    pub use_color: bool,
}

impl LoggerConfig {
    pub fn new(format: LoggerFormat, level: impl Into<String>) -> Self {
        Self {
            format,
            level: level.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), LoggerError> {
        EnvFilter::try_new(&self.level)
            .map(|_| ())
            .map_err(|_| LoggerError::InvalidLogLevel(self.level.clone()))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            format: LoggerFormat::Text,
            level: "info".to_string(),
            with_targets: true,
            use_color: std::io::stdout().is_terminal(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_filter_directives() {
        let cfg = LoggerConfig::new(LoggerFormat::Json, "info,forge_auction=debug");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.format, LoggerFormat::Json);
        assert!(cfg.with_targets);
    }

    #[test]
    fn rejects_garbage_level() {
        let cfg = LoggerConfig::new(LoggerFormat::Text, "forge=[[[");
        assert!(matches!(
            cfg.validate(),
            Err(LoggerError::InvalidLogLevel(_))
        ));
    }
}
