//! Structured logging for clawgate.
//!
//! Built on `tracing` and `tracing-subscriber`. The library only emits
//! events; binaries decide whether and how to install a subscriber.
//!
//! ## Environment Variables
//!
//! - `CLAWGATE_LOG` or `RUST_LOG`: filter directive (e.g. `clawgate=debug,warn`)
//! - `CLAWGATE_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! # Trace every frame the client handles
//! CLAWGATE_LOG=clawgate_core=trace clawgate watch chat.message
//!
//! # One JSON object per line
//! CLAWGATE_LOG_FORMAT=json clawgate status
//! ```

use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

pub const ENV_LOG: &str = "CLAWGATE_LOG";
pub const ENV_LOG_FORMAT: &str = "CLAWGATE_LOG_FORMAT";
pub const DEFAULT_FILTER: &str = "clawgate=info,clawgate_core=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// JSON, for log aggregation
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively. Unknown names mean `Pretty`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive
    pub filter: String,
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_spans: bool,
    /// Include file and line
    pub with_file: bool,
    pub with_thread_ids: bool,
    /// Include the module path
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
            with_spans: false,
            with_file: false,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Config from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Config from variables resolved through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup(ENV_LOG)
            .or_else(|| lookup("RUST_LOG"))
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = lookup(ENV_LOG_FORMAT)
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();
        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    pub fn debug() -> Self {
        Self {
            filter: "clawgate=debug,clawgate_core=debug,info".to_string(),
            with_file: true,
            ..Default::default()
        }
    }

    /// JSON output with span events.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            with_spans: true,
            ..Default::default()
        }
    }

    /// Raise verbosity by `level` steps (`-v`, `-vv`) unless the filter was
    /// set explicitly through the environment.
    pub fn verbosity(mut self, level: u8) -> Self {
        if self.filter != DEFAULT_FILTER {
            return self;
        }
        self.filter = match level {
            0 => return self,
            1 => "clawgate=debug,clawgate_core=debug,warn".to_string(),
            _ => "clawgate=trace,clawgate_core=trace,info".to_string(),
        };
        self
    }
}

/// Install the global subscriber. Returns `false` if one was already set,
/// in which case nothing changes.
pub fn init(config: LogConfig) -> bool {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_thread_ids(config.with_thread_ids)
        .with_target(config.with_target);
    let layer = match config.format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .try_init()
        .is_ok()
}

/// `init(LogConfig::from_env())`.
pub fn init_from_env() -> bool {
    init(LogConfig::from_env())
}
