//! Logging setup for the Bronze host.
//!
//! One `tracing-subscriber` stack configured from [`LoggingConfig`]. Span
//! events make the per-event `dispatch` span and plugin request spans
//! visible without extra instrumentation. `RUST_LOG`, when set, replaces the
//! configured base level; per-module `filters` are added on top.

use std::path::{Path, PathBuf};

use tracing::warn;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{LogFormat, LogOutput, LogRotation, LoggingConfig, SpanEventConfig};

const DEFAULT_LOG_FILE: &str = "bronze.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        }
    }
}

fn fmt_span(events: &SpanEventConfig) -> FmtSpan {
    let mut span = FmtSpan::NONE;
    for (enabled, flag) in [
        (events.new, FmtSpan::NEW),
        (events.enter, FmtSpan::ENTER),
        (events.exit, FmtSpan::EXIT),
        (events.close, FmtSpan::CLOSE),
    ] {
        if enabled {
            span |= flag;
        }
    }
    span
}

/// Initializes logging from a [`LoggingConfig`].
///
/// Does nothing if a global subscriber is already installed.
pub fn init_from_config(config: &LoggingConfig) {
    let _ = LoggingBuilder::from_config(config).try_init();
}

/// The subscriber stack described by a [`LoggingConfig`].
pub struct LoggingBuilder {
    level: tracing::Level,
    directives: Vec<String>,
    span_events: FmtSpan,
    format: LogFormat,
    output: LogOutput,
    thread_ids: bool,
    file_location: bool,
    file_path: Option<PathBuf>,
    rotation: LogRotation,
    max_files: usize,
}

impl LoggingBuilder {
    pub fn from_config(config: &LoggingConfig) -> Self {
        let mut filters: Vec<_> = config.filters.iter().collect();
        filters.sort_by(|a, b| a.0.cmp(b.0));

        Self {
            level: config.level.to_tracing_level(),
            directives: filters
                .into_iter()
                .map(|(module, level)| format!("{module}={level}"))
                .collect(),
            span_events: fmt_span(&config.span_events),
            format: config.format,
            output: config.output,
            thread_ids: config.thread_ids,
            file_location: config.file_location,
            file_path: config.file_path.clone(),
            rotation: config.rotation,
            max_files: config.max_files as usize,
        }
    }

    fn build_filter(&self) -> EnvFilter {
        let base = self.level.to_string().to_lowercase();
        let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base));
        for directive in &self.directives {
            if let Ok(d) = directive.parse() {
                filter = filter.add_directive(d);
            }
        }
        filter
    }

    /// Format actually used, given the enabled features.
    fn effective_format(&self) -> LogFormat {
        match self.format {
            #[cfg(not(feature = "json-log"))]
            LogFormat::Json => LogFormat::Full,
            other => other,
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let prefix = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);

        let mut builder = RollingFileAppender::builder()
            .rotation(self.rotation.into())
            .filename_prefix(prefix);
        if self.max_files > 0 && self.rotation != LogRotation::Never {
            builder = builder.max_log_files(self.max_files);
        }
        builder.build(directory).ok()
    }

    /// The writer for the configured output, and whether a file output fell
    /// back to stdout.
    fn writer(&self) -> (BoxMakeWriter, bool) {
        match self.output {
            LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), false),
            LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), false),
            LogOutput::File => match self.file_appender() {
                Some(appender) => (BoxMakeWriter::new(appender), false),
                None => (BoxMakeWriter::new(std::io::stdout), true),
            },
        }
    }

    fn layer(&self, writer: BoxMakeWriter) -> BoxedLayer {
        let base = fmt::layer()
            .with_writer(writer)
            .with_span_events(self.span_events.clone())
            .with_thread_ids(self.thread_ids)
            .with_file(self.file_location)
            .with_line_number(self.file_location);

        match self.effective_format() {
            #[cfg(feature = "json-log")]
            LogFormat::Json => base.json().boxed(),
            LogFormat::Compact => base.compact().boxed(),
            LogFormat::Pretty => base.pretty().boxed(),
            _ => base.boxed(),
        }
    }

    /// Initializes the logging system, ignoring an already installed subscriber.
    pub fn init(self) {
        let _ = self.try_init();
    }

    /// Tries to install the subscriber globally.
    pub fn try_init(self) -> Result<(), TryInitError> {
        let (writer, file_fallback) = self.writer();
        tracing_subscriber::registry()
            .with(self.layer(writer))
            .with(self.build_filter())
            .try_init()?;

        if file_fallback {
            warn!(path = ?self.file_path, "Log file could not be opened, logging to stdout");
        }
        if self.effective_format() != self.format {
            warn!("JSON logging needs the json-log feature, using the full format");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_span_event_flags() {
        assert_eq!(fmt_span(&SpanEventConfig::default()), FmtSpan::NONE);
        let lifecycle = SpanEventConfig {
            new: true,
            close: true,
            ..Default::default()
        };
        assert_eq!(fmt_span(&lifecycle), FmtSpan::NEW | FmtSpan::CLOSE);
    }

    #[test]
    fn test_builder_from_config() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Pretty,
            thread_ids: true,
            file_location: true,
            rotation: LogRotation::Daily,
            max_files: 3,
            span_events: SpanEventConfig {
                close: true,
                ..Default::default()
            },
            filters: HashMap::from([
                ("bronze_framework".to_string(), LogLevel::Trace),
                ("bronze_adapter_process".to_string(), LogLevel::Warn),
            ]),
            ..Default::default()
        };

        let builder = LoggingBuilder::from_config(&config);
        assert_eq!(builder.level, tracing::Level::DEBUG);
        assert_eq!(builder.format, LogFormat::Pretty);
        assert!(builder.thread_ids && builder.file_location);
        assert_eq!(builder.rotation, LogRotation::Daily);
        assert_eq!(builder.max_files, 3);
        assert_eq!(builder.span_events, FmtSpan::CLOSE);
        assert_eq!(
            builder.directives,
            ["bronze_adapter_process=warn", "bronze_framework=trace"]
        );
    }

    #[cfg(not(feature = "json-log"))]
    #[test]
    fn test_json_falls_back_without_feature() {
        let config = LoggingConfig {
            format: LogFormat::Json,
            ..Default::default()
        };
        assert_eq!(LoggingBuilder::from_config(&config).effective_format(), LogFormat::Full);
    }

    #[test]
    fn test_file_output_without_path_falls_back() {
        let config = LoggingConfig {
            output: LogOutput::File,
            ..Default::default()
        };
        let builder = LoggingBuilder::from_config(&config);
        assert!(builder.file_appender().is_none());
        assert!(builder.writer().1);
    }

    #[test]
    fn test_file_appender_creates_file() {
        let dir = std::env::temp_dir().join(format!("bronze-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let config = LoggingConfig {
            output: LogOutput::File,
            file_path: Some(dir.join("host.log")),
            ..Default::default()
        };
        let builder = LoggingBuilder::from_config(&config);
        assert!(builder.file_appender().is_some());
        assert!(dir.join("host.log").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
