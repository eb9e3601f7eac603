// Copyright 2025 DataStax Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Logging infrastructure for gridflow.
//!
//! Logging goes through the `log` facade, initialized here with `logforth`.
//! Every record emitted while a workflow operation is in flight carries
//! `workflow_id` and `step_id` diagnostics, injected from thread-local RAII
//! guards, so call sites never thread identifiers into individual log lines.

pub use log;

mod workflow_diagnostic_context;
pub use workflow_diagnostic_context::{
    StepIdGuard, WorkflowDiagnostic, WorkflowInfoGuard, get_step_id, get_workflow_id,
};

use serde::{Deserialize, Serialize};

/// Configuration for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservabilityConfig {
    /// Log level filter for gridflow crates.
    #[serde(with = "level_filter_serde")]
    pub log_level: log::LevelFilter,

    /// Log output format.
    pub log_format: LogFormat,

    /// Log to file (instead of stdout).
    pub log_file: Option<std::path::PathBuf>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: log::LevelFilter::Info,
            log_format: LogFormat::Text,
            log_file: None,
        }
    }
}

mod level_filter_serde {
    use serde::{Deserialize as _, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        level: &log::LevelFilter,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.to_string().to_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<log::LevelFilter, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_log_level(&s).map_err(serde::de::Error::custom)
    }
}

pub fn parse_log_level(s: &str) -> std::result::Result<log::LevelFilter, String> {
    match s.to_lowercase().as_str() {
        "off" => Ok(log::LevelFilter::Off),
        "error" => Ok(log::LevelFilter::Error),
        "warn" => Ok(log::LevelFilter::Warn),
        "info" => Ok(log::LevelFilter::Info),
        "debug" => Ok(log::LevelFilter::Debug),
        "trace" => Ok(log::LevelFilter::Trace),
        _ => Err(format!("Invalid log level: {s}")),
    }
}

/// Log output format
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON logs
    Json,
    /// Human-readable text logs
    Text,
}

/// Log output destination (computed from configuration)
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum LogDestination<'a> {
    Stdout,
    /// Log to a file (appends)
    File(&'a std::path::Path),
}

impl ObservabilityConfig {
    pub fn log_destination(&self) -> LogDestination<'_> {
        match &self.log_file {
            Some(path) => LogDestination::File(path),
            None => LogDestination::Stdout,
        }
    }
}

/// Initialize logging.
///
/// Returns a guard to hold for the lifetime of the process. Calling this
/// twice is an error from the underlying logger; binaries call it exactly
/// once at startup.
pub fn init_observability(config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    use logforth::filter::EnvFilter;
    use logforth::filter::env_filter::EnvFilterBuilder;

    fn level_to_str(level: log::LevelFilter) -> &'static str {
        match level {
            log::LevelFilter::Off => "off",
            log::LevelFilter::Error => "error",
            log::LevelFilter::Warn => "warn",
            log::LevelFilter::Info => "info",
            log::LevelFilter::Debug => "debug",
            log::LevelFilter::Trace => "trace",
        }
    }

    // Special case: /dev/null means discard logs (used in tests)
    if let LogDestination::File(path) = config.log_destination()
        && path == std::path::Path::new("/dev/null")
    {
        return Ok(ObservabilityGuard { _drop_guard: None });
    }

    let filter = EnvFilter::new(EnvFilterBuilder::new().parse(level_to_str(config.log_level)));
    let destination = config.log_destination();
    let format = config.log_format;

    let (appender, drop_guard) = create_appender(destination, format);

    logforth::builder()
        .dispatch(|d| {
            d.filter(filter)
                .diagnostic(WorkflowDiagnostic)
                .append(appender)
        })
        .apply();

    Ok(ObservabilityGuard {
        _drop_guard: drop_guard,
    })
}

/// Create an appender based on configuration
fn create_appender(
    destination: LogDestination<'_>,
    format: LogFormat,
) -> (Box<dyn logforth::Append>, Option<logforth::DropGuard>) {
    use logforth::append;
    use logforth::append::single_file::SingleFileBuilder;
    use logforth::layout::{JsonLayout, TextLayout};

    match (destination, format) {
        (LogDestination::Stdout, LogFormat::Json) => {
            (Box::new(append::Stdout::default().with_layout(JsonLayout::default())), None)
        }
        (LogDestination::Stdout, LogFormat::Text) => {
            (Box::new(append::Stdout::default().with_layout(TextLayout::default())), None)
        }
        (LogDestination::File(path), LogFormat::Json) => {
            let (file_appender, guard) = SingleFileBuilder::new(path.to_path_buf())
                .layout(JsonLayout::default())
                .build()
                .expect("File appender creation should have been validated");
            (Box::new(file_appender), Some(guard))
        }
        (LogDestination::File(path), LogFormat::Text) => {
            let (file_appender, guard) = SingleFileBuilder::new(path.to_path_buf())
                .layout(TextLayout::default())
                .build()
                .expect("File appender creation should have been validated");
            (Box::new(file_appender), Some(guard))
        }
    }
}

/// Guard that keeps logging alive for the process lifetime.
pub struct ObservabilityGuard {
    _drop_guard: Option<logforth::DropGuard>,
}

/// Errors that can occur during observability initialization
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("Failed to initialize logging")]
    LogInitError,
}

pub type Result<T> = std::result::Result<T, error_stack::Report<ObservabilityError>>;
