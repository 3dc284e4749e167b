//! ---
//! pvsim_section: "01-core-functionality"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Shared primitives and utilities for the meter and PV services."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::str::FromStr;

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Span};
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "PVSIM_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();
static STDOUT_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Available log formats for the services.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "json")]
    StructuredJson,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "structured-json" => Ok(LogFormat::StructuredJson),
            "pretty" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Filter directive: `PVSIM_LOG`, then `RUST_LOG`, then `info`.
fn service_filter() -> EnvFilter {
    match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(&directive).unwrap_or_else(|err| {
            eprintln!("ignoring {LOG_ENV}={directive:?} ({err}); using {DEFAULT_DIRECTIVE}");
            EnvFilter::new(DEFAULT_DIRECTIVE)
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Name of the rolling file for `service`.
fn log_file_name(config: &LoggingConfig, service: &str) -> String {
    let prefix = config.file_prefix.as_deref().unwrap_or("pvsim");
    format!("{prefix}-{service}.log")
}

/// Install the subscriber and return the root span every service event
/// should run under. The span carries `service` and `environment`, so both
/// labels appear on each stdout and file line.
///
/// Stdout uses the configured format; the daily rolling file under the log
/// directory is always JSON.
pub fn init_tracing(service: &str, environment: &str, config: &LoggingConfig) -> Result<Span> {
    std::fs::create_dir_all(&config.directory)?;
    let appender = daily(&config.directory, log_file_name(config, service));
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };
    let file_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_writer(file_writer)
        .boxed();

    // A second call (tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(service_filter())
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    let root = info_span!("pvsim", service = %service, environment = %environment);
    root.in_scope(|| {
        info!(log_dir = %config.directory.display(), format = ?config.format, "tracing initialised")
    });
    Ok(root)
}
