use std::fs;
use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error,ffmpeg_encode_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_LOG_FILE_PREFIX: &str = "kinetoscope";
pub const DEFAULT_LOG_FILE_SUFFIX: &str = "log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingInitOptions {
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub default_log_filter: String,
    pub noise_filter: String,
    pub retention_files: usize,
}

impl Default for LoggingInitOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            default_log_filter: DEFAULT_LOG_FILTER.to_string(),
            noise_filter: DEFAULT_NOISE_FILTER.to_string(),
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

#[derive(Debug)]
pub struct LoggingInitPlan {
    pub console_filter: String,
    pub file_sink: FileSinkPlan,
}

#[derive(Debug)]
pub enum FileSinkPlan {
    Ready(ReadyFileSinkPlan),
    Fallback(FallbackFileSinkPlan),
}

#[derive(Debug)]
pub struct ReadyFileSinkPlan {
    pub log_dir: PathBuf,
    pub appender: RollingFileAppender,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackFileSinkPlan {
    pub attempted_log_dir: Option<PathBuf>,
    pub reason: String,
}

impl FileSinkPlan {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn log_dir(&self) -> Option<&PathBuf> {
        match self {
            Self::Ready(plan) => Some(&plan.log_dir),
            Self::Fallback(plan) => plan.attempted_log_dir.as_ref(),
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            Self::Ready(_) => None,
            Self::Fallback(plan) => Some(plan.reason.as_str()),
        }
    }
}

pub fn compose_logging_init_plan(options: &LoggingInitOptions) -> LoggingInitPlan {
    LoggingInitPlan {
        console_filter: select_log_filter(options),
        file_sink: build_file_sink_plan(options),
    }
}

/// Resolve the effective log filter with priority:
/// 1. --log-filter CLI flag
/// 2. -v / -vv verbosity shortcuts
/// 3. RUST_LOG environment variable
/// 4. Built-in default
///
/// The noise filter suppressing ffmpeg/ort chatter is only prepended when the
/// user did not ask for an explicit filter or extra verbosity.
pub fn select_log_filter(options: &LoggingInitOptions) -> String {
    let user_filter = select_user_filter(options);
    let include_noise = options.cli_log_filter.is_none() && options.verbose == 0;
    merge_noise_filter(options.noise_filter.as_str(), user_filter.as_str(), include_noise)
}

pub fn build_file_sink_plan(options: &LoggingInitOptions) -> FileSinkPlan {
    let retention_files = normalize_retention_files(options.retention_files);

    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        });
    };

    let log_dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        });
    }

    let appender_builder = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(DEFAULT_LOG_FILE_PREFIX)
        .filename_suffix(DEFAULT_LOG_FILE_SUFFIX)
        .max_log_files(retention_files);

    match appender_builder.build(&log_dir) {
        Ok(appender) => FileSinkPlan::Ready(ReadyFileSinkPlan { log_dir, appender }),
        Err(error) => FileSinkPlan::Fallback(FallbackFileSinkPlan {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        }),
    }
}

fn normalize_retention_files(retention_files: usize) -> usize {
    if retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        retention_files
    }
}

fn select_user_filter(options: &LoggingInitOptions) -> String {
    if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        options.default_log_filter.clone()
    }
}

fn merge_noise_filter(noise_filter: &str, user_filter: &str, include_noise_filter: bool) -> String {
    if include_noise_filter && !noise_filter.trim().is_empty() {
        format!("{noise_filter},{user_filter}")
    } else {
        user_filter.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_includes_noise_suppression() {
        let options = LoggingInitOptions::default();
        let filter = select_log_filter(&options);
        assert_eq!(filter, format!("{DEFAULT_NOISE_FILTER},info"));
    }

    #[test]
    fn cli_filter_wins_and_skips_noise_suppression() {
        let options = LoggingInitOptions {
            cli_log_filter: Some("kinetoscope_core=trace".to_string()),
            rust_log_env: Some("warn".to_string()),
            verbose: 2,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&options), "kinetoscope_core=trace");
    }

    #[test]
    fn verbose_flags_map_to_debug_and_trace() {
        let debug = LoggingInitOptions {
            verbose: 1,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&debug), "debug");

        let trace = LoggingInitOptions {
            verbose: 2,
            ..Default::default()
        };
        assert_eq!(select_log_filter(&trace), "trace");
    }

    #[test]
    fn rust_log_env_used_when_no_cli_or_verbose() {
        let options = LoggingInitOptions {
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        assert_eq!(
            select_log_filter(&options),
            format!("{DEFAULT_NOISE_FILTER},warn")
        );
    }

    #[test]
    fn file_sink_falls_back_without_data_dir() {
        let options = LoggingInitOptions::default();
        let plan = build_file_sink_plan(&options);
        assert!(!plan.is_ready());
        assert!(plan
            .fallback_reason()
            .expect("fallback reason")
            .contains("data_dir"));
    }

    #[test]
    fn file_sink_ready_with_writable_data_dir() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let options = LoggingInitOptions {
            data_dir: Some(temp.path().to_path_buf()),
            ..Default::default()
        };
        let plan = build_file_sink_plan(&options);
        assert!(plan.is_ready());
        assert_eq!(
            plan.log_dir().expect("log dir"),
            &temp.path().join(DEFAULT_LOG_DIR_NAME)
        );
    }

    #[test]
    fn zero_retention_normalizes_to_default() {
        assert_eq!(normalize_retention_files(0), DEFAULT_LOG_RETENTION_FILES);
        assert_eq!(normalize_retention_files(3), 3);
    }
}
