//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{init_logging, redact_url, strip_path, LogFormat, LoggingConfig};

#[test]
fn test_logging_config_defaults() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Json)
        .with_level(LogLevel::Debug)
        .with_spans(true);

    assert_eq!(config.format, LogFormat::Json);
    assert_eq!(config.level, LogLevel::Debug);
    assert!(config.enable_spans);
    assert!(config.logger_sink.is_none());
}

#[test]
fn test_download_url_redaction() {
    assert_eq!(
        redact_url("https://lms.example.edu/files/9/download?download_frd=1&verifier=xyz"),
        "https://lms.example.edu/files/9/download?[REDACTED]"
    );
    assert_eq!(
        redact_url("https://lms.example.edu/courses/42/pages#intro"),
        "https://lms.example.edu/courses/42/pages?[REDACTED]"
    );
    assert_eq!(
        redact_url("https://lms.example.edu/courses/42"),
        "https://lms.example.edu/courses/42"
    );
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/data/offline/42/files/syllabus.pdf"), "syllabus.pdf");
    assert_eq!(strip_path("C:\\Users\\Ana\\offline\\42\\pages\\intro.html"), "intro.html");
    assert_eq!(strip_path("filename.txt"), "filename.txt");
    assert_eq!(strip_path("/var/log/"), "");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[cfg(not(debug_assertions))]
    {
        let config = LoggingConfig::default();
        assert_eq!(config.format, LogFormat::Json);
    }
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_filter("core_sync=trace,sqlx=warn")
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert_eq!(config.filter.as_deref(), Some("core_sync=trace,sqlx=warn"));
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}

#[test]
fn test_init_logging_only_once() {
    let first = init_logging(LoggingConfig::default().with_format(LogFormat::Compact));
    assert!(first.is_ok());

    let second = init_logging(LoggingConfig::default());
    assert!(second.is_err());
}
