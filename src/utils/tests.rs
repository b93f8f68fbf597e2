use super::{Error, logging};
use std::time::Duration;

#[test]
fn logging_init_accepts_levels() {
    // Repeated init must not panic.
    logging::init("info");
    logging::init("debug");
    logging::init("warning");
    logging::init("nonsense");
}

#[test]
fn authentication_errors_are_not_retryable() {
    assert!(!Error::Authentication("bad password".into()).is_retryable());
    assert!(Error::Connection("refused".into()).is_retryable());
    assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
}

#[test]
fn config_error_converts() {
    let err: Error = config::ConfigError::Message("boom".into()).into();
    assert!(matches!(err, Error::Config(ref m) if m.contains("boom")));
}
