//! Installs the global subscriber, so it runs in its own test binary.

use genpool::logger::{self, LogLevel};

#[test]
fn second_init_is_an_error() {
    assert!(logger::try_init(LogLevel::Debug).is_ok());
    assert!(logger::try_init(LogLevel::Debug).is_err());
}
