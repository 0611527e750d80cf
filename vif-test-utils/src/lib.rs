// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the VIF plugin's tests.

pub mod host;

use camino::Utf8PathBuf;
use slog::Drain;
use slog::Logger;

pub use host::FakeHost;

/// A per-test logger writing to its own file.
///
/// Call [`LogContext::cleanup_successful`] at the end of a passing test to
/// remove the file. Failed tests leave it behind for inspection.
pub struct LogContext {
    pub log: Logger,
    pub log_path: Utf8PathBuf,
}

impl LogContext {
    pub fn cleanup_successful(self) {
        let LogContext { log, log_path } = self;
        drop(log);
        if let Err(err) = std::fs::remove_file(&log_path) {
            eprintln!("failed to remove log file {log_path}: {err}");
        }
    }
}

/// Set up a trace-level [`LogContext`] for the test named `test_name`.
pub fn test_setup_log(test_name: &str) -> LogContext {
    let dir = Utf8PathBuf::try_from(std::env::temp_dir())
        .expect("temporary directory is not UTF-8");
    let log_path = dir.join(format!(
        "{test_name}.{}.{}.log",
        std::process::id(),
        uuid::Uuid::new_v4().simple(),
    ));
    let file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&log_path)
        .unwrap_or_else(|err| panic!("creating {log_path}: {err}"));
    let decorator = slog_term::PlainSyncDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let log = Logger::root(drain, slog::o!("test_name" => test_name.to_string()));
    eprintln!("log file: {log_path}");
    LogContext { log, log_path }
}

/// A logger writing to the test harness's captured stdout.
pub fn stdout_log() -> Logger {
    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    Logger::root(drain, slog::o!())
}
