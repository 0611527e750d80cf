// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::host::{
    error::ExecutionError, input::Input, output::output_to_exec_error,
    output::Output, output::OutputExt,
};

use async_trait::async_trait;
use slog::{debug, error, info, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn log_started(log: &Logger, id: u64, input: &Input) {
    info!(log, "running command"; "id" => id, "command" => %input);
    if !input.envs.is_empty() {
        debug!(log, "command environment"; "id" => id, "envs" => ?input.envs);
    }
}

fn log_finished(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "command finished";
        "id" => id,
        "success" => output.status.success(),
        "code" => ?output.status.code(),
    );
    if !output.stdout.is_empty() {
        debug!(log, "command stdout"; "id" => id, "stdout" => lossy(&output.stdout));
    }
    if !output.stderr.is_empty() {
        debug!(log, "command stderr"; "id" => id, "stderr" => lossy(&output.stderr));
    }
}

/// Turn a finished command's output into a result.
fn check_output(input: &Input, output: Output) -> Result<Output, ExecutionError> {
    if output.status.success() {
        Ok(output)
    } else {
        Err(output_to_exec_error(input.to_string(), &output))
    }
}

/// Shared handle to whichever [Executor] a component was built with.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs host commands on behalf of the plugin.
///
/// Production code uses a [HostExecutor]; tests substitute a
/// [FakeExecutor] so no command ever reaches the host.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs `command` to completion. A non-zero exit is an error.
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;
}

/// Runs `command`, treating any exit code in `allowed_codes` as success.
///
/// Some tools (notably `ip`) report "already exists" or "not found"
/// conditions with dedicated exit codes that callers want to ignore.
pub async fn execute_allowing(
    executor: &dyn Executor,
    command: &mut tokio::process::Command,
    allowed_codes: &[i32],
) -> Result<Output, ExecutionError> {
    match executor.execute_async(command).await {
        Ok(output) => Ok(output),
        Err(ExecutionError::CommandFailure(info))
            if info.code().is_some_and(|c| allowed_codes.contains(&c)) =>
        {
            Ok(Output {
                status: info.status,
                stdout: info.stdout.into_bytes(),
                stderr: info.stderr.into_bytes(),
            })
        }
        Err(err) => Err(err),
    }
}

/// Answers a command run through a [FakeExecutor].
pub type WaitFn = dyn FnMut(&Input) -> Output + Send + Sync;
pub type BoxedWaitFn = Box<WaitFn>;

/// An executor which records every command and answers it from a handler
/// instead of running it.
pub struct FakeExecutor {
    log: Logger,
    next_id: AtomicU64,
    handler: Mutex<BoxedWaitFn>,
    observed: Mutex<Vec<Input>>,
}

impl FakeExecutor {
    /// A fake whose commands all succeed until a handler is installed.
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            next_id: AtomicU64::new(0),
            handler: Mutex::new(Box::new(|_| Output::success())),
            observed: Mutex::new(Vec::new()),
        })
    }

    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.handler.lock().unwrap() = f;
    }

    /// Every command run through this executor so far, in order.
    pub fn observed(&self) -> Vec<Input> {
        self.observed.lock().unwrap().clone()
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_started(&self.log, id, &input);
        self.observed.lock().unwrap().push(input.clone());

        // Handlers are synchronous; the caller's future never yields here.
        let output = (self.handler.lock().unwrap())(&input);
        log_finished(&self.log, id, &output);
        check_output(&input, output)
    }
}

/// Runs commands on the host.
pub struct HostExecutor {
    log: Logger,
    next_id: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, next_id: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let input = Input::from(command.as_std());
        log_started(&self.log, id, &input);

        let output = match command.output().await {
            Ok(output) => output,
            Err(err) => {
                error!(
                    self.log,
                    "failed to start command";
                    "id" => id,
                    "command" => %input,
                    "error" => %err,
                );
                return Err(ExecutionError::ExecutionStart {
                    command: input.to_string(),
                    err,
                });
            }
        };
        log_finished(&self.log, id, &output);
        check_output(&input, output)
    }
}

type DynamicHandler = Box<dyn FnMut(&Input) -> Output + Send + Sync>;

enum Expectation {
    Exact { input: Input, output: Output },
    Dynamic(DynamicHandler),
}

impl Expectation {
    fn describe(&self) -> String {
        match self {
            Expectation::Exact { input, .. } => input.to_string(),
            Expectation::Dynamic(_) => "<dynamic handler>".to_string(),
        }
    }
}

/// Scripted answers for a [FakeExecutor], consumed in order.
///
/// Running a command nobody expected panics, and so does dropping the
/// handler while expectations remain unmet.
#[derive(Default)]
pub struct StaticHandler {
    expected: VecDeque<Expectation>,
    seen: usize,
}

impl StaticHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install this handler on `executor`.
    pub fn register(mut self, executor: &FakeExecutor) {
        executor.set_wait_handler(Box::new(move |input| self.answer(input)));
    }

    /// Expect exactly `input`, answering with `output`.
    pub fn expect(&mut self, input: Input, output: Output) {
        self.expected.push_back(Expectation::Exact { input, output });
    }

    /// Expect a command written like a shell line, which succeeds.
    pub fn expect_ok<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::success())
    }

    /// Expect a command written like a shell line, which fails.
    pub fn expect_fail<S: AsRef<str>>(&mut self, input: S) {
        self.expect(Input::shell(input), Output::failure())
    }

    /// Let `handler` inspect and answer the next command, whatever it is.
    pub fn expect_dynamic(&mut self, handler: DynamicHandler) {
        self.expected.push_back(Expectation::Dynamic(handler));
    }

    fn answer(&mut self, observed: &Input) -> Output {
        let Some(expected) = self.expected.pop_front() else {
            panic!(
                "unexpected command after {} expected ones: {observed}",
                self.seen
            );
        };
        self.seen += 1;
        match expected {
            Expectation::Exact { input, output } => {
                assert_eq!(observed, &input, "unexpected command");
                output
            }
            Expectation::Dynamic(mut handler) => handler(observed),
        }
    }
}

impl Drop for StaticHandler {
    fn drop(&mut self) {
        let Some(next) = self.expected.front() else {
            return;
        };
        let msg = format!(
            "saw {} commands but {} more were expected; next: {}",
            self.seen,
            self.expected.len(),
            next.describe(),
        );
        if std::thread::panicking() {
            eprintln!("{msg}");
        } else {
            panic!("{msg}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_log() -> Logger {
        let decorator =
            slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
        let drain = slog_term::FullFormat::new(decorator).build();
        Logger::root(slog::Fuse(drain), slog::o!())
    }

    fn ip(args: &[&str]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ip");
        cmd.args(args);
        cmd
    }

    #[tokio::test]
    async fn static_handler_matches_commands_in_order() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_ok("ip link set tap0 up");
        handler.expect_fail("ip link delete tap0");
        handler.register(&executor);

        executor
            .execute_async(&mut ip(&["link", "set", "tap0", "up"]))
            .await
            .expect("first command");
        let err = executor
            .execute_async(&mut ip(&["link", "delete", "tap0"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::CommandFailure(_)));
        assert_eq!(executor.observed().len(), 2);
    }

    #[tokio::test]
    async fn dynamic_expectation_sees_the_command() {
        let executor = FakeExecutor::new(test_log());
        let mut handler = StaticHandler::new();
        handler.expect_dynamic(Box::new(|input| {
            assert_eq!(input.args, vec!["tuntap", "add", "tap0"]);
            Output::success().set_stdout("ok")
        }));
        handler.register(&executor);

        let output = executor
            .execute_async(&mut ip(&["tuntap", "add", "tap0"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, b"ok");
    }

    #[tokio::test]
    async fn execute_allowing_accepts_listed_codes() {
        let executor = FakeExecutor::new(test_log());
        executor.set_wait_handler(Box::new(|input| {
            if input.has_arg("tap-exists") {
                Output::with_code(2)
            } else {
                Output::with_code(1)
            }
        }));

        let mut cmd = ip(&["tuntap", "add", "tap-exists", "mode", "tap"]);
        let output = execute_allowing(&*executor, &mut cmd, &[0, 2, 254])
            .await
            .expect("exit code 2 is allowed");
        assert_eq!(output.status.code(), Some(2));

        let mut cmd = ip(&["tuntap", "add", "tap-other", "mode", "tap"]);
        let err = execute_allowing(&*executor, &mut cmd, &[0, 2, 254])
            .await
            .unwrap_err();
        match err {
            ExecutionError::CommandFailure(info) => {
                assert_eq!(info.code(), Some(1))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn host_executor_reports_missing_program() {
        let executor = HostExecutor::new(test_log());
        let mut cmd =
            tokio::process::Command::new("/nonexistent/vrouter-port-control");
        let err = executor.execute_async(&mut cmd).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
    }
}
