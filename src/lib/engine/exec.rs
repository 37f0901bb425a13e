use std::{future::Future, time::Duration};

use tokio::time::{Instant, MissedTickBehavior};

use super::types::{EngineError, EngineResult, ExecOutcome, ExecProgress};

/// Environment variable tagging every process a script spawns.
pub const EXEC_MARKER_ENV: &str = "SANDBOXD_EXEC_ID";

/// `NAME=value` entry that marks one script execution.
pub fn exec_marker(exec_id: &str) -> String {
    format!("{}={}", EXEC_MARKER_ENV, exec_id)
}

/// Shell command that SIGKILLs every process carrying `marker` in its
/// environment. Children inherit the marker, so the whole script tree goes.
pub fn kill_command(marker: &str) -> Vec<String> {
    let script = format!(
        "for p in /proc/[0-9]*; do grep -qxz '{}' \"$p/environ\" 2>/dev/null && kill -9 \"${{p#/proc/}}\"; done; true",
        marker
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Polls a detached execution every `poll_interval` until it stops running
/// or `timeout` elapses. The first inspection happens one interval after
/// the call.
pub async fn poll_exec<F, Fut>(
    poll_interval: Duration,
    timeout: Duration,
    mut inspect: F,
) -> EngineResult<ExecOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<ExecProgress>>,
{
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = tokio::time::sleep_until(deadline) => {
                return Err(EngineError::ExecTimeout(timeout));
            }
            _ = ticker.tick() => {
                let progress = tokio::time::timeout_at(deadline, inspect())
                    .await
                    .map_err(|_| EngineError::ExecTimeout(timeout))??;

                if let ExecProgress::Exited(exit_code) = progress {
                    return Ok(ExecOutcome::from_exit_code(exit_code));
                }
            }
        }
    }
}
