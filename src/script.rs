//! # Script Dispatcher Module
//!
//! Runs the side-effect commands attached to trigger sources.
//!
//! When a capture flushes, every distinct script string across the sources
//! that fired is executed exactly once, strictly after the page write.
//! Deduplication is by exact string match. Command failures are logged and
//! never abort the logger.

use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capture::trigger::Firing;

/// Upper bound on how long one script may run before being abandoned.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Distinct script strings across the sources that fired, in first-seen
/// order, deduplicated by exact string match.
#[must_use]
pub fn distinct_commands(firings: &[Firing]) -> Vec<String> {
    let mut commands: Vec<String> = Vec::new();
    for firing in firings {
        if let Some(script) = &firing.script {
            if !commands.iter().any(|c| c == script) {
                commands.push(script.clone());
            }
        }
    }
    commands
}

/// Executes capture side-effect commands through `sh -c`.
#[derive(Debug, Default)]
pub struct ScriptDispatcher;

impl ScriptDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run each distinct command attached to the firing sources exactly
    /// once. Must only be called after the capture's page has been written.
    pub async fn dispatch(&self, firings: &[Firing]) {
        for command in distinct_commands(firings) {
            self.run(&command).await;
        }
    }

    async fn run(&self, command: &str) {
        debug!("Running capture script: {}", command);

        let spawned = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn capture script '{}': {}", command, e);
                return;
            }
        };

        match tokio::time::timeout(SCRIPT_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                warn!("Capture script '{}' exited with {}", command, status);
            }
            Ok(Err(e)) => {
                warn!("Failed to wait on capture script '{}': {}", command, e);
            }
            Err(_) => {
                warn!(
                    "Capture script '{}' still running after {:?}, abandoning it",
                    command, SCRIPT_TIMEOUT
                );
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::trigger::TriggerKind;

    fn firing(script: Option<&str>) -> Firing {
        Firing {
            kind: TriggerKind::Glitch,
            channel: "ch".to_string(),
            severity: None,
            script: script.map(str::to_string),
        }
    }

    #[test]
    fn test_distinct_commands_deduplicates_exact_matches() {
        let firings = vec![
            firing(Some("notify-operator")),
            firing(Some("notify-operator")),
            firing(Some("archive-page")),
        ];
        assert_eq!(
            distinct_commands(&firings),
            vec!["notify-operator".to_string(), "archive-page".to_string()]
        );
    }

    #[test]
    fn test_distinct_commands_skips_missing_scripts() {
        let firings = vec![firing(None), firing(Some("x")), firing(None)];
        assert_eq!(distinct_commands(&firings), vec!["x".to_string()]);
    }

    #[test]
    fn test_distinct_commands_is_case_sensitive() {
        // Exact string match only; differing whitespace or case is distinct.
        let firings = vec![firing(Some("cmd")), firing(Some("CMD")), firing(Some("cmd "))];
        assert_eq!(distinct_commands(&firings).len(), 3);
    }

    #[tokio::test]
    async fn test_dispatch_runs_each_command_once() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = format!("echo ran >> {}", out.display());

        let firings = vec![firing(Some(&script)), firing(Some(&script))];
        ScriptDispatcher::new().dispatch(&firings).await;

        let mut contents = String::new();
        std::fs::File::open(&out)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_survives_failing_command() {
        let firings = vec![firing(Some("false")), firing(Some("exit 3"))];
        // Failures are logged, never propagated.
        ScriptDispatcher::new().dispatch(&firings).await;
    }

    #[tokio::test]
    async fn test_dispatch_with_no_scripts_is_noop() {
        ScriptDispatcher::new().dispatch(&[firing(None)]).await;
        ScriptDispatcher::new().dispatch(&[]).await;
    }
}
