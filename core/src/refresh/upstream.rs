//! The upstream metrics source.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::infrastructure::runner::CommandRunner;
use crate::types::config::RefreshSettings;
use crate::types::snapshot::UsageSnapshot;


pub trait UpstreamSource: Send + Sync {
    fn fetch(&self) -> Result<UsageSnapshot>;
}

/// Runs the configured usage command and parses its JSON output.
pub struct CommandSource {
    runner: Arc<dyn CommandRunner>,
    command: String,
    timeout: Duration,
}

impl CommandSource {
    pub fn new(runner: Arc<dyn CommandRunner>, command: &str, timeout: Duration) -> Self {
        CommandSource {
            runner,
            command: command.to_string(),
            timeout,
        }
    }

    pub fn from_settings(runner: Arc<dyn CommandRunner>, refresh: &RefreshSettings) -> Self {
        CommandSource::new(
            runner,
            &refresh.upstream_command,
            Duration::from_millis(refresh.upstream_timeout_ms),
        )
    }
}

impl UpstreamSource for CommandSource {
    fn fetch(&self) -> Result<UsageSnapshot> {
        let output = self
            .runner
            .run(&self.command, self.timeout)
            .map_err(Error::Upstream)?;
        if output.trim().is_empty() {
            return Err(Error::Malformed("empty output".into()));
        }
        let snapshot = UsageSnapshot::parse(&output)?;
        debug!(
            active = snapshot.is_active,
            tokens = snapshot.total_tokens,
            "fetched usage snapshot"
        );
        Ok(snapshot)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommandError;
    use crate::infrastructure::runner::MockRunner;

    fn source(runner: Arc<MockRunner>) -> CommandSource {
        CommandSource::new(runner, "ccusage blocks --active --json", Duration::from_secs(1))
    }

    #[test]
    fn parses_runner_output() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(
            r#"{"isActive": true, "totalTokens": 42, "costUSD": 0.5}"#.into(),
        )]));
        let snap = source(runner.clone()).fetch().unwrap();
        assert_eq!(snap.total_tokens, 42);
        assert_eq!(
            runner.executed_commands(),
            vec!["ccusage blocks --active --json".to_string()]
        );
    }

    #[test]
    fn command_failure_is_upstream_error() {
        let runner = Arc::new(MockRunner::with_responses(vec![Err(CommandError::NotFound {
            command: "ccusage".into(),
        })]));
        let err = source(runner).fetch().unwrap_err();
        assert!(matches!(err, Error::Upstream(CommandError::NotFound { .. })));
    }

    #[test]
    fn empty_output_is_malformed() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok("\n".into())]));
        assert!(matches!(source(runner).fetch(), Err(Error::Malformed(_))));
    }
}
