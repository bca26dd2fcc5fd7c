//! Error types for usagebar-core.
//!
//! Every fallible operation returns [`Result`]. External commands fail with a
//! typed [`CommandError`], which callers wrap with the context of the call
//! (upstream metrics command vs. multiplexer store) so the recovery layer can
//! classify failures without sniffing message text.

use std::path::PathBuf;

use thiserror::Error;


/// Failure of a single external command invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The shell could not find the program (exit status 127).
    #[error("`{command}`: command not found")]
    NotFound { command: String },

    /// The command did not finish before its deadline and was killed.
    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    /// The command ran and exited unsuccessfully.
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The command could not be spawned at all.
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Captured stderr for `Failed`, empty otherwise.
    pub fn stderr(&self) -> &str {
        match self {
            CommandError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}


/// Crate-wide error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The upstream metrics command failed.
    #[error("upstream metrics command failed: {0}")]
    Upstream(#[source] CommandError),

    /// A multiplexer option-table command failed.
    #[error("multiplexer store command failed: {0}")]
    Store(#[source] CommandError),

    /// Upstream output could not be interpreted as a usage snapshot.
    #[error("malformed upstream response: {0}")]
    Malformed(String),

    /// Configuration is unreadable or fails validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another live process holds the single-instance lock.
    #[error("lock {} is held by pid {pid}", path.display())]
    LockHeld { path: PathBuf, pid: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    /// Anything that does not fit the other variants.
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_messages_name_the_command() {
        let e = CommandError::Timeout {
            command: "ccusage blocks".into(),
            timeout_ms: 15_000,
        };
        assert_eq!(e.to_string(), "`ccusage blocks` timed out after 15000ms");

        let e = CommandError::Failed {
            command: "tmux show-options -g".into(),
            code: Some(1),
            stderr: "no server running".into(),
        };
        assert!(e.to_string().contains("no server running"));
        assert_eq!(e.stderr(), "no server running");
    }

    #[test]
    fn context_wrappers_prefix_the_message() {
        let e = Error::Upstream(CommandError::NotFound {
            command: "ccusage".into(),
        });
        assert!(e.to_string().starts_with("upstream metrics command failed"));

        let e = Error::LockHeld {
            path: PathBuf::from("/tmp/usagebar.lock"),
            pid: 42,
        };
        assert_eq!(e.to_string(), "lock /tmp/usagebar.lock is held by pid 42");
    }
}
