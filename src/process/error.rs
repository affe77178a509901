//! Error types for spawning and running emulated processes
//!
//! Rejections surface synchronously as `SpawnError`. Anything that goes wrong
//! after a handle exists rides on the handle as a `ProcessError`.

use super::command::UnknownCommand;
use super::parser::ParseError;
use super::pid::PidError;
use super::stdio::StdioError;
use crate::image::ImageError;
use std::fmt;

/// Why `spawn`/`exec` refused to produce a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnError {
    /// Recognized name whose emulation does not exist yet
    Unsupported { command: String },

    /// Name outside the registry
    UnknownCommand { command: String, args: Vec<String> },

    /// `exec` could not tokenize the command line
    Parse(ParseError),

    /// Stdio request could not be resolved
    Stdio(StdioError),

    /// PID pool is full
    Pid(PidError),

    /// The executor refused the boot task
    Executor { reason: String },
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { command } => {
                write!(f, "the \"{}\" command is not supported yet", command)
            }
            Self::UnknownCommand { command, args } => {
                write!(f, "unknown command: {}", command)?;
                if !args.is_empty() {
                    write!(f, " with args: {}", args.join(","))?;
                }
                Ok(())
            }
            Self::Parse(e) => write!(f, "parse error: {}", e),
            Self::Stdio(e) => write!(f, "stdio error: {}", e),
            Self::Pid(e) => write!(f, "{}", e),
            Self::Executor { reason } => write!(f, "cannot schedule process: {}", reason),
        }
    }
}

impl std::error::Error for SpawnError {}

impl SpawnError {
    /// The command was turned away by the registry
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Unsupported { .. } | Self::UnknownCommand { .. })
    }
}

impl From<ParseError> for SpawnError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<StdioError> for SpawnError {
    fn from(e: StdioError) -> Self {
        Self::Stdio(e)
    }
}

impl From<PidError> for SpawnError {
    fn from(e: PidError) -> Self {
        Self::Pid(e)
    }
}

impl From<UnknownCommand> for SpawnError {
    fn from(e: UnknownCommand) -> Self {
        Self::UnknownCommand {
            command: e.0,
            args: Vec::new(),
        }
    }
}

/// Terminal failure of a process handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The image failed while loading (factory or pre-run hook)
    Boot(ImageError),
    /// The image's entry point failed
    Exec(ImageError),
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot(e) => write!(f, "boot failed: {}", e),
            Self::Exec(e) => write!(f, "execution failed: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Boot(e) | Self::Exec(e) => Some(e),
        }
    }
}

/// Collected result of a finished process
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Stdout output
    pub stdout: Vec<u8>,
    /// Stderr output
    pub stderr: Vec<u8>,
}

impl CommandResult {
    /// Check if command succeeded
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get stdout as string (lossy UTF-8)
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as string (lossy UTF-8)
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_display() {
        let err = SpawnError::UnknownCommand {
            command: "foo".to_string(),
            args: vec!["-a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "unknown command: foo with args: -a,b");
        assert!(err.is_rejection());

        let err = SpawnError::Unsupported {
            command: "node".to_string(),
        };
        assert_eq!(err.to_string(), "the \"node\" command is not supported yet");
        assert!(err.is_rejection());

        let err = SpawnError::from(ParseError::EmptyCommand);
        assert_eq!(err.to_string(), "parse error: empty command");
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_process_error_source() {
        let err = ProcessError::Exec(ImageError::Trap {
            reason: "unreachable".to_string(),
        });
        assert_eq!(err.to_string(), "execution failed: trap: unreachable");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_command_result_output() {
        let result = CommandResult {
            exit_code: 0,
            stdout: b"hello world\n".to_vec(),
            stderr: Vec::new(),
        };
        assert!(result.is_success());
        assert_eq!(result.stdout_str(), "hello world\n");
        assert_eq!(result.stderr_str(), "");
    }
}
