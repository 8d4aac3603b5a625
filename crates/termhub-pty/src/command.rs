//! Exec command building.

use thiserror::Error;

/// Exec command build error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecCommandError {
    #[error("Command cannot be parsed: {0}")]
    InvalidCommand(String),
    #[error("Command is empty after parsing")]
    EmptyCommand,
    #[error("Invalid container id: {0:?}")]
    InvalidContainerId(String),
}

/// Builder for the argument list of `docker exec`.
#[derive(Debug, Clone)]
pub struct ExecCommand {
    container_id: String,
    command: String,
    env: Vec<(String, String)>,
}

impl ExecCommand {
    /// Create a builder for `command` inside `container_id`.
    #[must_use]
    pub fn new<C: Into<String>, S: Into<String>>(container_id: C, command: S) -> Self {
        Self {
            container_id: container_id.into(),
            command: command.into(),
            env: Vec::new(),
        }
    }

    /// Export a variable into the execution.
    #[must_use]
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Arguments following the runtime binary.
    ///
    /// # Errors
    /// Returns error if the container id or command is invalid.
    pub fn build(&self) -> Result<Vec<String>, ExecCommandError> {
        let id = self.container_id.trim();
        if id.is_empty() || id.starts_with('-') || id.chars().any(char::is_whitespace) {
            return Err(ExecCommandError::InvalidContainerId(
                self.container_id.clone(),
            ));
        }

        let parts = shlex::split(&self.command)
            .ok_or_else(|| ExecCommandError::InvalidCommand(self.command.clone()))?;
        if parts.is_empty() {
            return Err(ExecCommandError::EmptyCommand);
        }

        let mut args = vec!["exec".to_string(), "-i".to_string(), "-t".to_string()];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(id.to_string());
        args.extend(parts);
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_with_env() {
        let args = ExecCommand::new("web-1", "/bin/bash")
            .env("TERM", "xterm-256color")
            .build()
            .unwrap();

        assert_eq!(
            args,
            vec!["exec", "-i", "-t", "-e", "TERM=xterm-256color", "web-1", "/bin/bash"]
        );
    }

    #[test]
    fn test_build_splits_quoted_command() {
        let args = ExecCommand::new("abc123", r#"sh -c "echo 'hi there'""#)
            .build()
            .unwrap();

        assert_eq!(&args[args.len() - 3..], ["sh", "-c", "echo 'hi there'"]);
    }

    #[test]
    fn test_build_rejects_flag_like_container() {
        let err = ExecCommand::new("--privileged", "sh").build().unwrap_err();
        assert!(matches!(err, ExecCommandError::InvalidContainerId(_)));
    }

    #[test]
    fn test_build_rejects_empty_command() {
        assert_eq!(
            ExecCommand::new("c1", "   ").build(),
            Err(ExecCommandError::EmptyCommand)
        );
        assert!(matches!(
            ExecCommand::new("c1", "echo \"unterminated").build(),
            Err(ExecCommandError::InvalidCommand(_))
        ));
    }
}
