//! External command execution.
//!
//! Every interaction with the host (ip, nmcli, iptables, systemctl, the
//! daemons themselves) goes through the [`CommandRunner`] trait so the
//! provisioning steps stay testable with a scripted fake. The production
//! implementation shells out with `std::process::Command` and captures
//! stdout/stderr.

use anyhow::{Context, Result};
use std::process::Command;

use crate::error::ProvisionError;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Best diagnostic text: stderr when present, stdout otherwise.
    pub fn message(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            self.stderr.clone()
        }
    }
}

pub trait CommandRunner {
    /// Run a command and capture its output. `Err` means the binary could not
    /// be spawned at all; a non-zero exit is reported through `success`.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command, failing unless it exited successfully.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.run(program, args)?;
        if !output.success {
            return Err(ProvisionError::CommandFailed {
                program: program.to_string(),
                detail: output.message(),
            }
            .into());
        }
        Ok(output.stdout)
    }

    /// Run a command ignoring any failure. Used for best-effort operations
    /// (stopping daemons that may not exist, sysctl tuning and the like).
    fn run_unchecked(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args) {
            tracing::debug!("{} unavailable: {}", program, e);
        }
    }
}

/// Production runner backed by `std::process::Command`.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("Failed to execute {}", program))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Scripted runner for unit tests. Responses are matched by command-line
    /// prefix (longest match wins); unmatched commands succeed with empty
    /// output unless `fail_unmatched` is set. Every invocation is recorded.
    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: RefCell<Vec<(String, CommandOutput)>>,
        calls: RefCell<Vec<String>>,
        pub fail_unmatched: bool,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, prefix: &str, success: bool, stdout: &str) {
            self.responses.borrow_mut().push((
                prefix.to_string(),
                CommandOutput {
                    success,
                    stdout: stdout.to_string(),
                    stderr: if success { String::new() } else { "scripted failure".to_string() },
                },
            ));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        pub fn called_with(&self, prefix: &str) -> bool {
            self.calls.borrow().iter().any(|c| c.starts_with(prefix))
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            let line = if args.is_empty() {
                program.to_string()
            } else {
                format!("{} {}", program, args.join(" "))
            };
            self.calls.borrow_mut().push(line.clone());

            let responses = self.responses.borrow();
            let best = responses
                .iter()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());

            match best {
                Some((_, output)) => Ok(output.clone()),
                None if self.fail_unmatched => Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("no scripted response for: {}", line),
                }),
                None => Ok(CommandOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                }),
            }
        }
    }
}
