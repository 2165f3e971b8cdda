//! External command templates and execution.
//!
//! Every interaction with the operating system (route tables, link
//! inspection, daemon reloads, health checks) goes through a
//! [`CommandTemplate`] rendered with a typed parameter struct and run by a
//! [`CommandRunner`].  Templates are split on whitespace and executed
//! directly, never through a shell; only health checks are handed to
//! `sh -c` since they are free-form operator lines.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Network;

/// Values substituted into a template.  Placeholders look like `{name}`.
pub trait TemplateParams {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Parameters of the route install/verify/delete commands.
pub struct RouteParams<'a> {
    pub network: &'a Network,
    pub interface: &'a str,
}

impl TemplateParams for RouteParams<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "network" => Some(self.network.to_string()),
            "interface" => Some(self.interface.to_string()),
            _ => None,
        }
    }
}

/// Parameters of the interface existence check.
pub struct InterfaceParams<'a> {
    pub interface: &'a str,
}

impl TemplateParams for InterfaceParams<'_> {
    fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "interface" => Some(self.interface.to_string()),
            _ => None,
        }
    }
}

/// Reload commands take no parameters.
pub struct NoParams;

impl TemplateParams for NoParams {
    fn lookup(&self, _key: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(String);

impl CommandTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    /// Renders the template into an argv vector.  Unknown placeholders are
    /// kept verbatim.
    pub fn render(&self, params: &impl TemplateParams) -> Vec<String> {
        self.0
            .split_whitespace()
            .map(|token| substitute(token, params))
            .collect()
    }

    /// Renders the template as a single shell line for `sh -c`.
    pub fn render_shell(&self, params: &impl TemplateParams) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            substitute(self.0.trim(), params),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn substitute(token: &str, params: &impl TemplateParams) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match params.lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turns a non-zero exit into an [`Error::Command`].
    pub fn check(self, argv: &[String]) -> Result<CommandOutput> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Command {
                command: argv.join(" "),
                reason: format!(
                    "exit code {}: {}",
                    self.code.unwrap_or(-1),
                    self.stderr.trim()
                ),
            })
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `argv` to completion.  Fails only if the process could not be
    /// started; a non-zero exit is reported through [`CommandOutput`].
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;
}

/// Runs commands as child processes of the daemon.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Command {
            command: String::new(),
            reason: "empty command".into(),
        })?;
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Command {
                command: argv.join(" "),
                reason: e.to_string(),
            })?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command and fails on a non-zero exit.
pub async fn run_checked(runner: &dyn CommandRunner, argv: &[String]) -> Result<CommandOutput> {
    runner.run(argv).await?.check(argv)
}
