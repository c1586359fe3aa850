//! `cf` command-line client wrapper.
//!
//! Every [`CfSession`] owns a private temporary `CF_HOME`, so the admin and
//! regular user can be logged in at the same time without sharing a config
//! file, and nothing from the developer's own `~/.cf` leaks into a run.
//! Passwords are handed to `cf auth` through `CF_USERNAME`/`CF_PASSWORD`,
//! never argv.

use crate::truncate_for_error;
use secrecy::{ExposeSecret, SecretString};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Maximum length for command output embedded in error messages.
const MAX_ERROR_OUTPUT_LEN: usize = 1024;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("`cf {command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("`cf {command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Failed to create CF_HOME: {0}")]
    Home(std::io::Error),
}

/// Credentials and target for one platform user.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub api: String,
    pub username: String,
    pub password: SecretString,
    pub org: Option<String>,
    pub space: Option<String>,
    pub skip_ssl_validation: bool,
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default)]
pub struct CfOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Launcher for `cf` commands.
#[derive(Debug, Clone)]
pub struct CfCli {
    program: PathBuf,
    leading_args: Vec<OsString>,
    command_timeout: Duration,
}

impl CfCli {
    /// Create a client for the given `cf` executable.
    ///
    /// `command_timeout` bounds every command that isn't given an explicit
    /// timeout.
    pub fn new(program: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            command_timeout,
        }
    }

    /// Run `cf` through a wrapper, e.g. `sh fake-cf.sh`.
    ///
    /// `leading_args` are placed before every command's own arguments.
    pub fn with_leading_args<I, S>(mut self, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Log in as `user` in a fresh `CF_HOME`.
    ///
    /// Runs `api`, `auth` and, when the context names an org, `target`.
    pub async fn login(&self, user: &UserContext) -> Result<CfSession, CliError> {
        let home = tempfile::Builder::new()
            .prefix("cf-home-")
            .tempdir()
            .map_err(CliError::Home)?;

        let session = CfSession {
            cli: self.clone(),
            home,
            username: user.username.clone(),
        };

        let mut api_args = vec!["api", user.api.as_str()];
        if user.skip_ssl_validation {
            api_args.push("--skip-ssl-validation");
        }
        session.run(&api_args).await?;

        session
            .execute(
                &["auth"],
                &[
                    ("CF_USERNAME", user.username.as_str()),
                    ("CF_PASSWORD", user.password.expose_secret()),
                ],
                self.command_timeout,
            )
            .await?;

        if let Some(target_args) = target_args(user.org.as_deref(), user.space.as_deref()) {
            session.run(&target_args).await?;
        }

        info!(user = %user.username, home = %session.home().display(), "Logged in");
        Ok(session)
    }
}

/// Build `target` arguments for an org and optional space.
fn target_args<'a>(org: Option<&'a str>, space: Option<&'a str>) -> Option<Vec<&'a str>> {
    let org = org?;
    let mut args = vec!["target", "-o", org];
    if let Some(space) = space {
        args.push("-s");
        args.push(space);
    }
    Some(args)
}

/// An authenticated `cf` session with its own `CF_HOME`.
///
/// The home directory is removed when the session is dropped.
pub struct CfSession {
    cli: CfCli,
    home: TempDir,
    username: String,
}

impl std::fmt::Debug for CfSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CfSession")
            .field("username", &self.username)
            .field("home", &self.home.path())
            .finish()
    }
}

impl CfSession {
    pub fn home(&self) -> &Path {
        self.home.path()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Run a command with the default command timeout.
    pub async fn run(&self, args: &[&str]) -> Result<CfOutput, CliError> {
        self.execute(args, &[], self.cli.command_timeout).await
    }

    /// Run a command with an explicit timeout (push, start, restart).
    pub async fn run_with_timeout(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CfOutput, CliError> {
        self.execute(args, &[], timeout).await
    }

    /// `cf curl <path> [extra...]`, returning the raw response body.
    pub async fn curl(&self, path: &str, extra: &[&str]) -> Result<String, CliError> {
        let mut args = vec!["curl", path];
        args.extend_from_slice(extra);
        Ok(self.run(&args).await?.stdout)
    }

    async fn execute(
        &self,
        args: &[&str],
        envs: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<CfOutput, CliError> {
        let command_line = args.join(" ");
        debug!(command = %command_line, user = %self.username, "Running cf");

        let mut command = Command::new(&self.cli.program);
        command
            .args(&self.cli.leading_args)
            .args(args)
            .env("CF_HOME", self.home.path())
            .env("CF_COLOR", "false")
            .env_remove("CF_USERNAME")
            .env_remove("CF_PASSWORD")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in envs {
            command.env(key, value);
        }

        let started = Instant::now();
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| CliError::Timeout {
                command: command_line.clone(),
                timeout,
            })?
            .map_err(|source| CliError::Spawn {
                program: self.cli.program.display().to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        debug!(
            command = %command_line,
            code = ?output.status.code(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cf finished"
        );

        if !output.status.success() {
            return Err(CliError::CommandFailed {
                command: command_line,
                code: output.status.code(),
                stdout: truncate_for_error(&stdout, MAX_ERROR_OUTPUT_LEN),
                stderr: truncate_for_error(&stderr, MAX_ERROR_OUTPUT_LEN),
            });
        }

        Ok(CfOutput { stdout, stderr })
    }
}
