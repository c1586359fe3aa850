//! Test app lifecycle: push nora, switch it to the alternate backend, start,
//! restart, wait for it to serve, and tear it down.

use crate::cli::{CfSession, CliError};
use crate::config::{Config, SecureAddress};
use crate::eventual::{eventually, PollCategory, PollTimeouts};
use crate::probe::{AppClient, ProbeError};
use crate::random_name;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Body nora's root endpoint answers with once it is up.
pub const NORA_GREETING: &str = "hello i am nora";

/// App errors.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("cf command failed: {0}")]
    Cli(#[from] CliError),

    #[error("App request failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("App {app} never served the expected content: {reason}")]
    NotServing { app: String, reason: String },

    #[error("`cf app {app} --guid` returned no guid")]
    MissingGuid { app: String },

    #[error("Failed to enable the alternate backend for {app}: {reason}")]
    EnableBackend { app: String, reason: String },
}

/// How the test app is pushed.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub path: String,
    pub buildpack: String,
    pub stack: String,
    pub memory: String,
}

impl PushOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.nora_path.clone(),
            buildpack: config.nora_buildpack.clone(),
            stack: config.nora_stack.clone(),
            memory: config.nora_memory.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AppUpdateResponse {
    entity: AppUpdateEntity,
}

#[derive(Debug, Deserialize)]
struct AppUpdateEntity {
    diego: bool,
}

/// The deployed test app.
pub struct TestApp {
    name: String,
    client: AppClient,
    push: PushOptions,
    timeouts: PollTimeouts,
}

impl TestApp {
    pub fn new(
        name: impl Into<String>,
        client: AppClient,
        push: PushOptions,
        timeouts: PollTimeouts,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            push,
            timeouts,
        }
    }

    /// A randomly named app routed under the configured apps domain.
    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let name = random_name("");
        let client = AppClient::for_app(&name, &config.apps_domain, config.skip_ssl_validation)?;
        Ok(Self::new(
            name,
            client,
            PushOptions::from_config(config),
            PollTimeouts::from_config(config),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &AppClient {
        &self.client
    }

    /// Arguments for `cf push`. The app is pushed stopped so the backend
    /// can be switched before it is first staged.
    pub fn push_args(&self) -> Vec<&str> {
        vec![
            "push",
            self.name.as_str(),
            "-p",
            self.push.path.as_str(),
            "-b",
            self.push.buildpack.as_str(),
            "-s",
            self.push.stack.as_str(),
            "-m",
            self.push.memory.as_str(),
            "--no-start",
        ]
    }

    pub async fn push(&self, session: &CfSession) -> Result<(), AppError> {
        session
            .run_with_timeout(&self.push_args(), self.timeouts.timeout(PollCategory::CfPush))
            .await?;
        info!(app = %self.name, "Pushed app");
        Ok(())
    }

    /// `cf app <name> --guid`.
    pub async fn guid(&self, session: &CfSession) -> Result<String, AppError> {
        let output = session.run(&["app", self.name.as_str(), "--guid"]).await?;
        let guid = output.stdout.trim();
        if guid.is_empty() {
            return Err(AppError::MissingGuid {
                app: self.name.clone(),
            });
        }
        Ok(guid.to_string())
    }

    /// Switch the app to the alternate (Diego) runtime backend.
    ///
    /// `cf curl` exits zero on API errors, so the response entity is checked.
    pub async fn enable_alternate_backend(&self, session: &CfSession) -> Result<(), AppError> {
        let guid = self.guid(session).await?;
        let path = format!("/v2/apps/{}", guid);
        let body = session
            .curl(&path, &["-X", "PUT", "-d", r#"{"diego": true}"#])
            .await?;

        let response: AppUpdateResponse =
            serde_json::from_str(&body).map_err(|e| AppError::EnableBackend {
                app: self.name.clone(),
                reason: format!("unexpected response ({}): {}", e, body.trim()),
            })?;
        if !response.entity.diego {
            return Err(AppError::EnableBackend {
                app: self.name.clone(),
                reason: "platform reported diego=false".to_string(),
            });
        }

        info!(app = %self.name, guid = %guid, "Enabled alternate backend");
        Ok(())
    }

    pub async fn start(&self, session: &CfSession) -> Result<(), AppError> {
        session
            .run_with_timeout(
                &["start", self.name.as_str()],
                self.timeouts.timeout(PollCategory::CfPush),
            )
            .await?;
        info!(app = %self.name, "Started app");
        Ok(())
    }

    /// Restart so the container picks up the current security groups.
    pub async fn restart(&self, session: &CfSession) -> Result<(), AppError> {
        session
            .run_with_timeout(
                &["restart", self.name.as_str()],
                self.timeouts.timeout(PollCategory::CfPush),
            )
            .await?;
        info!(app = %self.name, "Restarted app");
        Ok(())
    }

    /// Poll the app root until its body contains `expected`.
    pub async fn wait_until_serving(&self, expected: &str) -> Result<String, AppError> {
        eventually(
            PollCategory::AppReadiness,
            self.timeouts.timeout(PollCategory::AppReadiness),
            || self.client.root(),
            |body| body.contains(expected),
        )
        .await
        .map_err(|e| AppError::NotServing {
            app: self.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Egress probe through this app.
    pub async fn egress_return_code(&self, target: &SecureAddress) -> Result<i32, ProbeError> {
        self.client.egress_return_code(target).await
    }

    /// `cf logs <name> --recent`.
    pub async fn recent_logs(&self, session: &CfSession) -> Result<String, AppError> {
        let output = session
            .run(&["logs", self.name.as_str(), "--recent"])
            .await?;
        Ok(output.stdout)
    }

    /// `cf delete <name> -f`.
    pub async fn delete(&self, session: &CfSession) -> Result<(), AppError> {
        session.run(&["delete", self.name.as_str(), "-f"]).await?;
        info!(app = %self.name, "Deleted app");
        Ok(())
    }

    /// Dump recent logs for the test output, then delete the app.
    ///
    /// The app is deleted even if fetching logs fails.
    pub async fn teardown(&self, session: &CfSession) -> Result<(), AppError> {
        match self.recent_logs(session).await {
            Ok(logs) => info!(app = %self.name, logs = %logs, "Recent app logs"),
            Err(e) => warn!(app = %self.name, error = %e, "Failed to fetch recent logs"),
        }
        self.delete(session).await
    }
}
