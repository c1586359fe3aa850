//! Security group fixtures.
//!
//! Two kinds of group are handled here:
//!
//! - **Running security groups**: platform-wide defaults applied to every
//!   app container. [`RunningGroupsSnapshot`] captures their names, unbinds
//!   them, and later rebinds exactly that set.
//! - **Space-scoped groups**: [`AdHocSecurityGroup`] creates a group from a
//!   rule file, binds it to one org/space, unbinds it, and deletes it.
//!
//! All operations run through an admin [`CfSession`].

use crate::cli::{CfSession, CliError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

/// Platform API path listing the running security groups.
pub const RUNNING_SECURITY_GROUPS_PATH: &str = "/v2/config/running_security_groups";

/// Prefix for temporary rule files.
const RULE_FILE_PREFIX: &str = "DATS-sg-rules";

/// Security group errors.
#[derive(Debug, Error)]
pub enum SecurityGroupError {
    #[error("cf command failed: {0}")]
    Cli(#[from] CliError),

    #[error("Failed to parse running security groups listing: {source}")]
    Listing { source: serde_json::Error },

    #[error("Failed to unbind running security group {group}: {source}")]
    Unbind { group: String, source: CliError },

    #[error("Failed to recreate running-security-group {group}: {source}")]
    Bind { group: String, source: CliError },

    #[error("Failed to write rule file: {0}")]
    RuleFile(#[from] std::io::Error),

    #[error("Failed to serialize rules: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Cannot {action} security group {group} in state {state}")]
    InvalidTransition {
        group: String,
        action: &'static str,
        state: GroupState,
    },
}

/// Transport protocol of an egress rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

/// One egress rule.
///
/// `ports` is a port, range (`"8000-9000"`) or list (`"80,443"`); rules for
/// `icmp`/`all` carry none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRule {
    pub destination: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,

    pub protocol: Protocol,
}

impl EgressRule {
    /// Allow TCP to exactly `host:port`.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            destination: host.into(),
            ports: Some(port.to_string()),
            protocol: Protocol::Tcp,
        }
    }
}

/// Rules serialized to a temporary file for `cf create-security-group`.
///
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct RuleFile {
    file: NamedTempFile,
}

impl RuleFile {
    pub fn write(rules: &[EgressRule]) -> Result<Self, SecurityGroupError> {
        let mut file = tempfile::Builder::new()
            .prefix(RULE_FILE_PREFIX)
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(file.as_file_mut(), rules)?;
        file.as_file_mut().flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// One page of `GET /v2/config/running_security_groups`.
#[derive(Debug, Deserialize)]
pub struct RunningSecurityGroupsPage {
    #[serde(default)]
    pub next_url: Option<String>,
    pub resources: Vec<SecurityGroupResource>,
}

#[derive(Debug, Deserialize)]
pub struct SecurityGroupResource {
    pub entity: SecurityGroupEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroupEntity {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<EgressRule>,
}

/// Parse one listing page.
pub fn parse_running_groups_page(
    body: &str,
) -> Result<RunningSecurityGroupsPage, SecurityGroupError> {
    serde_json::from_str(body).map_err(|source| SecurityGroupError::Listing { source })
}

/// List every running security group, following pagination.
///
/// Each page is fetched at most once; a `next_url` already visited ends the
/// listing.
pub async fn list_running_groups(
    admin: &CfSession,
) -> Result<Vec<SecurityGroupEntity>, SecurityGroupError> {
    let mut groups = Vec::new();
    let mut visited = HashSet::new();
    let mut next = Some(RUNNING_SECURITY_GROUPS_PATH.to_string());

    while let Some(path) = next {
        if !visited.insert(path.clone()) {
            warn!(next_url = %path, "Listing repeated a page; stopping");
            break;
        }
        let body = admin.curl(&path, &[]).await?;
        let page = parse_running_groups_page(&body)?;
        groups.extend(page.resources.into_iter().map(|resource| resource.entity));
        next = page.next_url.filter(|url| !url.is_empty());
    }

    Ok(groups)
}

/// Names of the running security groups captured before the scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningGroupsSnapshot {
    names: Vec<String>,
}

impl RunningGroupsSnapshot {
    /// Capture the running security groups, then unbind each of them.
    ///
    /// If an unbind fails, the groups already unbound are rebound before the
    /// error is returned, so a failed capture leaves the platform as it was.
    pub async fn capture_and_unbind(admin: &CfSession) -> Result<Self, SecurityGroupError> {
        let names: Vec<String> = list_running_groups(admin)
            .await?
            .into_iter()
            .map(|group| group.name)
            .collect();
        info!(groups = ?names, "Captured running security groups");

        let mut unbound = Vec::with_capacity(names.len());
        for name in &names {
            if let Err(source) = admin
                .run(&["unbind-running-security-group", name.as_str()])
                .await
            {
                let partial = Self { names: unbound };
                if let Err(e) = partial.restore(admin).await {
                    warn!(error = %e, "Failed to roll back partial unbind");
                }
                return Err(SecurityGroupError::Unbind {
                    group: name.clone(),
                    source,
                });
            }
            unbound.push(name.clone());
        }

        info!(count = names.len(), "Unbound running security groups");
        Ok(Self { names })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Rebind every captured group.
    ///
    /// Attempts all of them even if one fails; the first failure is returned.
    pub async fn restore(&self, admin: &CfSession) -> Result<(), SecurityGroupError> {
        let mut first_error = None;

        for name in &self.names {
            match admin
                .run(&["bind-running-security-group", name.as_str()])
                .await
            {
                Ok(_) => info!(group = %name, "Rebound running security group"),
                Err(source) => {
                    warn!(
                        group = %name,
                        error = %source,
                        "Failed to rebind running security group"
                    );
                    if first_error.is_none() {
                        first_error = Some(SecurityGroupError::Bind {
                            group: name.clone(),
                            source,
                        });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Whether the platform's running groups are exactly the captured set.
    pub async fn matches_current(&self, admin: &CfSession) -> Result<bool, SecurityGroupError> {
        let current: BTreeSet<String> = list_running_groups(admin)
            .await?
            .into_iter()
            .map(|group| group.name)
            .collect();
        let captured: BTreeSet<String> = self.names.iter().cloned().collect();
        Ok(current == captured)
    }
}

/// Lifecycle of an ad-hoc space-scoped group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Created,
    Bound,
    Unbound,
    Deleted,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::Created => "created",
            GroupState::Bound => "bound",
            GroupState::Unbound => "unbound",
            GroupState::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A security group created for one scenario run.
#[derive(Debug)]
pub struct AdHocSecurityGroup {
    name: String,
    rule_file: RuleFile,
    state: Mutex<GroupState>,
}

impl AdHocSecurityGroup {
    /// Write `rules` to a temporary file and `cf create-security-group`.
    pub async fn create(
        admin: &CfSession,
        name: impl Into<String>,
        rules: &[EgressRule],
    ) -> Result<Self, SecurityGroupError> {
        let name = name.into();
        let rule_file = RuleFile::write(rules)?;

        let rules_path = rule_file.path().to_string_lossy().into_owned();
        admin
            .run(&["create-security-group", name.as_str(), rules_path.as_str()])
            .await?;
        info!(group = %name, rules = rules.len(), "Created security group");

        Ok(Self {
            name,
            rule_file,
            state: Mutex::new(GroupState::Created),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rule_file(&self) -> &RuleFile {
        &self.rule_file
    }

    pub fn state(&self) -> GroupState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `cf bind-security-group <name> <org> <space>`.
    pub async fn bind_to_space(
        &self,
        admin: &CfSession,
        org: &str,
        space: &str,
    ) -> Result<(), SecurityGroupError> {
        self.expect_state("bind", &[GroupState::Created, GroupState::Unbound])?;
        admin
            .run(&["bind-security-group", self.name.as_str(), org, space])
            .await?;
        self.set_state(GroupState::Bound);
        info!(group = %self.name, org, space, "Bound security group to space");
        Ok(())
    }

    /// `cf unbind-security-group <name> <org> <space>`.
    pub async fn unbind_from_space(
        &self,
        admin: &CfSession,
        org: &str,
        space: &str,
    ) -> Result<(), SecurityGroupError> {
        self.expect_state("unbind", &[GroupState::Bound])?;
        admin
            .run(&["unbind-security-group", self.name.as_str(), org, space])
            .await?;
        self.set_state(GroupState::Unbound);
        info!(group = %self.name, org, space, "Unbound security group from space");
        Ok(())
    }

    /// `cf delete-security-group <name> -f`. A no-op once deleted.
    ///
    /// Deleting a group that is still bound also removes its bindings.
    pub async fn delete(&self, admin: &CfSession) -> Result<(), SecurityGroupError> {
        if self.state() == GroupState::Deleted {
            return Ok(());
        }
        admin
            .run(&["delete-security-group", self.name.as_str(), "-f"])
            .await?;
        self.set_state(GroupState::Deleted);
        info!(group = %self.name, "Deleted security group");
        Ok(())
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[GroupState],
    ) -> Result<(), SecurityGroupError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(SecurityGroupError::InvalidTransition {
                group: self.name.clone(),
                action,
                state,
            })
        }
    }

    fn set_state(&self, next: GroupState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }
}
