//! Security Group Egress Acceptance Suite
//!
//! This crate drives a live application platform through its `cf` command-line
//! client and verifies that security groups gate outbound traffic from
//! application containers. The platform itself is the system under test; this
//! crate only orchestrates CLI calls and HTTP probes against it.
//!
//! # Features
//!
//! - `security-groups`: running and space-scoped security group egress scenario (5-10min)
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. `cf` CLI in PATH (or `CF_BINARY` pointing at it)
//! 2. Admin and regular user credentials with an existing org/space
//! 3. A `SECURE_ADDRESS` (`host:port`) that the default running security groups block
//! 4. The nora test app published at `NORA_PATH`
//!
//! See [`config`] for the full list of environment variables.
//!
//! # Usage
//!
//! ```bash
//! # Unit tests only (no platform needed)
//! cargo test -p egress-tests
//!
//! # Live scenario - mutates platform-wide running security groups
//! cargo test -p egress-tests --features security-groups
//! ```

pub mod app;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod eventual;
pub mod probe;
pub mod security_groups;
pub mod telemetry;

use uuid::Uuid;

/// Prefix shared by every platform object this suite creates.
pub const NAME_PREFIX: &str = "DATS";

/// Generate a unique platform object name, e.g. `DATS-SG-3f2c...`.
///
/// Uses a UUID to prevent collisions across runs and leftovers from
/// aborted runs.
pub fn random_name(kind: &str) -> String {
    if kind.is_empty() {
        format!("{}-{}", NAME_PREFIX, Uuid::new_v4())
    } else {
        format!("{}-{}-{}", NAME_PREFIX, kind, Uuid::new_v4())
    }
}

/// Truncate command output or a response body before embedding it in an
/// error message.
pub(crate) fn truncate_for_error(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated]", text.get(..end).unwrap_or_default())
}
