//! Security Groups: egress gating
//!
//! Verifies that security groups gate outbound traffic from app containers:
//!
//! 1. With the default running security groups unbound, nora cannot reach
//!    `SECURE_ADDRESS`; the nonzero curl code is recorded as the baseline.
//! 2. A space-scoped group allowing exactly `SECURE_ADDRESS` over TCP is
//!    bound; after a restart nora reaches it (code 0).
//! 3. The group is unbound; after a restart the code returns to the baseline.
//!
//! The running security groups are rebound, the ad-hoc group deleted and the
//! app deleted on every exit path, including assertion failures.
//!
//! This test assumes the default running security groups are the only thing
//! allowing traffic to `SECURE_ADDRESS`.

#![cfg(feature = "security-groups")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use egress_tests::app::{TestApp, NORA_GREETING};
use egress_tests::cleanup::with_cleanup;
use egress_tests::cli::{CfCli, CfSession};
use egress_tests::config::Config;
use egress_tests::eventual::{eventually_equals, PollCategory, PollTimeouts};
use egress_tests::random_name;
use egress_tests::security_groups::{AdHocSecurityGroup, EgressRule, RunningGroupsSnapshot};
use egress_tests::telemetry;
use serial_test::serial;
use std::sync::Arc;
use tracing::info;

/// Everything the scenario steps share. Owned so each step can run in its
/// own task under a cleanup guard.
#[derive(Clone)]
struct Scenario {
    config: Arc<Config>,
    admin: Arc<CfSession>,
    user: Arc<CfSession>,
    app: Arc<TestApp>,
}

impl Scenario {
    fn timeouts(&self) -> PollTimeouts {
        PollTimeouts::from_config(&self.config)
    }

    /// Restart the app and wait until it serves again.
    async fn restart_and_wait(&self) {
        self.app
            .restart(&self.user)
            .await
            .expect("app should restart");
        self.app
            .wait_until_serving(NORA_GREETING)
            .await
            .expect("app should serve after restart");
    }
}

#[tokio::test]
#[serial]
async fn test_security_groups_allow_then_block_egress() {
    telemetry::init();

    let config = Config::load()
        .expect("Failed to load config - see egress_tests::config for required variables");
    let cli = CfCli::new(&config.cf_binary, config.cf_command_timeout);

    let admin = Arc::new(
        cli.login(&config.admin_context())
            .await
            .expect("admin login should succeed"),
    );
    let user = Arc::new(
        cli.login(&config.regular_context())
            .await
            .expect("regular user login should succeed"),
    );
    let app = Arc::new(TestApp::from_config(&config).expect("app client should build"));

    let snapshot = RunningGroupsSnapshot::capture_and_unbind(&admin)
        .await
        .expect("running security groups should be captured and unbound");

    let scenario = Scenario {
        config: Arc::new(config),
        admin: admin.clone(),
        user,
        app,
    };

    with_cleanup(
        "rebind running security groups",
        with_app(scenario),
        snapshot.restore(&admin),
    )
    .await
    .expect("running security groups should be rebound");

    assert!(
        snapshot
            .matches_current(&admin)
            .await
            .expect("running security groups should be listable"),
        "Running security groups after the test must equal those captured before it: {:?}",
        snapshot.names()
    );
}

/// Deploy the app and run the scenario; the app is deleted afterwards.
async fn with_app(scenario: Scenario) {
    let app = scenario.app.clone();
    let user = scenario.user.clone();

    with_cleanup(
        "delete app",
        allows_traffic_and_then_blocks_traffic(scenario),
        async move { app.teardown(&user).await },
    )
    .await
    .expect("app should be deleted");
}

async fn allows_traffic_and_then_blocks_traffic(scenario: Scenario) {
    let Scenario { admin, user, app, .. } = scenario.clone();

    info!(app = %app.name(), "Pushing it");
    app.push(&user).await.expect("app should push");

    info!("Staging and running it on the alternate backend");
    app.enable_alternate_backend(&user)
        .await
        .expect("alternate backend should be enabled");
    app.start(&user).await.expect("app should start");

    info!("Verifying it's up");
    app.wait_until_serving(NORA_GREETING)
        .await
        .expect("app should serve its greeting");

    let target = scenario.config.secure_address.clone();
    let first_curl_error = app
        .egress_return_code(&target)
        .await
        .expect("egress probe should return a well-formed response");
    assert_ne!(
        first_curl_error, 0,
        "With running security groups unbound, egress to {} should be blocked",
        target
    );

    let group = Arc::new(
        AdHocSecurityGroup::create(
            &admin,
            random_name("SG"),
            &[EgressRule::tcp(&target.host, target.port)],
        )
        .await
        .expect("security group should be created"),
    );

    let cleanup_group = group.clone();
    with_cleanup(
        "delete security group",
        with_security_group(scenario, group, first_curl_error),
        async move { cleanup_group.delete(&admin).await },
    )
    .await
    .expect("security group should be deleted");
}

async fn with_security_group(
    scenario: Scenario,
    group: Arc<AdHocSecurityGroup>,
    first_curl_error: i32,
) {
    let config = &scenario.config;
    let target = &config.secure_address;
    let timeouts = scenario.timeouts();

    group
        .bind_to_space(&scenario.admin, &config.org, &config.space)
        .await
        .expect("security group should bind to the test space");

    info!("Restarting it - with security group");
    scenario.restart_and_wait().await;

    eventually_equals(
        PollCategory::EgressConvergence,
        timeouts.timeout(PollCategory::EgressConvergence),
        || scenario.app.egress_return_code(target),
        0,
    )
    .await
    .unwrap_or_else(|e| {
        panic!(
            "Security group {} allows {}; egress should succeed: {}",
            group.name(),
            target,
            e
        )
    });

    group
        .unbind_from_space(&scenario.admin, &config.org, &config.space)
        .await
        .expect("security group should unbind from the test space");

    info!("Restarting it - without security group");
    scenario.restart_and_wait().await;

    eventually_equals(
        PollCategory::EgressConvergence,
        timeouts.timeout(PollCategory::EgressConvergence),
        || scenario.app.egress_return_code(target),
        first_curl_error,
    )
    .await
    .unwrap_or_else(|e| {
        panic!(
            "After unbinding {}, egress to {} should return to baseline code {}: {}",
            group.name(),
            target,
            first_curl_error,
            e
        )
    });
}
