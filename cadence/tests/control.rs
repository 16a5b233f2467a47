//! Drives a fully wired scheduler through its control surface
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::unreachable
)]

mod support;

use std::time::Duration;

use cadence_common::{
    AlertMetric, AlertRule, AlertSeverity, Comparison, EntryKind, EntryStatus, PlanTier, Signal,
    TestConfiguration, TestStatus, UsageWindow, UserId, Variant,
    time::{DAY_MS, now_ms},
};
use cadence_control::{
    ControlClient, ControlError, ControlServer, ExperimentCommand, MonitorCommand, RequestCommand,
    ResponseData, ResponsePayload, ScheduleCommand, SystemCommand, UsageCommand,
};
use cadence_monitor::{HealthIssue, HealthStatus};
use pretty_assertions::assert_eq;
use support::{content, data, fails, immediate, once, stack, user};
use tempfile::TempDir;
use tokio::sync::broadcast;

async fn rules(client: &ControlClient, user_id: UserId) -> Vec<AlertRule> {
    let response = client
        .send(RequestCommand::Monitor(MonitorCommand::Rules { user_id }))
        .await
        .unwrap();
    let ResponsePayload::Data(data) = response.payload else {
        panic!("Expected data");
    };
    let ResponseData::Rules(rules) = *data else {
        panic!("Expected rules");
    };
    rules
}

fn list(status: Option<EntryStatus>) -> RequestCommand {
    RequestCommand::Schedule(ScheduleCommand::List {
        status,
        campaign_id: None,
    })
}

const PROCESS_NOW: RequestCommand = RequestCommand::Schedule(ScheduleCommand::ProcessNow);

#[tokio::test]
async fn submitted_campaigns_are_delivered_on_demand() {
    let services = stack(3);
    let handler = &services.handler;
    let owner = user(handler, PlanTier::Pro).await;

    let campaign = immediate(owner);
    let campaign_id = campaign.id;
    let ResponseData::Scheduled(entries) = data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Submit {
            campaign: Box::new(campaign),
        }),
    )
    .await
    else {
        panic!("Expected scheduled entries");
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, EntryStatus::Pending);

    let ResponseData::Entries(pending) = data(handler, list(Some(EntryStatus::Pending))).await
    else {
        panic!("Expected entries");
    };
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].campaign_name, "weekly news");

    let ResponseData::Pass(report) = data(handler, PROCESS_NOW).await else {
        panic!("Expected a pass report");
    };
    assert_eq!(report.processed, 1);
    assert_eq!(report.sent, 3);

    let ResponseData::Entries(processed) = data(handler, list(Some(EntryStatus::Processed))).await
    else {
        panic!("Expected entries");
    };
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0].entry.recipient_count, Some(3));

    let ResponseData::Stats(snapshot) = data(
        handler,
        RequestCommand::Monitor(MonitorCommand::Stats { campaign_id }),
    )
    .await
    else {
        panic!("Expected stats");
    };
    assert!(!snapshot.stale);
    assert_eq!(snapshot.stats.queue.sent, 3);

    let ResponseData::SystemStatus(status) =
        data(handler, RequestCommand::System(SystemCommand::Status)).await
    else {
        panic!("Expected system status");
    };
    assert_eq!(status.pending_entries, 0);
    assert_eq!(status.active_tests, 0);
}

#[tokio::test]
async fn usage_reflects_what_was_sent() {
    let services = stack(7);
    let handler = &services.handler;
    let owner = user(handler, PlanTier::Free).await;

    data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Submit {
            campaign: Box::new(immediate(owner)),
        }),
    )
    .await;
    let ResponseData::Pass(report) = data(handler, PROCESS_NOW).await else {
        panic!("Expected a pass report");
    };
    assert_eq!(report.sent, 7);

    let check = |count| {
        RequestCommand::Usage(UsageCommand::Check {
            user_id: owner,
            count,
        })
    };

    let ResponseData::Usage(decision) = data(handler, check(5)).await else {
        panic!("Expected a usage decision");
    };
    assert!(!decision.allowed);
    assert_eq!(decision.limiting_window, Some(UsageWindow::Monthly));
    assert_eq!(decision.usage, 7);
    assert_eq!(decision.limit, 10);
    assert_eq!(decision.remaining, 3);

    let ResponseData::Usage(decision) = data(handler, check(3)).await else {
        panic!("Expected a usage decision");
    };
    assert!(decision.allowed);
}

#[tokio::test]
async fn paused_campaigns_hold_their_entries_until_resumed() {
    let services = stack(2);
    let handler = &services.handler;
    let owner = user(handler, PlanTier::Pro).await;

    let campaign = once(owner, now_ms() + DAY_MS);
    let campaign_id = campaign.id;
    data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Submit {
            campaign: Box::new(campaign),
        }),
    )
    .await;

    let ResponseData::Message(message) = data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Pause { campaign_id }),
    )
    .await
    else {
        panic!("Expected a message");
    };
    assert!(message.contains("1 pending"), "{message}");

    let ResponseData::Entries(pending) = data(handler, list(Some(EntryStatus::Pending))).await
    else {
        panic!("Expected entries");
    };
    assert!(pending.is_empty());

    let ResponseData::ResumedEntries(resumed) = data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Resume { campaign_id }),
    )
    .await
    else {
        panic!("Expected resumed entries");
    };
    assert_eq!(resumed.len(), 1);

    data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Cancel { campaign_id }),
    )
    .await;
    let err = fails(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Resume { campaign_id }),
    )
    .await;
    assert!(matches!(err, ControlError::ServerError(_)), "{err:?}");
}

#[tokio::test]
async fn emergency_stops_need_confirmation_and_are_final() {
    let services = stack(2);
    let handler = &services.handler;
    let owner = user(handler, PlanTier::Pro).await;

    let campaign = once(owner, now_ms() + DAY_MS);
    let campaign_id = campaign.id;
    data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Submit {
            campaign: Box::new(campaign),
        }),
    )
    .await;

    let stop = |confirmed| {
        RequestCommand::Schedule(ScheduleCommand::EmergencyStop {
            campaign_id,
            confirmed,
        })
    };

    let err = fails(handler, stop(false)).await;
    let ControlError::Rejected(reason) = err else {
        panic!("Expected a rejection, got {err:?}");
    };
    assert!(reason.contains("must be confirmed"));

    let ResponseData::Entries(pending) = data(handler, list(Some(EntryStatus::Pending))).await
    else {
        panic!("Expected entries");
    };
    assert_eq!(pending.len(), 1);

    let ResponseData::Stop(report) = data(handler, stop(true)).await else {
        panic!("Expected a stop report");
    };
    assert_eq!(report.skipped, 1);
    assert!(report.in_flight.is_empty());

    let ResponseData::Badge(badge) = data(
        handler,
        RequestCommand::Monitor(MonitorCommand::Badge { campaign_id }),
    )
    .await
    else {
        panic!("Expected a badge");
    };
    assert_eq!(badge.status, HealthStatus::Critical);
    assert!(badge.issues.contains(&HealthIssue::Stopped));

    fails(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Resume { campaign_id }),
    )
    .await;
}

#[tokio::test]
async fn a_test_runs_from_creation_to_rollout() {
    let services = stack(4);
    let handler = &services.handler;
    let owner = user(handler, PlanTier::Pro).await;

    let campaign = once(owner, now_ms() + DAY_MS);
    let campaign_id = campaign.id;
    data(
        handler,
        RequestCommand::Schedule(ScheduleCommand::Submit {
            campaign: Box::new(campaign),
        }),
    )
    .await;

    let ResponseData::Test(test) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::Create {
            campaign_id,
            name: "subject line".to_string(),
            variants: vec![
                Variant::new("control", true, content("A")),
                Variant::new("challenger", false, content("B")),
            ],
            configuration: TestConfiguration::default(),
        }),
    )
    .await
    else {
        panic!("Expected a test");
    };
    assert_eq!(test.status, TestStatus::Draft);
    assert_eq!(
        test.variants
            .iter()
            .map(|variant| variant.assigned_recipients.len())
            .sum::<usize>(),
        4
    );
    let test_id = test.id;

    let ResponseData::Test(test) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::Start { test_id }),
    )
    .await
    else {
        panic!("Expected a test");
    };
    assert_eq!(test.status, TestStatus::Active);

    let ResponseData::Tests(tests) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::List {
            campaign_id: Some(campaign_id),
        }),
    )
    .await
    else {
        panic!("Expected tests");
    };
    assert_eq!(tests.len(), 1);

    let ResponseData::SystemStatus(status) =
        data(handler, RequestCommand::System(SystemCommand::Status)).await
    else {
        panic!("Expected system status");
    };
    assert_eq!(status.active_tests, 1);

    let ResponseData::Pass(report) = data(handler, PROCESS_NOW).await else {
        panic!("Expected a pass report");
    };
    assert_eq!(report.sent, 4);

    let ResponseData::Analysis(analysis) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::Analyze { test_id }),
    )
    .await
    else {
        panic!("Expected an analysis");
    };
    assert_eq!(analysis.results.len(), 2);
    assert!(analysis.results[0].is_control);
    assert_eq!(analysis.winner, None);

    let challenger = test
        .variants
        .iter()
        .find(|variant| !variant.is_control)
        .unwrap()
        .id;
    let ResponseData::Test(test) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::DeclareWinner {
            test_id,
            variant_id: challenger,
        }),
    )
    .await
    else {
        panic!("Expected a test");
    };
    assert_eq!(test.status, TestStatus::Completed);
    assert_eq!(test.winning_variant_id, Some(challenger));

    let ResponseData::Entry(entry) = data(
        handler,
        RequestCommand::Experiment(ExperimentCommand::Rollout {
            test_id,
            percentage: 100,
        }),
    )
    .await
    else {
        panic!("Expected an entry");
    };
    assert_eq!(entry.kind, EntryKind::Rollout);
}

#[tokio::test]
async fn the_daemon_answers_over_its_socket() {
    let services = stack(1);
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("cadence.sock").to_str().unwrap().to_string();

    let server = ControlServer::new(socket.clone(), services.handler.clone()).unwrap();
    let (shutdown, receiver) = broadcast::channel(1);
    let handle = tokio::spawn(async move { server.serve(receiver).await });

    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = ControlClient::new(socket).with_timeout(Duration::from_secs(5));
    let response = client
        .send(RequestCommand::System(SystemCommand::Ping))
        .await
        .unwrap();
    assert!(matches!(response.payload, ResponsePayload::Ok));

    let owner = UserId::generate();
    let rule = AlertRule::new(
        owner,
        AlertMetric::BounceRate,
        Comparison::GreaterThan,
        0.05,
        AlertSeverity::Critical,
    );
    let rule_id = rule.id;

    let response = client
        .send(RequestCommand::Monitor(MonitorCommand::PutRule { rule }))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(rules(&client, owner).await.len(), 1);

    client
        .send(RequestCommand::Monitor(MonitorCommand::DeleteRule { rule_id }))
        .await
        .unwrap();
    assert!(rules(&client, owner).await.is_empty());

    let response = client
        .send(RequestCommand::System(SystemCommand::Status))
        .await
        .unwrap();
    let ResponsePayload::Data(data) = response.payload else {
        panic!("Expected data");
    };
    let ResponseData::SystemStatus(status) = *data else {
        panic!("Expected system status");
    };
    assert_eq!(status.version, "0.0.1");

    shutdown.send(Signal::Shutdown).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
