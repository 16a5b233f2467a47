//! Client/server round trips over a real Unix socket
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::unreachable
)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use cadence_common::{CampaignId, Signal, UserId};
use cadence_control::{
    CommandHandler, ControlAuthConfig, ControlClient, ControlError, ControlServer,
    ExperimentCommand, Request, RequestCommand, Response, ResponseData, ResponsePayload, Result,
    ScheduleCommand, SystemCommand, SystemStatus, UsageCommand,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Answers system commands and counts every request it sees
#[derive(Default)]
struct MockHandler {
    handled: AtomicUsize,
}

#[async_trait]
impl CommandHandler for MockHandler {
    async fn handle_request(&self, request: Request) -> Result<Response> {
        self.handled.fetch_add(1, Ordering::SeqCst);

        match request.command {
            RequestCommand::System(SystemCommand::Ping) => Ok(Response::ok()),
            RequestCommand::System(SystemCommand::Status) => {
                Ok(Response::data(ResponseData::SystemStatus(SystemStatus {
                    version: "0.0.1".to_string(),
                    uptime_secs: 42,
                    pending_entries: 3,
                    in_flight: 1,
                    active_tests: 0,
                })))
            }
            RequestCommand::Schedule(ScheduleCommand::EmergencyStop { campaign_id, .. }) => Ok(
                Response::data(ResponseData::Message(format!("stopped {campaign_id}"))),
            ),
            RequestCommand::Experiment(ExperimentCommand::Analyze { test_id }) => {
                Err(ControlError::ServerError(format!("test {test_id} not found")))
            }
            _ => Ok(Response::error("not implemented in mock")),
        }
    }
}

struct TestServer {
    _dir: TempDir,
    socket: String,
    handler: Arc<MockHandler>,
    shutdown: broadcast::Sender<Signal>,
    handle: tokio::task::JoinHandle<Result<()>>,
}

async fn start(auth: ControlAuthConfig) -> TestServer {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("cadence.sock").to_str().unwrap().to_string();
    let handler = Arc::new(MockHandler::default());

    let server = ControlServer::new(socket.clone(), handler.clone())
        .unwrap()
        .with_auth(auth);
    let (shutdown, receiver) = broadcast::channel(1);
    let handle = tokio::spawn(async move { server.serve(receiver).await });

    // Give the server time to bind
    for _ in 0..50 {
        if std::path::Path::new(&socket).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    TestServer {
        _dir: dir,
        socket,
        handler,
        shutdown,
        handle,
    }
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn ping_and_status_round_trip() {
    let server = start(ControlAuthConfig::default()).await;
    let client = ControlClient::new(&server.socket);

    let pong = client.send(RequestCommand::System(SystemCommand::Ping)).await.unwrap();
    assert!(matches!(pong.payload, ResponsePayload::Ok));

    let status = client.send(RequestCommand::System(SystemCommand::Status)).await.unwrap();
    match status.payload {
        ResponsePayload::Data(data) => match *data {
            ResponseData::SystemStatus(status) => {
                assert_eq!(status.pending_entries, 3);
                assert_eq!(status.in_flight, 1);
            }
            other => panic!("Expected SystemStatus, got {other:?}"),
        },
        other => panic!("Expected Data response, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn the_socket_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let server = start(ControlAuthConfig::default()).await;
    let mode = || std::fs::metadata(&server.socket).unwrap().permissions().mode() & 0o777;

    // The mode is tightened just after bind
    for _ in 0..50 {
        if mode() == 0o600 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mode(), 0o600);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn unconfirmed_emergency_stops_never_reach_the_handler() {
    let server = start(ControlAuthConfig::default()).await;
    let client = ControlClient::new(&server.socket);
    let campaign_id = CampaignId::generate();

    let err = client
        .send(RequestCommand::Schedule(ScheduleCommand::EmergencyStop {
            campaign_id,
            confirmed: false,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ControlError::ServerError(ref msg) if msg.contains("must be confirmed")));
    assert_eq!(server.handler.handled.load(Ordering::SeqCst), 0);

    let response = client
        .send(RequestCommand::Schedule(ScheduleCommand::EmergencyStop {
            campaign_id,
            confirmed: true,
        }))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(server.handler.handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn handler_errors_become_server_errors() {
    let server = start(ControlAuthConfig::default()).await;
    let client = ControlClient::new(&server.socket);

    let err = client
        .send(RequestCommand::Experiment(ExperimentCommand::Analyze {
            test_id: cadence_common::TestId::generate(),
        }))
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::ServerError(ref msg) if msg.contains("not found")));
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn tokens_are_enforced_when_enabled() {
    let server = start(ControlAuthConfig {
        enabled: true,
        // sha256("test-token")
        token_hashes: vec![
            "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e".to_string(),
        ],
    })
    .await;
    let ping = || RequestCommand::System(SystemCommand::Ping);

    let anonymous = ControlClient::new(&server.socket);
    assert!(matches!(
        anonymous.send(ping()).await,
        Err(ControlError::ServerError(ref msg)) if msg.contains("no token")
    ));

    let wrong = ControlClient::new(&server.socket).with_token("guess");
    assert!(matches!(
        wrong.send(ping()).await,
        Err(ControlError::ServerError(ref msg)) if msg.contains("Invalid")
    ));

    let authorised = ControlClient::new(&server.socket).with_token("test-token");
    assert!(authorised.send(ping()).await.is_ok());
    assert_eq!(server.handler.handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn persistent_connections_carry_many_requests() {
    let server = start(ControlAuthConfig::default()).await;
    let client = ControlClient::new(&server.socket).with_persistent_connection();

    for _ in 0..5 {
        client.send(RequestCommand::System(SystemCommand::Ping)).await.unwrap();
    }
    let unknown = client
        .send(RequestCommand::Usage(UsageCommand::Check {
            user_id: UserId::generate(),
            count: 1,
        }))
        .await;
    assert!(matches!(unknown, Err(ControlError::ServerError(_))));

    assert_eq!(server.handler.handled.load(Ordering::SeqCst), 6);
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn a_second_server_cannot_take_a_live_socket() {
    let server = start(ControlAuthConfig::default()).await;

    let rival =
        ControlServer::new(server.socket.clone(), Arc::new(MockHandler::default())).unwrap();
    let (_tx, rx) = broadcast::channel(1);
    let err = rival.serve(rx).await.unwrap_err();

    assert!(matches!(err, ControlError::Io(ref e) if e.kind() == std::io::ErrorKind::AddrInUse));
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn shutdown_removes_the_socket() {
    let server = start(ControlAuthConfig::default()).await;
    assert!(std::path::Path::new(&server.socket).exists());

    server.shutdown.send(Signal::Shutdown).unwrap();
    server.handle.await.unwrap().unwrap();

    assert!(!std::path::Path::new(&server.socket).exists());
    let client = ControlClient::new(&server.socket);
    assert!(client.check_socket_exists().is_err());
}

#[tokio::test]
#[cfg_attr(miri, ignore)]
async fn clients_without_a_server_fail_to_connect() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("missing.sock");
    let client =
        ControlClient::new(socket.to_str().unwrap()).with_timeout(Duration::from_millis(200));

    assert!(matches!(
        client.send(RequestCommand::System(SystemCommand::Ping)).await,
        Err(ControlError::Io(_))
    ));
}
