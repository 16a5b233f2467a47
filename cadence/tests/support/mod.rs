//! Shared harness for the scheduler integration tests
#![allow(dead_code)] // Test utility module - not all helpers are used in every test

use cadence::{Cadence, CadenceControlHandler, Services};
use cadence_common::{
    Campaign, ContentRef, PlanTier, ScheduleSettings, Timestamp, UserConfig, UserId,
};
use cadence_control::{
    CommandHandler, ControlError, Request, RequestCommand, ResponseData, ResponsePayload,
    UsageCommand,
};
use cadence_store::MemoryBackingStore;

/// A fully wired scheduler whose directory holds `contacts` recipients
/// tagged `news`
pub fn stack(contacts: usize) -> Services {
    let contacts = (0..contacts)
        .map(|n| {
            format!(
                r#"(recipient: (id: "news-{n}", email: "news-{n}@example.com"), tags: ["news"])"#
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    Cadence::parse(&format!("(contacts: [{contacts}])"))
        .expect("config parses")
        .build(MemoryBackingStore::new())
        .expect("services initialise")
}

/// Run a command through the handler and return the data it answered with
pub async fn data(handler: &CadenceControlHandler, command: RequestCommand) -> ResponseData {
    match handler
        .handle_request(Request::new(command))
        .await
        .expect("command succeeds")
        .payload
    {
        ResponsePayload::Data(data) => *data,
        other => panic!("Expected Data response, got {other:?}"),
    }
}

pub async fn fails(handler: &CadenceControlHandler, command: RequestCommand) -> ControlError {
    handler
        .handle_request(Request::new(command))
        .await
        .expect_err("command fails")
}

pub async fn user(handler: &CadenceControlHandler, plan: PlanTier) -> UserId {
    let user = UserConfig::new(UserId::generate(), plan);
    let user_id = user.user_id;
    data(handler, RequestCommand::Usage(UsageCommand::SetUser { user })).await;
    user_id
}

pub fn content(subject: &str) -> ContentRef {
    ContentRef::Custom {
        subject: subject.to_string(),
        html: format!("<p>{subject}</p>"),
        text: subject.to_string(),
    }
}

pub fn immediate(user: UserId) -> Campaign {
    let mut campaign = Campaign::new(user, "weekly news", vec!["news".to_string()]);
    campaign.content = content("This week");
    campaign
}

pub fn once(user: UserId, at: Timestamp) -> Campaign {
    let mut campaign = immediate(user);
    campaign.schedule = ScheduleSettings::Once { at };
    campaign
}
