use std::sync::Arc;
use std::time::Duration;

use chitchat::conversations::ViewStateEvents;
use chitchat::{
    ConversationListService, LocalSessionSource, ServiceError, SettingsStore, ViewState,
};
use chitchat_storage::{
    IdentityError, MemoryRemoteStore, RemoteConversationRepository, StoreError, UserIdentity,
};
use serde_json::json;
use snafu::{ResultExt, Snafu};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
enum DemoError {
    #[snafu(display("invalid demo identity on `{stage}`: {source}"))]
    Identity {
        stage: &'static str,
        source: IdentityError,
    },
    #[snafu(display("failed to seed the in-memory store on `{stage}`: {source}"))]
    Seed { stage: &'static str, source: StoreError },
    #[snafu(display("conversation list service failed on `{stage}`: {source}"))]
    Service {
        stage: &'static str,
        source: ServiceError,
    },
    #[snafu(display("no view change arrived on `{stage}`"))]
    NoUpdate { stage: &'static str },
}

type DemoResult<T> = Result<T, DemoError>;

/// Walks one session through the conversation list against an in-memory store.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(error) = run().await {
        eprintln!("chitchat demo failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> DemoResult<()> {
    let settings = SettingsStore::load().settings();
    tracing::info!("using sync settings {settings:?}");

    let store = seeded_store();
    let repository = Arc::new(RemoteConversationRepository::new(
        Arc::new(store.clone()),
        settings.repository_config(),
    ));
    let session = LocalSessionSource::new();
    let service =
        ConversationListService::spawn(repository, &session, settings.controller_options());
    let handle = service.handle();
    let mut events = handle.subscribe().context(ServiceSnafu {
        stage: "subscribe-view-state",
    })?;

    let user = UserIdentity::parse("  A+demo@X.com ").context(IdentitySnafu {
        stage: "parse-demo-identity",
    })?;
    println!("login {user}");
    session.login(user);
    print_view("after login", &next_view(&mut events, "await-login").await?);
    println!("unread={}", handle.unread_count());

    store
        .set(
            "a-x-com/conversations/1/latest_message",
            json!({ "date": 1_261_267_800u64, "message": "Ticket resolved, please reboot", "is_read": false }),
        )
        .context(SeedSnafu {
            stage: "push-live-message",
        })?;
    if settings.live_updates {
        print_view("after new message", &next_view(&mut events, "await-update").await?);
    }

    for summary in handle.search("doctor") {
        println!("search doctor -> {}", summary.conversation_id);
    }

    session.logout();
    print_view("after logout", &next_view(&mut events, "await-logout").await?);

    service.shutdown().await.context(ServiceSnafu {
        stage: "shutdown-service",
    })
}

async fn next_view(events: &mut ViewStateEvents, stage: &'static str) -> DemoResult<ViewState> {
    tokio::time::timeout(SETTLE_TIMEOUT, events.next_settled())
        .await
        .ok()
        .flatten()
        .map(|event| event.view_state)
        .ok_or_else(|| NoUpdateSnafu { stage }.build())
}

fn print_view(label: &str, view: &ViewState) {
    match view {
        ViewState::Loading => println!("[{label}] loading"),
        ViewState::Empty => println!("[{label}] no conversations"),
        ViewState::Populated(snapshot) => {
            println!("[{label}] {} conversations", snapshot.len());
            for summary in snapshot {
                let marker = if summary.is_unread() { "*" } else { " " };
                println!(
                    "  {marker} {} ({}): {}",
                    summary.display_name, summary.other_participant, summary.latest_message.text
                );
            }
        }
    }
}

fn seeded_store() -> MemoryRemoteStore {
    MemoryRemoteStore::with_root(json!({
        "a-x-com": {
            "conversations": [
                {
                    "id": "fir5tM3ss4g35",
                    "name": "Doctor",
                    "other_user_email": "yds@gm.yds.edu.vn",
                    "latest_message": { "date": 1_261_267_200u64, "message": "Hello World", "is_read": true }
                },
                {
                    "id": "s3c0ndM3ss4g35",
                    "name": "IT",
                    "other_user_email": "uit@gm.uit.edu.vn",
                    "latest_message": { "date": 1_261_267_200u64, "message": "Hello World", "is_read": false }
                }
            ]
        }
    }))
}
