use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt, Snafu};

use chitchat_storage::{
    ConversationListSnapshot, ConversationRepository, IdentityError, MemoryRemoteStore,
    RemoteConversationRepository, RepositoryConfig, StoreError, StoreErrorKind, UserIdentity,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    fixture_path: Option<String>,
    identity: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    IdentityCanonical,
    FetchFixture,
    EmptyUser,
    UnknownUser,
    DuplicateIds,
    MalformedRecord,
    Offline,
    FetchTimeout,
    PreviewMonotonic,
    WatchRelease,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "identity_canonical" => Some(Self::IdentityCanonical),
            "fetch_fixture" => Some(Self::FetchFixture),
            "empty_user" => Some(Self::EmptyUser),
            "unknown_user" => Some(Self::UnknownUser),
            "duplicate_ids" => Some(Self::DuplicateIds),
            "malformed_record" => Some(Self::MalformedRecord),
            "offline" => Some(Self::Offline),
            "fetch_timeout" => Some(Self::FetchTimeout),
            "preview_monotonic" => Some(Self::PreviewMonotonic),
            "watch_release" => Some(Self::WatchRelease),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::IdentityCanonical => "identity_canonical",
            Self::FetchFixture => "fetch_fixture",
            Self::EmptyUser => "empty_user",
            Self::UnknownUser => "unknown_user",
            Self::DuplicateIds => "duplicate_ids",
            Self::MalformedRecord => "malformed_record",
            Self::Offline => "offline",
            Self::FetchTimeout => "fetch_timeout",
            Self::PreviewMonotonic => "preview_monotonic",
            Self::WatchRelease => "watch_release",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("invalid identity: {source}"))]
    Identity {
        stage: &'static str,
        source: IdentityError,
    },
    #[snafu(display("store validation failed: {source}"))]
    StoreValidation {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("failed to read fixture '{path}': {source}"))]
    ReadFixture {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse fixture '{path}': {source}"))]
    ParseFixture {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());
    if let Some(fixture_path) = args.fixture_path.as_deref() {
        println!("fixture_path={fixture_path}");
    }

    match args.scenario {
        Scenario::IdentityCanonical => run_identity_canonical(),
        Scenario::FetchFixture => run_fetch_fixture(&args).await,
        Scenario::EmptyUser => run_empty_user().await,
        Scenario::UnknownUser => run_unknown_user().await,
        Scenario::DuplicateIds => run_duplicate_ids().await,
        Scenario::MalformedRecord => run_malformed_record().await,
        Scenario::Offline => run_offline().await,
        Scenario::FetchTimeout => run_fetch_timeout().await,
        Scenario::PreviewMonotonic => run_preview_monotonic().await,
        Scenario::WatchRelease => run_watch_release().await,
        Scenario::All => run_all(&args).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut fixture_path = None;
    let mut identity = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--fixture" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-fixture-value",
                    arg: "--fixture",
                })?;
                fixture_path = Some(value);
            }
            "--identity" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-identity-value",
                    arg: "--identity",
                })?;
                identity = Some(value);
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        fixture_path,
        identity,
    })
}

async fn run_all(args: &RunnerArgs) -> RunnerResult<()> {
    run_identity_canonical()?;
    run_fetch_fixture(args).await?;
    run_empty_user().await?;
    run_unknown_user().await?;
    run_duplicate_ids().await?;
    run_malformed_record().await?;
    run_offline().await?;
    run_fetch_timeout().await?;
    run_preview_monotonic().await?;
    run_watch_release().await?;

    println!("all_passed=true");
    Ok(())
}

fn run_identity_canonical() -> RunnerResult<()> {
    let variants = ["a@x.com", "A@X.COM", " a@x.com ", "a+chat@x.com"];
    let mut keys = Vec::with_capacity(variants.len());
    for raw in variants {
        keys.push(parse_identity(raw)?.as_key().to_string());
    }

    let canonical = keys.iter().all(|key| key == "a-x-com");
    println!("identity_canonical={canonical}");
    if !canonical {
        return ScenarioFailedSnafu {
            stage: "scenario-identity-canonical",
            scenario: "identity_canonical",
            reason: format!("variants produced different keys: {keys:?}"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_fetch_fixture(args: &RunnerArgs) -> RunnerResult<()> {
    let root = match args.fixture_path.as_deref() {
        Some(path) => load_fixture(path)?,
        None => default_fixture(),
    };
    let identity = parse_identity(args.identity.as_deref().unwrap_or("a@x.com"))?;
    let store = MemoryRemoteStore::with_root(root);

    let snapshot = repository(&store)
        .fetch_all(&identity)
        .await
        .context(StoreValidationSnafu {
            stage: "scenario-fetch-fixture",
        })?;

    println!("conversation_count={}", snapshot.len());
    println!("unread_count={}", snapshot.unread_count());
    for summary in &snapshot {
        println!(
            "conversation={}\t{}\t{}",
            summary.conversation_id, summary.display_name, summary.latest_message.text
        );
    }

    if args.fixture_path.is_none() && !has_ids(&snapshot, &["fir5tM3ss4g35", "s3c0ndM3ss4g35"]) {
        return ScenarioFailedSnafu {
            stage: "scenario-fetch-fixture-assert-order",
            scenario: "fetch_fixture",
            reason: "built-in fixture was not returned in store order".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_empty_user() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(json!({ "a-x-com": { "name": "A" } }));
    let snapshot = repository(&store)
        .fetch_all(&parse_identity("a@x.com")?)
        .await
        .context(StoreValidationSnafu {
            stage: "scenario-empty-user",
        })?;

    println!("empty_snapshot={}", snapshot.is_empty());
    if !snapshot.is_empty() {
        return ScenarioFailedSnafu {
            stage: "scenario-empty-user-assert",
            scenario: "empty_user",
            reason: format!("expected no conversations, got {}", snapshot.len()),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_unknown_user() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(default_fixture());
    let outcome = repository(&store)
        .fetch_all(&parse_identity("ghost@nowhere.org")?)
        .await;

    let kind = outcome.as_ref().err().map(StoreError::kind);
    println!("unknown_user_kind={kind:?}");
    expect_kind("unknown_user", kind, StoreErrorKind::NotFound)?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_duplicate_ids() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(json!({
        "a-x-com": {
            "conversations": [
                record("c1", "Doctor", "Hello World", 1_700_000_000),
                record("c1", "Doctor", "Hello again", 1_700_000_000),
                record("c2", "IT", "Ticket closed", 1_600_000_000),
            ]
        }
    }));

    let snapshot = repository(&store)
        .fetch_all(&parse_identity("a@x.com")?)
        .await
        .context(StoreValidationSnafu {
            stage: "scenario-duplicate-ids",
        })?;

    let deduplicated = has_ids(&snapshot, &["c1", "c2"]);
    println!("deduplicated={deduplicated}");
    if !deduplicated {
        return ScenarioFailedSnafu {
            stage: "scenario-duplicate-ids-assert",
            scenario: "duplicate_ids",
            reason: "duplicate conversation ids leaked into the snapshot".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_malformed_record() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(json!({
        "a-x-com": { "conversations": [ { "id": "c1", "name": false } ] }
    }));
    let outcome = repository(&store)
        .fetch_all(&parse_identity("a@x.com")?)
        .await;

    let kind = outcome.as_ref().err().map(StoreError::kind);
    println!("malformed_record_kind={kind:?}");
    expect_kind("malformed_record", kind, StoreErrorKind::Decode)?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_offline() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(default_fixture());
    store.set_offline(true);
    let outcome = repository(&store)
        .fetch_all(&parse_identity("a@x.com")?)
        .await;

    let retryable = outcome.as_ref().err().is_some_and(StoreError::is_retryable);
    let kind = outcome.as_ref().err().map(StoreError::kind);
    println!("offline_kind={kind:?}");
    println!("offline_retryable={retryable}");
    expect_kind("offline", kind, StoreErrorKind::Network)?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_fetch_timeout() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(default_fixture());
    store.set_read_latency(Some(Duration::from_millis(200)));
    let repository = RemoteConversationRepository::new(
        Arc::new(store.clone()),
        RepositoryConfig {
            fetch_timeout: Some(Duration::from_millis(20)),
            ..RepositoryConfig::default()
        },
    );

    let outcome = repository.fetch_all(&parse_identity("a@x.com")?).await;
    let timed_out = matches!(outcome, Err(StoreError::FetchTimeout { .. }));
    println!("fetch_timed_out={timed_out}");
    expect_kind(
        "fetch_timeout",
        outcome.as_ref().err().map(StoreError::kind),
        StoreErrorKind::Network,
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_preview_monotonic() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(json!({
        "a-x-com": { "conversations": [ record("c1", "Doctor", "newest", 200) ] }
    }));
    let repository = repository(&store);
    let identity = parse_identity("a@x.com")?;

    repository
        .fetch_all(&identity)
        .await
        .context(StoreValidationSnafu {
            stage: "scenario-preview-monotonic-first",
        })?;

    store
        .set(
            "a-x-com/conversations/0",
            record("c1", "Doctor", "stale replica", 100),
        )
        .context(StoreValidationSnafu {
            stage: "scenario-preview-monotonic-regress",
        })?;

    let second = repository
        .fetch_all(&identity)
        .await
        .context(StoreValidationSnafu {
            stage: "scenario-preview-monotonic-second",
        })?;

    let preview_text = second
        .get("c1")
        .map(|summary| summary.latest_message.text.clone())
        .unwrap_or_default();
    let monotonic = preview_text == "newest";
    println!("preview_monotonic={monotonic}");
    if !monotonic {
        return ScenarioFailedSnafu {
            stage: "scenario-preview-monotonic-assert",
            scenario: "preview_monotonic",
            reason: format!("older preview '{preview_text}' replaced a newer one"),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

async fn run_watch_release() -> RunnerResult<()> {
    let store = MemoryRemoteStore::with_root(default_fixture());
    let handle = repository(&store)
        .subscribe_to_updates(&parse_identity("a@x.com")?)
        .context(StoreValidationSnafu {
            stage: "scenario-watch-release-subscribe",
        })?;

    let mut updates = handle.updates;
    let worker = tokio::spawn(handle.worker);
    let initial_ok = matches!(updates.recv().await, Some(Ok(_)));
    let watchers_while_subscribed = store.active_watchers();

    updates.unsubscribe();
    let worker_finished = worker.await.is_ok();
    let watchers_after = store.active_watchers();

    println!("initial_update={initial_ok}");
    println!("watchers_while_subscribed={watchers_while_subscribed}");
    println!("watchers_after_unsubscribe={watchers_after}");

    if !initial_ok || !worker_finished || watchers_while_subscribed != 1 || watchers_after != 0 {
        return ScenarioFailedSnafu {
            stage: "scenario-watch-release-assert",
            scenario: "watch_release",
            reason: "remote watch was not released after unsubscribe".to_string(),
        }
        .fail();
    }

    println!("runner_ok=true");
    Ok(())
}

fn repository(store: &MemoryRemoteStore) -> RemoteConversationRepository {
    RemoteConversationRepository::new(Arc::new(store.clone()), RepositoryConfig::default())
}

fn parse_identity(raw: &str) -> RunnerResult<UserIdentity> {
    UserIdentity::parse(raw).context(IdentitySnafu {
        stage: "parse-identity",
    })
}

fn load_fixture(path: &str) -> RunnerResult<Value> {
    let contents = std::fs::read_to_string(path).context(ReadFixtureSnafu {
        stage: "load-fixture-read",
        path: path.to_string(),
    })?;
    serde_json::from_str(&contents).context(ParseFixtureSnafu {
        stage: "load-fixture-parse",
        path: path.to_string(),
    })
}

fn default_fixture() -> Value {
    json!({
        "a-x-com": {
            "conversations": [
                {
                    "id": "fir5tM3ss4g35",
                    "name": "Doctor",
                    "other_user_email": "yds@gm.yds.edu.vn",
                    "latest_message": { "date": 1_261_267_200u64, "message": "Hello World", "is_read": false }
                },
                {
                    "id": "s3c0ndM3ss4g35",
                    "name": "IT",
                    "other_user_email": "uit@gm.uit.edu.vn",
                    "latest_message": { "date": 1_261_267_200u64, "message": "Hello World", "is_read": false }
                }
            ]
        }
    })
}

fn record(id: &str, name: &str, text: &str, date: u64) -> Value {
    json!({
        "id": id,
        "name": name,
        "other_user_email": format!("{}@peer.org", name.to_lowercase()),
        "latest_message": { "date": date, "message": text, "is_read": false }
    })
}

fn has_ids(snapshot: &ConversationListSnapshot, expected: &[&str]) -> bool {
    let ids = snapshot
        .iter()
        .map(|summary| summary.conversation_id.as_str())
        .collect::<Vec<_>>();
    ids == expected
}

fn expect_kind(
    scenario: &'static str,
    actual: Option<StoreErrorKind>,
    expected: StoreErrorKind,
) -> RunnerResult<()> {
    if actual == Some(expected) {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage: "scenario-expect-error-kind",
        scenario,
        reason: format!("expected {expected:?} failure, got {actual:?}"),
    }
    .fail()
}
