//! Command routing tests
//!
//! Drive inbound messages through a client and check what the recording
//! platform receives. Replies are debounced, so these run on paused time.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beymax::testing::RecordingPlatform;
use beymax::{
    Arg, Author, BusError, Client, Command, CommandOutcome, CommandSuite, EventArgs, FailureKind, Message,
    ParsedArgs, PlatformError, UserId,
};

use crate::common::{ping_command, TestHarness};

const PERMISSIONS: &str = r#"
defaults:
  allow: [ping, add]
  deny: [$all]
rules:
  - users: [alice]
    allow: [secret]
"#;

fn add_command() -> Command {
    Command::new("add", |client: Client, message: Message, args: ParsedArgs| async move {
        let a: i64 = args.get("a").unwrap_or_default();
        let b: i64 = args.get("b").unwrap_or_default();
        client.send_message(&message.channel, format!("{}", a + b)).detach();
        anyhow::Ok(())
    })
    .arg(Arg::int("a"))
    .arg(Arg::int("b"))
}

fn secret_command() -> Command {
    Command::new("secret", |client: Client, message: Message, _args: ParsedArgs| async move {
        client.send_message(&message.channel, "the cake is a lie").detach();
        anyhow::Ok(())
    })
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn registered_command_replies_in_channel() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());

    harness.say("u-alice", "!ping").await;

    let sent = harness.sent(1).await;
    assert_eq!(sent[0].0.0, "general");
    assert_eq!(sent[0].1, "pong");
}

#[tokio::test(start_paused = true)]
async fn command_word_is_case_insensitive() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());

    harness.say("u-alice", "!PING").await;

    assert_eq!(harness.replies(1).await, vec!["pong"]);
}

#[tokio::test(start_paused = true)]
async fn aliases_run_the_same_handler() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command().alias("p"));

    harness.say("u-alice", "!p").await;

    assert_eq!(harness.replies(1).await, vec!["pong"]);
    assert!(harness.client.command_names().contains(&"!p".to_string()));
}

#[tokio::test(start_paused = true)]
async fn configured_prefix_replaces_bang() {
    let harness = TestHarness::builder()
        .config("prefix: \"?\"\n")
        .build()
        .expect("harness");
    harness.client.add_command(ping_command());

    harness.say("u-alice", "!ping").await;
    harness.say("u-alice", "?ping").await;

    let sent = harness.sent(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "pong");
}

#[tokio::test(start_paused = true)]
async fn arguments_are_parsed_for_the_handler() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(add_command());

    harness.say("u-alice", "!add 2 40").await;

    assert_eq!(harness.replies(1).await, vec!["42"]);
}

#[tokio::test(start_paused = true)]
async fn delimiter_splits_arguments_when_present() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(
        Command::new("pair", |client: Client, message: Message, args: ParsedArgs| async move {
            let left: String = args.get("left").unwrap_or_default();
            let right: String = args.get("right").unwrap_or_default();
            client
                .send_message(&message.channel, format!("{left}|{right}"))
                .detach();
            anyhow::Ok(())
        })
        .arg(Arg::string("left"))
        .arg(Arg::string("right"))
        .delimiter(","),
    );

    harness.say("u-alice", "!pair hot dog, ice cream").await;

    assert_eq!(harness.replies(1).await, vec!["hot dog|ice cream"]);
}

#[tokio::test(start_paused = true)]
async fn replies_to_one_channel_are_debounced_together() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(Command::new(
        "chatty",
        |client: Client, message: Message, _args: ParsedArgs| async move {
            client.send_message(&message.channel, "one").detach();
            client.send_message(&message.channel, "two").detach();
            anyhow::Ok(())
        },
    ));

    harness.say("u-alice", "!chatty").await;
    harness.sent(1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(harness.platform.sent_to("general"), vec!["one\ntwo"]);
}

#[tokio::test(start_paused = true)]
async fn command_event_follows_each_invocation() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());

    let (event, _) = tokio::join!(
        harness.client.wait_for("command", |_| true, Some(Duration::from_secs(5))),
        harness.say("u-alice", "!ping"),
    );

    let event = event.expect("command event");
    assert_eq!(event.arg::<String>(0).expect("name"), "!ping");
    let author: serde_json::Value = event.arg(1).expect("author");
    assert_eq!(author["id"], "u-alice");
}

// ============================================================================
// Permissions and arguments
// ============================================================================

#[tokio::test(start_paused = true)]
async fn denied_command_tells_the_user() {
    let harness = TestHarness::builder()
        .permissions(PERMISSIONS)
        .build()
        .expect("harness");
    harness.client.add_command(secret_command());
    harness.client.start().await.expect("start");

    let outcome = harness
        .client
        .invoke_command("secret", harness.message("u-bob", "!secret"))
        .await
        .expect("invoke");

    assert_eq!(outcome, CommandOutcome::Denied);
    assert_eq!(
        harness.replies(1).await,
        vec!["You do not have permissions to use this command"]
    );
    harness.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn user_rule_overrides_defaults() {
    let harness = TestHarness::builder()
        .permissions(PERMISSIONS)
        .build()
        .expect("harness");
    harness.client.add_command(secret_command());
    harness.client.start().await.expect("start");

    let outcome = harness
        .client
        .invoke_command("!secret", harness.message("u-alice", "!secret"))
        .await
        .expect("invoke");

    assert_eq!(outcome, CommandOutcome::Completed);
    assert_eq!(harness.replies(1).await, vec!["the cake is a lie"]);
    harness.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn bad_arguments_reply_with_usage() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(add_command());

    let outcome = harness
        .client
        .invoke_command("add", harness.message("u-alice", "!add 2 two"))
        .await
        .expect("invoke");

    let CommandOutcome::Usage(text) = outcome else {
        panic!("expected usage, got {outcome:?}");
    };
    assert!(text.starts_with("usage: !add a b"));
    assert!(text.contains("argument b: invalid int value: 'two'"));
    assert_eq!(harness.replies(1).await, vec![text]);
}

#[tokio::test]
async fn unknown_command_is_an_error() {
    let harness = TestHarness::new().expect("harness");

    let result = harness
        .client
        .invoke_command("nope", harness.message("u-alice", "!nope"))
        .await;

    assert!(result.is_err());
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn platform_failure_gets_transient_reply() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(Command::new(
        "flaky",
        |_client: Client, _message: Message, _args: ParsedArgs| async move {
            Err::<(), _>(anyhow::Error::from(PlatformError::Unavailable("gateway down".into()))
                .context("posting scoreboard"))
        },
    ));

    let outcome = harness
        .client
        .invoke_command("flaky", harness.message("u-alice", "!flaky"))
        .await
        .expect("invoke");

    assert_eq!(outcome, CommandOutcome::Failed(FailureKind::Platform));
    let replies = harness.replies(1).await;
    assert_eq!(replies[0], FailureKind::Platform.user_message());
    assert!(!replies[0].contains("gateway down"));
}

#[tokio::test(start_paused = true)]
async fn internal_failure_does_not_leak_details() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(Command::new(
        "broken",
        |_client: Client, _message: Message, _args: ParsedArgs| async move {
            Err::<(), _>(anyhow::anyhow!("index out of range in scoreboard"))
        },
    ));

    let outcome = harness
        .client
        .invoke_command("broken", harness.message("u-alice", "!broken"))
        .await
        .expect("invoke");

    assert_eq!(outcome, CommandOutcome::Failed(FailureKind::Internal));
    let replies = harness.replies(1).await;
    assert_eq!(replies[0], FailureKind::Internal.user_message());
    assert!(!replies[0].contains("scoreboard"));
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_is_contained() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());
    harness.client.add_command(Command::new(
        "explode",
        |_client: Client, _message: Message, _args: ParsedArgs| async move {
            if true {
                panic!("kaboom");
            }
            anyhow::Ok(())
        },
    ));

    let outcome = harness
        .client
        .invoke_command("explode", harness.message("u-alice", "!explode"))
        .await
        .expect("invoke");
    assert_eq!(outcome, CommandOutcome::Failed(FailureKind::Internal));

    // The client keeps serving other commands. Both replies land in the
    // same debounce window for `general`, so they arrive as one send.
    harness.say("u-alice", "!ping").await;
    let replies = harness.replies(1).await;
    assert_eq!(
        replies,
        vec![format!("{}\npong", FailureKind::Internal.user_message())]
    );
}

#[tokio::test(start_paused = true)]
async fn failures_are_traced_to_dev_channel() {
    let harness = TestHarness::builder()
        .platform(RecordingPlatform::new().with_channel("bot-dev", "c-dev"))
        .config("send_traces: true\nchannels:\n  dev: bot-dev\n")
        .build()
        .expect("harness");
    harness.client.add_command(Command::new(
        "broken",
        |_client: Client, _message: Message, _args: ParsedArgs| async move {
            Err::<(), _>(anyhow::anyhow!("scoreboard corrupted"))
        },
    ));
    harness.client.start().await.expect("start");

    harness
        .client
        .invoke_command("broken", harness.message("u-alice", "!broken"))
        .await
        .expect("invoke");

    let traces = harness.platform.sent_to("c-dev");
    assert_eq!(traces.len(), 1);
    assert!(traces[0].starts_with("```"));
    assert!(traces[0].contains("scoreboard corrupted"));
    harness.client.shutdown().await;
}

// ============================================================================
// Filtering
// ============================================================================

fn member_update(member: &Author) -> EventArgs {
    EventArgs::new().with_arg(serde_json::to_value(member).expect("author"))
}

#[tokio::test(start_paused = true)]
async fn members_with_ignored_role_are_dropped() {
    let harness = TestHarness::builder()
        .config("ignore_role: muted\n")
        .build()
        .expect("harness");
    harness.client.add_command(ping_command());
    harness.client.start().await.expect("start");

    let muted = Author::new("u-bob", "bob").with_roles(["muted"]);
    harness
        .client
        .handle_message(Message::new("general", muted.clone(), "!ping"))
        .wait()
        .await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.platform.sent().is_empty());

    // A role change marks the member ignored even where messages carry no roles.
    harness.client.dispatch("member_update", member_update(&muted)).wait().await;
    assert!(harness.client.is_ignored(&UserId::from("u-bob")));
    harness.say("u-bob", "!ping").await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.platform.sent().is_empty());

    let unmuted = Author::new("u-bob", "bob").with_roles(["regular"]);
    harness.client.dispatch("member_update", member_update(&unmuted)).wait().await;
    assert!(!harness.client.is_ignored(&UserId::from("u-bob")));
    harness.say("u-bob", "!ping").await;
    assert_eq!(harness.replies(1).await, vec!["pong"]);
    harness.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ignored_users_are_dropped() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());
    harness.client.start().await.expect("start");

    harness.client.ignore_user(UserId::from("u-bob"));
    harness.say("u-bob", "!ping").await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.platform.sent().is_empty());

    assert!(harness.client.unignore_user(&UserId::from("u-bob")));
    harness.say("u-bob", "!ping").await;
    assert_eq!(harness.replies(1).await, vec!["pong"]);
    harness.client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_users_are_dropped() {
    let harness = TestHarness::builder()
        .platform(RecordingPlatform::new().with_stranger("u-eve"))
        .build()
        .expect("harness");
    harness.client.add_command(ping_command());

    harness.say("u-eve", "!ping").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(harness.platform.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn bot_does_not_answer_itself() {
    let harness = TestHarness::new().expect("harness");
    harness.client.add_command(ping_command());

    harness.say("beymax", "!ping").await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(harness.platform.sent().is_empty());
}

// ============================================================================
// Specials and interception
// ============================================================================

fn counting_suite(first: Arc<AtomicUsize>, second: Arc<AtomicUsize>) -> CommandSuite {
    CommandSuite::new("Counting")
        .command(ping_command())
        .special(
            "greeting",
            |message: &Message| message.content.contains("hello"),
            move |_client: Client, _message: Message| {
                let first = first.clone();
                async move {
                    first.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            },
        )
        .special(
            "anything",
            |_message: &Message| true,
            move |_client: Client, _message: Message| {
                let second = second.clone();
                async move {
                    second.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            },
        )
}

#[tokio::test]
async fn first_matching_special_takes_the_message() {
    let harness = TestHarness::new().expect("harness");
    let greeting = Arc::new(AtomicUsize::new(0));
    let anything = Arc::new(AtomicUsize::new(0));
    counting_suite(greeting.clone(), anything.clone())
        .attach(&harness.client)
        .expect("attach");

    harness.say("u-alice", "hello there").await;
    assert_eq!(greeting.load(Ordering::SeqCst), 1);
    assert_eq!(anything.load(Ordering::SeqCst), 0);

    harness.say("u-alice", "good night").await;
    assert_eq!(greeting.load(Ordering::SeqCst), 1);
    assert_eq!(anything.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn commands_take_precedence_over_specials() {
    let harness = TestHarness::new().expect("harness");
    let greeting = Arc::new(AtomicUsize::new(0));
    let anything = Arc::new(AtomicUsize::new(0));
    counting_suite(greeting.clone(), anything.clone())
        .attach(&harness.client)
        .expect("attach");

    // The catch-all special would accept this message too.
    harness.say("u-alice", "!ping").await;

    assert_eq!(harness.replies(1).await, vec!["pong"]);
    assert_eq!(greeting.load(Ordering::SeqCst), 0);
    assert_eq!(anything.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_special_is_rejected() {
    let harness = TestHarness::new().expect("harness");
    let noop = |_client: Client, _message: Message| async move { anyhow::Ok(()) };

    harness
        .client
        .add_special("greeting", |_m: &Message| true, noop)
        .expect("first registration");
    let again = harness.client.add_special("greeting", |_m: &Message| true, noop);

    assert!(again.is_err());
}

#[tokio::test(start_paused = true)]
async fn waiting_for_message_preempts_specials() {
    let harness = TestHarness::new().expect("harness");
    let greeting = Arc::new(AtomicUsize::new(0));
    let anything = Arc::new(AtomicUsize::new(0));
    counting_suite(greeting.clone(), anything.clone())
        .attach(&harness.client)
        .expect("attach");

    let (received, _) = tokio::join!(
        harness.client.wait_for_message(
            |m: &Message| m.author.id.0 == "u-bob",
            Some(Duration::from_secs(30)),
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            harness.say("u-alice", "hello from alice").await;
            harness.say("u-bob", "hello from bob").await;
        },
    );

    let received = received.expect("intercepted message");
    assert_eq!(received.content, "hello from bob");
    assert_eq!(greeting.load(Ordering::SeqCst), 1);

    // Once satisfied, the waiter no longer takes messages.
    harness.say("u-bob", "hello again").await;
    assert_eq!(greeting.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_message_times_out() {
    let harness = TestHarness::new().expect("harness");

    let result = harness
        .client
        .wait_for_message(|_m: &Message| true, Some(Duration::from_secs(5)))
        .await;

    assert!(matches!(result, Err(BusError::Timeout { .. })));
}
