//! Integration tests for the sender and receiver protocols.
//!
//! Every test runs two (or more) contexts inside one [`MemoryBrowser`] and
//! drives them through real `Messenger`s. Time is paused, so retransmission
//! ticks and deadlines advance deterministically without wall-clock waits.

use crossmsg_wire::config::load_config;
use crossmsg_wire::memory::{MemoryBrowser, MemoryContext, PostRecord};
use crossmsg_wire::message::{AckEnvelope, Envelope};
use crossmsg_wire::peer::Environment;
use crossmsg_wire::{
    AbortReason, ExchangeError, Messenger, OpenOptions, ReceiveOptions, SendOptions, SendReceipt,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_pending;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Pair {
    browser: MemoryBrowser,
    sender_ctx: MemoryContext,
    receiver_ctx: MemoryContext,
    sender: Messenger,
    receiver: Messenger,
}

impl Pair {
    fn new(sender_url: &str, receiver_url: &str) -> Self {
        init_tracing();
        let browser = MemoryBrowser::new();
        let sender_ctx = browser.open_context(sender_url);
        let receiver_ctx = browser.open_context(receiver_url);
        Self {
            sender: Messenger::new(Arc::new(sender_ctx.clone())),
            receiver: Messenger::new(Arc::new(receiver_ctx.clone())),
            browser,
            sender_ctx,
            receiver_ctx,
        }
    }

    fn same_site() -> Self {
        Self::new("https://app.example.com/", "https://app.example.com/inbox")
    }

    /// Options addressing the receiver by handle.
    fn to_receiver(&self) -> SendOptions {
        SendOptions::new().peer(self.sender_ctx.handle_for(&self.receiver_ctx))
    }

    fn data_sent(&self) -> Vec<PostRecord> {
        self.browser
            .posts_between(self.sender_ctx.id(), self.receiver_ctx.id())
            .into_iter()
            .filter(PostRecord::is_data)
            .collect()
    }

    fn acks_sent(&self) -> Vec<PostRecord> {
        self.browser
            .posts_between(self.receiver_ctx.id(), self.sender_ctx.id())
            .into_iter()
            .filter(PostRecord::is_ack)
            .collect()
    }
}

fn cancelled<T>(key: &str) -> Result<T, ExchangeError> {
    Err(ExchangeError::Aborted {
        key: key.into(),
        reason: AbortReason::Cancelled,
    })
}

fn millis_since(start: Instant, at: Instant) -> u64 {
    at.duration_since(start).as_millis() as u64
}

fn assert_near(actual_ms: u64, expected_ms: u64) {
    assert!(
        actual_ms.abs_diff(expected_ms) <= 5,
        "expected ~{expected_ms}ms, got {actual_ms}ms"
    );
}

// ---------------------------------------------------------------------------
// Sender protocol
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_single_flight_rejects_second_initiate() {
    let pair = Pair::same_site();

    let first = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver())
        .unwrap();
    let err = pair
        .sender
        .initiate_with_retry("k", json!(2), pair.to_receiver())
        .unwrap_err();

    assert_eq!(err, ExchangeError::KeyInUse { key: "k".into() });
    assert!(err.is_fail_fast());
    assert_eq!(pair.browser.posts().len(), 1, "rejected call must send nothing");

    assert!(pair.sender.cancel("k"));
    assert_eq!(first.await, cancelled("k"));
}

#[tokio::test(start_paused = true)]
async fn test_ack_short_circuits_retry() {
    let pair = Pair::same_site();
    let received = pair.receiver.await_once("k", ReceiveOptions::new());

    let sent = pair
        .sender
        .initiate_with_retry(
            "k",
            json!({"n": 1}),
            pair.to_receiver().interval_ms(100).deadline_ms(1_000),
        )
        .unwrap();

    assert_eq!(sent.await, Ok(SendReceipt { key: "k".into() }));
    assert_eq!(received.await, Ok(json!({"n": 1})));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pair.data_sent().len(), 1, "no retransmission after the Ack");
    assert_eq!(pair.acks_sent().len(), 1);
    assert_eq!(pair.sender.registry().key_count(), 0);
    assert_eq!(pair.receiver.registry().key_count(), 0);
    assert_eq!(pair.sender_ctx.listener_count(), 0);
    assert_eq!(pair.receiver_ctx.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cadence() {
    let pair = Pair::same_site();
    let start = Instant::now();

    let sent = pair
        .sender
        .initiate_with_retry(
            "k",
            json!("payload"),
            pair.to_receiver().interval_ms(100).deadline_ms(450),
        )
        .unwrap();

    assert_eq!(
        sent.await,
        Err(ExchangeError::Timeout {
            key: "k".into(),
            deadline_ms: 450,
        })
    );
    assert_near(start.elapsed().as_millis() as u64, 450);

    let data = pair.data_sent();
    assert_eq!(data.len(), 5);
    for (record, expected) in data.iter().zip([0, 100, 200, 300, 400]) {
        assert_near(millis_since(start, record.at), expected);
    }

    // Every retransmission carries a fresh id.
    let mut ids: Vec<String> = data
        .iter()
        .filter_map(|r| r.envelope.as_ref().map(|e| e.id().to_string()))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_key_reusable_after_terminal_state() {
    let pair = Pair::same_site();

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver().interval_ms(50).deadline_ms(120))
        .unwrap();
    assert!(matches!(sent.await, Err(ExchangeError::Timeout { .. })));
    assert!(!pair.sender.registry().contains("k"));

    let received = pair.receiver.await_once("k", ReceiveOptions::new());
    let sent = pair
        .sender
        .initiate_with_retry("k", json!(2), pair.to_receiver())
        .unwrap();
    assert!(sent.await.is_ok());
    assert_eq!(received.await, Ok(json!(2)));
}

#[tokio::test(start_paused = true)]
async fn test_downgrade_rejected_before_sending() {
    let pair = Pair::new("https://app.example.com/", "http://legacy.example.com/");

    let err = pair
        .sender
        .initiate_with_retry(
            "k",
            json!(1),
            pair.to_receiver().target_origin("http://legacy.example.com"),
        )
        .unwrap_err();

    assert!(matches!(err, ExchangeError::SecurityPolicyViolation { .. }));
    assert!(pair.browser.posts().is_empty());
    assert!(!pair.sender.registry().contains("k"));
}

#[tokio::test(start_paused = true)]
async fn test_target_origin_mismatch_drops_data() {
    let pair = Pair::new("https://app.example.com/", "https://login.example.com/");
    let received = pair.receiver.await_once("k", ReceiveOptions::new());

    // The receiver is not at the addressed origin: Data never arrives.
    let sent = pair
        .sender
        .initiate_with_retry(
            "k",
            json!(1),
            pair.to_receiver()
                .target_origin("https://other.example.com")
                .interval_ms(100)
                .deadline_ms(300),
        )
        .unwrap();

    assert!(matches!(sent.await, Err(ExchangeError::Timeout { .. })));
    let mut probe = tokio_test::task::spawn(received.clone());
    assert_pending!(probe.poll());
    pair.receiver.cancel("k");
}

#[tokio::test(start_paused = true)]
async fn test_ack_from_another_context_is_ignored() {
    let pair = Pair::same_site();
    let intruder = pair.browser.open_context("https://app.example.com/intruder");

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver().interval_ms(100).deadline_ms(300))
        .unwrap();
    let forged = Envelope::Ack(AckEnvelope {
        key: "k".into(),
        expect_ack: false,
        id: "forged".into(),
    });
    intruder
        .handle_for(&pair.sender_ctx)
        .post_message(forged.to_value(), "*")
        .unwrap();

    assert!(matches!(sent.await, Err(ExchangeError::Timeout { .. })));
    assert_eq!(pair.data_sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_closed_peer_is_unreachable_on_next_tick() {
    let pair = Pair::same_site();
    let start = Instant::now();

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver().interval_ms(100).deadline_ms(1_000))
        .unwrap();

    let receiver_ctx = pair.receiver_ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        receiver_ctx.close();
    });

    assert_eq!(sent.await, Err(ExchangeError::PeerUnreachable { key: "k".into() }));
    assert_near(start.elapsed().as_millis() as u64, 200);
    assert_eq!(pair.data_sent().len(), 2);
    assert!(!pair.sender.registry().contains("k"));
}

#[tokio::test(start_paused = true)]
async fn test_hidden_liveness_retries_until_timeout() {
    let pair = Pair::same_site();
    pair.receiver_ctx.hide_liveness(true);

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver().interval_ms(100).deadline_ms(450))
        .unwrap();

    let receiver_ctx = pair.receiver_ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        receiver_ctx.close();
    });

    assert_eq!(
        sent.await,
        Err(ExchangeError::Timeout {
            key: "k".into(),
            deadline_ms: 450,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_config_supplies_defaults() {
    init_tracing();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "interval_ms = 100").unwrap();
    writeln!(file, "deadline_ms = 250").unwrap();
    let config = load_config(Some(file.path()));

    let browser = MemoryBrowser::new();
    let sender_ctx = browser.open_context("https://app.example.com/");
    let receiver_ctx = browser.open_context("https://app.example.com/inbox");
    let sender = Messenger::with_config(Arc::new(sender_ctx.clone()), config);

    let sent = sender
        .initiate_with_retry(
            "k",
            json!(1),
            SendOptions::new().peer(sender_ctx.handle_for(&receiver_ctx)),
        )
        .unwrap();
    assert_eq!(
        sent.await,
        Err(ExchangeError::Timeout {
            key: "k".into(),
            deadline_ms: 250,
        })
    );
    assert_eq!(browser.posts().len(), 3);
}

// ---------------------------------------------------------------------------
// Receiver protocol
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_duplicates_resolve_once_and_ack_once() {
    let pair = Pair::same_site();
    let received = pair.receiver.await_once("k", ReceiveOptions::new());

    let raw = pair.sender_ctx.handle_for(&pair.receiver_ctx);
    for n in 0..5 {
        let data = Envelope::data("k", json!(n));
        raw.post_message(data.to_value(), "*").unwrap();
    }

    assert_eq!(received.await, Ok(json!(0)));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pair.acks_sent().len(), 1);
    assert!(!pair.receiver.registry().contains("k"));
}

#[tokio::test(start_paused = true)]
async fn test_second_await_joins_first() {
    let pair = Pair::same_site();
    let first = pair.receiver.await_once("k", ReceiveOptions::new());
    let second = pair.receiver.await_once("k", ReceiveOptions::new());
    assert_eq!(pair.receiver_ctx.listener_count(), 1);
    assert_eq!(pair.receiver.registry().inbound_count(), 1);

    let sent = pair
        .sender
        .initiate_with_retry("k", json!("once"), pair.to_receiver())
        .unwrap();
    assert!(sent.await.is_ok());
    assert_eq!(first.await, Ok(json!("once")));
    assert_eq!(second.await, Ok(json!("once")));
    assert_eq!(pair.acks_sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disallowed_origin_leaves_receiver_pending() {
    let pair = Pair::new("https://app.example.com/", "https://login.example.com/");
    let received = pair.receiver.await_once(
        "k",
        ReceiveOptions::new().allow_origin("https://trusted.example.com"),
    );

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver().interval_ms(100).deadline_ms(300))
        .unwrap();
    assert!(matches!(sent.await, Err(ExchangeError::Timeout { .. })));

    let mut probe = tokio_test::task::spawn(received.clone());
    assert_pending!(probe.poll());
    assert!(pair.acks_sent().is_empty());

    assert!(pair.receiver.cancel("k"));
    assert_eq!(received.await, cancelled("k"));
}

#[tokio::test(start_paused = true)]
async fn test_expected_peer_filters_sources() {
    init_tracing();
    let browser = MemoryBrowser::new();
    let receiver_ctx = browser.open_context("https://app.example.com/inbox");
    let trusted = browser.open_context("https://app.example.com/trusted");
    let intruder = browser.open_context("https://app.example.com/intruder");
    let receiver = Messenger::new(Arc::new(receiver_ctx.clone()));

    let received = receiver.await_once(
        "k",
        ReceiveOptions::new().expect_peer(receiver_ctx.handle_for(&trusted)),
    );

    let intruder_messenger = Messenger::new(Arc::new(intruder.clone()));
    let trusted_messenger = Messenger::new(Arc::new(trusted.clone()));
    let _ = intruder_messenger
        .initiate_with_retry("k", json!("forged"), SendOptions::new().peer(intruder.handle_for(&receiver_ctx)))
        .unwrap();
    let sent = trusted_messenger
        .initiate_with_retry("k", json!("real"), SendOptions::new().peer(trusted.handle_for(&receiver_ctx)))
        .unwrap();

    assert!(sent.await.is_ok());
    assert_eq!(received.await, Ok(json!("real")));
    intruder_messenger.cancel("k");
}

#[tokio::test(start_paused = true)]
async fn test_receiver_aborts_when_channel_closes() {
    let pair = Pair::same_site();
    let received = pair.receiver.await_once("k", ReceiveOptions::new());

    pair.receiver_ctx.close();
    assert_eq!(
        received.await,
        Err(ExchangeError::Aborted {
            key: "k".into(),
            reason: AbortReason::ChannelClosed,
        })
    );
    assert!(!pair.receiver.registry().contains("k"));
}

// ---------------------------------------------------------------------------
// Registry coupling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_cancel_settles_both_sides_and_frees_key() {
    let pair = Pair::same_site();
    let received = pair.sender.await_once("k", ReceiveOptions::new());
    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver())
        .unwrap();
    assert_eq!(pair.sender.registry().snapshot().len(), 2);

    assert!(pair.sender.cancel("k"));
    assert_eq!(sent.await, cancelled("k"));
    assert_eq!(received.await, cancelled("k"));
    assert_eq!(pair.sender_ctx.listener_count(), 0);

    let again = pair
        .sender
        .initiate_with_retry("k", json!(2), pair.to_receiver())
        .unwrap();
    assert!(pair.sender.cancel("k"));
    assert!(again.await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_ack_purges_inbound_on_same_key() {
    let pair = Pair::same_site();
    let own_inbound = pair.sender.await_once("k", ReceiveOptions::new());
    let received = pair.receiver.await_once("k", ReceiveOptions::new());

    let sent = pair
        .sender
        .initiate_with_retry("k", json!(1), pair.to_receiver())
        .unwrap();

    assert!(sent.await.is_ok());
    assert_eq!(received.await, Ok(json!(1)));
    assert_eq!(
        own_inbound.await,
        Err(ExchangeError::Aborted {
            key: "k".into(),
            reason: AbortReason::PairedCleanup,
        })
    );
    assert_eq!(pair.sender.registry().key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_independent_keys_run_concurrently() {
    let pair = Pair::same_site();
    let a = pair.receiver.await_once("a", ReceiveOptions::new());
    let b = pair.receiver.await_once("b", ReceiveOptions::new());

    let sent_b = pair
        .sender
        .initiate_with_retry("b", json!("B"), pair.to_receiver())
        .unwrap();
    let sent_a = pair
        .sender
        .initiate_with_retry("a", json!("A"), pair.to_receiver())
        .unwrap();

    let (ra, rb, sa, sb) = tokio::join!(a, b, sent_a, sent_b);
    assert_eq!(ra, Ok(json!("A")));
    assert_eq!(rb, Ok(json!("B")));
    assert!(sa.is_ok() && sb.is_ok());
}

// ---------------------------------------------------------------------------
// Resolution and opening
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_peer_name_reaches_announced_receiver() {
    let pair = Pair::same_site();
    let received = pair
        .receiver
        .await_once("k", ReceiveOptions::new().announce_as("inbox"));
    assert_eq!(pair.receiver_ctx.name(), "inbox");

    let sent = pair
        .sender
        .initiate_with_retry("k", json!("named"), SendOptions::new().peer_name("inbox"))
        .unwrap();
    assert!(sent.await.is_ok());
    assert_eq!(received.await, Ok(json!("named")));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_peer_name_is_unresolved_without_leaks() {
    let pair = Pair::same_site();
    let before = pair.browser.open_count();

    let err = pair
        .sender
        .initiate_with_retry("k", json!(1), SendOptions::new().peer_name("nobody"))
        .unwrap_err();

    assert_eq!(err, ExchangeError::UnresolvedTarget { key: "k".into() });
    assert_eq!(pair.browser.open_count(), before);
    assert!(pair.browser.posts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_popup_replies_to_its_opener() {
    init_tracing();
    let browser = MemoryBrowser::new();
    let main = browser.open_context("https://app.example.com/");
    let popup = main.open_popup("https://app.example.com/popup").unwrap();

    let main_messenger = Messenger::new(Arc::new(main.clone()));
    let popup_messenger = Messenger::new(Arc::new(popup.clone()));

    let received = main_messenger.await_once("result", ReceiveOptions::new());
    // No handle and no name: the opener is found structurally.
    let sent = popup_messenger
        .initiate_with_retry("result", json!({"ok": true}), SendOptions::new())
        .unwrap();

    assert!(sent.await.is_ok());
    assert_eq!(received.await, Ok(json!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn test_end_to_end_login_flow() {
    init_tracing();
    let browser = MemoryBrowser::new();
    browser.set_latency(Duration::from_millis(45));
    let main = browser.open_context("https://app.example.com/");
    let main_messenger = Messenger::new(Arc::new(main.clone()));
    let start = Instant::now();

    let sent = main_messenger
        .open_peer_and_initiate(
            "https://login.example.com/callback",
            "login",
            json!({"token": "abc"}),
            OpenOptions::new().interval_ms(100).deadline_ms(500),
        )
        .unwrap();

    let popup = browser.opened_by(main.id()).pop().unwrap();
    assert_eq!(popup.origin(), "https://login.example.com");

    // The popup takes a while to load before it starts listening.
    let popup_for_task = popup.clone();
    let receiver = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(220)).await;
        let opener = popup_for_task.opener().unwrap();
        let messenger = Messenger::new(Arc::new(popup_for_task));
        messenger
            .await_once(
                "login",
                ReceiveOptions::new()
                    .allow_origin("https://app.example.com")
                    .expect_peer(opener),
            )
            .await
    });

    assert_eq!(sent.await, Ok(SendReceipt { key: "login".into() }));
    assert_near(start.elapsed().as_millis() as u64, 290);
    assert_eq!(receiver.await.unwrap(), Ok(json!({"token": "abc"})));

    let data: Vec<_> = browser
        .posts_between(main.id(), popup.id())
        .into_iter()
        .filter(PostRecord::is_data)
        .collect();
    let acks: Vec<_> = browser
        .posts_between(popup.id(), main.id())
        .into_iter()
        .filter(PostRecord::is_ack)
        .collect();
    assert_eq!(data.len(), 3);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].target_origin, "https://app.example.com");
    assert!(data.iter().all(|r| r.target_origin == "https://login.example.com"));
    assert!(!main_messenger.registry().contains("login"));
}
