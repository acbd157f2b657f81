//! End-to-end bridge scenarios against an in-process mock relay.
//!
//! Two peers (an "app" and a "wallet" side) pair their sessions, exchange
//! encrypted payloads through the relay, and exercise resume, reconnect,
//! TTL, and watchdog behaviour.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use relay_bridge::{
    CancellationToken, ClientConnection, ConnectionOptions, Gateway, GatewayOptions,
    InboundMessage, Provider, ProviderOptions, RegisterOptions, SendOptions, SendRetryOptions,
    SessionKeypair, VerifyRequest,
};
use support::MockRelay;

type Event = InboundMessage<Value>;

struct Peer {
    provider: Arc<Provider<Value>>,
    events: mpsc::UnboundedReceiver<Event>,
    connects: Arc<AtomicU32>,
}

fn pairing(local: &SessionKeypair, remote: &SessionKeypair) -> ClientConnection {
    ClientConnection {
        session: local.clone(),
        client_id: remote.session_id(),
    }
}

async fn open_peer(
    relay_url: &str,
    clients: Vec<ClientConnection>,
    heartbeat_reconnect_interval: Option<Duration>,
) -> Peer {
    let (tx, rx) = mpsc::unbounded_channel();
    let connects = Arc::new(AtomicU32::new(0));

    let mut options = ProviderOptions::new(relay_url, clients);
    options.listener = Some(Arc::new(move |event| {
        let _ = tx.send(event);
    }));
    options.errors_listener = Some(Arc::new(|error| {
        eprintln!("bridge error listener: {error}");
    }));
    let connects_counter = Arc::clone(&connects);
    options.on_connecting = Some(Arc::new(move || {
        connects_counter.fetch_add(1, Ordering::SeqCst);
    }));
    options.heartbeat_reconnect_interval = heartbeat_reconnect_interval;

    let provider = Provider::open(options).await.expect("open provider");
    Peer {
        provider,
        events: rx,
        connects,
    }
}

async fn recv_within(
    events: &mut mpsc::UnboundedReceiver<Event>,
    limit: Duration,
) -> Option<Event> {
    tokio::time::timeout(limit, events.recv()).await.ok().flatten()
}

fn quick_send() -> SendRetryOptions {
    SendRetryOptions {
        attempts: Some(3),
        delay: Some(Duration::from_millis(50)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_basic_send_roundtrip() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;

    let payload = json!({"method": "sendTransaction", "params": [""], "id": "1"});
    app.provider
        .send(
            &payload,
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send");

    let event = recv_within(&mut wallet.events, Duration::from_secs(5))
        .await
        .expect("wallet should receive the message");
    assert_eq!(event.message, payload);
    assert_eq!(event.from, app_session.session_id());
    assert!(event.last_event_id.is_some());
}

#[tokio::test]
async fn test_ordered_delivery_with_advancing_ids() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;

    for i in 0..3 {
        app.provider
            .send(
                &json!({"method": "step", "id": i.to_string()}),
                &app_session,
                &wallet_session.session_id(),
                quick_send(),
            )
            .await
            .expect("send");
    }

    let mut previous_id = 0u64;
    for i in 0..3 {
        let event = recv_within(&mut wallet.events, Duration::from_secs(5))
            .await
            .expect("in-order delivery");
        assert_eq!(event.message["id"], i.to_string());
        let id: u64 = event
            .last_event_id
            .as_deref()
            .and_then(|v| v.parse().ok())
            .expect("numeric event id");
        assert!(id > previous_id, "event ids must strictly advance");
        previous_id = id;
    }
}

#[tokio::test]
async fn test_restore_connection_to_new_peer() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();
    let app2_session = SessionKeypair::generate();
    let wallet2_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;
    let mut wallet2 = open_peer(
        &relay.url,
        vec![pairing(&wallet2_session, &app2_session)],
        None,
    )
    .await;

    app.provider
        .restore_connection(
            vec![
                pairing(&app_session, &wallet_session),
                pairing(&app2_session, &wallet2_session),
            ],
            ConnectionOptions::default(),
        )
        .await
        .expect("restore with second pairing");

    let disconnect = json!({"method": "disconnect", "params": [], "id": "2"});
    app.provider
        .send(
            &disconnect,
            &app2_session,
            &wallet2_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send disconnect");

    let event = recv_within(&mut wallet2.events, Duration::from_secs(5))
        .await
        .expect("wallet2 should receive the disconnect");
    assert_eq!(event.message, disconnect);
    assert_eq!(event.from, app2_session.session_id());

    assert!(
        recv_within(&mut wallet.events, Duration::from_millis(500))
            .await
            .is_none(),
        "wallet1 must not see traffic addressed to wallet2"
    );
}

#[tokio::test]
async fn test_resume_after_close_with_last_event_id() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;

    app.provider
        .send(
            &json!({"method": "first", "id": "1"}),
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send first");
    let first = recv_within(&mut wallet.events, Duration::from_secs(5))
        .await
        .expect("first message");
    let first_id = first.last_event_id.clone().expect("event id");

    wallet.provider.close();

    // Sent while the wallet is offline; the relay stores it.
    let disconnect = json!({"method": "disconnect", "params": [], "id": "2"});
    app.provider
        .send(
            &disconnect,
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send while offline");

    wallet
        .provider
        .restore_connection(
            vec![pairing(&wallet_session, &app_session)],
            ConnectionOptions {
                last_event_id: Some(first_id),
                ..Default::default()
            },
        )
        .await
        .expect("resume");

    let event = recv_within(&mut wallet.events, Duration::from_secs(5))
        .await
        .expect("stored message must be replayed after resume");
    assert_eq!(event.message, disconnect);
}

#[tokio::test]
async fn test_stale_event_id_redelivers_current_does_not() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;

    let payload = json!({"method": "first", "id": "1"});
    app.provider
        .send(
            &payload,
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send");
    let event = recv_within(&mut wallet.events, Duration::from_secs(5))
        .await
        .expect("initial delivery");
    let id: u64 = event
        .last_event_id
        .as_deref()
        .and_then(|v| v.parse().ok())
        .expect("numeric event id");

    // Resume from one before: the same message comes again.
    wallet.provider.close();
    wallet
        .provider
        .restore_connection(
            vec![pairing(&wallet_session, &app_session)],
            ConnectionOptions {
                last_event_id: Some((id - 1).to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("resume with stale id");
    let replayed = recv_within(&mut wallet.events, Duration::from_secs(5))
        .await
        .expect("stale cursor must redeliver");
    assert_eq!(replayed.message, payload);
    assert_eq!(replayed.last_event_id.as_deref(), Some(id.to_string().as_str()));

    // Resume from the current cursor: nothing comes.
    wallet.provider.close();
    wallet
        .provider
        .restore_connection(
            vec![pairing(&wallet_session, &app_session)],
            ConnectionOptions {
                last_event_id: Some(id.to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("resume with current id");
    assert!(
        recv_within(&mut wallet.events, Duration::from_millis(700))
            .await
            .is_none(),
        "current cursor must not redeliver"
    );
}

#[tokio::test]
async fn test_ttl_expiry() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;

    let options = SendRetryOptions {
        ttl: Some(1),
        ..quick_send()
    };
    app.provider
        .send(
            &json!({"method": "ephemeral", "id": "1"}),
            &app_session,
            &wallet_session.session_id(),
            options,
        )
        .await
        .expect("send with short ttl");
    assert_eq!(relay.message_count(), 1);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;
    assert!(
        recv_within(&mut wallet.events, Duration::from_secs(1))
            .await
            .is_none(),
        "expired message must not be replayed"
    );
}

#[tokio::test]
async fn test_watchdog_recovers_from_stall() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet = open_peer(
        &relay.url,
        vec![pairing(&wallet_session, &app_session)],
        Some(Duration::from_millis(900)),
    )
    .await;
    assert_eq!(wallet.connects.load(Ordering::SeqCst), 1);

    // Kill the live stream silently, then send while it is dead.
    relay.stall();
    let payload = json!({"method": "sendTransaction", "params": ["abc"], "id": "1"});
    app.provider
        .send(
            &payload,
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send during stall");

    let event = recv_within(&mut wallet.events, Duration::from_secs(10))
        .await
        .expect("watchdog reconnect must recover the buffered message");
    assert_eq!(event.message, payload);

    // Exactly one reconnect: the initial connect plus one recovery.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(wallet.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_update_clients_noop_vs_change() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();
    let app2_session = SessionKeypair::generate();
    let wallet2_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    assert_eq!(app.connects.load(Ordering::SeqCst), 1);

    // Same session set: no reconnect.
    app.provider
        .update_clients(
            vec![pairing(&app_session, &wallet_session)],
            CancellationToken::new(),
        )
        .await
        .expect("no-op update");
    assert_eq!(app.connects.load(Ordering::SeqCst), 1);

    // Strictly larger set: exactly one reconnect.
    app.provider
        .update_clients(
            vec![
                pairing(&app_session, &wallet_session),
                pairing(&app2_session, &wallet2_session),
            ],
            CancellationToken::new(),
        )
        .await
        .expect("update with new pairing");
    assert_eq!(app.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_close_is_idempotent_and_silences_callbacks() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let app = open_peer(&relay.url, vec![pairing(&app_session, &wallet_session)], None).await;
    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;
    assert!(wallet.provider.is_ready());

    wallet.provider.close();
    wallet.provider.close();
    assert!(!wallet.provider.is_ready());
    assert!(!wallet.provider.is_connecting());

    app.provider
        .send(
            &json!({"method": "late", "id": "9"}),
            &app_session,
            &wallet_session.session_id(),
            quick_send(),
        )
        .await
        .expect("send after peer closed");

    assert!(
        recv_within(&mut wallet.events, Duration::from_millis(600))
            .await
            .is_none(),
        "no callback may fire after close"
    );
}

#[tokio::test]
async fn test_heartbeats_advance_clock_but_never_reach_listener() {
    let relay = MockRelay::start().await;
    let app_session = SessionKeypair::generate();
    let wallet_session = SessionKeypair::generate();

    let mut wallet =
        open_peer(&relay.url, vec![pairing(&wallet_session, &app_session)], None).await;

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(
        wallet.provider.heartbeat_age() < Duration::from_millis(900),
        "heartbeat frames must advance the stall clock"
    );
    assert!(
        wallet.events.try_recv().is_err(),
        "heartbeat frames must not reach the listener"
    );
}

#[tokio::test]
async fn test_gateway_send_without_subscription_and_verify() {
    let relay = MockRelay::start().await;
    let sender = SessionKeypair::generate();
    let receiver = SessionKeypair::generate();

    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();
    let gateway = Gateway::open(
        GatewayOptions {
            bridge_url: relay.url.clone(),
            session_ids: vec![receiver.session_id()],
            listener: Arc::new(move |frame| {
                let _ = frames_tx.send(frame);
            }),
            errors_listener: Arc::new(|_| {}),
            last_event_id: None,
            heartbeat_format: None,
            enable_queue_done_event: false,
        },
        RegisterOptions::default(),
    )
    .await
    .expect("open gateway");
    assert!(gateway.is_ready());

    // Static send path: no subscription needed on the sending side.
    let http = reqwest::Client::new();
    Gateway::send_request(
        &http,
        &relay.url,
        b"ciphertext-bytes",
        &sender.session_id(),
        &receiver.session_id(),
        &SendOptions::default(),
    )
    .await
    .expect("static send");

    let frame = tokio::time::timeout(Duration::from_secs(5), frames_rx.recv())
        .await
        .expect("frame within deadline")
        .expect("frame");
    assert!(frame.id.is_some());
    assert!(frame.data.contains(&sender.session_id()));

    let verification = Gateway::verify_request(
        &http,
        &relay.url,
        &VerifyRequest {
            client_id: sender.session_id(),
            url: "https://app.example".into(),
            kind: "link".into(),
        },
        &CancellationToken::new(),
    )
    .await
    .expect("verify");
    assert_eq!(verification.status, "ok");

    gateway.close();
    assert!(gateway.is_closed());
}
