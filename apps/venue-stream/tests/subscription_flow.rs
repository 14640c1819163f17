//! Subscription Flow Integration Tests
//!
//! Subscribe/unsubscribe round trips over a real WebSocket link, ack
//! routing through the dispatcher and delivery of decoded envelopes to
//! consumers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use venue_stream::domain::subscription::BeginSubscribe;
use venue_stream::testing::{JsonTestVenue, MockVenueServer};
use venue_stream::{
    AssetType, ChannelParams, ChannelState, ChannelSubscription, Connection, ConnectionSetup,
    ConsumerRegistry, CurrencyPair, DialerConfig, DispatchExit, Dispatcher, Envelope, Frame,
    HeaderMap, PayloadKind, Side, StreamError, SubscribeOutcome, SubscriptionError,
    SubscriptionRegistry, SubscriptionService, WebSocketConnection,
};

struct Session {
    connection: Arc<WebSocketConnection>,
    registry: Arc<SubscriptionRegistry>,
    consumers: Arc<ConsumerRegistry>,
    service: Arc<SubscriptionService>,
    dispatcher: JoinHandle<DispatchExit>,
}

fn spawn_dispatcher(
    connection: &Arc<WebSocketConnection>,
    registry: &Arc<SubscriptionRegistry>,
    consumers: &Arc<ConsumerRegistry>,
) -> JoinHandle<DispatchExit> {
    tokio::spawn(
        Dispatcher::for_websocket(
            connection,
            Arc::new(JsonTestVenue::new()),
            Arc::clone(registry),
            Arc::clone(consumers),
        )
        .run(),
    )
}

async fn open(server: &MockVenueServer, ack_timeout: Duration) -> Session {
    let setup = ConnectionSetup::new(server.url()).with_response_check_timeout(ack_timeout);
    let connection = Arc::new(WebSocketConnection::new(setup.clone()));
    connection
        .dial(&DialerConfig::default(), &HeaderMap::new())
        .await
        .unwrap();

    let registry = Arc::new(SubscriptionRegistry::new());
    let consumers = Arc::new(ConsumerRegistry::new());
    let dispatcher = spawn_dispatcher(&connection, &registry, &consumers);

    let service = Arc::new(SubscriptionService::new(
        Arc::clone(&connection) as Arc<dyn Connection>,
        Arc::new(JsonTestVenue::new()),
        Arc::clone(&registry),
        &setup,
    ));

    Session {
        connection,
        registry,
        consumers,
        service,
        dispatcher,
    }
}

fn btc_trades() -> ChannelSubscription {
    ChannelSubscription::new("trades")
        .with_pair(CurrencyPair::new("BTC", "USD"))
        .with_asset(AssetType::Spot)
}

fn parse(frame: &Frame) -> Value {
    serde_json::from_slice(&frame.raw).unwrap()
}

#[tokio::test]
async fn subscribe_and_unsubscribe_round_trip() {
    let mut server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;
    let key = btc_trades().key();

    let outcome = session.service.subscribe(btc_trades()).await.unwrap();
    assert_eq!(outcome, SubscribeOutcome::Subscribed);
    assert_eq!(session.registry.state(&key), ChannelState::Subscribed);

    let sent = parse(&server.recv_data().await.unwrap());
    assert_eq!(
        sent,
        json!({ "op": "subscribe", "channel": "trades", "pair": "BTC-USD", "asset": "spot" })
    );

    session.service.unsubscribe(&key).await.unwrap();
    assert_eq!(session.registry.state(&key), ChannelState::Unknown);
    assert_eq!(parse(&server.recv_data().await.unwrap())["op"], "unsubscribe");
}

#[tokio::test]
async fn channel_params_are_sent() {
    let mut server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;

    let candles = ChannelSubscription::new("candles")
        .with_pair(CurrencyPair::new("ETH", "USD"))
        .with_params(ChannelParams {
            interval: Some("1m".to_string()),
            ..ChannelParams::default()
        });
    session.service.subscribe(candles).await.unwrap();

    let sent = parse(&server.recv_data().await.unwrap());
    assert_eq!(sent["params"], json!({ "interval": "1m" }));
}

#[tokio::test]
async fn back_to_back_subscribes_send_one_request() {
    let mut server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;

    let (first, second) = tokio::join!(
        session.service.subscribe(btc_trades()),
        session.service.subscribe(btc_trades()),
    );
    assert_eq!(first.unwrap(), SubscribeOutcome::Subscribed);
    assert_eq!(second.unwrap(), SubscribeOutcome::AlreadySubscribed);
    assert_eq!(session.registry.len(), 1);

    assert!(server.recv_data().await.is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.drain().iter().all(|f| f.frame_type.is_control()));
}

#[tokio::test]
async fn silent_venue_times_out_and_reverts() {
    let server = MockVenueServer::start().await.unwrap();
    let session = open(&server, Duration::from_millis(150)).await;

    let err = session.service.subscribe(btc_trades()).await.unwrap_err();
    assert!(matches!(err, SubscriptionError::Timeout { .. }));
    assert!(session.registry.is_empty());
}

#[tokio::test]
async fn venue_rejection_reverts() {
    let server = MockVenueServer::start_with(Arc::new(|frame: &Frame| {
        if frame.frame_type.is_control() {
            return Vec::new();
        }
        let request: Value = serde_json::from_slice(&frame.raw).unwrap_or_default();
        vec![Frame::text(
            json!({
                "event": "error",
                "op": request["op"],
                "channel": request["channel"],
                "pair": request["pair"],
                "asset": request["asset"],
                "message": "channel unavailable",
            })
            .to_string(),
        )]
    }))
    .await
    .unwrap();
    let session = open(&server, Duration::from_secs(5)).await;

    match session.service.subscribe(btc_trades()).await {
        Err(SubscriptionError::Rejected { reason, .. }) => {
            assert_eq!(reason, "channel unavailable");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.registry.is_empty());
}

#[tokio::test]
async fn last_issued_request_decides_final_state() {
    let server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;
    let key = btc_trades().key();

    let service = Arc::clone(&session.service);
    let subscribe = tokio::spawn(async move { service.subscribe(btc_trades()).await.map(|_| ()) });
    let service = Arc::clone(&session.service);
    let unsubscribe_key = key.clone();
    let unsubscribe = tokio::spawn(async move { service.unsubscribe(&unsubscribe_key).await });

    subscribe.await.unwrap().unwrap();
    // The unsubscribe either ran after the subscribe or found nothing to remove
    match unsubscribe.await.unwrap() {
        Ok(()) => assert_eq!(session.registry.state(&key), ChannelState::Unknown),
        Err(SubscriptionError::NotSubscribed(_)) => {
            assert_eq!(session.registry.state(&key), ChannelState::Subscribed);
        }
        Err(e) => panic!("unexpected {e}"),
    }
}

#[tokio::test]
async fn transitions_follow_documented_edges() {
    let server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;
    let mut transitions = session.registry.transitions();
    let key = btc_trades().key();

    session.service.subscribe(btc_trades()).await.unwrap();
    session.service.unsubscribe(&key).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(t) = transitions.try_recv() {
        assert_eq!(t.key, key);
        seen.push((t.from, t.to));
    }
    assert_eq!(
        seen,
        vec![
            (ChannelState::Unknown, ChannelState::Subscribing),
            (ChannelState::Subscribing, ChannelState::Subscribed),
            (ChannelState::Subscribed, ChannelState::Unsubscribing),
            (ChannelState::Unsubscribing, ChannelState::Unknown),
        ]
    );
}

#[tokio::test]
async fn shutdown_forgets_subscriptions_for_the_next_link() {
    let mut server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;
    session.service.subscribe(btc_trades()).await.unwrap();
    assert!(server.recv_data().await.is_some());

    session.connection.shutdown().await.unwrap();
    assert_eq!(session.dispatcher.await.unwrap(), DispatchExit::Shutdown);
    assert!(session.registry.is_empty());

    session
        .connection
        .dial(&DialerConfig::default(), &HeaderMap::new())
        .await
        .unwrap();
    let _dispatcher = spawn_dispatcher(&session.connection, &session.registry, &session.consumers);

    let outcome = session.service.subscribe(btc_trades()).await.unwrap();
    assert_eq!(outcome, SubscribeOutcome::Subscribed);
    assert_eq!(parse(&server.recv_data().await.unwrap())["op"], "subscribe");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn shutdown_releases_waiting_subscribe() {
    let server = MockVenueServer::start().await.unwrap();
    let session = open(&server, Duration::from_secs(30)).await;

    let service = Arc::clone(&session.service);
    let pending = tokio::spawn(async move { service.subscribe(btc_trades()).await });
    while session.registry.is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.connection.shutdown().await.unwrap();
    let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(SubscriptionError::Stream(StreamError::Shutdown))
    ));
    assert!(session.registry.is_empty());
}

#[tokio::test]
async fn cancelled_subscribe_can_be_retried() {
    let mut server = MockVenueServer::start().await.unwrap();
    let session = open(&server, Duration::from_secs(2)).await;
    let key = btc_trades().key();

    let cancelled = timeout(
        Duration::from_millis(100),
        session.service.subscribe(btc_trades()),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(session.registry.state(&key), ChannelState::Unknown);
    assert!(server.recv_data().await.is_some());

    let retry = timeout(
        Duration::from_millis(100),
        session.service.subscribe(btc_trades()),
    )
    .await;
    assert!(retry.is_err());
    assert_eq!(parse(&server.recv_data().await.unwrap())["op"], "subscribe");
    assert_eq!(session.registry.state(&key), ChannelState::Unknown);
}

#[tokio::test]
async fn pending_entry_blocks_direct_subscribe() {
    let server = MockVenueServer::start().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;

    let BeginSubscribe::Started(_rx) = session.registry.begin_subscribe(btc_trades()) else {
        panic!("expected a new subscription");
    };
    assert!(matches!(
        session.service.subscribe(btc_trades()).await,
        Err(SubscriptionError::InFlight { .. })
    ));
}

#[tokio::test]
async fn funding_update_reaches_consumer() {
    let server = MockVenueServer::json_venue().await.unwrap();
    let session = open(&server, Duration::from_secs(5)).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    session.consumers.on(PayloadKind::Funding, move |envelope| {
        sink.lock().push(envelope);
    });

    server.send_text(
        json!({
            "type": "funding",
            "data": {
                "timestamp": "2024-05-01T12:00:00Z",
                "pair": { "base": "USD", "quote": "USD" },
                "asset": "margin_funding",
                "exchange": "testvenue",
                "amount": "2500.5",
                "rate": "0.0002",
                "period": 30,
                "side": "lend"
            }
        })
        .to_string(),
    );

    timeout(Duration::from_secs(5), async {
        while received.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let envelopes = received.lock();
    assert_eq!(envelopes.len(), 1);
    let Envelope::Funding(funding) = &envelopes[0] else {
        panic!("expected funding, got {:?}", envelopes[0]);
    };
    assert_eq!(funding.amount, dec!(2500.5));
    assert_eq!(funding.rate, dec!(0.0002));
    assert_eq!(funding.period, 30);
    assert_eq!(funding.side, Side::Lend);
    assert_eq!(funding.asset, AssetType::MarginFunding);
    drop(envelopes);

    assert!(session.connection.is_connected());
}
