//! Integration tests for the GraphQL WebSocket transport against a scripted loopback server.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sinewave_bench::channel::ChannelId;
use sinewave_bench::error::TransportError;
use sinewave_bench::payload::{decode, encode_f64, validate, ExpectedSet};
use sinewave_bench::transport::graphql_ws::{GraphqlWsTransport, WsProtocol};
use sinewave_bench::transport::{SubscriptionEvent, SubscriptionTransport};
use sinewave_bench::{RunOutcome, RunSequencer, RunSpec, SineWaveProbe};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/subscriptions", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener, protocol: &'static str) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    accept_hdr_async(stream, move |req: &Request, mut resp: Response| {
        let requested = req
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert_eq!(requested, protocol);
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(protocol));
        Ok::<Response, ErrorResponse>(resp)
    })
    .await
    .unwrap()
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Close(_))) | None => return json!({ "type": "<closed>" }),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("server read failed: {e}"),
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

fn update(kind: &str, id: &str, channel: &str, values: &[f64]) -> Value {
    json!({
        "type": kind,
        "id": id,
        "payload": { "data": { "subscribeChannel": {
            "id": channel,
            "value": { "base64Array": encode_f64(values) },
        } } },
    })
}

async fn handshake(ws: &mut ServerWs) {
    let init = recv_json(ws).await;
    assert_eq!(init["type"], "connection_init");
    send_json(ws, json!({ "type": "connection_ack" })).await;
    send_json(ws, json!({ "type": "ka" })).await;
}

/// Send a rotating update every 10 ms until the client stops the operation.
async fn serve_updates(ws: ServerWs, id: &str, channel: &str, mut values: Vec<f64>) {
    let (mut sink, mut stream) = ws.split();
    let mut ticker = tokio::time::interval(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let frame = update("data", id, channel, &values);
                sink.send(Message::Text(frame.to_string())).await.unwrap();
                values.rotate_right(1);
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    assert_eq!(frame["type"], "stop");
                    return;
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended before stop: {other:?}"),
            },
        }
    }
}

#[tokio::test]
async fn test_graphql_ws_subscribe_receive_stop() {
    let (listener, url) = bind().await;
    let channel = ChannelId::sinewave_simple(3, 0.1);
    let channel_str = channel.to_string();

    let server: JoinHandle<Vec<String>> = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;

        let start = recv_json(&mut ws).await;
        assert_eq!(start["type"], "start");
        let query = start["payload"]["query"].as_str().unwrap().to_string();
        assert!(query.contains(&channel_str));
        let id = start["id"].as_str().unwrap().to_string();

        send_json(&mut ws, update("data", &id, &channel_str, &[0.0, 1.0, 2.0])).await;
        send_json(&mut ws, update("data", &id, &channel_str, &[2.0, 0.0, 1.0])).await;
        send_json(&mut ws, update("data", &id, &channel_str, &[2.0, 0.0, 7.0])).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let frame = recv_json(&mut ws).await;
            if frame["type"] == "stop" {
                assert_eq!(frame["id"], id.as_str());
            }
            seen.push(frame["type"].as_str().unwrap_or_default().to_string());
        }
        seen
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap();
    let mut sub = transport.subscribe(&channel).await.unwrap();

    let expected = ExpectedSet::for_size(3);
    let mut checks = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(TIMEOUT, sub.next_event()).await.unwrap() {
            Some(SubscriptionEvent::Data(msg)) => {
                assert_eq!(msg.id.as_deref(), Some("sim://sinewavesimple(3,0.1)"));
                checks.push(validate(&decode(&msg).unwrap(), &expected));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(checks, vec![true, true, false]);

    assert!(sub.unsubscribe(TIMEOUT).await);
    transport.close().await;

    let frames = server.await.unwrap();
    assert_eq!(frames, vec!["stop", "connection_terminate"]);
}

#[tokio::test]
async fn test_graphql_transport_ws_frames() {
    let (listener, url) = bind().await;
    let channel = ChannelId::sinewave_simple(2, 0.1);
    let channel_str = channel.to_string();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-transport-ws").await;
        let init = recv_json(&mut ws).await;
        assert_eq!(init["type"], "connection_init");
        send_json(&mut ws, json!({ "type": "ping" })).await;
        let pong = recv_json(&mut ws).await;
        assert_eq!(pong["type"], "pong");
        send_json(&mut ws, json!({ "type": "connection_ack" })).await;

        let subscribe = recv_json(&mut ws).await;
        assert_eq!(subscribe["type"], "subscribe");
        let id = subscribe["id"].as_str().unwrap().to_string();
        send_json(&mut ws, update("next", &id, &channel_str, &[1.0, 0.0])).await;
        send_json(&mut ws, json!({ "type": "complete", "id": id })).await;

        let stop = recv_json(&mut ws).await;
        stop["type"].as_str().unwrap_or_default().to_string()
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlTransportWs, TIMEOUT)
        .await
        .unwrap();
    let mut sub = transport.subscribe(&channel).await.unwrap();

    assert!(matches!(
        sub.next_event().await,
        Some(SubscriptionEvent::Data(_))
    ));
    assert_eq!(sub.next_event().await, Some(SubscriptionEvent::Complete));
    assert_eq!(sub.next_event().await, None);
    sub.unsubscribe(TIMEOUT).await;
    transport.close().await;

    // the server completed the operation, so no stop is sent; the socket just closes
    assert_eq!(server.await.unwrap(), "<closed>");
}

#[tokio::test]
async fn test_connection_error_is_reported() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        let _init = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({ "type": "connection_error", "payload": { "message": "no" } }),
        )
        .await;
    });

    let err = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionRejected(_)), "{err}");
    server.await.unwrap();
}

#[tokio::test]
async fn test_missing_ack_times_out() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        let _init = recv_json(&mut ws).await;
        // never acknowledge; hold the socket until the client gives up
        while let Some(Ok(_)) = ws.next().await {}
    });

    let err = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::HandshakeTimeout(_)), "{err}");
    server.abort();
}

#[tokio::test]
async fn test_measurement_over_websocket() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;
        let start = recv_json(&mut ws).await;
        let id = start["id"].as_str().unwrap().to_string();
        let channel = "sim://sinewavesimple(4,0.01)";

        serve_updates(ws, &id, channel, vec![0.0, 1.0, 2.0, 3.0]).await;
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap();
    let probe = SineWaveProbe::new(Arc::new(transport.clone()), TIMEOUT);
    let outcomes = RunSequencer::new(probe)
        .run_all(&[RunSpec::new(4, 0.01, 300)])
        .await;

    let result = outcomes[0].result().expect("run succeeds");
    assert!(result.message_count > 0);
    assert!(result.elapsed_seconds >= 0.3);
    assert_eq!(result.decode_errors, 0);
    assert_eq!(result.validation_anomalies, 0);

    tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    transport.close().await;
}

#[tokio::test]
async fn test_update_larger_than_default_frame_limit() {
    let (listener, url) = bind().await;
    // 2.5M float64 values: ~26.7 MB of base64, above tungstenite's 16 MiB frame default
    let size = 2_500_000;
    let channel = ChannelId::sinewave_simple(size, 0.1);
    let channel_str = channel.to_string();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;

        let start = recv_json(&mut ws).await;
        let id = start["id"].as_str().unwrap().to_string();
        let values: Vec<f64> = (0..size).map(|i| i as f64).collect();
        let frame = update("data", &id, &channel_str, &values).to_string();
        assert!(frame.len() > 16 << 20);
        ws.send(Message::Text(frame)).await.unwrap();
        assert_eq!(recv_json(&mut ws).await["type"], "stop");

        // the connection survives the large frame
        let start = recv_json(&mut ws).await;
        assert_eq!(start["type"], "start");
        let id = start["id"].as_str().unwrap().to_string();
        send_json(&mut ws, update("data", &id, "sim://sinewavesimple(1,0.1)", &[0.0])).await;
        assert_eq!(recv_json(&mut ws).await["type"], "stop");
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap();

    let mut sub = transport.subscribe(&channel).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(30), sub.next_event()).await.unwrap() {
        Some(SubscriptionEvent::Data(msg)) => {
            let values = decode(&msg).unwrap();
            assert_eq!(values.len(), size);
            assert!(validate(&values, &ExpectedSet::for_size(size)));
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(sub.unsubscribe(TIMEOUT).await);

    let mut sub = transport
        .subscribe(&ChannelId::sinewave_simple(1, 0.1))
        .await
        .unwrap();
    assert!(matches!(
        tokio::time::timeout(TIMEOUT, sub.next_event()).await.unwrap(),
        Some(SubscriptionEvent::Data(_))
    ));
    assert!(sub.unsubscribe(TIMEOUT).await);

    tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    transport.close().await;
}

#[tokio::test]
async fn test_sequence_continues_after_connection_drop() {
    let (listener, url) = bind().await;
    let channel = "sim://sinewavesimple(4,0.01)";

    let server = tokio::spawn(async move {
        // first connection dies under the first run
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;
        assert_eq!(recv_json(&mut ws).await["type"], "start");
        drop(ws);

        // the client reconnects for the second run
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;
        let start = recv_json(&mut ws).await;
        let id = start["id"].as_str().unwrap().to_string();
        serve_updates(ws, &id, channel, vec![0.0, 1.0, 2.0, 3.0]).await;
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap();
    let spec = RunSpec::new(4, 0.01, 200);
    let outcomes = RunSequencer::new(SineWaveProbe::new(Arc::new(transport.clone()), TIMEOUT))
        .run_all(&[spec, spec])
        .await;

    assert_eq!(outcomes.len(), 2);
    match &outcomes[0] {
        RunOutcome::Failure { error, .. } => assert_eq!(error.kind(), "subscription"),
        other => panic!("expected the first run to fail, got {other:?}"),
    }
    let result = outcomes[1].result().expect("second run succeeds after reconnect");
    assert!(result.message_count > 0);
    assert_eq!(result.validation_anomalies, 0);

    tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    transport.close().await;
}

#[tokio::test]
async fn test_closed_transport_does_not_reconnect() {
    let (listener, url) = bind().await;
    let server = tokio::spawn(async move {
        let mut ws = accept(&listener, "graphql-ws").await;
        handshake(&mut ws).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    let transport = GraphqlWsTransport::connect(&url, WsProtocol::GraphqlWs, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(transport.endpoint(), url);
    assert_eq!(transport.protocol(), WsProtocol::GraphqlWs);
    transport.close().await;

    let err = transport
        .subscribe(&ChannelId::sinewave_simple(1, 0.1))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Closed), "{err}");
    tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
}
