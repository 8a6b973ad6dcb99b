//! End-to-end fan-out behavior: upstream frames flow through the Deribit
//! handler and router to every interested consumer, and subscription
//! bookkeeping drives exactly the right upstream traffic. No network
//! involved; the upstream side is driven by feeding raw frames to the
//! handler directly.

use axum::extract::ws::Message;
use common::{ControlCommand, WsHandler};
use gateway::{ClientRegistry, ClientState, DeribitHandler, MarketHub, MarketRouter};
use std::sync::Arc;
use tokio::sync::mpsc;

const TICKER: &str = "ticker.BTC-PERPETUAL.100ms";

fn ticker_frame(price: u64) -> String {
    format!(
        r#"{{"jsonrpc":"2.0","method":"subscription","params":{{"channel":"{}","data":{{"last_price":{}}}}}}}"#,
        TICKER, price
    )
}

fn consumer(hub: &MarketHub) -> (Arc<ClientState>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(32);
    let client = Arc::new(ClientState::new(tx));
    hub.registry().register(client.clone());
    (client, rx)
}

async fn recv_text(rx: &mut mpsc::Receiver<Message>) -> String {
    loop {
        match rx.recv().await.expect("channel closed") {
            Message::Text(t) => {
                // Skip control acks; market data is raw JSON-RPC passthrough.
                if t.contains(r#""method":"subscription""#) {
                    return t;
                }
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn two_consumers_share_one_upstream_subscription() {
    let registry = Arc::new(ClientRegistry::new());
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let (upstream_tx, mut upstream_rx) = mpsc::channel(16);

    let handler = DeribitHandler::new(
        "wss://unused.invalid".to_string(),
        registry.clone(),
        frame_tx,
    );
    let hub = MarketHub::new(registry.clone(), upstream_tx);
    tokio::spawn(MarketRouter::new(registry.clone(), frame_rx).run());

    let (a, mut rx_a) = consumer(&hub);
    let (b, mut rx_b) = consumer(&hub);

    // A subscribes: the channel gains its first consumer, exactly one
    // upstream subscribe is requested.
    hub.subscribe(&a.id, vec![TICKER.to_string()]).unwrap();
    assert_eq!(
        upstream_rx.try_recv().unwrap(),
        ControlCommand::Subscribe(vec![TICKER.to_string()])
    );

    // B joins the same channel: no redundant upstream request.
    hub.subscribe(&b.id, vec![TICKER.to_string()]).unwrap();
    assert!(upstream_rx.try_recv().is_err());

    // One upstream update reaches both consumers, verbatim.
    let first = ticker_frame(64000);
    handler.on_message(&first).await.unwrap();
    assert_eq!(recv_text(&mut rx_a).await, first);
    assert_eq!(recv_text(&mut rx_b).await, first);

    // A disconnects; the channel still has a consumer, nothing retracted.
    hub.disconnect(&a.id);
    assert!(upstream_rx.try_recv().is_err());

    let second = ticker_frame(64100);
    handler.on_message(&second).await.unwrap();
    assert_eq!(recv_text(&mut rx_b).await, second);
    // Router has processed the frame (B saw it), so A's silence is final.
    assert!(rx_a.try_recv().is_err());

    // B unsubscribes: last consumer gone, exactly one upstream unsubscribe.
    hub.unsubscribe(&b.id, vec![TICKER.to_string()]).unwrap();
    assert_eq!(
        upstream_rx.try_recv().unwrap(),
        ControlCommand::Unsubscribe(vec![TICKER.to_string()])
    );
    assert!(hub.registry().all_channels().is_empty());
}

#[tokio::test]
async fn disallowed_channel_is_rejected_without_poisoning_the_batch() {
    let registry = Arc::new(ClientRegistry::new());
    let (upstream_tx, mut upstream_rx) = mpsc::channel(16);
    let hub = MarketHub::new(registry.clone(), upstream_tx);

    let (a, _rx_a) = consumer(&hub);
    let outcome = hub
        .subscribe(
            &a.id,
            vec!["order.mytrades".to_string(), TICKER.to_string()],
        )
        .unwrap();

    assert_eq!(outcome.rejected, vec!["order.mytrades".to_string()]);
    assert_eq!(outcome.accepted, vec![TICKER.to_string()]);
    assert_eq!(registry.all_channels(), vec![TICKER.to_string()]);
    assert_eq!(
        upstream_rx.try_recv().unwrap(),
        ControlCommand::Subscribe(vec![TICKER.to_string()])
    );
}

#[tokio::test]
async fn reconciliation_converges_after_outage_churn() {
    let registry = Arc::new(ClientRegistry::new());
    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    let (upstream_tx, _upstream_rx) = mpsc::channel(16);

    let handler = DeribitHandler::new(
        "wss://unused.invalid".to_string(),
        registry.clone(),
        frame_tx,
    );
    let hub = MarketHub::new(registry.clone(), upstream_tx);
    let (a, _rx_a) = consumer(&hub);

    // Churn during a simulated outage: subscribe, unsubscribe, resubscribe.
    hub.subscribe(
        &a.id,
        vec![TICKER.to_string(), "book.ETH-PERPETUAL.100ms".to_string()],
    )
    .unwrap();
    hub.unsubscribe(&a.id, vec!["book.ETH-PERPETUAL.100ms".to_string()])
        .unwrap();
    hub.subscribe(&a.id, vec!["trades.SOL_USDC.raw".to_string()]).unwrap();

    // On reconnect the handler asserts exactly the registry's current set.
    let frames = handler.on_connect_messages();
    assert_eq!(frames.len(), 2);
    let reconcile: serde_json::Value = serde_json::from_str(&frames[1]).unwrap();
    assert_eq!(reconcile["method"], "public/subscribe");
    assert_eq!(
        reconcile["params"]["channels"],
        serde_json::json!([TICKER, "trades.SOL_USDC.raw"])
    );
}
