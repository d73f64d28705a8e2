//! WebSocket JSON-RPC client for the upstream node.
//!
//! Opens one connection per subscription episode, subscribes to filtered
//! logs and new heads with `eth_subscribe`, and serves `eth_blockNumber`
//! liveness probes over the same socket. The socket is owned by a background
//! task; the returned [`FeedSubscription`] aborts it when dropped.

use super::subscription::{EventFeed, FeedSubscription, LivenessProbe};
use super::types::*;
use async_trait::async_trait;
use futures::channel::mpsc as stream_channel;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
	MaybeTlsStream, WebSocketStream, connect_async,
	tungstenite::{Message, client::IntoClientRequest},
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ProbeReply = oneshot::Sender<Result<u64, FeedError>>;

const LOGS_REQUEST_ID: u64 = 1;
const HEADS_REQUEST_ID: u64 = 2;
const FIRST_PROBE_ID: u64 = 1_000;
const MESSAGE_BUFFER: usize = 512;
const PROBE_BUFFER: usize = 8;

/// Upstream node client speaking JSON-RPC over WebSocket
#[derive(Clone)]
pub struct WsEventFeed {
	/// The WebSocket URL of the node.
	ws_url: String,
	/// Upper bound for connect + subscribe acknowledgement.
	handshake_timeout: Duration,
}

/// Subscription ids assigned by the node.
#[derive(Debug, Clone)]
struct SubscriptionIds {
	logs: String,
	heads: String,
}

impl WsEventFeed {
	/// Create a new feed client.
	///
	/// # Arguments
	/// * `ws_url` - The WebSocket endpoint of the node.
	/// * `handshake_timeout` - Maximum time to wait for both subscriptions to be acknowledged.
	pub fn new(ws_url: String, handshake_timeout: Duration) -> Self {
		Self {
			ws_url,
			handshake_timeout,
		}
	}

	/// Connect, send both subscriptions and wait for their ids.
	///
	/// Notifications that race ahead of the second acknowledgement are
	/// returned so the connection task can deliver them first.
	async fn handshake(
		&self,
		filter: &LogFilter,
	) -> Result<(WsStream, SubscriptionIds, Vec<Value>), FeedError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let request = self.ws_url.clone().into_client_request()?;
		let (mut ws_stream, response) = connect_async(request).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);

		ws_stream
			.send(Message::Text(
				rpc_request(LOGS_REQUEST_ID, "eth_subscribe", json!(["logs", filter.to_json()]))
					.to_string(),
			))
			.await?;
		ws_stream
			.send(Message::Text(
				rpc_request(HEADS_REQUEST_ID, "eth_subscribe", json!(["newHeads"])).to_string(),
			))
			.await?;

		let mut logs = None;
		let mut heads = None;
		let mut early = Vec::new();

		while logs.is_none() || heads.is_none() {
			let Some(msg) = ws_stream.next().await else {
				return Err(FeedError::Closed(
					"Connection ended during handshake".to_string(),
				));
			};

			match msg? {
				Message::Text(text) => {
					let parsed: Value = serde_json::from_str(&text)?;
					if let Some(error) = parsed.get("error") {
						return Err(FeedError::from_rpc(error));
					}

					let id = parsed.get("id").and_then(Value::as_u64);
					let subscription = parsed.get("result").and_then(Value::as_str);
					match (id, subscription) {
						(Some(LOGS_REQUEST_ID), Some(sub)) => logs = Some(sub.to_string()),
						(Some(HEADS_REQUEST_ID), Some(sub)) => heads = Some(sub.to_string()),
						_ if is_notification(&parsed) => early.push(parsed),
						_ => debug!("Ignoring message during handshake: {}", text),
					}
				}
				Message::Ping(data) => ws_stream.send(Message::Pong(data)).await?,
				Message::Close(frame) => {
					return Err(FeedError::Closed(format!(
						"Closed during handshake: {:?}",
						frame
					)));
				}
				_ => {}
			}
		}

		let ids = SubscriptionIds {
			logs: logs.unwrap_or_default(),
			heads: heads.unwrap_or_default(),
		};
		Ok((ws_stream, ids, early))
	}
}

#[async_trait]
impl EventFeed for WsEventFeed {
	async fn subscribe(&self, filter: &LogFilter) -> Result<FeedSubscription, FeedError> {
		let (ws_stream, ids, early) =
			tokio::time::timeout(self.handshake_timeout, self.handshake(filter))
				.await
				.map_err(|_| {
					FeedError::Handshake(format!(
						"Subscriptions not acknowledged within {:?}",
						self.handshake_timeout
					))
				})??;

		info!(
			"Subscribed to {} (logs={}, heads={})",
			self.ws_url, ids.logs, ids.heads
		);

		let (events_tx, events_rx) = stream_channel::channel(MESSAGE_BUFFER);
		let (probe_tx, probe_rx) = mpsc::channel(PROBE_BUFFER);
		let router = MessageRouter::new(ids);

		let connection = tokio::spawn(run_connection(ws_stream, router, early, events_tx, probe_rx));

		Ok(FeedSubscription::new(
			Box::pin(events_rx),
			Arc::new(WsProbe { requests: probe_tx }),
			Some(connection),
		))
	}

	fn endpoint(&self) -> &str {
		&self.ws_url
	}
}

/// Sends `eth_blockNumber` through the connection task and awaits the reply.
struct WsProbe {
	requests: mpsc::Sender<ProbeReply>,
}

#[async_trait]
impl LivenessProbe for WsProbe {
	async fn probe(&self) -> Result<u64, FeedError> {
		let (reply, response) = oneshot::channel();
		self.requests
			.send(reply)
			.await
			.map_err(|_| FeedError::Closed("Connection task stopped".to_string()))?;

		response
			.await
			.map_err(|_| FeedError::Closed("Probe abandoned by connection task".to_string()))?
	}
}

async fn run_connection(
	ws_stream: WsStream,
	mut router: MessageRouter,
	early: Vec<Value>,
	mut events_tx: stream_channel::Sender<Result<FeedMessage, FeedError>>,
	mut probe_rx: mpsc::Receiver<ProbeReply>,
) {
	let (mut write, mut read) = ws_stream.split();

	for value in early {
		if let Some(item) = router.route(value) {
			if events_tx.send(item).await.is_err() {
				return;
			}
		}
	}

	loop {
		tokio::select! {
			msg = read.next() => {
				let failure = match msg {
					Some(Ok(Message::Text(text))) => {
						match serde_json::from_str::<Value>(&text) {
							Ok(value) => {
								if let Some(item) = router.route(value) {
									if events_tx.send(item).await.is_err() {
										debug!("Feed subscriber dropped, stopping connection task");
										break;
									}
								}
							}
							Err(e) => warn!("Ignoring unparseable upstream message: {}", e),
						}
						None
					}
					Some(Ok(Message::Ping(data))) => {
						write.send(Message::Pong(data)).await.err().map(FeedError::from)
					}
					Some(Ok(Message::Close(frame))) => {
						Some(FeedError::Closed(format!("Closed by server: {:?}", frame)))
					}
					Some(Ok(_)) => None,
					Some(Err(e)) => Some(FeedError::WebSocket(e)),
					None => Some(FeedError::Closed("Stream ended".to_string())),
				};

				if let Some(error) = failure {
					router.abandon_probes();
					let _ = events_tx.send(Err(error)).await;
					break;
				}
			}
			Some(reply) = probe_rx.recv() => {
				let id = router.register_probe(reply);
				let request = rpc_request(id, "eth_blockNumber", json!([]));
				if let Err(e) = write.send(Message::Text(request.to_string())).await {
					router.abandon_probes();
					let _ = events_tx.send(Err(FeedError::WebSocket(e))).await;
					break;
				}
			}
		}
	}

	debug!("WebSocket connection task ended");
}

/// Routes parsed upstream messages to subscription items or probe replies.
struct MessageRouter {
	ids: SubscriptionIds,
	pending_probes: HashMap<u64, ProbeReply>,
	next_probe_id: u64,
}

impl MessageRouter {
	fn new(ids: SubscriptionIds) -> Self {
		Self {
			ids,
			pending_probes: HashMap::new(),
			next_probe_id: FIRST_PROBE_ID,
		}
	}

	fn register_probe(&mut self, reply: ProbeReply) -> u64 {
		let id = self.next_probe_id;
		self.next_probe_id += 1;
		self.pending_probes.insert(id, reply);
		id
	}

	fn abandon_probes(&mut self) {
		for (_, reply) in self.pending_probes.drain() {
			let _ = reply.send(Err(FeedError::Closed("Connection lost".to_string())));
		}
	}

	/// Returns an item to forward to the subscriber, if any.
	fn route(&mut self, value: Value) -> Option<Result<FeedMessage, FeedError>> {
		if let Some(id) = value.get("id").and_then(Value::as_u64) {
			if let Some(reply) = self.pending_probes.remove(&id) {
				let result = match value.get("error") {
					Some(error) => Err(FeedError::from_rpc(error)),
					None => value
						.get("result")
						.and_then(Value::as_str)
						.and_then(parse_quantity)
						.ok_or_else(|| {
							FeedError::Handshake(format!("Invalid eth_blockNumber reply: {}", value))
						}),
				};
				let _ = reply.send(result);
				return None;
			}
		}

		if let Some(error) = value.get("error") {
			return Some(Err(FeedError::from_rpc(error)));
		}

		if !is_notification(&value) {
			return None;
		}

		let params = value.get("params")?;
		let subscription = params.get("subscription")?.as_str()?;
		let result = params.get("result")?.clone();

		if subscription == self.ids.logs {
			let item = match serde_json::from_value::<RawLog>(result) {
				Ok(log) => FeedMessage::Log(log),
				Err(e) => FeedMessage::Malformed(e.to_string()),
			};
			Some(Ok(item))
		} else if subscription == self.ids.heads {
			let item = match serde_json::from_value::<NewHead>(result) {
				Ok(head) => FeedMessage::NewHead(head.number.to::<u64>()),
				Err(e) => FeedMessage::Malformed(e.to_string()),
			};
			Some(Ok(item))
		} else {
			debug!("Ignoring notification for unknown subscription {}", subscription);
			None
		}
	}
}

fn rpc_request(id: u64, method: &str, params: Value) -> Value {
	json!({
		"jsonrpc": "2.0",
		"id": id,
		"method": method,
		"params": params
	})
}

fn is_notification(value: &Value) -> bool {
	value.get("method").and_then(Value::as_str) == Some("eth_subscription")
}

fn parse_quantity(hex: &str) -> Option<u64> {
	u64::from_str_radix(hex.strip_prefix("0x").unwrap_or(hex), 16).ok()
}
