//! Channel broker interface and an in-process implementation.
//!
//! The socket transport is out of scope for this crate; `LocalBroker`
//! provides the same contract over in-process broadcast channels so the data
//! layer runs (and is tested) without one. A real transport implements
//! `Broker` and routes client traffic through the same `InboundGate`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::prelude::*;

/// A message observed on a broker channel. Resource-level notifications have
/// no payload (an empty publish means "refetch"); field and view
/// notifications carry a `ChangeMessage` value.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
	pub channel: String,
	pub payload: Option<Value>,
}

/// Attributes of one client-originated request, handed to middleware.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
	pub socket: String,
	pub event: String,
	pub channel: Option<String>,
	pub data: Option<Value>,
	pub auth_token: Option<Value>,
}

/// Middleware consulted for client-originated traffic. The orchestrator
/// implements this: emits run the pre filter, publishes to crud channels are
/// denied outright, subscribes run pre then post (with a resource fetch).
#[async_trait]
pub trait InboundGate: Send + Sync {
	async fn allow_emit(&self, req: &InboundRequest) -> CcResult<()>;
	async fn allow_publish(&self, req: &InboundRequest) -> CcResult<()>;
	async fn allow_subscribe(&self, req: &InboundRequest) -> CcResult<()>;
}

/// Server-side broker surface consumed by the data layer.
#[async_trait]
pub trait Broker: Send + Sync {
	/// Subscribe the server itself to a channel, creating it if needed.
	async fn subscribe(&self, channel: &str) -> CcResult<broadcast::Receiver<BrokerMessage>>;

	/// Drop a channel once its last receiver is gone.
	async fn unsubscribe(&self, channel: &str);

	/// Publish a message. Channels without subscribers drop it silently.
	async fn publish(&self, channel: &str, payload: Option<Value>) -> CcResult<()>;

	async fn is_subscribed(&self, channel: &str) -> bool;

	/// Install the middleware consulted for client traffic.
	fn set_gate(&self, gate: Arc<dyn InboundGate>);
}

/// Broker limits.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
	/// Messages buffered per channel before slow receivers lag
	pub buffer_size: usize,
	pub max_channel_name: usize,
	pub max_channels: usize,
}

impl Default for BrokerConfig {
	fn default() -> Self {
		Self { buffer_size: 128, max_channel_name: 256, max_channels: 10000 }
	}
}

/// In-process broker over tokio broadcast channels.
pub struct LocalBroker {
	channels: RwLock<HashMap<String, broadcast::Sender<BrokerMessage>>>,
	gate: RwLock<Option<Arc<dyn InboundGate>>>,
	config: BrokerConfig,
}

impl LocalBroker {
	pub fn new() -> Arc<Self> {
		Self::with_config(BrokerConfig::default())
	}

	pub fn with_config(config: BrokerConfig) -> Arc<Self> {
		Arc::new(Self { channels: RwLock::new(HashMap::new()), gate: RwLock::new(None), config })
	}

	fn sender(&self, channel: &str) -> CcResult<broadcast::Sender<BrokerMessage>> {
		if channel.is_empty() || channel.len() > self.config.max_channel_name {
			return Err(Error::InvalidArguments("invalid channel name".to_string()));
		}
		let mut channels = self.channels.write();
		if !channels.contains_key(channel) && channels.len() >= self.config.max_channels {
			return Err(Error::InvalidArguments("too many channels".to_string()));
		}
		let sender = channels
			.entry(channel.to_string())
			.or_insert_with(|| broadcast::channel(self.config.buffer_size).0)
			.clone();
		Ok(sender)
	}

	fn gate(&self) -> Option<Arc<dyn InboundGate>> {
		self.gate.read().clone()
	}

	// Client-facing, gated entry points //
	//***********************************//

	/// A client emitted an event (e.g. a CRUD request).
	pub async fn emit_from(&self, req: InboundRequest) -> CcResult<()> {
		match self.gate() {
			Some(gate) => gate.allow_emit(&req).await,
			None => Ok(()),
		}
	}

	/// A client attempted to publish to a channel.
	pub async fn publish_from(&self, req: InboundRequest) -> CcResult<()> {
		if let Some(gate) = self.gate() {
			gate.allow_publish(&req).await?;
		}
		let channel = req
			.channel
			.ok_or_else(|| Error::InvalidArguments("publish requires a channel".to_string()))?;
		self.publish(&channel, req.data).await
	}

	/// A client subscribed to a channel.
	pub async fn subscribe_from(
		&self,
		req: InboundRequest,
	) -> CcResult<broadcast::Receiver<BrokerMessage>> {
		if let Some(gate) = self.gate() {
			gate.allow_subscribe(&req).await?;
		}
		let channel = req
			.channel
			.ok_or_else(|| Error::InvalidArguments("subscribe requires a channel".to_string()))?;
		self.subscribe(&channel).await
	}

	pub fn receiver_count(&self, channel: &str) -> usize {
		self.channels.read().get(channel).map(|s| s.receiver_count()).unwrap_or(0)
	}
}

#[async_trait]
impl Broker for LocalBroker {
	async fn subscribe(&self, channel: &str) -> CcResult<broadcast::Receiver<BrokerMessage>> {
		Ok(self.sender(channel)?.subscribe())
	}

	async fn unsubscribe(&self, channel: &str) {
		let mut channels = self.channels.write();
		if let Some(sender) = channels.get(channel) {
			if sender.receiver_count() == 0 {
				channels.remove(channel);
				debug!("channel destroyed: {}", channel);
			}
		}
	}

	async fn publish(&self, channel: &str, payload: Option<Value>) -> CcResult<()> {
		let sender = self.channels.read().get(channel).cloned();
		if let Some(sender) = sender {
			// Ignore if no receivers (channel exists but unused)
			let _ = sender.send(BrokerMessage { channel: channel.to_string(), payload });
		}
		Ok(())
	}

	async fn is_subscribed(&self, channel: &str) -> bool {
		self.receiver_count(channel) > 0
	}

	fn set_gate(&self, gate: Arc<dyn InboundGate>) {
		*self.gate.write() = Some(gate);
	}
}


// vim: ts=4
