//! Per-device update coordinator.
//!
//! A coordinator owns the state of exactly one configured node. Messages
//! are handled one at a time: decode, decrypt, interpret, merge, then the
//! persistence write, which is the only await point.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::DeviceConfig;
use crate::crypto::{decrypt_envelope, ChannelKey};
use crate::envelope::Envelope;
use crate::error::{
    BridgeError, ConfigError, DecodeError, DecryptionError, StoreError, TransportError,
};
use crate::interpret::{interpret, RecordType};
use crate::node_id::NodeId;
use crate::state::{DeviceState, Rejection};
use crate::store::StateStore;
use crate::time::now_epoch_secs_f64;
use crate::transport::{Subscription, Transport};

/// Result of handling one transport message.
#[derive(Debug)]
pub enum Outcome {
    /// A record of this type was merged and committed.
    Merged(RecordType),
    /// The status field was replaced.
    StatusUpdated,
    Ignored(Ignored),
}

/// Reasons a message was dropped without touching state.
#[derive(Debug)]
pub enum Ignored {
    Undecodable(DecodeError),
    Undecryptable(DecryptionError),
    /// Decoded fine, but the port is not one the bridge tracks.
    Unsupported { portnum: i32 },
    Rejected(Rejection),
}

impl Outcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, Self::Merged(_))
    }
}

pub struct Coordinator {
    config: DeviceConfig,
    device: NodeId,
    key: ChannelKey,
    store: Arc<dyn StateStore>,
    state: watch::Sender<DeviceState>,
    clock: fn() -> f64,
}

impl Coordinator {
    /// Create a coordinator with empty state. Call [`Coordinator::restore`]
    /// before handling messages to pick up persisted state.
    pub fn new(config: DeviceConfig, store: Arc<dyn StateStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let device = config.node_id()?;
        let key = config.channel_key()?;
        let (state, _) = watch::channel(DeviceState::default());
        Ok(Self { config, device, key, store, state, clock: now_epoch_secs_f64 })
    }

    /// Replace the wall clock used for `last_update`.
    pub fn with_clock(mut self, clock: fn() -> f64) -> Self {
        self.clock = clock;
        self
    }

    pub fn device(&self) -> NodeId {
        self.device
    }

    /// Snapshot of the current merged state.
    pub fn state(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every committed state.
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.state.subscribe()
    }

    fn store_key(&self) -> String {
        self.device.to_string()
    }

    /// Load persisted state for this device, if the store has any.
    pub async fn restore(&mut self) -> Result<(), StoreError> {
        if let Some(saved) = self.store.get(&self.store_key()).await? {
            log::debug!("restored state for {}: {} record types", self.device, saved.records.len());
            self.state.send_replace(saved);
        }
        Ok(())
    }

    /// Write the current state to the store.
    ///
    /// Also the recovery path after a failed write: the in-memory state is
    /// already committed, so only the write needs repeating.
    pub async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = self.state();
        self.store.put(&self.store_key(), &snapshot).await
    }

    async fn commit(&mut self, next: DeviceState) -> Result<(), StoreError> {
        self.state.send_replace(next);
        self.persist().await
    }

    /// Handle one binary message from the payload topic.
    ///
    /// Only a failed persistence write is an error; everything wrong with
    /// the message itself is reported as [`Outcome::Ignored`].
    pub async fn handle_payload(&mut self, bytes: &[u8]) -> Result<Outcome, StoreError> {
        let mut envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::debug!("{}: dropping undecodable envelope: {err}", self.device);
                return Ok(Outcome::Ignored(Ignored::Undecodable(err)));
            }
        };
        if envelope.from_node() != self.device.num() {
            let rejection = Rejection::ForeignSender { from: envelope.from_node() };
            return Ok(Outcome::Ignored(Ignored::Rejected(rejection)));
        }
        if let Err(err) = decrypt_envelope(&mut envelope, &self.key) {
            log::debug!("{}: dropping packet {:#010x}: {err}", self.device, envelope.packet_id());
            return Ok(Outcome::Ignored(Ignored::Undecryptable(err)));
        }
        let record = match interpret(&envelope) {
            Ok(Some(record)) => record,
            Ok(None) => {
                let portnum = envelope.decoded().map(|data| data.portnum).unwrap_or_default();
                return Ok(Outcome::Ignored(Ignored::Unsupported { portnum }));
            }
            Err(err) => {
                log::debug!("{}: dropping undecodable payload: {err}", self.device);
                return Ok(Outcome::Ignored(Ignored::Undecodable(err)));
            }
        };

        let kind = record.kind;
        let now = (self.clock)();
        let next = self.state.borrow().accept(self.device, &envelope, record, now);
        match next {
            Ok(next) => {
                self.commit(next).await?;
                log::debug!("{}: merged {kind}", self.device);
                Ok(Outcome::Merged(kind))
            }
            Err(rejection) => {
                log::debug!("{}: ignoring {kind}: {rejection:?}", self.device);
                Ok(Outcome::Ignored(Ignored::Rejected(rejection)))
            }
        }
    }

    /// Handle one message from the status topic. The payload is stored as
    /// text, unfiltered.
    pub async fn handle_status(&mut self, payload: &[u8]) -> Result<Outcome, StoreError> {
        let stat = String::from_utf8_lossy(payload).into_owned();
        let next = self.state.borrow().with_stat(stat);
        self.commit(next).await?;
        Ok(Outcome::StatusUpdated)
    }

    /// Subscribe to the configured topics. Messages published after this
    /// returns are delivered to [`Coordinator::serve`].
    pub async fn listen(&self, transport: &dyn Transport) -> Result<Listener, TransportError> {
        let payloads = transport.subscribe(&self.config.pb_topic).await?;
        let status = match self.config.stat_topic() {
            Some(topic) => Some(transport.subscribe(topic).await?),
            None => None,
        };
        log::info!(
            "{} ({}): listening on {}{}",
            self.config.display_name(),
            self.device,
            payloads.topic(),
            status.as_ref().map(|sub| format!(", status on {}", sub.topic())).unwrap_or_default()
        );
        Ok(Listener { payloads, status })
    }

    /// Process messages until the payload subscription ends.
    ///
    /// Persistence failures are logged and processing continues; the next
    /// successful write carries the full state.
    pub async fn serve(&mut self, listener: Listener) {
        let Listener { mut payloads, mut status } = listener;
        loop {
            tokio::select! {
                message = payloads.recv() => {
                    let Some(bytes) = message else { break };
                    if let Err(err) = self.handle_payload(&bytes).await {
                        log::warn!("{}: failed to persist state: {err}", self.device);
                    }
                }
                message = next_message(&mut status) => match message {
                    Some(bytes) => {
                        if let Err(err) = self.handle_status(&bytes).await {
                            log::warn!("{}: failed to persist status: {err}", self.device);
                        }
                    }
                    None => status = None,
                },
            }
        }
        log::info!("{}: payload subscription closed", self.device);
    }

    /// [`Coordinator::listen`] followed by [`Coordinator::serve`].
    pub async fn run(&mut self, transport: &dyn Transport) -> Result<(), BridgeError> {
        let listener = self.listen(transport).await?;
        self.serve(listener).await;
        Ok(())
    }
}

/// Live subscriptions of one coordinator.
#[derive(Debug)]
pub struct Listener {
    payloads: Subscription,
    status: Option<Subscription>,
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Vec<u8>> {
    match subscription {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_data;
    use crate::proto::mesh_packet::PayloadVariant;
    use crate::proto::{Data, MeshPacket, PortNum, ServiceEnvelope};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use prost::Message;

    const DEVICE_ID: &str = "!0a1b2c3d";
    const DEVICE_NUM: u32 = 0x0a1b_2c3d;

    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<DeviceState>, StoreError> {
            Ok(None)
        }

        async fn put(&self, _key: &str, _state: &DeviceState) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
    }

    fn fixed_clock() -> f64 {
        1_700_000_000.0
    }

    fn coordinator(store: Arc<dyn StateStore>) -> Coordinator {
        Coordinator::new(DeviceConfig::new(DEVICE_ID, "msh/test"), store)
            .expect("valid config")
            .with_clock(fixed_clock)
    }

    fn text_data(text: &str) -> Data {
        Data {
            portnum: PortNum::TextMessageApp as i32,
            payload: text.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    fn wire(from: u32, variant: PayloadVariant) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                from,
                id: 77,
                rx_time: 1_699_999_999,
                payload_variant: Some(variant),
                ..Default::default()
            }),
            channel_id: "LongFast".into(),
            gateway_id: DEVICE_ID.into(),
        }
        .encode_to_vec()
    }

    #[tokio::test]
    async fn merges_and_persists_text_message() {
        let store = Arc::new(MemoryStore::new());
        let mut coord = coordinator(store.clone());
        let bytes = wire(DEVICE_NUM, PayloadVariant::Decoded(text_data("hi")));
        let outcome = coord.handle_payload(&bytes).await.expect("handled");
        assert!(matches!(outcome, Outcome::Merged(RecordType::TextMessage)));

        let state = coord.state();
        assert_eq!(state.last_update, Some(1_700_000_000.0));
        let text = state.attributes(RecordType::TextMessage).expect("text");
        assert_eq!(text["text"], "hi");
        assert_eq!(text["rx_time"], 1_699_999_999);
        assert_eq!(store.get(DEVICE_ID).await.expect("get"), Some(state));
    }

    #[tokio::test]
    async fn decrypts_with_default_key() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        let ciphertext =
            encrypt_data(&text_data("secret"), &ChannelKey::default(), 77, DEVICE_NUM).expect("enc");
        let bytes = wire(DEVICE_NUM, PayloadVariant::Encrypted(ciphertext));
        assert!(coord.handle_payload(&bytes).await.expect("handled").is_merged());
        let state = coord.state();
        assert_eq!(state.attributes(RecordType::TextMessage).expect("text")["text"], "secret");
    }

    #[tokio::test]
    async fn wrong_key_drops_message() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        let other_key = ChannelKey::from_bytes(vec![0x5a; 16]).expect("key");
        let data = Data { portnum: PortNum::PositionApp as i32, ..text_data("x") };
        let ciphertext = encrypt_data(&data, &other_key, 77, DEVICE_NUM).expect("enc");
        let bytes = wire(DEVICE_NUM, PayloadVariant::Encrypted(ciphertext));
        let outcome = coord.handle_payload(&bytes).await.expect("handled");
        assert!(!outcome.is_merged());
        assert_eq!(coord.state(), DeviceState::default());
    }

    #[tokio::test]
    async fn foreign_sender_is_ignored_before_decryption() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        let bytes = wire(0x1234_5678, PayloadVariant::Encrypted(vec![1, 2, 3]));
        let outcome = coord.handle_payload(&bytes).await.expect("handled");
        assert!(matches!(
            outcome,
            Outcome::Ignored(Ignored::Rejected(Rejection::ForeignSender { from: 0x1234_5678 }))
        ));
        assert_eq!(coord.state(), DeviceState::default());
    }

    #[tokio::test]
    async fn unknown_port_is_ignored() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        let data = Data { portnum: 4242, payload: vec![1, 2, 3], ..Default::default() };
        let outcome =
            coord.handle_payload(&wire(DEVICE_NUM, PayloadVariant::Decoded(data))).await.expect("ok");
        assert!(matches!(outcome, Outcome::Ignored(Ignored::Unsupported { portnum: 4242 })));
        assert_eq!(coord.state(), DeviceState::default());
    }

    #[tokio::test]
    async fn garbage_is_ignored() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        let outcome = coord.handle_payload(&[0xff, 0xff, 0xff]).await.expect("handled");
        assert!(matches!(outcome, Outcome::Ignored(Ignored::Undecodable(_))));
    }

    #[tokio::test]
    async fn persistence_failure_propagates_after_commit() {
        let mut coord = coordinator(Arc::new(FailingStore));
        let mut observer = coord.subscribe_state();
        let bytes = wire(DEVICE_NUM, PayloadVariant::Decoded(text_data("kept")));
        assert!(matches!(coord.handle_payload(&bytes).await, Err(StoreError::Io(_))));
        assert!(observer.has_changed().expect("sender alive"));
        let state = observer.borrow_and_update().clone();
        assert_eq!(state.attributes(RecordType::TextMessage).expect("text")["text"], "kept");
        assert!(coord.persist().await.is_err());
    }

    #[tokio::test]
    async fn status_sets_stat_only() {
        let store = Arc::new(MemoryStore::new());
        let mut coord = coordinator(store.clone());
        assert!(matches!(
            coord.handle_status(b"online").await.expect("handled"),
            Outcome::StatusUpdated
        ));
        let state = coord.state();
        assert_eq!(state.stat.as_deref(), Some("online"));
        assert_eq!(state.last_update, None);
        assert!(state.records.is_empty());
        assert_eq!(store.get(DEVICE_ID).await.expect("get"), Some(state));
    }

    #[tokio::test]
    async fn status_applies_after_undecodable_payloads() {
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        coord.handle_payload(b"\x0a\x10\x01\x02").await.expect("handled");
        coord.handle_status(b"online").await.expect("handled");
        assert_eq!(coord.state().is_online(), Some(true));
    }

    #[tokio::test]
    async fn restore_loads_saved_state() {
        let store = Arc::new(MemoryStore::new());
        let saved = DeviceState { stat: Some("offline".into()), ..Default::default() };
        store.put(DEVICE_ID, &saved).await.expect("put");
        let mut coord = coordinator(store);
        coord.restore().await.expect("restore");
        assert_eq!(coord.state(), saved);
    }

    #[tokio::test]
    async fn listen_subscribes_before_serving() {
        let transport = crate::transport::LoopbackTransport::new();
        let config = DeviceConfig {
            stat_topic: Some("msh/stat".into()),
            ..DeviceConfig::new(DEVICE_ID, "msh/test")
        };
        let mut coord = Coordinator::new(config, Arc::new(MemoryStore::new()))
            .expect("valid config")
            .with_clock(fixed_clock);
        let listener = coord.listen(&transport).await.expect("listen");

        // Published before serve starts: queued on the subscriptions.
        let bytes = wire(DEVICE_NUM, PayloadVariant::Decoded(text_data("early")));
        assert_eq!(transport.publish("msh/test", bytes), 1);
        assert_eq!(transport.publish("msh/stat", "online"), 1);
        transport.close();

        coord.serve(listener).await;
        let state = coord.state();
        assert_eq!(state.attributes(RecordType::TextMessage).expect("text")["text"], "early");
    }

    #[tokio::test]
    async fn run_fails_on_closed_transport() {
        let transport = crate::transport::LoopbackTransport::new();
        transport.close();
        let mut coord = coordinator(Arc::new(MemoryStore::new()));
        assert!(matches!(
            coord.run(&transport).await,
            Err(BridgeError::Transport(TransportError::Closed))
        ));
    }
}
