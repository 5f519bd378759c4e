//! Device facade.
//! Symbolic datapoint commands, status queries and a translated event stream on
//! top of one background session.

use crate::crypto::{KEY_LEN, KeyStore};
use crate::error::{Result, TuyaError};
use crate::payload::DpMap;
use crate::protocol::Version;
use crate::schema::{DpSchema, SchemaRegistry};
use crate::session::{
    self, EVENT_QUEUE_LEN, Phase, SessionConfig, SessionEvent, SessionHandle, SessionParams,
};
use crate::transport::{Connector, DEFAULT_PORT, TcpConnector};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Duration;

/// Datapoint values keyed by symbolic code.
pub type StatusMap = BTreeMap<String, Value>;

/// Events published on [`Device::events`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Datapoints reported by the device, keyed by code.
    StateChanged(StatusMap),
    Connected,
    Disconnected { code: u32, reason: String },
    Reconnecting { attempt: u32, delay: Duration },
}

impl DeviceEvent {
    fn from_session(schema: &DpSchema, event: SessionEvent) -> Self {
        match event {
            SessionEvent::Connected => DeviceEvent::Connected,
            SessionEvent::Disconnected { error } => DeviceEvent::Disconnected {
                code: error.code(),
                reason: error.to_string(),
            },
            SessionEvent::Reconnecting { attempt, delay } => {
                DeviceEvent::Reconnecting { attempt, delay }
            }
            SessionEvent::Dps(dps) => DeviceEvent::StateChanged(translate(schema, &dps)),
        }
    }
}

fn translate(schema: &DpSchema, dps: &DpMap) -> StatusMap {
    dps.iter()
        .map(|(id, value)| (schema.code_for(*id), value.clone()))
        .collect()
}

/// Describes one device. `build` validates; `start` also opens the session.
pub struct DeviceBuilder {
    id: String,
    local_key: Vec<u8>,
    address: Option<String>,
    port: u16,
    version: Version,
    config: SessionConfig,
    schema: Option<Arc<DpSchema>>,
    registry: Option<Arc<SchemaRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    local_nonce: Option<[u8; KEY_LEN]>,
}

impl DeviceBuilder {
    pub fn new<I, K>(id: I, local_key: K) -> Self
    where
        I: Into<String>,
        K: Into<Vec<u8>>,
    {
        Self {
            id: id.into(),
            local_key: local_key.into(),
            address: None,
            port: DEFAULT_PORT,
            version: Version::V3_3,
            config: SessionConfig::default(),
            schema: None,
            registry: None,
            connector: None,
            local_nonce: None,
        }
    }

    pub fn address<A: Into<String>>(mut self, address: A) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema<S: Into<Arc<DpSchema>>>(mut self, schema: S) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Loads the schema from `registry` at build time when none is given directly.
    pub fn registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the TCP connector, e.g. for tunnels or in-memory transports.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<Device> {
        let keys = KeyStore::new(&self.local_key)?;

        let schema = match (self.schema, &self.registry) {
            (Some(schema), _) => schema,
            (None, Some(registry)) => registry.load(&self.id)?,
            (None, None) => {
                debug!("Device {} has no schema, only raw datapoints are usable", self.id);
                Arc::new(DpSchema::default())
            }
        };

        let connector: Arc<dyn Connector> = match (self.connector, self.address) {
            (Some(connector), _) => connector,
            (None, Some(address)) if !address.trim().is_empty() => {
                Arc::new(TcpConnector::new(address.trim(), self.port))
            }
            _ => {
                return Err(TuyaError::Config(format!(
                    "device {} needs an address or a connector",
                    self.id
                )));
            }
        };

        let (events, _) = broadcast::channel(EVENT_QUEUE_LEN);
        Ok(Device {
            inner: Arc::new(DeviceInner {
                id: self.id,
                version: self.version,
                keys,
                connector,
                config: self.config,
                schema,
                events,
                session: Mutex::new(None),
                local_nonce: self.local_nonce,
            }),
        })
    }

    /// Builds the device and starts its session. Requires a tokio runtime.
    pub fn start(self) -> Result<Device> {
        let device = self.build()?;
        device.start();
        Ok(device)
    }
}

struct DeviceInner {
    id: String,
    version: Version,
    keys: KeyStore,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    schema: Arc<DpSchema>,
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Option<SessionHandle>>,
    local_nonce: Option<[u8; KEY_LEN]>,
}

/// A Tuya device reachable on the local network.
///
/// Cheap to clone; clones share the session and the event channel.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    pub fn builder<I: Into<String>, K: Into<Vec<u8>>>(id: I, local_key: K) -> DeviceBuilder {
        DeviceBuilder::new(id, local_key)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn schema(&self) -> &Arc<DpSchema> {
        &self.inner.schema
    }

    /// Starts the background session. Does nothing if one is already running.
    pub fn start(&self) {
        let mut slot = self.inner.session.lock();
        if slot.as_ref().is_some_and(|s| !s.is_stopped()) {
            return;
        }

        info!("Starting device {}", self.inner.id);
        let mut params = SessionParams::new(
            self.inner.id.clone(),
            self.inner.version,
            self.inner.keys.clone(),
            self.inner.connector.clone(),
        )
        .config(self.inner.config.clone())
        .events(self.inner.events.clone());
        params.local_nonce = self.inner.local_nonce;
        *slot = Some(session::spawn(params));
    }

    /// Stops the session and waits until it has shut down.
    pub async fn stop(&self) {
        let handle = self.inner.session.lock().take();
        if let Some(handle) = handle {
            info!("Stopping device {}", self.inner.id);
            handle.stop();
            handle.closed().await;
        }
    }

    pub fn phase(&self) -> Phase {
        self.inner
            .session
            .lock()
            .as_ref()
            .map_or(Phase::Disconnected, |s| s.phase())
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Active
    }

    fn session(&self) -> Result<SessionHandle> {
        self.inner
            .session
            .lock()
            .clone()
            .ok_or(TuyaError::NotConnected)
    }

    /// Sets a datapoint by its symbolic code.
    pub async fn send_command<V: Into<Value>>(&self, code: &str, value: V) -> Result<()> {
        let dp = self
            .inner
            .schema
            .by_code(code)
            .ok_or_else(|| TuyaError::UnknownDatapoint(code.to_string()))?;
        let value = dp.coerce(&value.into())?;
        self.set_dps(DpMap::from([(dp.id, value)])).await
    }

    /// Sets one datapoint by numeric id, bypassing the schema.
    pub async fn set_value<V: Into<Value>>(&self, dp_id: u32, value: V) -> Result<()> {
        self.set_dps(DpMap::from([(dp_id, value.into())])).await
    }

    pub async fn set_dps(&self, dps: DpMap) -> Result<()> {
        self.session()?.control(dps).await
    }

    /// Queries all datapoints and returns them keyed by code.
    ///
    /// Some devices answer with an empty map; they are then sent a control
    /// with every known datapoint set to `null`, which makes them push their
    /// values as state changes.
    pub async fn request_status(&self) -> Result<StatusMap> {
        let session = self.session()?;
        let dps = session.query().await?;

        if dps.is_empty() && !self.inner.schema.is_empty() {
            debug!(
                "Device {} returned an empty status, requesting a refresh",
                self.inner.id
            );
            let refresh: DpMap = self.inner.schema.ids().map(|id| (id, Value::Null)).collect();
            session.control(refresh).await?;
        }

        Ok(translate(&self.inner.schema, &dps))
    }

    /// Stream of translated events. Each call starts a new subscription.
    pub fn events(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.inner.events.subscribe();
        let schema = self.inner.schema.clone();
        let id = self.inner.id.clone();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield DeviceEvent::from_session(&schema, event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Event stream of device {} skipped {} events", id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandType;
    use crate::schema::{DpType, SchemaDp};
    use crate::session::tests::{DEVICE_ID, FakeDevice, KEY, LOCAL_NONCE};
    use crate::transport::{BoxTransport, FnConnector};
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    fn schema() -> DpSchema {
        DpSchema::new(vec![
            SchemaDp::new(1, "switch_led", DpType::Boolean),
            SchemaDp::new(
                2,
                "bright_value",
                DpType::Integer {
                    min: 10,
                    max: 1000,
                    step: 1,
                    scale: 0,
                },
            ),
        ])
    }

    fn builder(device: &FakeDevice) -> DeviceBuilder {
        let mut builder = DeviceBuilder::new(DEVICE_ID, KEY)
            .version(device.version)
            .schema(schema())
            .connector(device.connector());
        builder.local_nonce = Some(LOCAL_NONCE);
        builder
    }

    async fn next_state(events: &mut (impl Stream<Item = DeviceEvent> + Unpin)) -> StatusMap {
        loop {
            if let Some(DeviceEvent::StateChanged(state)) = events.next().await {
                return state;
            }
        }
    }

    #[test]
    fn build_validates_configuration() {
        assert_eq!(
            DeviceBuilder::new(DEVICE_ID, "short").address("10.0.0.2").build().unwrap_err(),
            TuyaError::InvalidKey(5)
        );
        assert!(matches!(
            DeviceBuilder::new(DEVICE_ID, KEY).build(),
            Err(TuyaError::Config(_))
        ));

        let registry = Arc::new(SchemaRegistry::in_memory());
        assert!(matches!(
            DeviceBuilder::new(DEVICE_ID, KEY)
                .address("10.0.0.2")
                .registry(registry.clone())
                .build(),
            Err(TuyaError::DeviceNotFound(_))
        ));

        registry.persist(DEVICE_ID, schema().dps().to_vec()).unwrap();
        let device = DeviceBuilder::new(DEVICE_ID, KEY)
            .address("10.0.0.2")
            .version(Version::V3_5)
            .registry(registry)
            .build()
            .unwrap();
        assert_eq!(device.schema().by_code("bright_value").unwrap().id, 2);
        assert_eq!(device.phase(), Phase::Disconnected);
    }

    #[tokio::test]
    async fn commands_fail_fast_when_not_started() {
        let (fake, _seen) = FakeDevice::new(Version::V3_3);
        let device = builder(&fake).build().unwrap();

        assert_eq!(
            device.send_command("switch_led", true).await,
            Err(TuyaError::NotConnected)
        );
        assert_eq!(
            device.send_command("colour_data", "x").await,
            Err(TuyaError::UnknownDatapoint("colour_data".into()))
        );
        assert!(matches!(
            device.send_command("switch_led", 7).await,
            Err(TuyaError::InvalidValue { .. })
        ));
        assert_eq!(fake.connections.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn symbolic_commands_round_trip_through_the_device() {
        let (fake, _seen) = FakeDevice::new(Version::V3_4);
        let device = builder(&fake).build().unwrap();
        let events = device.events();
        tokio::pin!(events);

        device.start();
        assert_eq!(events.next().await, Some(DeviceEvent::Connected));
        assert_eq!(
            next_state(&mut events).await,
            StatusMap::from([
                ("switch_led".to_string(), json!(true)),
                ("bright_value".to_string(), json!(500)),
            ])
        );
        assert!(device.is_connected());

        device.send_command("switch_led", "off").await.unwrap();
        assert_eq!(
            next_state(&mut events).await,
            StatusMap::from([("switch_led".to_string(), json!(false))])
        );

        device.send_command("bright_value", 5000).await.unwrap();
        assert_eq!(
            next_state(&mut events).await,
            StatusMap::from([("bright_value".to_string(), json!(1000))])
        );

        device.set_value(9, "raw").await.unwrap();
        assert_eq!(
            next_state(&mut events).await,
            StatusMap::from([("9".to_string(), json!("raw"))])
        );

        device.stop().await;
        assert_eq!(device.phase(), Phase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_translated_and_empty_status_triggers_refresh() {
        let (mut fake, _seen) = FakeDevice::new(Version::V3_3);
        fake.dps = DpMap::from([(1, json!(true)), (7, json!("x"))]);
        let device = builder(&fake)
            .config(SessionConfig {
                query_on_connect: false,
                ..Default::default()
            })
            .start()
            .unwrap();
        device.session().unwrap().wait_for_phase(Phase::Active).await.unwrap();

        assert_eq!(
            device.request_status().await.unwrap(),
            StatusMap::from([
                ("switch_led".to_string(), json!(true)),
                ("7".to_string(), json!("x")),
            ])
        );
        device.stop().await;

        let (mut empty, mut empty_seen) = FakeDevice::new(Version::V3_3);
        empty.dps = DpMap::new();
        let device = builder(&empty)
            .config(SessionConfig {
                query_on_connect: false,
                ..Default::default()
            })
            .start()
            .unwrap();
        let events = device.events();
        tokio::pin!(events);
        device.session().unwrap().wait_for_phase(Phase::Active).await.unwrap();

        assert_eq!(device.request_status().await.unwrap(), StatusMap::new());
        assert_eq!(
            next_state(&mut events).await,
            StatusMap::from([
                ("switch_led".to_string(), Value::Null),
                ("bright_value".to_string(), Value::Null),
            ])
        );
        assert_eq!(empty_seen.recv().await, Some(CommandType::DpQuery));
        assert_eq!(empty_seen.recv().await, Some(CommandType::Control));
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_backoff_waits_for_the_session_to_exit() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector: Arc<dyn Connector> = {
            let attempts = attempts.clone();
            Arc::new(FnConnector(move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<BoxTransport, _>(TuyaError::ConnectionFailed) }
            }))
        };
        let device = DeviceBuilder::new(DEVICE_ID, KEY)
            .connector(connector)
            .start()
            .unwrap();
        let events = device.events();
        tokio::pin!(events);

        loop {
            if let Some(DeviceEvent::Reconnecting { attempt: 1, .. }) = events.next().await {
                break;
            }
        }
        let session = device.session().unwrap();
        assert_eq!(session.phase(), Phase::Disconnected);

        device.stop().await;
        assert!(timeout(Duration::ZERO, session.closed()).await.is_ok());
        assert!(session.is_stopped());

        sleep(Duration::from_secs(3600)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_opens_a_new_session() {
        let (fake, _seen) = FakeDevice::new(Version::V3_5);
        let device = builder(&fake).start().unwrap();
        device.session().unwrap().wait_for_phase(Phase::Active).await.unwrap();
        device.stop().await;
        assert!(matches!(
            device.set_value(1, true).await,
            Err(TuyaError::NotConnected)
        ));

        device.start();
        device.session().unwrap().wait_for_phase(Phase::Active).await.unwrap();
        device.set_value(1, true).await.unwrap();
        assert_eq!(fake.connections.load(Ordering::SeqCst), 2);
        device.stop().await;
    }
}
