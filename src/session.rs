//! Connection state machine for one device.
//!
//! A session task owns the transport, performs the 3.4/3.5 key negotiation,
//! keeps the link alive with heartbeats and reconnects with capped exponential
//! backoff. Callers reach it through a cloneable [`SessionHandle`].

use crate::codec::{Frame, FrameCodec, MessageWrapper};
use crate::crypto::{self, KEY_LEN, KeyStore};
use crate::error::{ERR_KEY_OR_VER, ErrorKind, Result, TuyaError};
use crate::payload::{DpMap, generate_payload, parse_dps, timestamp};
use crate::protocol::{CommandType, Version};
use crate::transport::{BoxTransport, Connector};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use rand::{Rng, RngCore};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const COMMAND_QUEUE_LEN: usize = 32;
pub(crate) const EVENT_QUEUE_LEN: usize = 64;
/// Remote nonce (16) + HMAC of the local nonce (32)
const NEG_RESP_LEN: usize = KEY_LEN + crypto::HMAC_LEN;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    Connecting,
    NegotiatingKey,
    Active,
    Closing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::NegotiatingKey => "negotiating-key",
            Phase::Active => "active",
            Phase::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Timing and reconnect policy. Every field has a default, so partial JSON works.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub liveness_timeout_secs: u64,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub auto_reconnect: bool,
    pub query_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 10,
            heartbeat_interval_secs: 10,
            liveness_timeout_secs: 30,
            backoff_min_secs: 5,
            backoff_max_secs: 600,
            auto_reconnect: true,
            query_on_connect: true,
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Delay before reconnect attempt `attempt` (1-based): doubling from
    /// `backoff_min`, capped at `backoff_max`, with equal jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let min_ms = self.backoff_min_secs.saturating_mul(1000);
        let max_ms = self.backoff_max_secs.saturating_mul(1000).max(min_ms);
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = min_ms.saturating_mul(1 << exp).min(max_ms);
        let half = ceiling / 2;
        let jitter = if half > 0 {
            rand::rng().random_range(0..=half)
        } else {
            0
        };
        Duration::from_millis(ceiling - half + jitter)
    }
}

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session reached `Active`.
    Connected,
    /// Connection attempt failed or an active connection was lost.
    Disconnected { error: TuyaError },
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Datapoint values reported by the device.
    Dps(DpMap),
}

enum SessionCommand {
    Control {
        dps: DpMap,
        resp_tx: oneshot::Sender<Result<()>>,
    },
    Query {
        resp_tx: oneshot::Sender<Result<DpMap>>,
    },
}

impl SessionCommand {
    fn fail(self, err: TuyaError) {
        match self {
            SessionCommand::Control { resp_tx, .. } => {
                let _ = resp_tx.send(Err(err));
            }
            SessionCommand::Query { resp_tx } => {
                let _ = resp_tx.send(Err(err));
            }
        }
    }
}

/// Everything needed to start a session.
pub struct SessionParams {
    pub device_id: String,
    pub version: Version,
    pub keys: KeyStore,
    pub connector: Arc<dyn Connector>,
    pub config: SessionConfig,
    pub(crate) local_nonce: Option<[u8; KEY_LEN]>,
    pub(crate) events: Option<broadcast::Sender<SessionEvent>>,
}

impl SessionParams {
    pub fn new<S: Into<String>>(
        device_id: S,
        version: Version,
        keys: KeyStore,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            version,
            keys,
            connector,
            config: SessionConfig::default(),
            local_nonce: None,
            events: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Publishes into an existing event channel instead of a fresh one.
    pub fn events(mut self, events: broadcast::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    device_id: Arc<str>,
    commands: mpsc::Sender<SessionCommand>,
    phase_rx: watch::Receiver<Phase>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase_rx.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase_rx.clone()
    }

    /// Resolves once the session is in `phase`, or fails if the session task is gone.
    pub async fn wait_for_phase(&self, phase: Phase) -> Result<()> {
        let mut rx = self.phase_rx.clone();
        rx.wait_for(|p| *p == phase)
            .await
            .map(|_| ())
            .map_err(|_| TuyaError::Cancelled)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() || self.phase() != Phase::Active {
            return Err(TuyaError::NotConnected);
        }
        Ok(())
    }

    async fn submit(&self, cmd: SessionCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TuyaError::NotConnected)
    }

    /// Writes a control command. Resolves once the frame is on the wire.
    pub async fn control(&self, dps: DpMap) -> Result<()> {
        self.ensure_active()?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.submit(SessionCommand::Control { dps, resp_tx }).await?;
        resp_rx.await.map_err(|_| TuyaError::Cancelled)?
    }

    /// Queries every datapoint and waits for the matching reply.
    pub async fn query(&self) -> Result<DpMap> {
        self.ensure_active()?;
        let (resp_tx, resp_rx) = oneshot::channel();
        self.submit(SessionCommand::Query { resp_tx }).await?;
        resp_rx.await.map_err(|_| TuyaError::Cancelled)?
    }

    /// Stops the session permanently; outstanding requests resolve with `Cancelled`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session task has exited.
    pub async fn closed(&self) {
        let mut rx = self.phase_rx.clone();
        while rx.changed().await.is_ok() {}
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("device_id", &self.device_id)
            .field("phase", &self.phase())
            .finish()
    }
}

struct Pending {
    deadline: Instant,
    resp_tx: oneshot::Sender<Result<DpMap>>,
}

/// One live transport with its codec state.
struct Connection {
    framed: Framed<BoxTransport, FrameCodec>,
    seqno: u32,
    pending: HashMap<u32, Pending>,
    last_received: Instant,
    write_timeout: Duration,
}

impl Connection {
    fn new(transport: BoxTransport, codec: FrameCodec, write_timeout: Duration) -> Self {
        Self {
            framed: Framed::new(transport, codec),
            seqno: 1,
            pending: HashMap::new(),
            last_received: Instant::now(),
            write_timeout,
        }
    }

    async fn send(&mut self, command: CommandType, payload: Vec<u8>) -> Result<u32> {
        let seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        trace!("Sending {} seqno={} len={}", command, seqno, payload.len());
        // Writes share the request deadline
        timeout(
            self.write_timeout,
            self.framed
                .send(Frame::new(seqno, MessageWrapper::new(command, payload))),
        )
        .await
        .map_err(|_| TuyaError::Timeout)??;
        Ok(seqno)
    }

    async fn recv(&mut self) -> Result<Frame> {
        match self.framed.next().await {
            Some(Ok(frame)) => {
                self.last_received = Instant::now();
                Ok(frame)
            }
            Some(Err(e)) => Err(e),
            None => Err(TuyaError::Io("connection closed by device".into())),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Resolves every pending request: expired ones with `Timeout`, the rest with `Cancelled`.
    fn fail_pending(&mut self) {
        let now = Instant::now();
        for (_, pending) in self.pending.drain() {
            let result = if pending.deadline <= now {
                TuyaError::Timeout
            } else {
                TuyaError::Cancelled
            };
            let _ = pending.resp_tx.send(Err(result));
        }
    }
}

struct Session {
    device_id: String,
    version: Version,
    keys: KeyStore,
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    local_nonce: Option<[u8; KEY_LEN]>,
    phase_tx: watch::Sender<Phase>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    auth_failures: u32,
}

/// Spawns the session task on the current tokio runtime.
pub fn spawn(params: SessionParams) -> SessionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
    let (phase_tx, phase_rx) = watch::channel(Phase::Disconnected);
    let events = params
        .events
        .unwrap_or_else(|| broadcast::channel(EVENT_QUEUE_LEN).0);
    let cancel = CancellationToken::new();

    let handle = SessionHandle {
        device_id: Arc::from(params.device_id.as_str()),
        commands: tx,
        phase_rx,
        events: events.clone(),
        cancel: cancel.clone(),
    };

    let session = Session {
        device_id: params.device_id,
        version: params.version,
        keys: params.keys,
        connector: params.connector,
        config: params.config,
        local_nonce: params.local_nonce,
        phase_tx,
        events,
        cancel,
        auth_failures: 0,
    };
    tokio::spawn(session.run(rx));
    handle
}

impl Session {
    fn set_phase(&self, phase: Phase) {
        let old = self.phase_tx.send_replace(phase);
        if old != phase {
            debug!("Device {}: {} -> {}", self.device_id, old, phase);
        }
    }

    fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        debug!("Starting session task for device {}", self.device_id);
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if failures > 0 {
                if !self.config.auto_reconnect {
                    info!("Device {}: reconnect disabled, stopping session", self.device_id);
                    break;
                }
                let delay = self.config.backoff(failures);
                info!(
                    "Device {}: reconnecting in {}ms (attempt {})",
                    self.device_id,
                    delay.as_millis(),
                    failures
                );
                self.emit(SessionEvent::Reconnecting {
                    attempt: failures,
                    delay,
                });
                if !self.wait_for_backoff(&mut rx, delay).await {
                    break;
                }
            }

            self.set_phase(Phase::Connecting);
            let mut conn = match self.connect(&mut rx).await {
                Ok(conn) => conn,
                Err(TuyaError::Cancelled) => break,
                Err(e) => {
                    self.report_failure(&e);
                    failures = failures.saturating_add(1);
                    continue;
                }
            };

            failures = 0;
            let result = self.maintain(&mut conn, &mut rx).await;
            conn.fail_pending();
            conn.framed.codec_mut().keys_mut().clear_session_key();
            drop(conn);

            match result {
                Ok(()) => break,
                Err(e) => {
                    self.report_failure(&e);
                    failures = 1;
                }
            }
        }

        self.set_phase(Phase::Closing);
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            cmd.fail(TuyaError::Cancelled);
        }
        self.cancel.cancel();
        self.set_phase(Phase::Disconnected);
        debug!("Session task for device {} exited", self.device_id);
    }

    fn report_failure(&mut self, err: &TuyaError) {
        let phase = self.phase();
        if err.kind() == ErrorKind::Authentication {
            self.auth_failures += 1;
            warn!(
                "Device {}: authentication failed during {} ({}); local key or version is probably stale \
                 (error {}, {} failure(s))",
                self.device_id, phase, err, ERR_KEY_OR_VER, self.auth_failures
            );
        } else {
            warn!(
                "Device {}: {} error during {}: {}",
                self.device_id,
                err.kind(),
                phase,
                err
            );
        }
        self.set_phase(Phase::Disconnected);
        self.emit(SessionEvent::Disconnected { error: err.clone() });
    }

    /// Sleeps out the backoff delay. Returns `false` when the session should end.
    async fn wait_for_backoff(&self, rx: &mut mpsc::Receiver<SessionCommand>, delay: Duration) -> bool {
        let sleep_fut = sleep(delay);
        tokio::pin!(sleep_fut);

        loop {
            tokio::select! {
                _ = &mut sleep_fut => return true,
                _ = self.cancel.cancelled() => return false,
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        debug!("Rejecting command during backoff for device {}", self.device_id);
                        cmd.fail(TuyaError::NotConnected);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Opens the transport and negotiates keys, rejecting commands meanwhile.
    async fn connect(&self, rx: &mut mpsc::Receiver<SessionCommand>) -> Result<Connection> {
        let attempt = timeout(self.config.connect_timeout(), self.open());
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TuyaError::Cancelled),
                res = &mut attempt => return res.unwrap_or(Err(TuyaError::Timeout)),
                Some(cmd) = rx.recv() => cmd.fail(TuyaError::NotConnected),
            }
        }
    }

    async fn open(&self) -> Result<Connection> {
        info!("Connecting to device {} (protocol {})", self.device_id, self.version);
        let transport = self.connector.connect().await?;
        let codec = FrameCodec::new(self.version, self.keys.clone());
        let mut conn = Connection::new(transport, codec, self.config.request_timeout());

        if self.version.requires_negotiation() {
            self.set_phase(Phase::NegotiatingKey);
            self.negotiate(&mut conn).await?;
        }
        Ok(conn)
    }

    async fn negotiate(&self, conn: &mut Connection) -> Result<()> {
        let local_nonce = self.local_nonce.unwrap_or_else(|| {
            let mut nonce = [0u8; KEY_LEN];
            rand::rng().fill_bytes(&mut nonce);
            nonce
        });
        let local_key = *self.keys.local_key();

        debug!("Device {}: starting session key negotiation", self.device_id);
        conn.send(CommandType::SessKeyNegStart, local_nonce.to_vec())
            .await?;

        let resp = loop {
            let frame = conn.recv().await?;
            if frame.command() == CommandType::SessKeyNegResp {
                break frame;
            }
            debug!(
                "Device {}: ignoring {} while negotiating",
                self.device_id,
                frame.command()
            );
        };

        let payload = resp.payload();
        if payload.len() < NEG_RESP_LEN {
            debug!(
                "Device {}: negotiation response is {} bytes, expected {}",
                self.device_id,
                payload.len(),
                NEG_RESP_LEN
            );
            return Err(TuyaError::InvalidPayload);
        }
        let remote_nonce = &payload[..KEY_LEN];
        let proof = &payload[KEY_LEN..NEG_RESP_LEN];
        if !crypto::verify_hmac_sha256(&local_key, &local_nonce, proof)? {
            return Err(TuyaError::Authentication(
                "device proof of the local key does not verify".into(),
            ));
        }

        let answer = crypto::hmac_sha256(&local_key, remote_nonce)?;
        conn.send(CommandType::SessKeyNegFinish, answer.to_vec())
            .await?;

        let session_key =
            crypto::generate_session_key(&local_nonce, remote_nonce, &local_key, self.version)?;
        conn.framed.codec_mut().keys_mut().set_session_key(session_key);
        debug!("Device {}: session key installed", self.device_id);
        Ok(())
    }

    /// Runs the active connection. `Ok` means the session was asked to stop.
    async fn maintain(
        &self,
        conn: &mut Connection,
        rx: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<()> {
        self.set_phase(Phase::Active);
        info!("Device {} connected", self.device_id);
        self.emit(SessionEvent::Connected);

        if self.config.query_on_connect {
            self.send_command(conn, CommandType::DpQuery, None).await?;
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness = self.config.liveness_timeout();

        loop {
            let next_deadline = conn.next_deadline();
            let silent_until = conn.last_received + liveness;

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.process_command(conn, cmd).await?,
                    None => {
                        debug!("All handles for device {} dropped, stopping session", self.device_id);
                        return Ok(());
                    }
                },
                frame = conn.recv() => self.dispatch(conn, frame?),
                _ = heartbeat.tick() => {
                    trace!("Heartbeat for device {}", self.device_id);
                    self.send_command(conn, CommandType::HeartBeat, None).await?;
                }
                _ = sleep_until(silent_until) => {
                    warn!(
                        "Device {}: nothing received for {}s",
                        self.device_id,
                        liveness.as_secs()
                    );
                    return Err(TuyaError::Timeout);
                }
                _ = async {
                    match next_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    warn!("Device {}: status request timed out", self.device_id);
                    return Err(TuyaError::Timeout);
                }
            }
        }
    }

    async fn send_command(
        &self,
        conn: &mut Connection,
        command: CommandType,
        dps: Option<&DpMap>,
    ) -> Result<u32> {
        let (cmd, body) = generate_payload(self.version, &self.device_id, command, dps, timestamp());
        conn.send(cmd, serde_json::to_vec(&body)?).await
    }

    async fn process_command(&self, conn: &mut Connection, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Control { dps, resp_tx } => {
                debug!("Device {}: control {:?}", self.device_id, dps);
                match self.send_command(conn, CommandType::Control, Some(&dps)).await {
                    Ok(_) => {
                        let _ = resp_tx.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = resp_tx.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
            SessionCommand::Query { resp_tx } => {
                match self.send_command(conn, CommandType::DpQuery, None).await {
                    Ok(seqno) => {
                        conn.pending.insert(
                            seqno,
                            Pending {
                                deadline: Instant::now() + self.config.request_timeout(),
                                resp_tx,
                            },
                        );
                        Ok(())
                    }
                    Err(e) => {
                        let _ = resp_tx.send(Err(e.clone()));
                        Err(e)
                    }
                }
            }
        }
    }

    fn dispatch(&self, conn: &mut Connection, frame: Frame) {
        let command = frame.command();
        trace!(
            "Device {}: received {} seqno={} retcode={:?} len={}",
            self.device_id,
            command,
            frame.seqno,
            frame.retcode,
            frame.payload().len()
        );

        let carries_state = matches!(
            command,
            CommandType::Status
                | CommandType::DpQuery
                | CommandType::DpQueryNew
                | CommandType::Control
                | CommandType::ControlNew
        );
        if !carries_state {
            if command != CommandType::HeartBeat {
                debug!("Device {}: ignoring {}", self.device_id, command);
            }
            return;
        }

        let dps = if frame.payload().is_empty() {
            None
        } else {
            match parse_dps(frame.payload()) {
                Ok(dps) => dps,
                Err(e) => {
                    debug!(
                        "Device {}: {} payload is not JSON ({}): {}",
                        self.device_id,
                        command,
                        e,
                        String::from_utf8_lossy(frame.payload())
                    );
                    None
                }
            }
        };

        if let Some(pending) = conn.pending.remove(&frame.seqno) {
            let _ = pending.resp_tx.send(Ok(dps.clone().unwrap_or_default()));
        }

        if let Some(dps) = dps.filter(|d| !d.is_empty()) {
            self.emit(SessionEvent::Dps(dps));
        }
    }
}
