// Report channel: framed telemetry over one long-lived TCP connection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::net;
use super::tasks::TaskSet;
use crate::config::{AgentConfig, CONFIG_READ_BUFFER};
use crate::error::{AgentError, Result};
use crate::platform::traits::ResourceProbe;
use crate::wire::frame::{Frame, MessageType};
use crate::wire::payload::BatteryStatus;
use crate::wire::SessionIds;

/// Parameters announced by the server right after the session-open frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerConfig {
    pub resource_interval: Duration,
    pub measurement_probability: f64,
}

impl ServerConfig {
    /// Used whenever the announced configuration cannot be parsed.
    pub fn fallback(config: &AgentConfig) -> Self {
        Self {
            resource_interval: config.resource_interval(),
            measurement_probability: 1.0,
        }
    }

    /// The announced sampling interval, or `fallback` when the server announced zero.
    pub fn resource_interval_or(&self, fallback: Duration) -> Duration {
        if self.resource_interval.is_zero() {
            fallback
        } else {
            self.resource_interval
        }
    }

    /// Parse the configuration read off the socket. Everything past the last `}` is ignored.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let end = text
            .rfind('}')
            .ok_or_else(|| AgentError::ConfigParse("no closing brace in server config".into()))?;
        let json: Value = serde_json::from_str(&text[..=end])
            .map_err(|e| AgentError::ConfigParse(e.to_string()))?;

        let interval_ms: u64 = field(&json, "resourceInterval")?;
        // Key spelling is fixed by the server.
        let probability: f64 = field(&json, "measurmentProbability")?;
        Ok(Self {
            resource_interval: Duration::from_millis(interval_ms),
            measurement_probability: probability,
        })
    }
}

/// Numeric field that the server may send either as a number or as a string.
fn field<T: std::str::FromStr>(json: &Value, key: &str) -> Result<T> {
    let raw = match json.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(AgentError::ConfigParse(format!("missing {}", key))),
    };
    raw.parse()
        .map_err(|_| AgentError::ConfigParse(format!("bad {} {:?}", key, raw)))
}

struct BatteryTracker {
    last_level: i32,
    last_plugged: i32,
}

struct ReportShared {
    ids: SessionIds,
    config: AgentConfig,
    resources: Arc<dyn ResourceProbe>,
    app_char_id: Arc<Mutex<Option<String>>>,
    stream: Arc<AsyncMutex<Option<TcpStream>>>,
    running: AtomicBool,
    sampled_in: AtomicBool,
    server_config: Mutex<Option<ServerConfig>>,
    sequence: AtomicU32,
    battery: Mutex<BatteryTracker>,
    app_uid_sent: AtomicBool,
    frames_sent: AtomicU64,
    tasks: TaskSet,
}

pub struct ReportChannel {
    shared: Arc<ReportShared>,
}

impl ReportChannel {
    /// Start bringing the channel up in the background.
    ///
    /// The socket lock is taken before this returns, so frames sent right away queue behind
    /// the handshake instead of racing it. Must be called inside a tokio runtime.
    pub fn open(
        config: &AgentConfig,
        ids: SessionIds,
        resources: Arc<dyn ResourceProbe>,
        app_char_id: Arc<Mutex<Option<String>>>,
    ) -> Self {
        let stream = Arc::new(AsyncMutex::new(None));
        let shared = Arc::new(ReportShared {
            ids,
            config: config.clone(),
            resources,
            app_char_id,
            stream: stream.clone(),
            running: AtomicBool::new(true),
            sampled_in: AtomicBool::new(false),
            server_config: Mutex::new(None),
            sequence: AtomicU32::new(0),
            battery: Mutex::new(BatteryTracker {
                last_level: -100,
                last_plugged: -100,
            }),
            app_uid_sent: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            tasks: TaskSet::new("report"),
        });

        match stream.try_lock_owned() {
            Ok(guard) => shared.tasks.spawn("bring-up", bring_up(shared.clone(), guard)),
            Err(_) => {
                warn!("report socket lock unexpectedly held at open");
                shared.running.store(false, Ordering::SeqCst);
            }
        }
        Self { shared }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether this session won the sampling draw. False until the draw has happened.
    pub fn is_sampled_in(&self) -> bool {
        self.shared.sampled_in.load(Ordering::SeqCst)
    }

    pub fn server_config(&self) -> Option<ServerConfig> {
        *self.shared.server_config.lock()
    }

    /// Last sequence number handed out.
    pub fn sequence(&self) -> u32 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    pub fn frames_sent(&self) -> u64 {
        self.shared.frames_sent.load(Ordering::SeqCst)
    }

    pub async fn send_location(&self, payload: String) -> Result<()> {
        self.shared.send(MessageType::Location, payload).await
    }

    pub async fn send_periodic_stats(&self, payload: String) -> Result<()> {
        self.shared.send(MessageType::PeriodicStats, payload).await
    }

    pub async fn send_session_close(&self, payload: String) -> Result<()> {
        self.shared.send(MessageType::SessionClose, payload).await
    }

    /// Forward a battery update if the session is sampled in and level or plug state moved.
    /// Returns whether a frame was sent.
    pub async fn send_battery(&self, status: &BatteryStatus) -> Result<bool> {
        if !self.is_sampled_in() {
            return Ok(false);
        }
        {
            let mut last = self.shared.battery.lock();
            if last.last_level == status.level && last.last_plugged == status.plugged {
                return Ok(false);
            }
            last.last_level = status.level;
            last.last_plugged = status.plugged;
        }
        self.shared
            .send(MessageType::Battery, status.to_payload())
            .await?;
        Ok(true)
    }

    /// Stop the background loops and close the socket.
    pub async fn close(&self) {
        let shared = &self.shared;
        shared.tasks.shutdown().await;
        shared.running.store(false, Ordering::SeqCst);
        if let Some(mut stream) = shared.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("closing report stream: {}", e);
            }
        }
        info!(
            "report channel closed session_id={} frames_sent={}",
            shared.ids.session_id,
            shared.frames_sent.load(Ordering::SeqCst)
        );
    }
}

impl Drop for ReportChannel {
    fn drop(&mut self) {
        self.shared.tasks.token().cancel();
    }
}

impl ReportShared {
    /// Queue behind the socket lock and write one frame, giving up after the connect timeout.
    ///
    /// A timed-out send stops the channel and cancels a handshake still holding the lock.
    async fn send(&self, message_type: MessageType, payload: String) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AgentError::NotRunning);
        }
        let limit = self.config.connect_timeout();
        match tokio::time::timeout(limit, self.send_locked(message_type, payload)).await {
            Ok(result) => result,
            Err(_) => {
                if self.running.swap(false, Ordering::SeqCst) {
                    warn!(
                        "report channel stopped: type={} send timed out after {}ms session_id={}",
                        message_type.code(),
                        limit.as_millis(),
                        self.ids.session_id
                    );
                }
                self.tasks.token().cancel();
                Err(AgentError::SendTimeout(limit))
            }
        }
    }

    async fn send_locked(&self, message_type: MessageType, payload: String) -> Result<()> {
        let mut guard = self.stream.lock().await;
        self.write_frame(&mut guard, message_type, payload).await
    }

    /// Write one frame while holding the socket lock. Any failure stops the channel for good.
    async fn write_frame(
        &self,
        slot: &mut Option<TcpStream>,
        message_type: MessageType,
        payload: String,
    ) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AgentError::NotRunning);
        }
        if slot.is_none() {
            self.stop(slot, "no connection");
            return Err(AgentError::NotRunning);
        }

        let mut frame = Frame::new(message_type, &self.ids, payload);
        if message_type.is_sequenced() {
            frame = frame.with_sequence(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        }
        let written = match slot.as_mut() {
            Some(stream) => stream.write_all(&frame.encode()).await,
            None => return Err(AgentError::NotRunning),
        };
        match written {
            Ok(()) => {
                self.frames_sent.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "sent frame type={} seq={:?} session_id={}",
                    message_type.code(),
                    frame.sequence,
                    self.ids.session_id
                );
                Ok(())
            }
            Err(e) => {
                self.stop(slot, "write failed");
                Err(AgentError::Io(e))
            }
        }
    }

    fn stop(&self, slot: &mut Option<TcpStream>, reason: &str) {
        if self.running.swap(false, Ordering::SeqCst) {
            warn!(
                "report channel stopped: {} session_id={}",
                reason, self.ids.session_id
            );
        }
        *slot = None;
        self.tasks.token().cancel();
    }
}

async fn bring_up(shared: Arc<ReportShared>, mut guard: OwnedMutexGuard<Option<TcpStream>>) {
    if let Err(e) = handshake(&shared, &mut guard).await {
        warn!("report handshake failed: {}", e);
        shared.stop(&mut guard, "handshake failed");
        return;
    }
    drop(guard);

    match shared.resources.system_info().await {
        Ok(info) => {
            if let Err(e) = shared.send(MessageType::SystemInfo, info.to_payload()).await {
                warn!("system info frame not sent: {}", e);
            }
        }
        Err(e) => warn!("system info unavailable: {}", e),
    }

    tokio::time::sleep(shared.config.init_delay()).await;

    let announced = *shared.server_config.lock();
    let server = announced.unwrap_or_else(|| ServerConfig::fallback(&shared.config));
    // One draw for the whole session.
    let draw: f64 = rand::thread_rng().gen();
    if draw <= server.measurement_probability {
        shared.sampled_in.store(true, Ordering::SeqCst);
        let interval = server.resource_interval_or(shared.config.resource_interval());
        shared
            .tasks
            .spawn("resource-sampler", resource_loop(shared.clone(), interval));
    } else {
        info!(
            "session not sampled for resource stats draw={:.3} probability={}",
            draw, server.measurement_probability
        );
    }
}

async fn handshake(shared: &ReportShared, slot: &mut Option<TcpStream>) -> Result<()> {
    let addr = net::resolve(&shared.config.server_host, shared.config.report_port).await?;
    *slot = Some(net::connect(addr, shared.config.connect_timeout()).await?);

    shared
        .write_frame(
            slot,
            MessageType::SessionOpen,
            shared.ids.platform.to_string(),
        )
        .await?;

    let stream = slot.as_mut().ok_or(AgentError::ChannelClosed)?;
    let mut buf = [0u8; CONFIG_READ_BUFFER];
    let n = stream.read(&mut buf).await?;
    let server = ServerConfig::parse(&buf[..n]).unwrap_or_else(|e| {
        warn!("server config unusable, using defaults: {}", e);
        ServerConfig::fallback(&shared.config)
    });
    info!(
        "report channel up server={} resource_interval_ms={} probability={}",
        addr,
        server.resource_interval.as_millis(),
        server.measurement_probability
    );
    *shared.server_config.lock() = Some(server);
    Ok(())
}

async fn resource_loop(shared: Arc<ReportShared>, interval: Duration) {
    tokio::time::sleep(shared.config.init_delay()).await;
    loop {
        match shared.resources.resource_snapshot().await {
            Ok(snapshot) => {
                if let Err(e) = shared.send(MessageType::Resource, snapshot.to_payload()).await {
                    warn!("resource sampler stopping: {}", e);
                    return;
                }
            }
            Err(e) => warn!("resource snapshot unavailable: {}", e),
        }

        if !shared.app_uid_sent.load(Ordering::SeqCst) {
            let app_char_id = shared.app_char_id.lock().clone();
            if let Some(id) = app_char_id {
                tokio::time::sleep(shared.config.init_delay()).await;
                match shared.send(MessageType::AppUid, id).await {
                    Ok(()) => shared.app_uid_sent.store(true, Ordering::SeqCst),
                    Err(e) => warn!("application id frame not sent: {}", e),
                }
            }
        }

        tokio::time::sleep(interval).await;
    }
}
