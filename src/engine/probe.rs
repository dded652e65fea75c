// Probe engine: keeps a TCP and a UDP channel to the measurement server and answers its pings.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::net;
use super::tasks::TaskSet;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::platform::traits::RadioState;
use crate::wire::packet::{build_echo, build_packet, interval_from_response, ClientState, HANDSHAKE_OFFSET};
use crate::wire::SessionIds;

/// Write half of the current TCP connection, tagged with the generation that opened it.
struct TcpLink {
    generation: u64,
    writer: OwnedWriteHalf,
}

struct ProbeShared {
    ids: SessionIds,
    radio: Arc<dyn RadioState>,
    addr: SocketAddr,
    packet_size: usize,
    connect_timeout: Duration,
    ping_start_delay: Duration,
    default_interval: Duration,
    udp: Arc<UdpSocket>,
    tcp: AsyncMutex<Option<TcpLink>>,
    tcp_alive: AtomicBool,
    tcp_generation: AtomicU64,
    interval_tx: watch::Sender<Duration>,
    reschedules: AtomicU32,
    tasks: TaskSet,
}

pub struct ProbeEngine {
    shared: Arc<ProbeShared>,
}

impl ProbeEngine {
    /// Connect both channels, send the punch-through datagram and start the loops.
    pub async fn start(
        config: &AgentConfig,
        ids: SessionIds,
        radio: Arc<dyn RadioState>,
    ) -> Result<Self> {
        let addr = net::resolve(&config.server_host, config.probe_port).await?;
        let stream = net::connect(addr, config.connect_timeout()).await?;

        let bind_ip = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let udp = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
        udp.connect(addr).await?;

        let (reader, writer) = stream.into_split();
        let (interval_tx, interval_rx) = watch::channel(config.default_ping_interval());

        let shared = Arc::new(ProbeShared {
            ids,
            radio,
            addr,
            packet_size: config.packet_size,
            connect_timeout: config.connect_timeout(),
            ping_start_delay: config.ping_start_delay(),
            default_interval: config.default_ping_interval(),
            udp: Arc::new(udp),
            tcp: AsyncMutex::new(Some(TcpLink {
                generation: 0,
                writer,
            })),
            tcp_alive: AtomicBool::new(true),
            tcp_generation: AtomicU64::new(0),
            interval_tx,
            reschedules: AtomicU32::new(0),
            tasks: TaskSet::new("probe"),
        });

        if let Err(e) = shared.send_udp_ping().await {
            warn!("punch-through datagram to {} failed: {}", addr, e);
        }

        shared.tasks.spawn("ping", ping_loop(shared.clone(), interval_rx));
        shared.tasks.spawn("udp-recv", udp_loop(shared.clone()));
        shared.tasks.spawn("tcp-recv", tcp_loop(shared.clone(), reader, 0));

        info!(
            "probe engine started server={} session_id={}",
            addr, shared.ids.session_id
        );
        Ok(Self { shared })
    }

    /// Effective ping interval; zero while the timer is disabled.
    pub fn ping_interval(&self) -> Duration {
        *self.shared.interval_tx.borrow()
    }

    /// How many times the ping timer was rescheduled from a server-announced interval.
    pub fn reschedule_count(&self) -> u32 {
        self.shared.reschedules.load(Ordering::SeqCst)
    }

    pub fn is_tcp_alive(&self) -> bool {
        self.shared.tcp_alive.load(Ordering::SeqCst)
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn local_udp_addr(&self) -> Option<SocketAddr> {
        self.shared.udp.local_addr().ok()
    }

    /// Cancel the loops, close both sockets and release the radio listener.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.tasks.shutdown().await;
        shared.tcp_alive.store(false, Ordering::SeqCst);

        if let Some(mut link) = shared.tcp.lock().await.take() {
            if let Err(e) = link.writer.shutdown().await {
                debug!("closing probe tcp stream: {}", e);
            }
        }
        shared.radio.stop_listening();
        info!("probe engine stopped session_id={}", shared.ids.session_id);
    }
}

impl Drop for ProbeEngine {
    fn drop(&mut self) {
        self.shared.tasks.token().cancel();
    }
}

impl ProbeShared {
    fn client_state(&self) -> ClientState {
        ClientState::capture(&self.ids, self.radio.as_ref())
    }

    async fn send_udp_ping(&self) -> Result<()> {
        let packet = build_packet(&self.client_state(), self.packet_size, HANDSHAKE_OFFSET)?;
        self.udp.send(&packet).await?;
        Ok(())
    }

    /// Write one TCP ping; a dead or failing stream is replaced by a fresh connection.
    async fn send_tcp_ping(self: &Arc<Self>) -> Result<()> {
        let packet = build_packet(&self.client_state(), self.packet_size, HANDSHAKE_OFFSET)?;

        if self.tcp_alive.load(Ordering::SeqCst) {
            let mut guard = self.tcp.lock().await;
            if let Some(link) = guard.as_mut() {
                match link.writer.write_all(&packet).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!("tcp ping to {} failed: {}", self.addr, e),
                }
            }
            *guard = None;
            self.tcp_alive.store(false, Ordering::SeqCst);
        }
        self.reconnect_tcp().await
    }

    async fn reconnect_tcp(self: &Arc<Self>) -> Result<()> {
        let stream = net::connect(self.addr, self.connect_timeout).await?;
        let (reader, writer) = stream.into_split();
        let generation = self.tcp_generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.tcp.lock().await = Some(TcpLink { generation, writer });
        self.tcp_alive.store(true, Ordering::SeqCst);
        self.tasks
            .spawn("tcp-recv", tcp_loop(self.clone(), reader, generation));
        info!("probe tcp reconnected to {} generation={}", self.addr, generation);
        Ok(())
    }

    fn mark_tcp_dead(&self, generation: u64) {
        if self.tcp_generation.load(Ordering::SeqCst) == generation {
            self.tcp_alive.store(false, Ordering::SeqCst);
        }
    }

    /// Adopt the interval announced by the server, restarting the timer if it changed.
    fn adopt_interval(&self, interval: Duration) {
        let changed = self.interval_tx.send_if_modified(|current| {
            if *current == interval {
                false
            } else {
                *current = interval;
                true
            }
        });
        if changed {
            self.reschedules.fetch_add(1, Ordering::SeqCst);
            info!(
                "ping interval renegotiated interval_ms={} default_ms={}",
                interval.as_millis(),
                self.default_interval.as_millis()
            );
        } else {
            debug!("server kept ping interval at {}ms", interval.as_millis());
        }
    }
}

async fn ping_loop(shared: Arc<ProbeShared>, mut interval_rx: watch::Receiver<Duration>) {
    loop {
        let interval = *interval_rx.borrow_and_update();
        if interval.is_zero() {
            // Disabled until the server announces an interval.
            if interval_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + shared.ping_start_delay, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = shared.send_udp_ping().await {
                        warn!("udp ping failed: {}", e);
                    }
                    if let Err(e) = shared.send_tcp_ping().await {
                        warn!("tcp ping failed: {}", e);
                    }
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

async fn udp_loop(shared: Arc<ProbeShared>) {
    let mut receive = vec![0u8; shared.packet_size];
    loop {
        let n = match shared.udp.recv(&mut receive).await {
            Ok(n) => n,
            Err(e) => {
                warn!("udp receive failed, stopping loop: {}", e);
                return;
            }
        };
        if n == 0 {
            continue;
        }

        let echo = match build_echo(&shared.client_state(), &receive[..n], shared.packet_size) {
            Ok(echo) => echo,
            Err(e) => {
                warn!("building udp echo failed: {}", e);
                continue;
            }
        };
        if let Err(e) = shared.udp.send(&echo).await {
            warn!("udp echo failed, stopping loop: {}", e);
            return;
        }
    }
}

async fn tcp_loop(shared: Arc<ProbeShared>, mut reader: OwnedReadHalf, generation: u64) {
    let mut receive = vec![0u8; shared.packet_size];
    let mut first_response = true;

    loop {
        let n = match reader.read(&mut receive).await {
            Ok(0) => {
                debug!("probe tcp closed by server generation={}", generation);
                shared.mark_tcp_dead(generation);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("probe tcp read failed generation={}: {}", generation, e);
                shared.mark_tcp_dead(generation);
                return;
            }
        };

        if first_response {
            first_response = false;
            match interval_from_response(&receive[..n]) {
                Some(interval) => shared.adopt_interval(interval),
                None => debug!("first tcp response too short for an interval ({} bytes)", n),
            }
            continue;
        }

        if let Err(e) = echo_tcp(&shared, &receive[..n], generation).await {
            warn!("tcp echo failed generation={}: {}", generation, e);
            shared.mark_tcp_dead(generation);
            return;
        }
    }
}

/// Echo a TCP read: as many bytes as were received, with a fresh client state at offset 2.
async fn echo_tcp(shared: &ProbeShared, received: &[u8], generation: u64) -> Result<()> {
    let echo = build_echo(&shared.client_state(), received, shared.packet_size)?;
    let len = received.len().min(echo.len());

    let mut guard = shared.tcp.lock().await;
    match guard.as_mut() {
        Some(link) if link.generation == generation => {
            link.writer.write_all(&echo[..len]).await?;
            Ok(())
        }
        _ => Err(AgentError::ChannelClosed),
    }
}
