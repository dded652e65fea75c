// Measurement session state machine: reference-counted starts, delayed finalize, teardown.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::identity::{hash_device_id, new_session_id};
use super::location::LocationReporter;
use super::probe::ProbeEngine;
use super::report::ReportChannel;
use super::tasks::TaskSet;
use crate::config::{AgentConfig, SECTION_DELIM};
use crate::error::AgentError;
use crate::platform::Platform;
use crate::stats::events::EventStats;
use crate::stats::sanitize_field;
use crate::stats::traffic::NetworkTrafficStats;
use crate::wire::payload::BatteryStatus;
use crate::wire::SessionIds;

/// What the host knows about itself when it starts a session.
#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    pub app_package: String,
    pub app_uid: u32,
    /// Hardware identifiers hashed into the device id.
    pub hardware_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
    PendingEnd,
}

/// Everything owned by one measurement session.
struct ActiveSession {
    ids: SessionIds,
    events: Arc<EventStats>,
    traffic: Arc<NetworkTrafficStats>,
    report: Arc<ReportChannel>,
    probe: Arc<Mutex<Option<ProbeEngine>>>,
    location: Arc<LocationReporter>,
    tasks: TaskSet,
}

struct PendingEnd {
    generation: u64,
    token: CancellationToken,
}

struct ControllerState {
    active_starts: u32,
    phase: SessionPhase,
    session: Option<Arc<ActiveSession>>,
    pending_end: Option<PendingEnd>,
    next_generation: u64,
}

pub struct SessionController {
    config: Mutex<AgentConfig>,
    platform: Platform,
    state: Mutex<ControllerState>,
    device_id: Mutex<Option<String>>,
    app_char_id: Arc<Mutex<Option<String>>>,
}

impl SessionController {
    pub fn new(config: AgentConfig, platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            platform,
            state: Mutex::new(ControllerState {
                active_starts: 0,
                phase: SessionPhase::Idle,
                session: None,
                pending_end: None,
                next_generation: 0,
            }),
            device_id: Mutex::new(None),
            app_char_id: Arc::new(Mutex::new(None)),
        })
    }

    /// Count one more active start. The first one opens a session; a start during the
    /// hysteresis window cancels the pending finalize instead. Needs a tokio runtime context.
    pub fn start_session(self: &Arc<Self>, ctx: &DeviceContext) {
        let mut state = self.state.lock();
        state.active_starts += 1;

        if let Some(pending) = state.pending_end.take() {
            pending.token.cancel();
            state.phase = SessionPhase::Running;
            info!(
                "continuing session, pending end cancelled active_starts={}",
                state.active_starts
            );
            return;
        }

        if state.session.is_some() {
            debug!("session already running active_starts={}", state.active_starts);
            return;
        }

        let session = self.open_session(ctx);
        info!(
            "session started session_id={} device_id={} app={}",
            session.ids.session_id, session.ids.device_id, ctx.app_package
        );
        state.session = Some(session);
        state.phase = SessionPhase::Running;
    }

    /// Drop one active start. When the count reaches zero, finalize after the hysteresis window.
    pub fn end_session(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.active_starts == 0 {
            debug!("end_session without a matching start");
            return;
        }
        state.active_starts -= 1;
        if state.active_starts > 0 {
            debug!("session kept alive active_starts={}", state.active_starts);
            return;
        }
        if state.session.is_none() || state.pending_end.is_some() {
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let token = CancellationToken::new();
        state.pending_end = Some(PendingEnd {
            generation,
            token: token.clone(),
        });
        state.phase = SessionPhase::PendingEnd;

        let wait = self.config.lock().session_end_wait();
        info!("session end scheduled in {}ms", wait.as_millis());

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("delayed finalize {} cancelled", generation);
                }
                _ = tokio::time::sleep(wait) => {
                    controller.finish_pending(generation).await;
                }
            }
        });
    }

    /// Tear the session down now. No-op while starts are outstanding or when idle.
    pub async fn finish(&self) {
        let session = {
            let mut state = self.state.lock();
            if state.active_starts > 0 {
                debug!("finish ignored active_starts={}", state.active_starts);
                return;
            }
            if let Some(pending) = state.pending_end.take() {
                pending.token.cancel();
            }
            Self::take_session(&mut state)
        };
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    /// Finish on behalf of the delayed task, unless a start cancelled it in the meantime.
    async fn finish_pending(&self, generation: u64) {
        let session = {
            let mut state = self.state.lock();
            match &state.pending_end {
                Some(pending) if pending.generation == generation => {}
                _ => {
                    debug!("delayed finalize {} superseded", generation);
                    return;
                }
            }
            state.pending_end = None;
            Self::take_session(&mut state)
        };
        if let Some(session) = session {
            self.teardown(session).await;
        }
    }

    fn take_session(state: &mut ControllerState) -> Option<Arc<ActiveSession>> {
        state.active_starts = 0;
        state.phase = SessionPhase::Idle;
        state.session.take()
    }

    fn open_session(&self, ctx: &DeviceContext) -> Arc<ActiveSession> {
        let config = self.config.lock().clone();
        let ids = SessionIds {
            device_id: self.resolve_device_id(ctx),
            session_id: new_session_id(),
            app_id: config.application_id,
            platform: config.platform_tag,
        };

        let events = Arc::new(EventStats::new());
        let traffic = Arc::new(NetworkTrafficStats::new(
            self.platform.traffic.clone(),
            ctx.app_uid,
        ));
        for (id, value) in traffic.start_events() {
            events.values.append(id, value);
        }

        let report = Arc::new(ReportChannel::open(
            &config,
            ids.clone(),
            self.platform.resources.clone(),
            self.app_char_id.clone(),
        ));
        let location = Arc::new(LocationReporter::new(
            self.platform.location.clone(),
            report.clone(),
            config.hide_precise_location,
        ));
        let probe = Arc::new(Mutex::new(None));
        let tasks = TaskSet::new("session");

        {
            let probe = probe.clone();
            let radio = self.platform.radio.clone();
            let ids = ids.clone();
            let config = config.clone();
            tasks.spawn("probe-start", async move {
                match ProbeEngine::start(&config, ids, radio).await {
                    Ok(engine) => *probe.lock() = Some(engine),
                    Err(e) => warn!("probe engine not started: {}", e),
                }
            });
        }
        tasks.spawn(
            "periodic-stats",
            stats_loop(events.clone(), traffic.clone(), report.clone(), config.stats_interval()),
        );
        tasks.spawn(
            "location",
            location
                .clone()
                .run(config.location_initial_delay(), config.location_interval()),
        );

        Arc::new(ActiveSession {
            ids,
            events,
            traffic,
            report,
            probe,
            location,
            tasks,
        })
    }

    fn resolve_device_id(&self, ctx: &DeviceContext) -> String {
        let mut device_id = self.device_id.lock();
        match device_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let id = hash_device_id(&ctx.hardware_ids);
                *device_id = Some(id.clone());
                id
            }
        }
    }

    async fn teardown(&self, session: Arc<ActiveSession>) {
        let session_id = session.ids.session_id;
        session.traffic.end_session();
        // Loops go first so nothing else competes for the report socket.
        session.tasks.shutdown().await;

        // Both sends below are bounded by the report channel's send timeout.
        if !session.location.first_update_sent() {
            match session.location.send_current().await {
                Ok(true) => debug!("final location sent session_id={}", session_id),
                Ok(false) => {}
                Err(e) => debug!("final location not sent: {}", e),
            }
        }

        let summary = end_summary(&session.events, &session.traffic);
        if let Err(e) = session.report.send_session_close(summary).await {
            warn!("session close frame not sent session_id={}: {}", session_id, e);
        }

        let probe = session.probe.lock().take();
        if let Some(probe) = probe {
            probe.stop().await;
        }
        session.report.close().await;
        info!("session ended session_id={}", session_id);
    }

    pub fn capture_event(&self, id: i32) {
        if let Some(session) = self.current() {
            session.events.counts.increment(id);
        }
    }

    pub fn capture_event_value(&self, id: i32, value: f64) {
        if let Some(session) = self.current() {
            session.events.values.append(id, value);
        }
    }

    pub fn capture_event_string(&self, id: i32, value: &str) {
        if let Some(session) = self.current() {
            session.events.strings.append(id, sanitize_field(value));
        }
    }

    /// Token for a download starting now, or `None` outside a session.
    pub fn download_started(&self) -> Option<u64> {
        self.current().map(|s| s.traffic.download_started())
    }

    pub fn download_ended(&self, token: u64) {
        if let Some(session) = self.current() {
            session.traffic.download_ended(token);
        }
    }

    /// Forward a battery broadcast without blocking the caller.
    pub fn battery_changed(&self, status: BatteryStatus) {
        let Some(session) = self.current() else {
            return;
        };
        let report = session.report.clone();
        session.tasks.spawn("battery", async move {
            match report.send_battery(&status).await {
                Ok(sent) => debug!("battery level={} forwarded={}", status.level, sent),
                Err(AgentError::NotRunning) => {}
                Err(e) => warn!("battery frame not sent: {}", e),
            }
        });
    }

    /// Server used by the next session that starts.
    pub fn set_server_hostname(&self, host: &str) {
        self.config.lock().server_host = host.to_string();
    }

    pub fn server_hostname(&self) -> String {
        self.config.lock().server_host.clone()
    }

    pub fn set_application_char_id(&self, id: &str) {
        *self.app_char_id.lock() = Some(id.to_string());
    }

    /// Override the hashed device id for sessions started from now on.
    pub fn set_device_id(&self, id: &str) {
        *self.device_id.lock() = Some(id.to_string());
    }

    pub fn device_id(&self) -> Option<String> {
        self.device_id.lock().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn active_starts(&self) -> u32 {
        self.state.lock().active_starts
    }

    pub fn session_id(&self) -> Option<u64> {
        self.current().map(|s| s.ids.session_id)
    }

    pub fn report_running(&self) -> Option<bool> {
        self.current().map(|s| s.report.is_running())
    }

    fn current(&self) -> Option<Arc<ActiveSession>> {
        self.state.lock().session.clone()
    }
}

/// `values$strings$downloads`. Event counts are held back until the session ends.
fn periodic_payload(events: &EventStats, traffic: &NetworkTrafficStats) -> String {
    [
        events.values.drain_to_string(),
        events.strings.drain_to_string(),
        traffic.drain_to_string(),
    ]
    .join(&SECTION_DELIM.to_string())
}

/// `net$counts$values$strings$downloads`.
fn end_summary(events: &EventStats, traffic: &NetworkTrafficStats) -> String {
    [
        traffic.network_stats_string(),
        events.counts.drain_to_string(),
        events.values.drain_to_string(),
        events.strings.drain_to_string(),
        traffic.drain_to_string(),
    ]
    .join(&SECTION_DELIM.to_string())
}

async fn stats_loop(
    events: Arc<EventStats>,
    traffic: Arc<NetworkTrafficStats>,
    report: Arc<ReportChannel>,
    interval: std::time::Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        let payload = periodic_payload(&events, &traffic);
        if let Err(e) = report.send_periodic_stats(payload).await {
            warn!("periodic stats stopped: {}", e);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::traits::{TrafficSource, TxRx};

    struct FixedCounters;

    impl TrafficSource for FixedCounters {
        fn totals(&self) -> anyhow::Result<TxRx> {
            Ok(TxRx { tx: 10, rx: 20 })
        }

        fn mobile(&self) -> anyhow::Result<TxRx> {
            Ok(TxRx::default())
        }

        fn app(&self, _app_uid: u32) -> anyhow::Result<TxRx> {
            Ok(TxRx { tx: 1, rx: 2 })
        }
    }

    #[test]
    fn test_end_summary_layout() {
        let events = EventStats::new();
        let traffic = NetworkTrafficStats::new(Arc::new(FixedCounters), 7);
        events.counts.increment(4);
        events.strings.append(2, sanitize_field("a#b"));
        traffic.end_session();

        let summary = end_summary(&events, &traffic);
        let sections: Vec<&str> = summary.split('$').collect();
        assert_eq!(sections.len(), 5);
        assert_eq!(sections[0], "0@0@0@0@0@0");
        assert_eq!(sections[1], "4#1@");
        assert_eq!(sections[3], "2#0#a_b@");
        assert_eq!(sections[4], "");
    }

    #[test]
    fn test_periodic_payload_keeps_counts() {
        let events = EventStats::new();
        let traffic = NetworkTrafficStats::new(Arc::new(FixedCounters), 7);
        events.counts.increment(1);
        events.values.append(3, 2.5);

        assert_eq!(periodic_payload(&events, &traffic), "3#0#2.5@$$");
        assert_eq!(events.counts.count(1), 1);
        assert_eq!(periodic_payload(&events, &traffic), "$$");
    }

    #[tokio::test]
    async fn test_events_outside_session_are_dropped() {
        let controller = SessionController::new(AgentConfig::default(), Platform::detached());
        controller.capture_event(1);
        controller.capture_event_value(2, 1.0);
        assert_eq!(controller.download_started(), None);
        assert_eq!(controller.phase(), SessionPhase::Idle);
        controller.finish().await;
        controller.end_session();
        assert_eq!(controller.active_starts(), 0);
    }

    #[test]
    fn test_device_id_override() {
        let controller = SessionController::new(AgentConfig::default(), Platform::detached());
        let ctx = DeviceContext {
            hardware_ids: vec!["x".into()],
            ..DeviceContext::default()
        };
        let hashed = controller.resolve_device_id(&ctx);
        assert_eq!(hashed.len(), 32);
        assert_eq!(controller.resolve_device_id(&DeviceContext::default()), hashed);

        controller.set_device_id("custom");
        assert_eq!(controller.resolve_device_id(&ctx), "custom");
    }
}
