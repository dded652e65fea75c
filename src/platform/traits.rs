use anyhow::Result;
use async_trait::async_trait;

use crate::wire::payload::{LocationFix, ResourceSnapshot, SystemInfo};

/// One transmitted/received byte reading. Signed: platform counters can go backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxRx {
    pub tx: i64,
    pub rx: i64,
}

/// Raw cumulative byte counters of the device.
pub trait TrafficSource: Send + Sync {
    fn totals(&self) -> Result<TxRx>;
    fn mobile(&self) -> Result<TxRx>;
    /// Counters scoped to the host application's uid.
    fn app(&self, app_uid: u32) -> Result<TxRx>;
    fn uptime_secs(&self) -> f64 {
        0.0
    }
    fn elapsed_realtime_secs(&self) -> f64 {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Wifi,
    Cellular,
    Other,
}

impl InterfaceKind {
    /// Ordinal the server expects for the active network type.
    pub fn active_type_code(self) -> i32 {
        match self {
            InterfaceKind::Cellular => 3,
            InterfaceKind::Wifi => 2,
            InterfaceKind::Other => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStatus {
    pub available: bool,
    pub connected: bool,
    pub failover: bool,
    /// Ordinal of the platform connection state.
    pub state: i32,
    pub subtype: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WifiLink {
    pub enabled: bool,
    pub rssi: i32,
    pub link_speed: i32,
}

/// Radio and connectivity state sampled into every probe packet.
pub trait RadioState: Send + Sync {
    fn cell_signal(&self) -> i32;
    fn wifi_link(&self) -> WifiLink;
    fn interface(&self, kind: InterfaceKind) -> Option<InterfaceStatus>;
    fn active_interface(&self) -> Option<(InterfaceKind, InterfaceStatus)>;
    /// Release any signal-strength listener registered for the probe engine.
    fn stop_listening(&self) {}
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn system_info(&self) -> Result<SystemInfo>;
    async fn resource_snapshot(&self) -> Result<ResourceSnapshot>;
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_fix(&self) -> Result<Option<LocationFix>>;
}
