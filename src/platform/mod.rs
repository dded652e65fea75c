// Platform seams: raw counters, radio state, resource and location providers.

pub mod sysfs;
pub mod traits;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::wire::payload::{LocationFix, ResourceSnapshot, SystemInfo};
use traits::{
    InterfaceKind, InterfaceStatus, LocationProvider, RadioState, ResourceProbe, TrafficSource,
    TxRx, WifiLink,
};

/// The set of collaborators a session reads from.
#[derive(Clone)]
pub struct Platform {
    pub traffic: Arc<dyn TrafficSource>,
    pub resources: Arc<dyn ResourceProbe>,
    pub radio: Arc<dyn RadioState>,
    pub location: Arc<dyn LocationProvider>,
}

impl Platform {
    /// Inert collaborators: zero counters, default snapshots, no radio, no location.
    pub fn detached() -> Self {
        let detached = Arc::new(Detached);
        Self {
            traffic: detached.clone(),
            resources: detached.clone(),
            radio: detached.clone(),
            location: detached,
        }
    }

    /// Detached platform with real counters read from sysfs/procfs.
    pub fn with_sysfs_traffic() -> Self {
        Self {
            traffic: Arc::new(sysfs::SysfsTraffic::default()),
            ..Self::detached()
        }
    }
}

struct Detached;

impl TrafficSource for Detached {
    fn totals(&self) -> Result<TxRx> {
        Ok(TxRx::default())
    }

    fn mobile(&self) -> Result<TxRx> {
        Ok(TxRx::default())
    }

    fn app(&self, _app_uid: u32) -> Result<TxRx> {
        Ok(TxRx::default())
    }
}

impl RadioState for Detached {
    fn cell_signal(&self) -> i32 {
        0
    }

    fn wifi_link(&self) -> WifiLink {
        WifiLink::default()
    }

    fn interface(&self, _kind: InterfaceKind) -> Option<InterfaceStatus> {
        None
    }

    fn active_interface(&self) -> Option<(InterfaceKind, InterfaceStatus)> {
        None
    }
}

#[async_trait]
impl ResourceProbe for Detached {
    async fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo::default())
    }

    async fn resource_snapshot(&self) -> Result<ResourceSnapshot> {
        Ok(ResourceSnapshot::default())
    }
}

#[async_trait]
impl LocationProvider for Detached {
    async fn current_fix(&self) -> Result<Option<LocationFix>> {
        Ok(None)
    }
}
