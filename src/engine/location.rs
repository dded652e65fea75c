// Periodic location updates over the report channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::report::ReportChannel;
use crate::error::Result;
use crate::platform::traits::LocationProvider;

pub struct LocationReporter {
    provider: Arc<dyn LocationProvider>,
    report: Arc<ReportChannel>,
    hide_precise: bool,
    first_sent: AtomicBool,
}

impl LocationReporter {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        report: Arc<ReportChannel>,
        hide_precise: bool,
    ) -> Self {
        Self {
            provider,
            report,
            hide_precise,
            first_sent: AtomicBool::new(false),
        }
    }

    pub fn first_update_sent(&self) -> bool {
        self.first_sent.load(Ordering::SeqCst)
    }

    /// Send the current fix. `Ok(false)` when no fix is available.
    pub async fn send_current(&self) -> Result<bool> {
        let fix = match self.provider.current_fix().await {
            Ok(Some(fix)) => fix,
            Ok(None) => {
                debug!("no location fix available");
                return Ok(false);
            }
            Err(e) => {
                warn!("location provider failed: {}", e);
                return Ok(false);
            }
        };
        self.report
            .send_location(fix.to_payload(self.hide_precise))
            .await?;
        self.first_sent.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// Send a fix after `initial_delay`, then every `interval`, until a send fails.
    pub async fn run(self: Arc<Self>, initial_delay: Duration, interval: Duration) {
        tokio::time::sleep(initial_delay).await;
        loop {
            if let Err(e) = self.send_current().await {
                warn!("location updates stopped: {}", e);
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
