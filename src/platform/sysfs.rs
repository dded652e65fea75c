// Byte counters read from /sys/class/net and /proc/uid_stat.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use super::traits::{TrafficSource, TxRx};

/// Interfaces probed, in order, for cellular counters.
const MOBILE_INTERFACES: [&str; 2] = ["rmnet0", "ppp0"];

pub struct SysfsTraffic {
    net_root: PathBuf,
    uid_root: PathBuf,
}

impl Default for SysfsTraffic {
    fn default() -> Self {
        Self::new("/sys/class/net", "/proc/uid_stat")
    }
}

impl SysfsTraffic {
    pub fn new(net_root: impl Into<PathBuf>, uid_root: impl Into<PathBuf>) -> Self {
        Self {
            net_root: net_root.into(),
            uid_root: uid_root.into(),
        }
    }

    /// Sum a statistic over every interface except loopback.
    fn total_stat(&self, stat: &str) -> Result<i64> {
        let entries = fs::read_dir(&self.net_root)
            .with_context(|| format!("list {}", self.net_root.display()))?;
        let mut total = 0i64;
        for entry in entries.flatten() {
            if entry.file_name() == "lo" {
                continue;
            }
            let path = entry.path().join("statistics").join(stat);
            match read_number(&path) {
                Ok(v) => total += v,
                Err(e) => debug!("skipping {}: {}", path.display(), e),
            }
        }
        Ok(total)
    }

    fn mobile_stat(&self, stat: &str) -> i64 {
        MOBILE_INTERFACES
            .iter()
            .map(|iface| self.net_root.join(iface).join("statistics").join(stat))
            .find(|path| path.exists())
            .and_then(|path| read_number(&path).ok())
            .unwrap_or(0)
    }
}

impl TrafficSource for SysfsTraffic {
    fn totals(&self) -> Result<TxRx> {
        Ok(TxRx {
            tx: self.total_stat("tx_bytes")?,
            rx: self.total_stat("rx_bytes")?,
        })
    }

    fn mobile(&self) -> Result<TxRx> {
        Ok(TxRx {
            tx: self.mobile_stat("tx_bytes"),
            rx: self.mobile_stat("rx_bytes"),
        })
    }

    fn app(&self, app_uid: u32) -> Result<TxRx> {
        let dir = self.uid_root.join(app_uid.to_string());
        Ok(TxRx {
            tx: read_number(&dir.join("tcp_snd"))?,
            rx: read_number(&dir.join("tcp_rcv"))?,
        })
    }
}

/// Last numeric line of a counter file.
fn read_number(path: &Path) -> Result<i64> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let line = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| anyhow!("{} is empty", path.display()))?;
    Ok(line.parse::<i64>()?)
}
