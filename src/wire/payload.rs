// Payload records carried inside report frames.

use crate::config::{FRAME_DELIM, TUPLE_DELIM};
use crate::stats::fmt_real;

const MAX_CPU: i32 = 100;
const MAX_RUNNING_PROCS: i32 = 200;
const MAX_TOTAL_PROCS: i32 = 30_000;

fn join_lines(fields: &[String]) -> String {
    fields.join(&FRAME_DELIM.to_string())
}

fn flag(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

/// Static device description sent once after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemInfo {
    pub carrier: String,
    pub os_version: String,
    pub build_incremental: String,
    pub sdk: String,
    pub device: String,
    pub model: String,
    pub product: String,
    pub board: String,
    pub brand: String,
    /// `(processor, bogomips, hardware)` from cpuinfo, when it could be read.
    pub cpu: Option<(String, String, String)>,
    /// MemTotal from meminfo, when it could be read.
    pub mem_total: Option<String>,
    pub screen_width: i32,
    pub screen_height: i32,
    pub density_dpi: i32,
    pub x_dpi: i32,
    pub y_dpi: i32,
    pub gps_enabled: bool,
    pub network_location_enabled: bool,
    pub active_network: i32,
    pub active_subtype: i32,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            carrier: String::new(),
            os_version: String::new(),
            build_incremental: String::new(),
            sdk: String::new(),
            device: String::new(),
            model: String::new(),
            product: String::new(),
            board: String::new(),
            brand: String::new(),
            cpu: None,
            mem_total: None,
            screen_width: 0,
            screen_height: 0,
            density_dpi: 0,
            x_dpi: 0,
            y_dpi: 0,
            gps_enabled: false,
            network_location_enabled: false,
            active_network: 0,
            active_subtype: 0,
        }
    }
}

impl SystemInfo {
    pub fn to_payload(&self) -> String {
        let carrier = match self.carrier.as_str() {
            "" | "null" => "N_A".to_string(),
            c => c.to_string(),
        };
        // Product is reported twice; the server reads fixed positions.
        let mut fields = vec![
            carrier,
            self.os_version.clone(),
            self.build_incremental.clone(),
            self.sdk.clone(),
            self.device.clone(),
            self.model.clone(),
            self.product.clone(),
            self.product.clone(),
            self.board.clone(),
            self.brand.clone(),
        ];
        if let Some((processor, bogomips, hardware)) = &self.cpu {
            fields.extend([processor.clone(), bogomips.clone(), hardware.clone()]);
        }
        if let Some(mem_total) = &self.mem_total {
            fields.push(mem_total.clone());
        }
        fields.extend([
            self.screen_width.to_string(),
            self.screen_height.to_string(),
            self.density_dpi.to_string(),
            self.x_dpi.to_string(),
            self.y_dpi.to_string(),
            flag(self.gps_enabled),
            flag(self.network_location_enabled),
            self.active_network.to_string(),
            self.active_subtype.to_string(),
        ]);
        join_lines(&fields)
    }
}

/// Per-sample process and device resource usage.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub total_entries: i32,
    pub pid: i32,
    pub cpu: i32,
    pub rss_kb: f64,
    pub vss_kb: f64,
    pub threads: i32,
    pub bogomips: String,
    pub cpu_idle_ratio: f64,
    pub load_one: String,
    pub load_five: String,
    pub load_fifteen: String,
    pub running_procs: i32,
    pub total_procs: i32,
    pub mem_total: String,
    pub mem_available: i64,
    pub mem_threshold: i64,
    pub total_cpu: i32,
    pub brightness: i32,
    pub screen_on: bool,
    pub speaker_on: bool,
    pub wired_headset_on: bool,
    pub audio_level: i32,
    pub audio_max_level: i32,
}

impl Default for ResourceSnapshot {
    fn default() -> Self {
        Self {
            total_entries: 0,
            pid: -1,
            cpu: 0,
            rss_kb: 0.0,
            vss_kb: 0.0,
            threads: 0,
            bogomips: "NULL".to_string(),
            cpu_idle_ratio: -1.0,
            load_one: String::new(),
            load_five: String::new(),
            load_fifteen: String::new(),
            running_procs: 0,
            total_procs: 0,
            mem_total: String::new(),
            mem_available: 0,
            mem_threshold: 0,
            total_cpu: 0,
            brightness: 0,
            screen_on: false,
            speaker_on: false,
            wired_headset_on: false,
            audio_level: 0,
            audio_max_level: 0,
        }
    }
}

impl ResourceSnapshot {
    /// Out-of-range readings are pinned to the bounds the server accepts.
    pub fn clamped(&self) -> Self {
        Self {
            cpu: self.cpu.clamp(0, MAX_CPU),
            total_cpu: self.total_cpu.clamp(0, MAX_CPU),
            running_procs: self.running_procs.clamp(0, MAX_RUNNING_PROCS),
            total_procs: self.total_procs.clamp(0, MAX_TOTAL_PROCS),
            ..self.clone()
        }
    }

    pub fn to_payload(&self) -> String {
        let s = self.clamped();
        join_lines(&[
            s.total_entries.to_string(),
            s.pid.to_string(),
            s.cpu.to_string(),
            fmt_real(s.rss_kb),
            fmt_real(s.vss_kb),
            s.threads.to_string(),
            s.bogomips,
            fmt_real(s.cpu_idle_ratio),
            s.load_one,
            s.load_five,
            s.load_fifteen,
            s.running_procs.to_string(),
            s.total_procs.to_string(),
            s.mem_total,
            s.mem_available.to_string(),
            s.mem_threshold.to_string(),
            s.total_cpu.to_string(),
            s.brightness.to_string(),
            flag(s.screen_on),
            flag(s.speaker_on),
            flag(s.wired_headset_on),
            s.audio_level.to_string(),
            s.audio_max_level.to_string(),
        ])
    }
}

/// One battery broadcast as delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryStatus {
    pub level: i32,
    pub scale: i32,
    pub temperature: i32,
    pub voltage: i32,
    pub health: i32,
    pub technology: String,
    pub plugged: i32,
}

impl BatteryStatus {
    pub fn to_payload(&self) -> String {
        join_lines(&[
            self.level.to_string(),
            self.scale.to_string(),
            self.temperature.to_string(),
            self.voltage.to_string(),
            self.health.to_string(),
            self.technology.clone(),
            self.plugged.to_string(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub country_code: String,
    pub admin_name: String,
}

impl LocationFix {
    /// `lat@lon@country@admin`. Hidden coordinates keep one decimal at most.
    pub fn to_payload(&self, hide_precise: bool) -> String {
        let coord = |v: f64| {
            if hide_precise {
                coarse(v)
            } else {
                fmt_real(v)
            }
        };
        let delim = TUPLE_DELIM.to_string();
        [
            coord(self.latitude),
            coord(self.longitude),
            self.country_code.clone(),
            self.admin_name.clone(),
        ]
        .join(&delim)
    }
}

fn coarse(value: f64) -> String {
    let rounded = (value * 10.0).round() / 10.0;
    let s = format!("{:.1}", rounded);
    match s.strip_suffix(".0") {
        Some("-0") => "0".to_string(),
        Some(whole) => whole.to_string(),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_payload_clamps() {
        let snapshot = ResourceSnapshot {
            cpu: 250,
            total_cpu: -4,
            running_procs: 999,
            total_procs: 40_000,
            ..ResourceSnapshot::default()
        };
        let payload = snapshot.to_payload();
        let fields: Vec<&str> = payload.split('\n').collect();
        assert_eq!(fields.len(), 23);
        assert_eq!(fields[2], "100");
        assert_eq!(fields[11], "200");
        assert_eq!(fields[12], "30000");
        assert_eq!(fields[16], "0");
        assert_eq!(fields[7], "-1.0");
    }

    #[test]
    fn test_system_info_carrier_fallback() {
        let info = SystemInfo {
            product: "p".into(),
            ..SystemInfo::default()
        };
        let payload = info.to_payload();
        let fields: Vec<&str> = payload.split('\n').collect();
        assert_eq!(fields[0], "N_A");
        assert_eq!(fields[6], "p");
        assert_eq!(fields[7], "p");
        assert_eq!(fields.len(), 19);
    }

    #[test]
    fn test_system_info_optional_sections() {
        let info = SystemInfo {
            carrier: "Carrier".into(),
            cpu: Some(("ARMv7".into(), "998.0".into(), "msm".into())),
            mem_total: Some("512000".into()),
            ..SystemInfo::default()
        };
        let payload = info.to_payload();
        assert!(payload.starts_with("Carrier\n"));
        assert_eq!(payload.split('\n').count(), 23);
        assert!(payload.contains("\nARMv7\n998.0\nmsm\n512000\n"));
    }

    #[test]
    fn test_location_payload() {
        let fix = LocationFix {
            latitude: 43.0731,
            longitude: -89.4012,
            country_code: "US".into(),
            admin_name: "Wisconsin".into(),
        };
        assert_eq!(fix.to_payload(true), "43.1@-89.4@US@Wisconsin");
        assert_eq!(fix.to_payload(false), "43.0731@-89.4012@US@Wisconsin");

        let whole = LocationFix {
            latitude: 12.0,
            longitude: -0.01,
            ..fix
        };
        assert_eq!(whole.to_payload(true), "12@0@US@Wisconsin");
    }

    #[test]
    fn test_battery_payload() {
        let status = BatteryStatus {
            level: 80,
            scale: 100,
            temperature: 310,
            voltage: 4100,
            health: 2,
            technology: "Li-ion".into(),
            plugged: 1,
        };
        assert_eq!(status.to_payload(), "80\n100\n310\n4100\n2\nLi-ion\n1");
    }
}
