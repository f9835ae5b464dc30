//! Sources of [`DeviceResourceState`] and the coarse poller that feeds them
//! into the mode arbiter.

use crate::arbiter::{DeviceResourceState, ModeArbiter, PerformanceMode};
use crate::util::lock_unpoisoned;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const LOG_TARGET: &str = "voice_state::resources";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum ResourceError {
    #[error("no battery found under {0}")]
    NoBattery(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected value in {path}: {value:?}")]
    Parse { path: PathBuf, value: String },
}

pub trait ResourceMonitor: Send + Sync {
    fn current(&self) -> Result<DeviceResourceState, ResourceError>;
}

/// Reports whatever state it was last given.
#[derive(Clone, Debug, Default)]
pub struct FixedResources {
    state: Arc<Mutex<DeviceResourceState>>,
}

impl FixedResources {
    pub fn new(state: DeviceResourceState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn set(&self, state: DeviceResourceState) {
        *lock_unpoisoned(&self.state, "fixed resources") = state;
    }
}

impl ResourceMonitor for FixedResources {
    fn current(&self) -> Result<DeviceResourceState, ResourceError> {
        Ok(*lock_unpoisoned(&self.state, "fixed resources"))
    }
}

/// Linux battery and platform-profile readings from sysfs.
#[derive(Clone, Debug)]
pub struct SysfsBatteryMonitor {
    root: PathBuf,
}

impl Default for SysfsBatteryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsBatteryMonitor {
    pub fn new() -> Self {
        Self::with_root("/sys")
    }

    /// `root` stands in for `/sys`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn battery_dir(&self) -> Result<PathBuf, ResourceError> {
        let supplies = self.root.join("class").join("power_supply");
        let entries = std::fs::read_dir(&supplies).map_err(|source| ResourceError::Io {
            path: supplies.clone(),
            source,
        })?;

        let mut batteries: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("BAT"))
            .map(|e| e.path())
            .collect();
        batteries.sort();
        batteries
            .into_iter()
            .next()
            .ok_or(ResourceError::NoBattery(supplies))
    }

    fn performance_mode(&self) -> PerformanceMode {
        let path = self.root.join("firmware").join("acpi").join("platform_profile");
        match std::fs::read_to_string(&path) {
            Ok(profile) => parse_platform_profile(&profile),
            Err(_) => PerformanceMode::Balanced,
        }
    }
}

impl ResourceMonitor for SysfsBatteryMonitor {
    fn current(&self) -> Result<DeviceResourceState, ResourceError> {
        let battery = self.battery_dir()?;

        let capacity_path = battery.join("capacity");
        let raw = read_trimmed(&capacity_path)?;
        let percent: f32 = raw.parse().map_err(|_| ResourceError::Parse {
            path: capacity_path.clone(),
            value: raw.clone(),
        })?;

        let status_path = battery.join("status");
        let status = read_trimmed(&status_path)?;
        let is_charging = matches!(status.as_str(), "Charging" | "Full");

        Ok(DeviceResourceState::new(
            percent / 100.0,
            is_charging,
            self.performance_mode(),
        ))
    }
}

fn read_trimmed(path: &Path) -> Result<String, ResourceError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_owned())
        .map_err(|source| ResourceError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn parse_platform_profile(profile: &str) -> PerformanceMode {
    match profile.trim() {
        "low-power" | "quiet" | "cool" => PerformanceMode::BatterySaver,
        "performance" => PerformanceMode::High,
        _ => PerformanceMode::Balanced,
    }
}

/// Polls `monitor` every `interval` and forwards readings to `arbiter` until
/// `shutdown` flips to `true` or its sender is dropped.
pub fn watch_resources(
    monitor: Arc<dyn ResourceMonitor>,
    arbiter: Arc<Mutex<ModeArbiter>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_error: Option<String> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match monitor.current() {
                Ok(state) => {
                    last_error = None;
                    tracing::trace!(target: LOG_TARGET, ?state, "resource reading");
                    lock_unpoisoned(&arbiter, "arbiter").update_resources(state);
                }
                Err(e) => {
                    // only log when the failure changes, not every poll
                    let msg = e.to_string();
                    if last_error.as_deref() != Some(msg.as_str()) {
                        tracing::warn!(target: LOG_TARGET, error = %msg, "resource reading failed");
                        last_error = Some(msg);
                    }
                }
            }
        }
        tracing::debug!(target: LOG_TARGET, "resource watch stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::DetectionMode;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "voice-state-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn write_battery(root: &Path, capacity: &str, status: &str) {
        let bat = root.join("class/power_supply/BAT0");
        std::fs::create_dir_all(&bat).expect("create battery dir");
        std::fs::write(bat.join("capacity"), capacity).expect("write capacity");
        std::fs::write(bat.join("status"), status).expect("write status");
    }

    #[test]
    fn sysfs_reads_capacity_and_status() {
        let root = scratch_dir("sysfs-basic");
        write_battery(&root, "42\n", "Discharging\n");
        std::fs::create_dir_all(root.join("class/power_supply/AC")).expect("create ac dir");

        let state = SysfsBatteryMonitor::with_root(&root).current().expect("state");
        assert!((state.battery_level - 0.42).abs() < 1e-6);
        assert!(!state.is_charging);
        assert_eq!(state.performance_mode, PerformanceMode::Balanced);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn sysfs_reads_platform_profile() {
        let root = scratch_dir("sysfs-profile");
        write_battery(&root, "90", "Charging");
        let acpi = root.join("firmware/acpi");
        std::fs::create_dir_all(&acpi).expect("create acpi dir");
        std::fs::write(acpi.join("platform_profile"), "performance\n").expect("write profile");

        let state = SysfsBatteryMonitor::with_root(&root).current().expect("state");
        assert!(state.is_charging);
        assert_eq!(state.performance_mode, PerformanceMode::High);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn sysfs_without_battery_errors() {
        let root = scratch_dir("sysfs-none");
        std::fs::create_dir_all(root.join("class/power_supply/AC")).expect("create ac dir");
        let err = SysfsBatteryMonitor::with_root(&root).current().unwrap_err();
        assert!(matches!(err, ResourceError::NoBattery(_)));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn sysfs_rejects_garbage_capacity() {
        let root = scratch_dir("sysfs-garbage");
        write_battery(&root, "lots", "Full");
        let err = SysfsBatteryMonitor::with_root(&root).current().unwrap_err();
        assert!(matches!(err, ResourceError::Parse { .. }));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn platform_profile_mapping() {
        assert_eq!(parse_platform_profile("low-power\n"), PerformanceMode::BatterySaver);
        assert_eq!(parse_platform_profile("performance"), PerformanceMode::High);
        assert_eq!(parse_platform_profile("balanced"), PerformanceMode::Balanced);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_forwards_readings_to_arbiter() {
        let resources = FixedResources::new(DeviceResourceState::new(
            0.9,
            false,
            PerformanceMode::High,
        ));
        let arbiter = Arc::new(Mutex::new(ModeArbiter::new(DetectionMode::Emotion, true)));
        let (tx, rx) = watch::channel(false);

        let handle = watch_resources(
            Arc::new(resources.clone()),
            arbiter.clone(),
            Duration::from_secs(1),
            rx,
        );

        // the first tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(arbiter.lock().unwrap().mode(), DetectionMode::Both);

        resources.set(DeviceResourceState::new(0.1, false, PerformanceMode::Balanced));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(arbiter.lock().unwrap().mode(), DetectionMode::Emotion);

        tx.send(true).expect("send shutdown");
        handle.await.expect("watch task");
    }
}
