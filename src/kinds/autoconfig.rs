//! Input-device autoconfiguration tasks.
//!
//! When a device is hot-plugged the frontend pushes a connect task; the task
//! validates the input driver, searches the profile registry for a matching
//! device profile and reports whether the device was configured. Profiles
//! are TOML files loaded once at engine construction.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::engine::TaskEngine;
use crate::error::{PushError, TaskError};
use crate::task::{
    AutoconfigResult, Payload, StepOutcome, TaskContext, TaskHandler, TaskId, TaskKind,
    TaskOutcome, TaskReport, TaskSpec,
};

/// Ports above this are rejected at push time.
pub const MAX_DEVICE_PORTS: usize = 16;

/// A stored device profile. Matching prefers exact vendor/product ids and
/// falls back to the device name.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
}

/// In-memory set of device profiles.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: Vec<DeviceProfile>,
}

impl ProfileRegistry {
    /// Load every `*.toml` profile under `dir`. Unreadable or malformed
    /// files are skipped with a warning; a missing directory yields an empty
    /// registry.
    pub fn load_dir(dir: &Path) -> Self {
        let mut profiles = Vec::new();
        for entry in WalkDir::new(dir).max_depth(1).into_iter().flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping unreadable profile {:?}: {}", path, e);
                    continue;
                }
            };
            match toml::from_str::<DeviceProfile>(&text) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!("Skipping malformed profile {:?}: {}", path, e),
            }
        }
        debug!("Loaded {} device profiles from {:?}", profiles.len(), dir);
        Self { profiles }
    }

    #[cfg(test)]
    pub(crate) fn from_profiles(profiles: Vec<DeviceProfile>) -> Self {
        Self { profiles }
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Find the best profile for a device. Vendor/product id pairs win over
    /// name matches.
    pub fn find(&self, request: &ConnectRequest) -> Option<&DeviceProfile> {
        if let (Some(vid), Some(pid)) = (request.vendor_id, request.product_id) {
            let by_ids = self
                .profiles
                .iter()
                .find(|p| p.vendor_id == Some(vid) && p.product_id == Some(pid));
            if by_ids.is_some() {
                return by_ids;
            }
        }
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&request.device_name))
    }
}

/// Description of a hot-plugged device.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub port: usize,
    pub device_name: String,
    /// Human-facing name for notifications; falls back to `device_name`.
    pub display_name: Option<String>,
    pub driver: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
}

impl ConnectRequest {
    fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.device_name)
    }
}

struct ConnectHandler {
    request: ConnectRequest,
    known_drivers: Vec<String>,
    registry: std::sync::Arc<ProfileRegistry>,
    driver_checked: bool,
}

impl TaskHandler for ConnectHandler {
    fn step(&mut self, _ctx: &TaskContext) -> Result<StepOutcome, TaskError> {
        if !self.driver_checked {
            if !self
                .known_drivers
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&self.request.driver))
            {
                return Err(TaskError::msg(format!(
                    "unknown input driver '{}'",
                    self.request.driver
                )));
            }
            self.driver_checked = true;
            return Ok(StepOutcome::Pending);
        }

        let matched = self.registry.find(&self.request);
        let result = AutoconfigResult {
            port: self.request.port,
            configured: matched.is_some(),
            profile: matched.map(|p| p.name.clone()),
        };
        if result.configured {
            debug!(
                "Configured '{}' on port {} with profile {:?}",
                self.request.device_name, self.request.port, result.profile
            );
        } else {
            debug!(
                "No profile for '{}' on port {}",
                self.request.device_name, self.request.port
            );
        }
        Ok(StepOutcome::Finished(TaskOutcome::Autoconfig(result)))
    }
}

impl TaskEngine {
    /// Push a device-connected autoconfiguration task.
    pub fn push_autoconfig_connect(
        &self,
        request: ConnectRequest,
        mute: bool,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if request.device_name.is_empty() {
            return Err(PushError::InvalidArgument("empty device name".to_string()));
        }
        if request.port >= MAX_DEVICE_PORTS {
            return Err(PushError::InvalidArgument(format!(
                "port {} out of range (max {})",
                request.port,
                MAX_DEVICE_PORTS - 1
            )));
        }

        let title = format!("{} connected to port {}", request.label(), request.port);
        let handler = ConnectHandler {
            request,
            known_drivers: self.config.known_input_drivers.clone(),
            registry: std::sync::Arc::clone(&self.profiles),
            driver_checked: false,
        };
        let id = self.submit(
            TaskSpec::new(TaskKind::Autoconfig, title, handler)
                .mute(mute)
                .callback(callback),
        )?;
        debug!("Pushed autoconfig connect {}", id);
        Ok(id)
    }

    /// Push a device-disconnected notification task. Always completes in one
    /// step; exists so disconnect surfaces through the same callback channel
    /// as connect.
    pub fn push_autoconfig_disconnect(
        &self,
        port: usize,
        device_name: &str,
        mute: bool,
        callback: impl FnOnce(TaskReport, Payload) + Send + 'static,
    ) -> Result<TaskId, PushError> {
        if device_name.is_empty() {
            return Err(PushError::InvalidArgument("empty device name".to_string()));
        }
        if port >= MAX_DEVICE_PORTS {
            return Err(PushError::InvalidArgument(format!(
                "port {port} out of range (max {})",
                MAX_DEVICE_PORTS - 1
            )));
        }

        let title = format!("{device_name} disconnected from port {port}");
        let handler = move |_: &TaskContext| {
            Ok(StepOutcome::Finished(TaskOutcome::Autoconfig(
                AutoconfigResult {
                    port,
                    configured: false,
                    profile: None,
                },
            )))
        };
        let id = self.submit(
            TaskSpec::new(TaskKind::Autoconfig, title, handler)
                .mute(mute)
                .callback(callback),
        )?;
        debug!("Pushed autoconfig disconnect {}", id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::task::TaskState;
    use std::sync::{Arc, Mutex};

    fn request(name: &str, driver: &str) -> ConnectRequest {
        ConnectRequest {
            port: 0,
            device_name: name.to_string(),
            display_name: None,
            driver: driver.to_string(),
            vendor_id: None,
            product_id: None,
        }
    }

    fn run_until_empty(engine: &TaskEngine) {
        for _ in 0..1000 {
            engine.tick();
            if engine.pending_tasks() == 0 {
                return;
            }
        }
        panic!("engine did not drain");
    }

    #[test]
    fn registry_prefers_id_match_over_name_match() {
        let registry = ProfileRegistry::from_profiles(vec![
            DeviceProfile {
                name: "Generic Pad".to_string(),
                driver: None,
                vendor_id: None,
                product_id: None,
            },
            DeviceProfile {
                name: "Vendor Pad".to_string(),
                driver: None,
                vendor_id: Some(0x054c),
                product_id: Some(0x0268),
            },
        ]);

        let mut req = request("Generic Pad", "udev");
        req.vendor_id = Some(0x054c);
        req.product_id = Some(0x0268);
        assert_eq!(registry.find(&req).unwrap().name, "Vendor Pad");

        req.vendor_id = None;
        req.product_id = None;
        assert_eq!(registry.find(&req).unwrap().name, "Generic Pad");
    }

    #[test]
    fn load_dir_skips_malformed_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("pad.toml"),
            "name = \"Test Pad\"\nvendor_id = 1\nproduct_id = 2\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("broken.toml"), "name = [oops").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        let registry = ProfileRegistry::load_dir(tmp.path());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn out_of_range_port_fails_push() {
        let engine = TaskEngine::new(EngineConfig::default()).unwrap();
        let mut req = request("Pad", "udev");
        req.port = MAX_DEVICE_PORTS;
        let result = engine.push_autoconfig_connect(req, true, |_, _| {});
        assert!(matches!(result, Err(PushError::InvalidArgument(_))));
    }

    #[test]
    fn unknown_driver_finalizes_task_as_errored() {
        let engine = TaskEngine::new(EngineConfig::default()).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_autoconfig_connect(request("Pad", "no-such-driver"), true, move |report, _| {
                *slot_inner.lock().unwrap() = Some((report.state, report.error));
            })
            .unwrap();

        run_until_empty(&engine);

        let (state, error) = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(state, TaskState::Errored);
        assert!(error.unwrap().contains("unknown input driver"));
    }

    #[test]
    fn known_driver_without_profile_reports_unconfigured() {
        let engine = TaskEngine::new(EngineConfig::default()).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_autoconfig_connect(request("Mystery Pad", "udev"), true, move |report, _| {
                if let TaskOutcome::Autoconfig(result) = report.outcome {
                    *slot_inner.lock().unwrap() = Some(result);
                }
            })
            .unwrap();

        run_until_empty(&engine);

        let result = slot.lock().unwrap().take().expect("callback fired");
        assert!(!result.configured);
        assert_eq!(result.port, 0);
        assert_eq!(result.profile, None);
    }

    #[test]
    fn disconnect_completes_with_unconfigured_outcome() {
        let engine = TaskEngine::new(EngineConfig::default()).unwrap();
        let slot = Arc::new(Mutex::new(None));
        let slot_inner = Arc::clone(&slot);
        engine
            .push_autoconfig_disconnect(2, "Pad", true, move |report, _| {
                *slot_inner.lock().unwrap() = Some(report);
            })
            .unwrap();

        run_until_empty(&engine);

        let report = slot.lock().unwrap().take().expect("callback fired");
        assert_eq!(report.state, TaskState::Finished);
        assert!(report.mute);
        match report.outcome {
            TaskOutcome::Autoconfig(result) => assert_eq!(result.port, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
