//! Hardware acceleration management: device detection, benchmarking,
//! ranked assignment with battery/thermal gates, and inference with a
//! fallback walk down the ranked device list.

mod probe;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

use meridian_store::DocumentStore;

pub use probe::{Benchmark, DetectedDevice};

const PROFILE_FILE: &str = "accel/profile.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Gpu,
    Npu,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
            DeviceKind::Npu => "npu",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cpu" => Some(DeviceKind::Cpu),
            "gpu" => Some(DeviceKind::Gpu),
            "npu" => Some(DeviceKind::Npu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceProfile {
    pub timestamp: String,
    pub detected: BTreeMap<String, DetectedDevice>,
    pub benchmarks: BTreeMap<String, Benchmark>,
    /// Device names ordered by measured GFLOPS, fastest first.
    pub ranked: Vec<String>,
    pub battery_pct: u8,
    pub cpu_temp_c: f64,
    pub thermal_state: String,
}

#[derive(Debug, Clone)]
pub struct AccelParams {
    pub battery_threshold_pct: u8,
    pub temp_threshold_c: f64,
    pub profile_ttl: Duration,
    pub npu_sdk_env: String,
    /// Per-device inference engine binaries.  Only the CPU engine is
    /// required; missing accelerated engines fall back down the ranking.
    pub engines: BTreeMap<DeviceKind, PathBuf>,
}

impl Default for AccelParams {
    fn default() -> Self {
        Self {
            battery_threshold_pct: 20,
            temp_threshold_c: 70.0,
            profile_ttl: Duration::from_secs(24 * 3600),
            npu_sdk_env: "QNN_SDK_ROOT".to_string(),
            engines: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceAttempt {
    pub device: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    pub device: String,
    pub ok: bool,
    pub output: String,
    pub latency_s: f64,
    pub attempts: Vec<InferenceAttempt>,
}

pub struct AccelerationManager {
    store: Arc<DocumentStore>,
    params: AccelParams,
}

impl AccelerationManager {
    pub fn new(store: Arc<DocumentStore>, params: AccelParams) -> Self {
        Self { store, params }
    }

    /// The cached profile when it is fresh, otherwise a full re-probe and
    /// re-benchmark.  Battery level is always re-read — it moves faster than
    /// the 24 h profile cache.
    pub async fn profile(&self, force_rerun: bool) -> DeviceProfile {
        if !force_rerun {
            let cached: DeviceProfile = self.store.load_or_default(PROFILE_FILE);
            if profile_is_fresh(&cached, self.params.profile_ttl) {
                let mut cached = cached;
                cached.battery_pct = probe::battery_pct();
                return cached;
            }
        }
        self.rebuild_profile().await
    }

    async fn rebuild_profile(&self) -> DeviceProfile {
        info!("probing hardware acceleration capabilities");

        let mut detected = BTreeMap::new();
        detected.insert("cpu".to_string(), probe::detect_cpu());
        detected.insert("gpu".to_string(), probe::detect_gpu().await);
        detected.insert("npu".to_string(), probe::detect_npu(&self.params.npu_sdk_env));

        let mut benchmarks = BTreeMap::new();
        benchmarks.insert("cpu".to_string(), probe::benchmark_cpu(probe::BENCH_SIZE));
        if detected["gpu"].available {
            benchmarks.insert("gpu".to_string(), probe::benchmark_gpu_estimate());
        }
        if detected["npu"].available {
            benchmarks.insert("npu".to_string(), probe::benchmark_npu_estimate());
        }

        let mut ranked: Vec<(String, f64)> = benchmarks
            .iter()
            .map(|(name, bench)| (name.clone(), bench.gflops))
            .collect();
        ranked.sort_by(|(_, a), (_, b)| b.total_cmp(a));

        let cpu_temp = probe::cpu_temp_c();
        let profile = DeviceProfile {
            timestamp: Utc::now().to_rfc3339(),
            detected,
            benchmarks,
            ranked: ranked.into_iter().map(|(name, _)| name).collect(),
            battery_pct: probe::battery_pct(),
            cpu_temp_c: cpu_temp,
            thermal_state: if cpu_temp > self.params.temp_threshold_c {
                "hot".to_string()
            } else {
                "normal".to_string()
            },
        };

        if let Err(err) = self.store.save(PROFILE_FILE, &profile) {
            warn!(%err, "could not cache acceleration profile");
        }
        profile
    }

    /// Pick the device a model should run on.  Explicit preferences win;
    /// `auto` routes by quantization keywords; low battery or a hot CPU
    /// forces the CPU regardless.
    pub async fn assign_device(&self, model_path: &str, preference: &str) -> DeviceKind {
        let profile = self.profile(false).await;
        choose_device(
            &profile,
            model_path,
            preference,
            probe::battery_pct(),
            probe::cpu_temp_c(),
            &self.params,
        )
    }

    /// Run inference on the assigned device, walking down the ranked list
    /// when an engine is missing or fails.
    pub async fn run_inference(
        &self,
        model_path: &str,
        prompt: &str,
        timeout: Duration,
        device_hint: Option<DeviceKind>,
    ) -> InferenceResult {
        let profile = self.profile(false).await;
        let first = match device_hint {
            Some(device) => device,
            None => self.assign_device(model_path, "auto").await,
        };

        let mut order: Vec<DeviceKind> = vec![first];
        for name in &profile.ranked {
            if let Some(device) = DeviceKind::parse(name) {
                if !order.contains(&device) {
                    order.push(device);
                }
            }
        }

        let mut attempts = Vec::new();
        for device in order {
            let Some(engine) = self.params.engines.get(&device) else {
                attempts.push(InferenceAttempt {
                    device: device.as_str().to_string(),
                    ok: false,
                    error: Some("no engine configured".to_string()),
                });
                continue;
            };
            if !engine.exists() {
                attempts.push(InferenceAttempt {
                    device: device.as_str().to_string(),
                    ok: false,
                    error: Some(format!("engine not found: {}", engine.display())),
                });
                continue;
            }

            match run_engine(engine, model_path, prompt, timeout).await {
                Ok((output, latency_s)) => {
                    attempts.push(InferenceAttempt {
                        device: device.as_str().to_string(),
                        ok: true,
                        error: None,
                    });
                    return InferenceResult {
                        device: device.as_str().to_string(),
                        ok: true,
                        output,
                        latency_s,
                        attempts,
                    };
                }
                Err(err) => {
                    warn!(device = device.as_str(), %err, "inference failed, walking down ranking");
                    attempts.push(InferenceAttempt {
                        device: device.as_str().to_string(),
                        ok: false,
                        error: Some(err),
                    });
                }
            }
        }

        InferenceResult {
            device: "none".to_string(),
            ok: false,
            output: String::new(),
            latency_s: 0.0,
            attempts,
        }
    }
}

async fn run_engine(
    engine: &PathBuf,
    model_path: &str,
    prompt: &str,
    timeout: Duration,
) -> Result<(String, f64), String> {
    let started = Instant::now();
    let child = Command::new(engine)
        .args(["-m", model_path, "-p", prompt, "-n", "256"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| format!("spawn failed: {err}"))?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| format!("timed out after {}s", timeout.as_secs()))?
        .map_err(|err| format!("wait failed: {err}"))?;

    if !output.status.success() {
        return Err(format!("engine exited with {}", output.status));
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        return Err("no output from engine".to_string());
    }
    Ok((text, started.elapsed().as_secs_f64()))
}

fn profile_is_fresh(profile: &DeviceProfile, ttl: Duration) -> bool {
    let Ok(stamp) = DateTime::parse_from_rfc3339(&profile.timestamp) else {
        return false;
    };
    let age = Utc::now().signed_duration_since(stamp.with_timezone(&Utc));
    age.num_seconds() >= 0 && (age.num_seconds() as u64) < ttl.as_secs()
}

/// Device choice given a profile and live battery/thermal readings.
/// Pure so the policy is directly testable.
fn choose_device(
    profile: &DeviceProfile,
    model_path: &str,
    preference: &str,
    battery: u8,
    temp_c: f64,
    params: &AccelParams,
) -> DeviceKind {
    let ranked: Vec<DeviceKind> = profile
        .ranked
        .iter()
        .filter_map(|name| DeviceKind::parse(name))
        .collect();

    // Explicit preference wins regardless of profile state.
    if let Some(device) = DeviceKind::parse(preference) {
        return device;
    }

    if battery < params.battery_threshold_pct || temp_c > params.temp_threshold_c {
        return DeviceKind::Cpu;
    }

    let model_lower = model_path.to_lowercase();
    if ["int8", "int4", "q4_", "q8_"].iter().any(|q| model_lower.contains(q)) {
        for device in [DeviceKind::Npu, DeviceKind::Gpu, DeviceKind::Cpu] {
            if ranked.contains(&device) {
                return device;
            }
        }
    }
    if model_lower.contains("fp16") || model_lower.contains("f16") {
        for device in [DeviceKind::Gpu, DeviceKind::Cpu] {
            if ranked.contains(&device) {
                return device;
            }
        }
    }

    ranked.first().copied().unwrap_or(DeviceKind::Cpu)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with(ranked: &[&str]) -> DeviceProfile {
        DeviceProfile {
            timestamp: Utc::now().to_rfc3339(),
            ranked: ranked.iter().map(|s| s.to_string()).collect(),
            battery_pct: 90,
            cpu_temp_c: 40.0,
            thermal_state: "normal".to_string(),
            ..DeviceProfile::default()
        }
    }

    #[test]
    fn explicit_cpu_preference_always_wins() {
        let profile = profile_with(&["npu", "gpu", "cpu"]);
        let params = AccelParams::default();
        let device = choose_device(&profile, "model.Q4_K_M.gguf", "cpu", 90, 40.0, &params);
        assert_eq!(device, DeviceKind::Cpu);

        // Even on an empty profile.
        let device = choose_device(&DeviceProfile::default(), "m.gguf", "cpu", 90, 40.0, &params);
        assert_eq!(device, DeviceKind::Cpu);
    }

    #[test]
    fn low_battery_forces_cpu() {
        let profile = profile_with(&["npu", "gpu", "cpu"]);
        let params = AccelParams::default();
        let device = choose_device(&profile, "model.Q4_K_M.gguf", "auto", 10, 40.0, &params);
        assert_eq!(device, DeviceKind::Cpu);
    }

    #[test]
    fn hot_cpu_forces_cpu() {
        let profile = profile_with(&["gpu", "cpu"]);
        let params = AccelParams::default();
        let device = choose_device(&profile, "model.fp16.gguf", "auto", 90, 85.0, &params);
        assert_eq!(device, DeviceKind::Cpu);
    }

    #[test]
    fn quantized_model_prefers_npu_then_gpu() {
        let params = AccelParams::default();
        let full = profile_with(&["npu", "gpu", "cpu"]);
        assert_eq!(
            choose_device(&full, "model.Q4_K_M.gguf", "auto", 90, 40.0, &params),
            DeviceKind::Npu
        );

        let no_npu = profile_with(&["gpu", "cpu"]);
        assert_eq!(
            choose_device(&no_npu, "model.int8.bin", "auto", 90, 40.0, &params),
            DeviceKind::Gpu
        );
    }

    #[test]
    fn fp16_model_prefers_gpu() {
        let params = AccelParams::default();
        let profile = profile_with(&["npu", "gpu", "cpu"]);
        assert_eq!(
            choose_device(&profile, "model.fp16.gguf", "auto", 90, 40.0, &params),
            DeviceKind::Gpu
        );
    }

    #[test]
    fn auto_defaults_to_fastest_ranked() {
        let params = AccelParams::default();
        let profile = profile_with(&["gpu", "cpu"]);
        assert_eq!(
            choose_device(&profile, "model.bin", "auto", 90, 40.0, &params),
            DeviceKind::Gpu
        );
    }

    #[test]
    fn stale_profile_is_not_fresh() {
        let mut profile = profile_with(&["cpu"]);
        profile.timestamp = "2020-01-01T00:00:00+00:00".to_string();
        assert!(!profile_is_fresh(&profile, Duration::from_secs(24 * 3600)));
        assert!(!profile_is_fresh(&DeviceProfile::default(), Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn profile_round_trips_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let manager = AccelerationManager::new(Arc::clone(&store), AccelParams::default());

        let first = manager.profile(false).await;
        assert!(first.ranked.contains(&"cpu".to_string()));
        assert!(store.exists(PROFILE_FILE));

        // Second read must come from the cache (same timestamp).
        let second = manager.profile(false).await;
        assert_eq!(second.timestamp, first.timestamp);
    }

    #[tokio::test]
    async fn inference_with_no_engines_reports_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());
        let manager = AccelerationManager::new(store, AccelParams::default());

        let result = manager
            .run_inference("model.gguf", "hi", Duration::from_secs(1), Some(DeviceKind::Cpu))
            .await;
        assert!(!result.ok);
        assert!(!result.attempts.is_empty());
        assert!(result.attempts.iter().all(|a| !a.ok));
    }

    #[tokio::test]
    async fn inference_walks_to_working_engine() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path()).unwrap());

        let engine = dir.path().join("cpu-engine");
        std::fs::write(&engine, "#!/bin/sh\necho generated text\n").unwrap();
        std::fs::set_permissions(&engine, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut params = AccelParams::default();
        params.engines.insert(DeviceKind::Cpu, engine);
        // GPU engine path that does not exist — must be skipped.
        params.engines.insert(DeviceKind::Gpu, dir.path().join("missing-gpu-engine"));

        let manager = AccelerationManager::new(store, params);
        let result = manager
            .run_inference("model.gguf", "hi", Duration::from_secs(5), Some(DeviceKind::Gpu))
            .await;

        assert!(result.ok);
        assert_eq!(result.device, "cpu");
        assert_eq!(result.output, "generated text");
        assert!(result.attempts.len() >= 2);
    }
}
