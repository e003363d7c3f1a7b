//! Hardware detection, sensor reads, and the matmul microbenchmark.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

/// Square matrix edge for the microbenchmark.
pub const BENCH_SIZE: usize = 256;

const BENCH_RUNS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DetectedDevice {
    pub available: bool,
    pub backend: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Benchmark {
    pub gflops: f64,
    pub latency_s: f64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

async fn run_cmd(program: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;
    let output = tokio::time::timeout(timeout, child.wait_with_output()).await.ok()?.ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

pub fn detect_cpu() -> DetectedDevice {
    let model = std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|l| l.starts_with("model name") || l.starts_with("Hardware"))
                .and_then(|l| l.split(':').nth(1))
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    DetectedDevice {
        available: true,
        backend: "native".to_string(),
        info: format!("{model} ({} cores)", num_cpus::get()),
    }
}

/// Vulkan GPU detection: `vulkaninfo --summary` if the tool is installed,
/// otherwise the presence of a driver library.
pub async fn detect_gpu() -> DetectedDevice {
    let mut result = DetectedDevice {
        available: false,
        backend: "vulkan".to_string(),
        info: String::new(),
    };

    if run_cmd("which", &["vulkaninfo"], Duration::from_secs(2)).await.is_some() {
        match run_cmd("vulkaninfo", &["--summary"], Duration::from_secs(5)).await {
            Some(summary) => {
                result.available = true;
                result.info = summary.lines().take(3).collect::<Vec<_>>().join(" | ");
                return result;
            }
            None => {
                result.info = "vulkaninfo present but failed".to_string();
            }
        }
    }

    for lib in [
        "/usr/lib/x86_64-linux-gnu/libvulkan.so.1",
        "/system/lib64/libvulkan.so",
        "/vendor/lib64/libvulkan.so",
    ] {
        if Path::new(lib).exists() {
            result.available = true;
            result.info = format!("driver library {lib}");
            return result;
        }
    }

    if result.info.is_empty() {
        result.info = "no Vulkan runtime detected".to_string();
    }
    result
}

/// NPU detection via the vendor runtime: SDK root env var or runtime libs.
pub fn detect_npu(sdk_env: &str) -> DetectedDevice {
    let mut result = DetectedDevice {
        available: false,
        backend: "qnn".to_string(),
        info: String::new(),
    };

    if let Ok(root) = std::env::var(sdk_env) {
        if !root.trim().is_empty() && Path::new(&root).exists() {
            result.available = true;
            result.info = format!("SDK root {root}");
            return result;
        }
    }

    for lib in ["/vendor/lib64/libQnnHtp.so", "/system/lib64/libQnnHtp.so"] {
        if Path::new(lib).exists() {
            result.available = true;
            result.info = format!("runtime library {lib}");
            return result;
        }
    }

    result.info = "NPU runtime not detected".to_string();
    result
}

/// Naive f32 matmul benchmark on the CPU.  Deliberately unoptimized — the
/// point is a stable relative ranking, not peak numbers.
pub fn benchmark_cpu(size: usize) -> Benchmark {
    let a = vec![1.5_f32; size * size];
    let b = vec![2.5_f32; size * size];
    let mut c = vec![0.0_f32; size * size];

    let mut total = Duration::ZERO;
    for _ in 0..BENCH_RUNS {
        let started = Instant::now();
        for i in 0..size {
            for k in 0..size {
                let aik = a[i * size + k];
                for j in 0..size {
                    c[i * size + j] += aik * b[k * size + j];
                }
            }
        }
        total += started.elapsed();
    }

    // Keep the result alive so the work is not optimized away.
    let checksum: f32 = c.iter().take(4).sum();
    debug!(checksum, "cpu benchmark checksum");

    let avg = total.as_secs_f64() / BENCH_RUNS as f64;
    let ops = 2.0 * (size as f64).powi(3);
    Benchmark {
        gflops: ops / avg / 1e9,
        latency_s: avg,
        success: true,
        note: None,
    }
}

/// Estimated GPU throughput until a compute backend lands; keeps the ranking
/// meaningful when Vulkan hardware is detected.
pub fn benchmark_gpu_estimate() -> Benchmark {
    Benchmark {
        gflops: 300.0,
        latency_s: 0.05,
        success: true,
        note: Some("estimated until Vulkan compute backend is wired".to_string()),
    }
}

pub fn benchmark_npu_estimate() -> Benchmark {
    Benchmark {
        gflops: 500.0,
        latency_s: 0.03,
        success: true,
        note: Some("estimated until the vendor runtime adapter is wired".to_string()),
    }
}

/// Battery percentage from the power-supply class; assume full when no
/// battery is exposed (desktops, containers).
pub fn battery_pct() -> u8 {
    let Ok(entries) = std::fs::read_dir("/sys/class/power_supply") else {
        return 100;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let capacity = entry.path().join("capacity");
        if let Ok(raw) = std::fs::read_to_string(&capacity) {
            if let Ok(pct) = raw.trim().parse::<u8>() {
                return pct.min(100);
            }
        }
    }
    100
}

/// First readable thermal zone, in °C.  0.0 when no sensor is exposed.
pub fn cpu_temp_c() -> f64 {
    let Ok(entries) = std::fs::read_dir("/sys/class/thermal") else {
        return 0.0;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("thermal_zone") {
            continue;
        }
        if let Ok(raw) = std::fs::read_to_string(entry.path().join("temp")) {
            if let Ok(millidegrees) = raw.trim().parse::<i64>() {
                return millidegrees as f64 / 1000.0;
            }
        }
    }
    0.0
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_is_always_detected() {
        let cpu = detect_cpu();
        assert!(cpu.available);
        assert!(cpu.info.contains("cores"));
    }

    #[test]
    fn small_benchmark_produces_positive_gflops() {
        let bench = benchmark_cpu(32);
        assert!(bench.success);
        assert!(bench.gflops > 0.0);
        assert!(bench.latency_s > 0.0);
    }

    #[test]
    fn sensors_never_panic() {
        let _ = battery_pct();
        let _ = cpu_temp_c();
    }

    #[test]
    fn npu_detection_honors_env_root() {
        // A guaranteed-missing env var means not available via SDK path.
        let result = detect_npu("MERIDIAN_TEST_NONEXISTENT_SDK_ROOT");
        assert_eq!(result.backend, "qnn");
    }
}
