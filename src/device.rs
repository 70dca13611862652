//! Compute device selection and accelerator memory probing.
//!
//! The device is resolved once at startup from a short tag (`cpu`, `cuda:0`,
//! `npu:1`) into a [`DeviceCapability`]: whether the device accelerates
//! inference, and how to ask it for its memory size. [`ResourceProbe`] turns
//! that into a single integer capacity in GB which the
//! [`crate::planner`] maps onto a batch ratio.
//!
//! A failed or unsupported memory query is never fatal. It reports a
//! capacity of `0`, which the planner reads as "batching disabled".

use crate::error::DocServeError;
use std::fmt;
use std::process::Command;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Environment variable that overrides the probed accelerator memory (integer GB).
pub const VRAM_OVERRIDE_ENV: &str = "VIRTUAL_VRAM_SIZE";

/// The compute target inference runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    /// Host CPU only.
    #[default]
    Cpu,
    /// NVIDIA GPU by ordinal.
    Cuda(u32),
    /// NPU by ordinal.
    Npu(u32),
}

impl Device {
    /// `true` for every device other than the CPU.
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(n) => write!(f, "cuda:{n}"),
            Device::Npu(n) => write!(f, "npu:{n}"),
        }
    }
}

impl FromStr for Device {
    type Err = DocServeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (kind, index) = match s.split_once(':') {
            Some((k, i)) => {
                let idx = i
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| DocServeError::InvalidDevice(s.clone()))?;
                (k.trim().to_string(), idx)
            }
            None => (s.clone(), 0),
        };

        match kind.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(index)),
            "npu" => Ok(Device::Npu(index)),
            _ => Err(DocServeError::InvalidDevice(s)),
        }
    }
}

/// Queries a device for its total memory.
pub trait MemoryQuery: Send + Sync {
    /// Total device memory in GB, or `None` when it cannot be determined.
    fn total_memory_gb(&self, device: Device) -> Option<f64>;
}

/// Memory query for devices that expose none (CPU, NPUs without a portable tool).
pub struct NoMemoryQuery;

impl MemoryQuery for NoMemoryQuery {
    fn total_memory_gb(&self, _device: Device) -> Option<f64> {
        None
    }
}

/// Reads `memory.total` through `nvidia-smi`.
pub struct NvidiaSmiQuery {
    bin: String,
}

impl NvidiaSmiQuery {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for NvidiaSmiQuery {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl MemoryQuery for NvidiaSmiQuery {
    fn total_memory_gb(&self, device: Device) -> Option<f64> {
        let Device::Cuda(index) = device else {
            return None;
        };

        let output = Command::new(&self.bin)
            .args([
                "--query-gpu=memory.total",
                "--format=csv,noheader,nounits",
                "-i",
                &index.to_string(),
            ])
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                parse_nvidia_smi_mib(&stdout).map(|mib| mib / 1024.0)
            }
            Ok(out) => {
                warn!(
                    "{} exited with {} while probing {}",
                    self.bin, out.status, device
                );
                None
            }
            Err(e) => {
                warn!("Could not run {} to probe {}: {}", self.bin, device, e);
                None
            }
        }
    }
}

/// Parse the first line of `nvidia-smi --format=csv,noheader,nounits` (MiB).
fn parse_nvidia_smi_mib(stdout: &str) -> Option<f64> {
    stdout
        .lines()
        .next()
        .and_then(|l| l.trim().parse::<f64>().ok())
}

/// What the selected device can do, resolved once at startup.
#[derive(Clone)]
pub struct DeviceCapability {
    pub device: Device,
    pub has_accelerator: bool,
    query: Arc<dyn MemoryQuery>,
}

impl fmt::Debug for DeviceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceCapability")
            .field("device", &self.device)
            .field("has_accelerator", &self.has_accelerator)
            .finish()
    }
}

impl DeviceCapability {
    /// Resolve the default capability for a device tag.
    pub fn resolve(device: Device) -> Self {
        let query: Arc<dyn MemoryQuery> = match device {
            Device::Cuda(_) => Arc::new(NvidiaSmiQuery::default()),
            Device::Cpu | Device::Npu(_) => Arc::new(NoMemoryQuery),
        };
        Self {
            device,
            has_accelerator: device.is_accelerator(),
            query,
        }
    }

    /// Build a capability with a caller-supplied memory query.
    pub fn with_query(device: Device, has_accelerator: bool, query: Arc<dyn MemoryQuery>) -> Self {
        Self {
            device,
            has_accelerator,
            query,
        }
    }

    pub fn query_memory_gb(&self) -> Option<f64> {
        self.query.total_memory_gb(self.device)
    }
}

/// Reports accelerator memory capacity in whole GB, probed at most once.
#[derive(Debug)]
pub struct ResourceProbe {
    capability: DeviceCapability,
    override_gb: Option<u32>,
    cached: OnceLock<u32>,
}

impl ResourceProbe {
    pub fn new(capability: DeviceCapability, override_gb: Option<u32>) -> Self {
        Self {
            capability,
            override_gb,
            cached: OnceLock::new(),
        }
    }

    /// Build a probe honouring [`VRAM_OVERRIDE_ENV`], falling back to `fallback_override`.
    pub fn from_env(capability: DeviceCapability, fallback_override: Option<u32>) -> Self {
        let env_override = match std::env::var(VRAM_OVERRIDE_ENV) {
            Ok(v) if !v.trim().is_empty() => match v.trim().parse::<u32>() {
                Ok(gb) => Some(gb),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not an integer GB value", VRAM_OVERRIDE_ENV, v);
                    None
                }
            },
            _ => None,
        };
        Self::new(capability, env_override.or(fallback_override))
    }

    pub fn capability(&self) -> &DeviceCapability {
        &self.capability
    }

    /// Memory capacity in GB; `0` means unknown or no accelerator.
    pub fn capacity(&self) -> u32 {
        *self.cached.get_or_init(|| self.probe())
    }

    fn probe(&self) -> u32 {
        if let Some(gb) = self.override_gb {
            info!("Using configured accelerator memory: {} GB", gb);
            return gb;
        }
        if !self.capability.has_accelerator {
            debug!("Device {} has no accelerator; capacity 0", self.capability.device);
            return 0;
        }
        match self.capability.query_memory_gb() {
            Some(gb) if gb.is_finite() && gb > 0.0 => {
                let rounded = gb.round() as u32;
                info!(
                    "Probed {} memory: {:.2} GB (rounded to {} GB)",
                    self.capability.device, gb, rounded
                );
                rounded
            }
            _ => {
                warn!(
                    "Memory query unavailable for {}; batching disabled",
                    self.capability.device
                );
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingQuery {
        gb: Option<f64>,
        calls: AtomicUsize,
    }

    impl MemoryQuery for CountingQuery {
        fn total_memory_gb(&self, _device: Device) -> Option<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gb
        }
    }

    #[test]
    fn parses_device_tags() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("npu:2".parse::<Device>().unwrap(), Device::Npu(2));
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for d in [Device::Cpu, Device::Cuda(3), Device::Npu(0)] {
            assert_eq!(d.to_string().parse::<Device>().unwrap(), d);
        }
    }

    #[test]
    fn capacity_is_rounded_and_probed_once() {
        let query = Arc::new(CountingQuery {
            gb: Some(15.7),
            calls: AtomicUsize::new(0),
        });
        let cap = DeviceCapability::with_query(Device::Cuda(0), true, query.clone());
        let probe = ResourceProbe::new(cap, None);
        assert_eq!(probe.capacity(), 16);
        assert_eq!(probe.capacity(), 16);
        assert_eq!(query.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn override_wins_over_query() {
        let query = Arc::new(CountingQuery {
            gb: Some(24.0),
            calls: AtomicUsize::new(0),
        });
        let cap = DeviceCapability::with_query(Device::Cuda(0), true, query.clone());
        let probe = ResourceProbe::new(cap, Some(9));
        assert_eq!(probe.capacity(), 9);
        assert_eq!(query.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_query_degrades_to_zero() {
        let query = Arc::new(CountingQuery {
            gb: None,
            calls: AtomicUsize::new(0),
        });
        let cap = DeviceCapability::with_query(Device::Npu(0), true, query);
        assert_eq!(ResourceProbe::new(cap, None).capacity(), 0);
    }

    #[test]
    fn cpu_reports_zero() {
        let probe = ResourceProbe::new(DeviceCapability::resolve(Device::Cpu), None);
        assert_eq!(probe.capacity(), 0);
    }

    #[test]
    fn nvidia_smi_output_parsing() {
        assert_eq!(parse_nvidia_smi_mib("24576\n"), Some(24576.0));
        assert_eq!(parse_nvidia_smi_mib(" 8192 \n16384\n"), Some(8192.0));
        assert_eq!(parse_nvidia_smi_mib("N/A"), None);
        assert_eq!(parse_nvidia_smi_mib(""), None);
    }
}
