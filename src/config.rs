use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{yolo::DEFAULT_IOU_THRESHOLD, DEFAULT_CONFIDENCE_FLOOR};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_PROBE_INTERVAL_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 200;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_INPUT_SIZE: u32 = 640;
const MAX_INPUT_SIZE: u32 = 4096;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    addr: Option<String>,
    probe: Option<ProbeConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    detector: Option<DetectorConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ProbeConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    grace_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_size: Option<u32>,
    confidence_floor: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    max_bytes: Option<usize>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub addr: String,
    pub probe_interval: Duration,
    pub shutdown_grace: Duration,
    pub detector: DetectorSettings,
    pub upload: UploadSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_floor: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: None,
            labels_path: None,
            input_size: DEFAULT_INPUT_SIZE,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    pub max_bytes: usize,
    pub jpeg_quality: u8,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            probe_interval: Duration::from_secs(DEFAULT_PROBE_INTERVAL_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            detector: DetectorSettings::default(),
            upload: UploadSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: optional JSON file, then `DETECTD_*` env overrides.
    ///
    /// When `path` is `None`, `DETECTD_CONFIG` is consulted.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("DETECTD_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => read_config_file(&path)?,
            None => ServiceConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let defaults = Self::default();
        let detector = file.detector.unwrap_or_default();
        let upload = file.upload.unwrap_or_default();
        Self {
            addr: file.addr.unwrap_or(defaults.addr),
            probe_interval: file
                .probe
                .and_then(|probe| probe.interval_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_interval),
            shutdown_grace: file
                .shutdown
                .and_then(|shutdown| shutdown.grace_ms)
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace),
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(defaults.detector.backend),
                model_path: detector.model_path,
                labels_path: detector.labels_path,
                input_size: detector.input_size.unwrap_or(defaults.detector.input_size),
                confidence_floor: detector
                    .confidence_floor
                    .unwrap_or(defaults.detector.confidence_floor),
                iou_threshold: detector
                    .iou_threshold
                    .unwrap_or(defaults.detector.iou_threshold),
            },
            upload: UploadSettings {
                max_bytes: upload.max_bytes.unwrap_or(defaults.upload.max_bytes),
                jpeg_quality: upload.jpeg_quality.unwrap_or(defaults.upload.jpeg_quality),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_nonempty("DETECTD_ADDR") {
            self.addr = addr;
        }
        if let Some(secs) = env_nonempty("DETECTD_PROBE_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                anyhow!("DETECTD_PROBE_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.probe_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_nonempty("DETECTD_SHUTDOWN_GRACE_MS") {
            let ms: u64 = ms.parse().map_err(|_| {
                anyhow!("DETECTD_SHUTDOWN_GRACE_MS must be an integer number of milliseconds")
            })?;
            self.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(backend) = env_nonempty("DETECTD_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_nonempty("DETECTD_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(path));
        }
        if let Some(path) = env_nonempty("DETECTD_LABELS_PATH") {
            self.detector.labels_path = Some(PathBuf::from(path));
        }
        if let Some(floor) = env_nonempty("DETECTD_CONFIDENCE_FLOOR") {
            self.detector.confidence_floor = floor
                .parse()
                .map_err(|_| anyhow!("DETECTD_CONFIDENCE_FLOOR must be a number"))?;
        }
        if let Some(max) = env_nonempty("DETECTD_MAX_UPLOAD_BYTES") {
            self.upload.max_bytes = max
                .parse()
                .map_err(|_| anyhow!("DETECTD_MAX_UPLOAD_BYTES must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.probe_interval.is_zero() {
            return Err(anyhow!("probe interval must be greater than zero"));
        }
        let floor = self.detector.confidence_floor;
        if !(0.0..=1.0).contains(&floor) {
            return Err(anyhow!("confidence floor {} outside [0, 1]", floor));
        }
        let iou = self.detector.iou_threshold;
        if !(0.0..=1.0).contains(&iou) {
            return Err(anyhow!("iou threshold {} outside [0, 1]", iou));
        }
        let input_size = self.detector.input_size;
        if input_size == 0 || input_size % 32 != 0 || input_size > MAX_INPUT_SIZE {
            return Err(anyhow!(
                "detector input size {} must be a multiple of 32 in 32..={}",
                input_size,
                MAX_INPUT_SIZE
            ));
        }
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if self.detector.backend == "tract" && self.detector.model_path.is_none() {
            return Err(anyhow!("tract backend requires detector.model_path"));
        }
        if self.upload.max_bytes == 0 {
            return Err(anyhow!("upload limit must be greater than zero"));
        }
        if !(1..=100).contains(&self.upload.jpeg_quality) {
            return Err(anyhow!(
                "jpeg quality {} outside 1..=100",
                self.upload.jpeg_quality
            ));
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
