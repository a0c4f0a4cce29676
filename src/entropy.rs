use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs::File;
use std::io::Read;
use tracing::{debug, warn};

/// Default entropy device read for random input buffers
pub const DEFAULT_ENTROPY_DEVICE: &str = "/dev/urandom";

/// Configuration for the input-buffer entropy source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntropyConfig {
    /// Device to read from (None skips straight to OsRng)
    pub device_path: Option<String>,

    /// Buffer size for batched device reads (default: 4096 bytes)
    pub buffer_size: usize,

    /// Deterministic seed for reproducible runs and tests
    pub deterministic_seed: Option<u64>,
}

impl Default for EntropyConfig {
    fn default() -> Self {
        Self {
            device_path: Some(DEFAULT_ENTROPY_DEVICE.to_string()),
            buffer_size: 4096,
            deterministic_seed: None,
        }
    }
}

impl EntropyConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            device_path: match std::env::var("TEE_AES_PERF_ENTROPY_DEVICE") {
                Ok(path) if path.is_empty() || path == "none" => None,
                Ok(path) => Some(path),
                Err(_) => defaults.device_path,
            },

            buffer_size: std::env::var("TEE_AES_PERF_ENTROPY_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.buffer_size),

            deterministic_seed: std::env::var("TEE_AES_PERF_ENTROPY_SEED")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    pub fn deterministic(seed: u64) -> Self {
        Self {
            deterministic_seed: Some(seed),
            ..Self::default()
        }
    }
}

enum Source {
    Device(File),
    OsRng,
    Deterministic(StdRng),
}

impl Source {
    fn name(&self) -> &'static str {
        match self {
            Source::Device(_) => "Device",
            Source::OsRng => "OsRng",
            Source::Deterministic(_) => "Deterministic",
        }
    }
}

/// Entropy for random-input runs
///
/// Reads an entropy device in batches and falls back to the OS CSPRNG
/// when the device cannot be opened or a read fails. A seeded source
/// gives byte-for-byte reproducible input.
pub struct EntropySource {
    source: Source,
    buffer: Vec<u8>,
    position: usize,
    config: EntropyConfig,
}

impl EntropySource {
    pub fn new() -> Self {
        Self::with_config(EntropyConfig::from_env())
    }

    pub fn new_deterministic(seed: u64) -> Self {
        Self::with_config(EntropyConfig::deterministic(seed))
    }

    pub fn with_config(config: EntropyConfig) -> Self {
        let source = if let Some(seed) = config.deterministic_seed {
            Source::Deterministic(StdRng::seed_from_u64(seed))
        } else if let Some(path) = &config.device_path {
            match File::open(path) {
                Ok(file) => {
                    debug!(device = %path, "entropy device opened");
                    Source::Device(file)
                }
                Err(e) => {
                    warn!(device = %path, error = %e, "entropy device unavailable, using OsRng");
                    Source::OsRng
                }
            }
        } else {
            Source::OsRng
        };

        // empty buffer forces a refill on first use
        Self {
            source,
            buffer: Vec::with_capacity(config.buffer_size.max(1)),
            position: 0,
            config,
        }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    fn refill(&mut self) {
        self.buffer.resize(self.config.buffer_size.max(1), 0);
        self.position = 0;

        match &mut self.source {
            Source::Device(file) => {
                if let Err(e) = file.read_exact(&mut self.buffer) {
                    warn!(error = %e, "entropy device read failed, switching to OsRng");
                    self.source = Source::OsRng;
                    rand::rngs::OsRng.fill_bytes(&mut self.buffer);
                }
            }
            Source::OsRng => rand::rngs::OsRng.fill_bytes(&mut self.buffer),
            Source::Deterministic(rng) => rng.fill_bytes(&mut self.buffer),
        }
    }

    fn fill(&mut self, dest: &mut [u8]) {
        // large requests bypass the batch buffer
        if dest.len() >= self.config.buffer_size {
            match &mut self.source {
                Source::Device(file) => {
                    if file.read_exact(dest).is_ok() {
                        return;
                    }
                    warn!("entropy device read failed, switching to OsRng");
                    self.source = Source::OsRng;
                    rand::rngs::OsRng.fill_bytes(dest);
                }
                Source::OsRng => rand::rngs::OsRng.fill_bytes(dest),
                Source::Deterministic(rng) => rng.fill_bytes(dest),
            }
            return;
        }

        let mut offset = 0;
        while offset < dest.len() {
            if self.position == self.buffer.len() {
                self.refill();
            }
            let to_copy = (self.buffer.len() - self.position).min(dest.len() - offset);
            dest[offset..offset + to_copy]
                .copy_from_slice(&self.buffer[self.position..self.position + to_copy]);
            self.position += to_copy;
            offset += to_copy;
        }
    }
}

impl Default for EntropySource {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for EntropySource {
    fn next_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.fill(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.fill(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill(dest);
        Ok(())
    }
}
