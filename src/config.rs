// Benchmark Configuration
// Defaults, optional JSON file, TEE_AES_PERF_* environment overlay and
// validation. Command-line flags are applied last by the binary.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::shared_memory::{DEFAULT_POOL_CAPACITY, PAGE_SIZE};
use crate::tee::{KeyMaterial, ServiceConfig, AES_BLOCK_SIZE};
use crate::tee_service::MAX_SOCKET_BUFFER_SIZE;
use crate::types::{CipherConfig, CipherMode, Direction, InputMode, KeySize};

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_OUTER_ITERATIONS: u32 = 100_000;
pub const DEFAULT_INNER_LOOPS: u32 = 1;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "TEE_AES_PERF_";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io { path: String, message: String },
    Parse { message: String },
    InvalidEnv { var: String, value: String },
    InvalidValue { field: &'static str, reason: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io { path, message } => {
                write!(f, "Cannot read configuration {}: {}", path, message)
            }
            ConfigError::Parse { message } => write!(f, "Invalid configuration file: {}", message),
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "Invalid value '{}' for {}", value, var)
            }
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Everything one benchmark run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub mode: CipherMode,
    pub direction: Direction,
    pub key_size: KeySize,

    /// Bytes per Process command
    pub buffer_size: usize,

    /// Timed Process commands
    pub outer_iterations: u32,

    /// Cipher passes folded into each Process command
    pub inner_loops: u32,

    /// One inout buffer instead of separate input and output buffers
    pub in_place: bool,

    pub input_mode: InputMode,

    /// Untimed Process commands before measurement
    pub warmup_iterations: u32,

    /// Key material override, hex (service side)
    pub key_hex: Option<String>,

    /// IV override, 16 bytes hex (service side)
    pub iv_hex: Option<String>,

    /// Shared memory pool capacity in bytes
    pub pool_capacity: usize,

    /// Reach a standalone service daemon instead of the in-process one
    pub socket_path: Option<String>,

    /// Seed for reproducible random input
    pub entropy_seed: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            mode: CipherMode::Ecb,
            direction: Direction::Encrypt,
            key_size: KeySize::Aes128,
            buffer_size: DEFAULT_BUFFER_SIZE,
            outer_iterations: DEFAULT_OUTER_ITERATIONS,
            inner_loops: DEFAULT_INNER_LOOPS,
            in_place: false,
            input_mode: InputMode::Zero,
            warmup_iterations: 0,
            key_hex: None,
            iv_hex: None,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            socket_path: None,
            entropy_seed: None,
        }
    }
}

fn parse_env<T: FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value,
    })
}

fn parse_flag(var: &str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        }),
    }
}

impl BenchConfig {
    pub fn cipher_config(&self) -> CipherConfig {
        CipherConfig::new(self.mode, self.direction, self.key_size)
    }

    /// Load a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Overlay TEE_AES_PERF_* variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Overlay variables from an arbitrary lookup (process env, tests)
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("{}{}", ENV_PREFIX, suffix);
            lookup(&var).map(|value| (var, value))
        };

        if let Some((var, value)) = get("MODE") {
            self.mode = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("DECRYPT") {
            self.direction = if parse_flag(&var, value)? {
                Direction::Decrypt
            } else {
                Direction::Encrypt
            };
        }
        if let Some((var, value)) = get("KEY_SIZE") {
            self.key_size = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("BUFFER_SIZE") {
            self.buffer_size = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("ITERATIONS") {
            self.outer_iterations = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("INNER_LOOPS") {
            self.inner_loops = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("IN_PLACE") {
            self.in_place = parse_flag(&var, value)?;
        }
        if let Some((var, value)) = get("INPUT_MODE") {
            self.input_mode = parse_env(&var, value)?;
        }
        if let Some((var, value)) = get("WARMUP") {
            self.warmup_iterations = parse_env(&var, value)?;
        }
        if let Some((_, value)) = get("KEY") {
            self.key_hex = Some(value);
        }
        if let Some((_, value)) = get("IV") {
            self.iv_hex = Some(value);
        }
        if let Some((var, value)) = get("POOL_CAPACITY") {
            self.pool_capacity = parse_env(&var, value)?;
        }
        if let Some((_, value)) = get("SOCKET") {
            self.socket_path = Some(value);
        }
        Ok(())
    }

    /// Pool bytes the run's buffers reserve
    pub fn required_pool_bytes(&self) -> usize {
        let per_buffer = self.buffer_size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        if self.in_place {
            per_buffer
        } else {
            2 * per_buffer
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outer_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "outer_iterations",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.inner_loops == 0 {
            return Err(ConfigError::InvalidValue {
                field: "inner_loops",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.required_pool_bytes() > self.pool_capacity {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size",
                reason: format!(
                    "{} bytes per buffer do not fit a {}-byte pool",
                    self.buffer_size, self.pool_capacity
                ),
            });
        }
        if self.socket_path.is_some() && (self.key_hex.is_some() || self.iv_hex.is_some()) {
            return Err(ConfigError::InvalidValue {
                field: "key",
                reason: "key and IV belong to the service daemon when a socket is used".to_string(),
            });
        }
        if self.socket_path.is_some() && self.buffer_size > MAX_SOCKET_BUFFER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "buffer_size",
                reason: format!(
                    "{} bytes exceed the {}-byte limit of the socket transport",
                    self.buffer_size, MAX_SOCKET_BUFFER_SIZE
                ),
            });
        }
        self.key_material().map(|_| ())
    }

    /// Service key material: defaults with any hex overrides applied
    pub fn key_material(&self) -> Result<KeyMaterial, ConfigError> {
        let defaults = KeyMaterial::default();

        let key = match &self.key_hex {
            Some(text) => hex::decode(text.trim()).map_err(|e| ConfigError::InvalidValue {
                field: "key",
                reason: e.to_string(),
            })?,
            None => defaults.key().to_vec(),
        };

        let iv = match &self.iv_hex {
            Some(text) => {
                let bytes = hex::decode(text.trim()).map_err(|e| ConfigError::InvalidValue {
                    field: "iv",
                    reason: e.to_string(),
                })?;
                <[u8; AES_BLOCK_SIZE]>::try_from(bytes.as_slice()).map_err(|_| {
                    ConfigError::InvalidValue {
                        field: "iv",
                        reason: format!("expected {} bytes, got {}", AES_BLOCK_SIZE, bytes.len()),
                    }
                })?
            }
            None => *defaults.iv(),
        };

        Ok(KeyMaterial::new(key, iv))
    }

    pub fn service_config(&self) -> Result<ServiceConfig, ConfigError> {
        Ok(ServiceConfig::new(self.key_material()?))
    }
}
