pub mod benchmark;
pub mod clock;
pub mod config;
pub mod entropy;
pub mod logging;
pub mod report;
pub mod shared_memory;
pub mod statistics;
pub mod tee;
pub mod tee_service;
pub mod types;

pub use benchmark::BenchmarkRunner;
pub use config::{BenchConfig, ConfigError};
pub use entropy::{EntropyConfig, EntropySource};
pub use report::{BenchmarkReport, Summary};
pub use shared_memory::{MemFlags, MemRef, SharedBuffer, SharedMemoryPool};
pub use statistics::StatisticsAccumulator;
pub use tee::{ErrorOrigin, ResultCode, TeeError};
pub use tee_service::{CipherSession, LocalTransport, SocketTransport, TeeServiceServer, TeeTransport};
pub use types::{CipherConfig, CipherMode, Direction, InputMode, KeySize};
