// Cipher Session - caller-side handle on one cipher service session
// Owns the transport, tracks the committed key configuration and times
// each Process crossing with a monotonic clock

use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::protocol::{BufferLayout, Command, CommandId, Operation};
use super::transport::TeeTransport;
use crate::shared_memory::{MemFlags, SharedBuffer, SharedMemoryPool};
use crate::tee::{CommandOutput, TeeError};
use crate::types::CipherConfig;

/// Open connection to the cipher service
///
/// A session must commit a key configuration with [`prepare_key`] before
/// any Process; a failed PrepareKey clears the committed configuration
/// because the service rolls back to holding no operation context.
///
/// [`prepare_key`]: CipherSession::prepare_key
pub struct CipherSession<T: TeeTransport> {
    transport: T,
    pool: SharedMemoryPool,
    committed: Option<CipherConfig>,
    open: bool,
}

impl<T: TeeTransport> CipherSession<T> {
    /// Open a session over `transport`, allocating shared buffers from `pool`
    pub fn open(mut transport: T, pool: SharedMemoryPool) -> Result<Self, TeeError> {
        transport.open_session()?;
        info!(transport = transport.name(), "cipher session opened");
        Ok(Self {
            transport,
            pool,
            committed: None,
            open: true,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn pool(&self) -> &SharedMemoryPool {
        &self.pool
    }

    /// Configuration the service currently holds a context for
    pub fn committed_config(&self) -> Option<CipherConfig> {
        self.committed
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Allocate a shared buffer from the session's pool
    pub fn allocate(&self, len: usize, flags: MemFlags) -> Result<SharedBuffer, TeeError> {
        self.pool.allocate(len, flags)
    }

    /// Commit a (mode, direction, key size) configuration
    pub fn prepare_key(&mut self, config: CipherConfig) -> Result<(), TeeError> {
        let mut operation = Command::PrepareKey(config).to_operation()?;
        match self
            .transport
            .invoke_command(CommandId::PREPARE_KEY, &mut operation)
        {
            Ok(_) => {
                self.committed = Some(config);
                debug!(%config, "key configuration committed");
                Ok(())
            }
            Err(e) => {
                // Shape errors leave the old context in place; anything
                // later in key setup leaves none
                if !e.is_protocol() {
                    self.committed = None;
                }
                Err(e)
            }
        }
    }

    /// PrepareKey only when `config` differs from what is committed
    pub fn ensure_key(&mut self, config: CipherConfig) -> Result<(), TeeError> {
        if self.committed == Some(config) {
            return Ok(());
        }
        self.prepare_key(config)
    }

    /// One Process crossing; returns bytes written
    pub fn process(&mut self, layout: BufferLayout<'_>, inner_loops: u32) -> Result<usize, TeeError> {
        let mut operation = Command::Process {
            layout,
            inner_loops,
        }
        .to_operation()?;
        let output = self
            .transport
            .invoke_command(CommandId::PROCESS, &mut operation)?;
        let slot = if layout.is_in_place() { 0 } else { 1 };
        Ok(output.written[slot].unwrap_or(0))
    }

    /// One Process crossing, timed from just before the request is issued
    /// until the reply has been handled
    pub fn timed_process(
        &mut self,
        layout: BufferLayout<'_>,
        inner_loops: u32,
    ) -> Result<Duration, TeeError> {
        let mut operation = Command::Process {
            layout,
            inner_loops,
        }
        .to_operation()?;

        let start = Instant::now();
        self.transport
            .invoke_command(CommandId::PROCESS, &mut operation)?;
        Ok(start.elapsed())
    }

    /// Send an arbitrary four-slot operation, bypassing the typed commands
    pub fn invoke_raw(
        &mut self,
        command_id: u32,
        operation: &mut Operation<'_>,
    ) -> Result<CommandOutput, TeeError> {
        operation.validate()?;
        self.transport.invoke_command(command_id, operation)
    }

    /// Close the session; the service frees its operation context
    pub fn close(mut self) -> Result<(), TeeError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), TeeError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.committed = None;
        let result = self.transport.close_session();
        info!(transport = self.transport.name(), "cipher session closed");
        result
    }
}

impl<T: TeeTransport> Drop for CipherSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            debug!(error = %e, "session close on drop failed");
        }
    }
}
