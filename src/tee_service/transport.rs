// Cipher Service Transport - how a command crosses the trust boundary
// In-process transport hands shared buffers to the service directly;
// socket transport ships them to a standalone daemon and copies results back

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::io::{Read, Write};
use std::ops::Range;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::protocol::{
    check_frame_len, encode_operation, Operation, Param, WireParam, WireRequest, WireResponse,
};
use crate::tee::{
    CipherService, CommandOutput, ErrorOrigin, ResultCode, ServiceConfig, TaParam, TaParams,
    TeeError, Value,
};

/// One way of reaching a cipher service session
pub trait TeeTransport {
    /// Short label used in logs and reports
    fn name(&self) -> &'static str;

    fn open_session(&mut self) -> Result<(), TeeError>;

    /// Synchronous command crossing; output windows are truncated to the
    /// bytes written when this returns Ok
    fn invoke_command(
        &mut self,
        command_id: u32,
        operation: &mut Operation<'_>,
    ) -> Result<CommandOutput, TeeError>;

    fn close_session(&mut self) -> Result<(), TeeError>;
}

fn no_session() -> TeeError {
    TeeError::session(ResultCode::BAD_STATE, ErrorOrigin::Api, "no open session")
}

fn session_already_open() -> TeeError {
    TeeError::session(
        ResultCode::BAD_STATE,
        ErrorOrigin::Api,
        "session already open",
    )
}

// ============================================================================
// In-process transport
// ============================================================================

/// Hosts the cipher service in the calling process
#[derive(Debug)]
pub struct LocalTransport {
    config: ServiceConfig,
    service: Option<CipherService>,
}

impl LocalTransport {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            service: None,
        }
    }

    /// Service state for inspection (None when no session is open)
    pub fn service(&self) -> Option<&CipherService> {
        self.service.as_ref()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

/// A slot with its buffer access held for the duration of one command
enum Mapping<'b> {
    None,
    ValueInput(Value),
    ValueOutput(Value),
    ValueInout(Value),
    Input(RwLockReadGuard<'b, Box<[u8]>>, Range<usize>),
    Output(RwLockWriteGuard<'b, Box<[u8]>>, Range<usize>),
    Inout(RwLockWriteGuard<'b, Box<[u8]>>, Range<usize>),
}

fn buffer_busy(id: u64) -> TeeError {
    TeeError::protocol(
        ResultCode::BUSY,
        ErrorOrigin::Api,
        format!("buffer {} is already mapped by another slot", id),
    )
}

impl<'b> Mapping<'b> {
    fn map(param: &Param<'b>) -> Result<Self, TeeError> {
        let mapping = match param {
            Param::None => Mapping::None,
            Param::ValueInput(v) => Mapping::ValueInput(*v),
            Param::ValueOutput(v) => Mapping::ValueOutput(*v),
            Param::ValueInout(v) => Mapping::ValueInout(*v),
            Param::MemrefInput(m) => {
                let guard = m
                    .buffer()
                    .try_read()
                    .ok_or_else(|| buffer_busy(m.buffer().id()))?;
                Mapping::Input(guard, m.range())
            }
            Param::MemrefOutput(m) => {
                let guard = m
                    .buffer()
                    .try_write()
                    .ok_or_else(|| buffer_busy(m.buffer().id()))?;
                Mapping::Output(guard, m.range())
            }
            Param::MemrefInout(m) => {
                let guard = m
                    .buffer()
                    .try_write()
                    .ok_or_else(|| buffer_busy(m.buffer().id()))?;
                Mapping::Inout(guard, m.range())
            }
        };
        Ok(mapping)
    }

    fn as_param(&mut self) -> TaParam<'_> {
        match self {
            Mapping::None => TaParam::None,
            Mapping::ValueInput(v) => TaParam::ValueInput(*v),
            Mapping::ValueOutput(v) => TaParam::ValueOutput(*v),
            Mapping::ValueInout(v) => TaParam::ValueInout(*v),
            Mapping::Input(guard, range) => TaParam::MemrefInput(&guard[range.clone()]),
            Mapping::Output(guard, range) => TaParam::MemrefOutput(&mut guard[range.clone()]),
            Mapping::Inout(guard, range) => TaParam::MemrefInout(&mut guard[range.clone()]),
        }
    }
}

/// Copy value outputs the service produced back into the caller's slots
fn write_back_values(params: &TaParams<'_>, operation: &mut Operation<'_>) {
    for (ta, param) in params.iter().zip(operation.params.iter_mut()) {
        match (ta, param) {
            (TaParam::ValueOutput(v), Param::ValueOutput(out))
            | (TaParam::ValueInout(v), Param::ValueInout(out)) => *out = *v,
            _ => {}
        }
    }
}

impl TeeTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn open_session(&mut self) -> Result<(), TeeError> {
        if self.service.is_some() {
            return Err(session_already_open());
        }
        self.service = Some(CipherService::new(self.config.clone()));
        Ok(())
    }

    fn invoke_command(
        &mut self,
        command_id: u32,
        operation: &mut Operation<'_>,
    ) -> Result<CommandOutput, TeeError> {
        let service = self.service.as_mut().ok_or_else(no_session)?;

        let output = {
            let [p0, p1, p2, p3] = &operation.params;
            let mut mappings = [
                Mapping::map(p0)?,
                Mapping::map(p1)?,
                Mapping::map(p2)?,
                Mapping::map(p3)?,
            ];
            let [m0, m1, m2, m3] = &mut mappings;
            let mut params: TaParams = [m0.as_param(), m1.as_param(), m2.as_param(), m3.as_param()];

            let output = service.invoke(command_id, &mut params)?;
            write_back_values(&params, operation);
            output
        };

        operation.apply_output(&output);
        Ok(output)
    }

    fn close_session(&mut self) -> Result<(), TeeError> {
        if let Some(mut service) = self.service.take() {
            service.close();
        }
        Ok(())
    }
}

// ============================================================================
// Socket transport
// ============================================================================

fn comms_error(context: &str, e: impl std::fmt::Display) -> TeeError {
    TeeError::session(
        ResultCode::COMMUNICATION,
        ErrorOrigin::Comms,
        format!("{}: {}", context, e),
    )
}

/// Write one length-prefixed (u32 big-endian) JSON frame
pub fn write_frame<W: Write, T: serde::Serialize>(writer: &mut W, message: &T) -> Result<(), TeeError> {
    let payload = serde_json::to_vec(message).map_err(|e| comms_error("encode frame", e))?;
    check_frame_len(payload.len())?;
    let len = (payload.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .and_then(|_| writer.write_all(&payload))
        .and_then(|_| writer.flush())
        .map_err(|e| comms_error("send frame", e))
}

/// Read one length-prefixed JSON frame
pub fn read_frame<R: Read, T: serde::de::DeserializeOwned>(reader: &mut R) -> Result<T, TeeError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .map_err(|e| comms_error("read frame length", e))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    check_frame_len(len)?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| comms_error("read frame", e))?;
    serde_json::from_slice(&payload).map_err(|e| comms_error("decode frame", e))
}

/// Talks to a standalone cipher service daemon over a Unix socket
#[derive(Debug)]
pub struct SocketTransport {
    socket_path: PathBuf,
    stream: Option<UnixStream>,
}

impl SocketTransport {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            stream: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn exchange(&mut self, request: &WireRequest) -> Result<WireResponse, TeeError> {
        let stream = self.stream.as_mut().ok_or_else(no_session)?;
        trace!(request = request.request_type(), "sending");
        write_frame(stream, request)?;
        read_frame(stream)
    }
}

fn unexpected(response: &WireResponse) -> TeeError {
    TeeError::session(
        ResultCode::COMMUNICATION,
        ErrorOrigin::Comms,
        format!("unexpected response {:?}", response),
    )
}

/// Copy returned output windows into the caller's shared buffers
fn copy_back(returned: &[WireParam], operation: &mut Operation<'_>) -> Result<(), TeeError> {
    for (slot, (wire, param)) in returned.iter().zip(operation.params.iter_mut()).enumerate() {
        match (wire, param) {
            (WireParam::Memref { data, .. }, Param::MemrefOutput(m))
            | (WireParam::Memref { data, .. }, Param::MemrefInout(m)) => {
                if data.len() > m.size() {
                    return Err(TeeError::session(
                        ResultCode::COMMUNICATION,
                        ErrorOrigin::Comms,
                        format!(
                            "slot {} returned {} bytes into a {}-byte window",
                            slot,
                            data.len(),
                            m.size()
                        ),
                    ));
                }
                let start = m.offset();
                m.buffer().write()[start..start + data.len()].copy_from_slice(data);
            }
            (WireParam::Value(v), Param::ValueOutput(out))
            | (WireParam::Value(v), Param::ValueInout(out)) => *out = *v,
            _ => {}
        }
    }
    Ok(())
}

impl TeeTransport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn open_session(&mut self) -> Result<(), TeeError> {
        if self.stream.is_some() {
            return Err(session_already_open());
        }
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            comms_error(
                &format!("connect to {}", self.socket_path.display()),
                e,
            )
        })?;
        self.stream = Some(stream);

        match self.exchange(&WireRequest::OpenSession) {
            Ok(WireResponse::SessionOpened) => {
                debug!(socket = %self.socket_path.display(), "remote session opened");
                Ok(())
            }
            Ok(WireResponse::Failed { error }) => {
                self.stream = None;
                Err(error)
            }
            Ok(other) => {
                self.stream = None;
                Err(unexpected(&other))
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    fn invoke_command(
        &mut self,
        command_id: u32,
        operation: &mut Operation<'_>,
    ) -> Result<CommandOutput, TeeError> {
        let request = WireRequest::InvokeCommand {
            command_id,
            param_types: operation.param_types().pack(),
            params: encode_operation(operation),
        };

        match self.exchange(&request)? {
            WireResponse::Completed { output, params } => {
                copy_back(&params, operation)?;
                operation.apply_output(&output);
                Ok(output)
            }
            WireResponse::Failed { error } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    fn close_session(&mut self) -> Result<(), TeeError> {
        if self.stream.is_none() {
            return Ok(());
        }
        let result = match self.exchange(&WireRequest::CloseSession) {
            Ok(WireResponse::SessionClosed) => Ok(()),
            Ok(WireResponse::Failed { error }) => Err(error),
            Ok(other) => Err(unexpected(&other)),
            Err(e) => Err(e),
        };
        self.stream = None;
        debug!("remote session closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory::{MemFlags, MemRef, SharedMemoryPool};
    use crate::tee::CommandId;
    use crate::tee_service::protocol::{BufferLayout, Command};
    use crate::types::CipherConfig;

    #[test]
    fn test_local_transport_requires_open_session() {
        let mut transport = LocalTransport::default();
        let mut op = Command::PrepareKey(CipherConfig::default())
            .to_operation()
            .unwrap();
        let err = transport
            .invoke_command(CommandId::PREPARE_KEY, &mut op)
            .unwrap_err();
        assert!(matches!(err, TeeError::Session { .. }));

        transport.open_session().unwrap();
        assert!(transport.open_session().is_err());
        transport
            .invoke_command(CommandId::PREPARE_KEY, &mut op)
            .unwrap();
        assert_eq!(transport.service().unwrap().state_name(), "KeyReady");
    }

    #[test]
    fn test_local_transport_maps_buffers() {
        let pool = SharedMemoryPool::default();
        let input = pool.allocate(32, MemFlags::INPUT).unwrap();
        let output = pool.allocate(32, MemFlags::OUTPUT).unwrap();
        let mut transport = LocalTransport::default();
        transport.open_session().unwrap();

        let mut op = Command::PrepareKey(CipherConfig::default())
            .to_operation()
            .unwrap();
        transport
            .invoke_command(CommandId::PREPARE_KEY, &mut op)
            .unwrap();

        let layout = BufferLayout::separate(MemRef::whole(&input), MemRef::whole(&output)).unwrap();
        let mut op = Command::Process { layout, inner_loops: 1 }
            .to_operation()
            .unwrap();
        let out = transport.invoke_command(CommandId::PROCESS, &mut op).unwrap();
        assert_eq!(out.written[1], Some(32));
        assert!(output.read().iter().any(|&b| b != 0));
        assert!(input.read().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_same_buffer_in_two_write_slots_is_busy() {
        let pool = SharedMemoryPool::default();
        let buffer = pool.allocate(32, MemFlags::INOUT).unwrap();
        let mut transport = LocalTransport::default();
        transport.open_session().unwrap();

        let mut op = Operation::new([
            Param::MemrefInout(MemRef::whole(&buffer)),
            Param::MemrefOutput(MemRef::whole(&buffer)),
            Param::ValueInput(Value::new(1, 0)),
            Param::None,
        ]);
        let err = transport.invoke_command(CommandId::PROCESS, &mut op).unwrap_err();
        assert_eq!(err.code(), ResultCode::BUSY);
    }

    #[test]
    fn test_socket_connect_failure_is_comms_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut transport = SocketTransport::new(dir.path().join("missing.sock"));
        let err = transport.open_session().unwrap_err();
        assert!(matches!(err, TeeError::Session { .. }));
        assert_eq!(err.code(), ResultCode::COMMUNICATION);
        assert_eq!(err.origin(), ErrorOrigin::Comms);
    }

    #[test]
    fn test_frame_roundtrip_over_buffer() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &WireRequest::CloseSession).unwrap();
        assert_eq!(&wire[..4], &((wire.len() - 4) as u32).to_be_bytes());

        let back: WireRequest = read_frame(&mut wire.as_slice()).unwrap();
        assert_eq!(back.request_type(), "CloseSession");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = ((crate::tee_service::protocol::MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        let err = read_frame::<_, WireRequest>(&mut len.as_slice()).unwrap_err();
        assert_eq!(err.code(), ResultCode::COMMUNICATION);
    }
}
