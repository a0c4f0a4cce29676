// Cipher Service Server - standalone isolated cipher service
// One connection is one session with its own CipherService; sessions never
// share operation contexts

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use colored::*;

use super::protocol::{WireParam, WireRequest, WireResponse, MAX_MESSAGE_SIZE};
use crate::tee::{
    CipherService, CommandOutput, ErrorOrigin, ParamType, ParamTypes, ResultCode, ServiceConfig,
    TaParam, TaParams, TeeError, Value, NUM_PARAMS,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Per-connection session state
#[derive(Debug)]
pub struct ServiceSession {
    config: ServiceConfig,
    service: Option<CipherService>,
}

impl ServiceSession {
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            service: None,
        }
    }

    pub fn service(&self) -> Option<&CipherService> {
        self.service.as_ref()
    }

    /// Handle one request frame; every request yields exactly one response
    pub fn handle(&mut self, request: WireRequest) -> WireResponse {
        match request {
            WireRequest::OpenSession => {
                if self.service.as_ref().is_some_and(|s| !s.is_closed()) {
                    return WireResponse::Failed {
                        error: TeeError::session(
                            ResultCode::BAD_STATE,
                            ErrorOrigin::Tee,
                            "session already open on this connection",
                        ),
                    };
                }
                self.service = Some(CipherService::new(self.config.clone()));
                WireResponse::SessionOpened
            }
            WireRequest::InvokeCommand {
                command_id,
                param_types,
                params,
            } => {
                let Some(service) = self.service.as_mut() else {
                    return WireResponse::Failed {
                        error: TeeError::session(
                            ResultCode::BAD_STATE,
                            ErrorOrigin::Tee,
                            "no session opened on this connection",
                        ),
                    };
                };
                match invoke_wire(service, command_id, param_types, params) {
                    Ok((output, params)) => WireResponse::Completed { output, params },
                    Err(error) => WireResponse::Failed { error },
                }
            }
            WireRequest::CloseSession => {
                if let Some(service) = self.service.as_mut() {
                    service.close();
                }
                WireResponse::SessionClosed
            }
        }
    }
}

fn slot_mismatch(slot: usize, declared: ParamType) -> TeeError {
    TeeError::protocol(
        ResultCode::BAD_PARAMETERS,
        ErrorOrigin::Comms,
        format!("slot {} does not carry a {:?} parameter", slot, declared),
    )
}

fn as_param(declared: ParamType, value: Value, data: &mut [u8]) -> TaParam<'_> {
    match declared {
        ParamType::None => TaParam::None,
        ParamType::ValueInput => TaParam::ValueInput(value),
        ParamType::ValueOutput => TaParam::ValueOutput(value),
        ParamType::ValueInout => TaParam::ValueInout(value),
        ParamType::MemrefInput => TaParam::MemrefInput(data),
        ParamType::MemrefOutput => TaParam::MemrefOutput(data),
        ParamType::MemrefInout => TaParam::MemrefInout(data),
    }
}

/// Materialise wire slots as service-side parameters, invoke, and package
/// the output windows for the reply
fn invoke_wire(
    service: &mut CipherService,
    command_id: u32,
    param_types: u32,
    params: [WireParam; NUM_PARAMS],
) -> Result<(CommandOutput, [WireParam; NUM_PARAMS]), TeeError> {
    let types = ParamTypes::unpack(param_types).ok_or_else(|| {
        TeeError::bad_parameters(format!("unknown parameter types 0x{:04x}", param_types))
    })?;

    let mut regions: [Vec<u8>; NUM_PARAMS] = Default::default();
    let mut values = [Value::default(); NUM_PARAMS];
    for (slot, wire) in params.into_iter().enumerate() {
        let declared = types.get(slot);
        match (declared, wire) {
            (ParamType::None, WireParam::None) => {}
            (ParamType::ValueInput | ParamType::ValueOutput | ParamType::ValueInout, WireParam::Value(v)) => {
                values[slot] = v
            }
            (ParamType::MemrefInput | ParamType::MemrefInout, WireParam::Memref { size, data })
                if data.len() == size =>
            {
                regions[slot] = data
            }
            (ParamType::MemrefOutput, WireParam::Memref { size, .. }) if size <= MAX_MESSAGE_SIZE => {
                regions[slot] = vec![0u8; size]
            }
            _ => return Err(slot_mismatch(slot, declared)),
        }
    }

    let (output, returned) = {
        let [r0, r1, r2, r3] = &mut regions;
        let mut ta: TaParams = [
            as_param(types.get(0), values[0], r0),
            as_param(types.get(1), values[1], r1),
            as_param(types.get(2), values[2], r2),
            as_param(types.get(3), values[3], r3),
        ];
        let output = service.invoke(command_id, &mut ta)?;

        let mut returned = [None; NUM_PARAMS];
        for (slot, param) in ta.iter().enumerate() {
            if let TaParam::ValueOutput(v) | TaParam::ValueInout(v) = param {
                returned[slot] = Some(*v);
            }
        }
        (output, returned)
    };

    let mut reply: [WireParam; NUM_PARAMS] = Default::default();
    for (slot, out) in reply.iter_mut().enumerate() {
        *out = match types.get(slot) {
            ParamType::MemrefOutput | ParamType::MemrefInout => {
                let mut data = std::mem::take(&mut regions[slot]);
                data.truncate(output.written[slot].unwrap_or(0));
                WireParam::Memref {
                    size: data.len(),
                    data,
                }
            }
            ParamType::ValueOutput | ParamType::ValueInout => {
                WireParam::Value(returned[slot].unwrap_or_default())
            }
            _ => WireParam::None,
        };
    }
    Ok((output, reply))
}

/// Cipher service daemon listening on a Unix domain socket
pub struct TeeServiceServer {
    /// Unix domain socket path
    socket_path: String,

    /// Key material every session is provisioned with
    config: ServiceConfig,

    /// Connections accepted since start
    sessions_served: Arc<AtomicU64>,
}

impl TeeServiceServer {
    pub fn new(socket_path: String, config: ServiceConfig) -> Self {
        Self {
            socket_path,
            config,
            sessions_served: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    pub fn sessions_served(&self) -> u64 {
        self.sessions_served.load(Ordering::Relaxed)
    }

    /// Remove a stale socket file and bind
    pub fn bind(&self) -> std::io::Result<UnixListener> {
        let path = Path::new(&self.socket_path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        UnixListener::bind(path)
    }

    /// Print the banner, bind and serve until the task is dropped
    pub async fn run(&self) -> Result<(), BoxError> {
        println!(
            "{}",
            "═══════════════════════════════════════".cyan().bold()
        );
        println!(
            "{}",
            "        TEE CIPHER SERVICE             ".cyan().bold()
        );
        println!(
            "{}",
            "═══════════════════════════════════════".cyan().bold()
        );
        println!("{} Socket: {}", "→".cyan(), self.socket_path.bright_white());
        println!(
            "{} Key material: {} bytes",
            "→".cyan(),
            self.config.key_material.key().len()
        );
        println!();

        let listener = self.bind()?;
        println!("{} Cipher service listening", "✓".green().bold());
        println!("{} Ready to accept sessions", "→".cyan());
        println!();

        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener
    pub async fn serve(&self, listener: UnixListener) -> Result<(), BoxError> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let config = self.config.clone();
                    let id = self.sessions_served.fetch_add(1, Ordering::Relaxed) + 1;

                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, config, id).await {
                            eprintln!("{} Connection error: {}", "✗".red(), e);
                        }
                    });
                }
                Err(e) => {
                    eprintln!("{} Accept error: {}", "✗".red(), e);
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: UnixStream,
        config: ServiceConfig,
        id: u64,
    ) -> Result<(), BoxError> {
        debug!(connection = id, "connection accepted");
        let mut session = ServiceSession::new(config);

        loop {
            let mut len_buf = [0u8; 4];
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    return Err(e.into());
                }
            }

            let msg_len = u32::from_be_bytes(len_buf) as usize;
            if msg_len > MAX_MESSAGE_SIZE {
                return Err(format!("Message too large: {} bytes", msg_len).into());
            }

            let mut msg_buf = vec![0u8; msg_len];
            stream.read_exact(&mut msg_buf).await?;

            let response = match serde_json::from_slice::<WireRequest>(&msg_buf) {
                Ok(request) => {
                    let request_type = request.request_type();
                    let response = session.handle(request);
                    if let Some(error) = response.error() {
                        warn!(connection = id, request = request_type, %error, "request failed");
                    }
                    response
                }
                Err(e) => WireResponse::Failed {
                    error: TeeError::protocol(
                        ResultCode::BAD_FORMAT,
                        ErrorOrigin::Comms,
                        format!("failed to parse request: {}", e),
                    ),
                },
            };

            Self::send_response(&mut stream, &response).await?;
        }

        debug!(connection = id, "connection closed");
        Ok(())
    }

    async fn send_response(stream: &mut UnixStream, response: &WireResponse) -> Result<(), BoxError> {
        let payload = serde_json::to_vec(response)?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err("Response too large".into());
        }
        stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        Ok(())
    }
}
