// Cipher Service Protocol - caller-side command model and wire messages
// Typed commands are lowered to four-slot operations; operations are
// serialised as length-prefixed JSON frames when the service runs out of process

use serde::{Deserialize, Serialize};

use crate::shared_memory::{MemFlags, MemRef};
use crate::tee::{
    CommandOutput, ErrorOrigin, ParamType, ParamTypes, ResultCode, TeeError, Value, NUM_PARAMS,
};
use crate::types::CipherConfig;

pub use crate::tee::CommandId;

/// Maximum frame size (64 MiB)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest buffer one frame can carry; JSON spends up to four bytes per
/// data byte ("255,") and the rest of the frame needs some headroom
pub const MAX_SOCKET_BUFFER_SIZE: usize = MAX_MESSAGE_SIZE / 4 - 64 * 1024;

/// Caller-side parameter slot
#[derive(Debug, Clone, Copy)]
pub enum Param<'a> {
    None,
    ValueInput(Value),
    ValueOutput(Value),
    ValueInout(Value),
    MemrefInput(MemRef<'a>),
    MemrefOutput(MemRef<'a>),
    MemrefInout(MemRef<'a>),
}

impl<'a> Param<'a> {
    pub fn param_type(&self) -> ParamType {
        match self {
            Param::None => ParamType::None,
            Param::ValueInput(_) => ParamType::ValueInput,
            Param::ValueOutput(_) => ParamType::ValueOutput,
            Param::ValueInout(_) => ParamType::ValueInout,
            Param::MemrefInput(_) => ParamType::MemrefInput,
            Param::MemrefOutput(_) => ParamType::MemrefOutput,
            Param::MemrefInout(_) => ParamType::MemrefInout,
        }
    }

    pub fn memref(&self) -> Option<MemRef<'a>> {
        match self {
            Param::MemrefInput(m) | Param::MemrefOutput(m) | Param::MemrefInout(m) => Some(*m),
            _ => None,
        }
    }

    /// Buffer permission the slot direction requires
    fn required_flags(&self) -> Option<MemFlags> {
        match self {
            Param::MemrefInput(_) => Some(MemFlags::INPUT),
            Param::MemrefOutput(_) => Some(MemFlags::OUTPUT),
            Param::MemrefInout(_) => Some(MemFlags::INOUT),
            _ => None,
        }
    }
}

/// Four slots sent with one command
#[derive(Debug, Clone, Copy)]
pub struct Operation<'a> {
    pub params: [Param<'a>; NUM_PARAMS],
}

impl<'a> Operation<'a> {
    pub fn new(params: [Param<'a>; NUM_PARAMS]) -> Self {
        Self { params }
    }

    pub fn param_types(&self) -> ParamTypes {
        ParamTypes([
            self.params[0].param_type(),
            self.params[1].param_type(),
            self.params[2].param_type(),
            self.params[3].param_type(),
        ])
    }

    /// Caller-side checks performed before anything crosses
    pub fn validate(&self) -> Result<(), TeeError> {
        for (slot, param) in self.params.iter().enumerate() {
            let (Some(memref), Some(required)) = (param.memref(), param.required_flags()) else {
                continue;
            };
            if !memref.buffer().flags().contains(required) {
                return Err(TeeError::protocol(
                    ResultCode::BAD_PARAMETERS,
                    ErrorOrigin::Api,
                    format!(
                        "slot {} needs a {} buffer, buffer {} is {}",
                        slot,
                        required,
                        memref.buffer().id(),
                        memref.buffer().flags()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Shrink output windows to the byte counts the service reported
    pub fn apply_output(&mut self, output: &CommandOutput) {
        for (param, written) in self.params.iter_mut().zip(output.written.iter()) {
            let Some(written) = *written else { continue };
            match param {
                Param::MemrefOutput(m) | Param::MemrefInout(m) => *m = m.truncated(written),
                _ => {}
            }
        }
    }
}

/// How the Process command sees its data
#[derive(Debug, Clone, Copy)]
pub enum BufferLayout<'a> {
    /// Disjoint source and destination
    Separate {
        input: MemRef<'a>,
        output: MemRef<'a>,
    },
    /// Source and destination are one region
    InPlace(MemRef<'a>),
}

impl<'a> BufferLayout<'a> {
    /// Disjoint layout; one buffer on both sides must use `in_place` instead
    pub fn separate(input: MemRef<'a>, output: MemRef<'a>) -> Result<Self, TeeError> {
        if input.buffer().id() == output.buffer().id() {
            return Err(TeeError::protocol(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::Api,
                format!(
                    "buffer {} used as both input and output; use the in-place layout",
                    input.buffer().id()
                ),
            ));
        }
        Ok(BufferLayout::Separate { input, output })
    }

    pub fn in_place(region: MemRef<'a>) -> Self {
        BufferLayout::InPlace(region)
    }

    pub fn is_in_place(&self) -> bool {
        matches!(self, BufferLayout::InPlace(_))
    }

    /// Bytes the service reads per cipher pass
    pub fn input_len(&self) -> usize {
        match self {
            BufferLayout::Separate { input, .. } => input.size(),
            BufferLayout::InPlace(region) => region.size(),
        }
    }
}

/// Typed command, one variant per command id
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    PrepareKey(CipherConfig),
    Process {
        layout: BufferLayout<'a>,
        inner_loops: u32,
    },
}

impl<'a> Command<'a> {
    pub fn id(&self) -> u32 {
        match self {
            Command::PrepareKey(_) => CommandId::PREPARE_KEY,
            Command::Process { .. } => CommandId::PROCESS,
        }
    }

    /// Lower to the four-slot form, validating buffer permissions
    pub fn to_operation(&self) -> Result<Operation<'a>, TeeError> {
        let operation = match *self {
            Command::PrepareKey(config) => Operation::new([
                Param::ValueInput(Value::new(
                    config.direction.wire_value(),
                    config.key_size.bits(),
                )),
                Param::ValueInput(Value::new(config.mode.wire_value(), 0)),
                Param::None,
                Param::None,
            ]),
            Command::Process {
                layout: BufferLayout::Separate { input, output },
                inner_loops,
            } => Operation::new([
                Param::MemrefInput(input),
                Param::MemrefOutput(output),
                Param::ValueInput(Value::new(inner_loops, 0)),
                Param::None,
            ]),
            Command::Process {
                layout: BufferLayout::InPlace(region),
                inner_loops,
            } => Operation::new([
                Param::MemrefInout(region),
                Param::None,
                Param::ValueInput(Value::new(inner_loops, 0)),
                Param::None,
            ]),
        };
        operation.validate()?;
        Ok(operation)
    }
}

/// Parameter slot as carried in a frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireParam {
    #[default]
    None,
    Value(Value),
    /// `data` carries the window contents when the service reads it;
    /// output-only windows travel as their size alone
    Memref { size: usize, data: Vec<u8> },
}

/// Request frame from caller to service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    /// Returns: SessionOpened
    OpenSession,

    /// Returns: Completed or Failed
    InvokeCommand {
        command_id: u32,
        param_types: u32,
        params: [WireParam; NUM_PARAMS],
    },

    /// Returns: SessionClosed
    CloseSession,
}

impl WireRequest {
    pub fn request_type(&self) -> &'static str {
        match self {
            WireRequest::OpenSession => "OpenSession",
            WireRequest::InvokeCommand { .. } => "InvokeCommand",
            WireRequest::CloseSession => "CloseSession",
        }
    }
}

/// Response frame from service to caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    SessionOpened,

    /// Output windows come back as `WireParam::Memref` in their slot
    Completed {
        output: CommandOutput,
        params: [WireParam; NUM_PARAMS],
    },

    Failed { error: TeeError },

    SessionClosed,
}

impl WireResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, WireResponse::Failed { .. })
    }

    pub fn error(&self) -> Option<&TeeError> {
        match self {
            WireResponse::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Serialise an operation for the socket transport
pub fn encode_operation(operation: &Operation<'_>) -> [WireParam; NUM_PARAMS] {
    let mut wire: [WireParam; NUM_PARAMS] = Default::default();
    for (slot, param) in wire.iter_mut().zip(operation.params.iter()) {
        *slot = match param {
            Param::None => WireParam::None,
            Param::ValueInput(v) | Param::ValueOutput(v) | Param::ValueInout(v) => {
                WireParam::Value(*v)
            }
            Param::MemrefInput(m) | Param::MemrefInout(m) => WireParam::Memref {
                size: m.size(),
                data: m.buffer().read()[m.range()].to_vec(),
            },
            Param::MemrefOutput(m) => WireParam::Memref {
                size: m.size(),
                data: Vec::new(),
            },
        };
    }
    wire
}

/// Frame size check shared by both ends
pub fn check_frame_len(len: usize) -> Result<(), TeeError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(TeeError::session(
            ResultCode::COMMUNICATION,
            ErrorOrigin::Comms,
            format!("frame of {} bytes exceeds {}", len, MAX_MESSAGE_SIZE),
        ));
    }
    Ok(())
}
