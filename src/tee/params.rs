// Parameter model shared by both sides of the trust boundary
//
// Every command carries four parameter slots. Each slot has a type; the
// packed four-type signature is what the service compares against the
// signature a command expects before it touches any parameter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of parameter slots per command
pub const NUM_PARAMS: usize = 4;

/// Parameter slot type, service view (GP TEE_PARAM_TYPE_* values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    None,
    ValueInput,
    ValueOutput,
    ValueInout,
    MemrefInput,
    MemrefOutput,
    MemrefInout,
}

impl ParamType {
    pub fn raw(&self) -> u32 {
        match self {
            ParamType::None => 0,
            ParamType::ValueInput => 1,
            ParamType::ValueOutput => 2,
            ParamType::ValueInout => 3,
            ParamType::MemrefInput => 5,
            ParamType::MemrefOutput => 6,
            ParamType::MemrefInout => 7,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ParamType::None),
            1 => Some(ParamType::ValueInput),
            2 => Some(ParamType::ValueOutput),
            3 => Some(ParamType::ValueInout),
            5 => Some(ParamType::MemrefInput),
            6 => Some(ParamType::MemrefOutput),
            7 => Some(ParamType::MemrefInout),
            _ => None,
        }
    }

    pub fn is_memref(&self) -> bool {
        matches!(
            self,
            ParamType::MemrefInput | ParamType::MemrefOutput | ParamType::MemrefInout
        )
    }
}

/// Four slot types, packed as `t0 | t1 << 4 | t2 << 8 | t3 << 12`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamTypes(pub [ParamType; NUM_PARAMS]);

impl ParamTypes {
    pub const fn new(t0: ParamType, t1: ParamType, t2: ParamType, t3: ParamType) -> Self {
        ParamTypes([t0, t1, t2, t3])
    }

    pub fn pack(&self) -> u32 {
        self.0
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, t)| acc | (t.raw() << (4 * i)))
    }

    /// Returns None when a nibble is not a known type or high bits are set
    pub fn unpack(raw: u32) -> Option<Self> {
        if raw >> (4 * NUM_PARAMS) != 0 {
            return None;
        }
        let mut types = [ParamType::None; NUM_PARAMS];
        for (i, slot) in types.iter_mut().enumerate() {
            *slot = ParamType::from_raw((raw >> (4 * i)) & 0xF)?;
        }
        Some(ParamTypes(types))
    }

    pub fn get(&self, index: usize) -> ParamType {
        self.0[index]
    }
}

impl fmt::Display for ParamTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.pack())
    }
}

/// Value parameter: two 32-bit words
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub a: u32,
    pub b: u32,
}

impl Value {
    pub fn new(a: u32, b: u32) -> Self {
        Self { a, b }
    }
}

/// Service-side view of one slot while a command is in flight.
///
/// Memory references borrow the caller's region for the duration of the
/// command only; nothing here outlives the invocation.
#[derive(Debug)]
pub enum TaParam<'a> {
    None,
    ValueInput(Value),
    ValueOutput(Value),
    ValueInout(Value),
    MemrefInput(&'a [u8]),
    MemrefOutput(&'a mut [u8]),
    MemrefInout(&'a mut [u8]),
}

impl<'a> TaParam<'a> {
    pub fn param_type(&self) -> ParamType {
        match self {
            TaParam::None => ParamType::None,
            TaParam::ValueInput(_) => ParamType::ValueInput,
            TaParam::ValueOutput(_) => ParamType::ValueOutput,
            TaParam::ValueInout(_) => ParamType::ValueInout,
            TaParam::MemrefInput(_) => ParamType::MemrefInput,
            TaParam::MemrefOutput(_) => ParamType::MemrefOutput,
            TaParam::MemrefInout(_) => ParamType::MemrefInout,
        }
    }
}

/// The four slots handed to the service entry point
pub type TaParams<'a> = [TaParam<'a>; NUM_PARAMS];

/// Signature of a set of service-side slots
pub fn signature_of(params: &TaParams<'_>) -> ParamTypes {
    ParamTypes([
        params[0].param_type(),
        params[1].param_type(),
        params[2].param_type(),
        params[3].param_type(),
    ])
}

/// What a completed command reports back besides success
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Bytes written into each output/inout memory reference
    pub written: [Option<usize>; NUM_PARAMS],
}

impl CommandOutput {
    pub fn with_written(slot: usize, bytes: usize) -> Self {
        let mut output = Self::default();
        output.written[slot] = Some(bytes);
        output
    }
}
