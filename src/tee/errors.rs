use serde::{Deserialize, Serialize};
use std::fmt;

/// GlobalPlatform-style numeric result code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultCode(pub u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0x0000_0000);
    pub const GENERIC: ResultCode = ResultCode(0xFFFF_0000);
    pub const ACCESS_DENIED: ResultCode = ResultCode(0xFFFF_0001);
    pub const BAD_FORMAT: ResultCode = ResultCode(0xFFFF_0005);
    pub const BAD_PARAMETERS: ResultCode = ResultCode(0xFFFF_0006);
    pub const BAD_STATE: ResultCode = ResultCode(0xFFFF_0007);
    pub const ITEM_NOT_FOUND: ResultCode = ResultCode(0xFFFF_0008);
    pub const NOT_SUPPORTED: ResultCode = ResultCode(0xFFFF_000A);
    pub const OUT_OF_MEMORY: ResultCode = ResultCode(0xFFFF_000C);
    pub const BUSY: ResultCode = ResultCode(0xFFFF_000D);
    pub const COMMUNICATION: ResultCode = ResultCode(0xFFFF_000E);
    pub const SHORT_BUFFER: ResultCode = ResultCode(0xFFFF_0010);

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn name(&self) -> &'static str {
        match *self {
            ResultCode::SUCCESS => "SUCCESS",
            ResultCode::GENERIC => "GENERIC",
            ResultCode::ACCESS_DENIED => "ACCESS_DENIED",
            ResultCode::BAD_FORMAT => "BAD_FORMAT",
            ResultCode::BAD_PARAMETERS => "BAD_PARAMETERS",
            ResultCode::BAD_STATE => "BAD_STATE",
            ResultCode::ITEM_NOT_FOUND => "ITEM_NOT_FOUND",
            ResultCode::NOT_SUPPORTED => "NOT_SUPPORTED",
            ResultCode::OUT_OF_MEMORY => "OUT_OF_MEMORY",
            ResultCode::BUSY => "BUSY",
            ResultCode::COMMUNICATION => "COMMUNICATION",
            ResultCode::SHORT_BUFFER => "SHORT_BUFFER",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Where an error was raised, relative to the trust boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorOrigin {
    /// Caller-side API (argument checks before anything crossed)
    Api,
    /// Transport between caller and service
    Comms,
    /// Isolated environment itself (session management, secure memory)
    Tee,
    /// The cipher service running inside the isolated environment
    TrustedApp,
}

impl ErrorOrigin {
    pub fn is_service_side(&self) -> bool {
        matches!(self, ErrorOrigin::Tee | ErrorOrigin::TrustedApp)
    }

    /// GP origin code (TEEC_ORIGIN_*)
    pub fn code(&self) -> u32 {
        match self {
            ErrorOrigin::Api => 1,
            ErrorOrigin::Comms => 2,
            ErrorOrigin::Tee => 3,
            ErrorOrigin::TrustedApp => 4,
        }
    }
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorOrigin::Api => write!(f, "api"),
            ErrorOrigin::Comms => write!(f, "comms"),
            ErrorOrigin::Tee => write!(f, "tee"),
            ErrorOrigin::TrustedApp => write!(f, "trusted-app"),
        }
    }
}

/// Structured error crossing (or failing to cross) the trust boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeeError {
    /// Shared or secure memory could not be provided
    Allocation {
        code: ResultCode,
        origin: ErrorOrigin,
        reason: String,
    },
    /// Parameter shape or command contract violated
    Protocol {
        code: ResultCode,
        origin: ErrorOrigin,
        reason: String,
    },
    /// The cipher step (or key setup) failed inside the service
    Cipher {
        code: ResultCode,
        origin: ErrorOrigin,
        reason: String,
    },
    /// Session could not be opened, or is no longer usable
    Session {
        code: ResultCode,
        origin: ErrorOrigin,
        reason: String,
    },
}

impl TeeError {
    pub fn allocation(code: ResultCode, origin: ErrorOrigin, reason: impl Into<String>) -> Self {
        TeeError::Allocation {
            code,
            origin,
            reason: reason.into(),
        }
    }

    pub fn protocol(code: ResultCode, origin: ErrorOrigin, reason: impl Into<String>) -> Self {
        TeeError::Protocol {
            code,
            origin,
            reason: reason.into(),
        }
    }

    pub fn cipher(code: ResultCode, origin: ErrorOrigin, reason: impl Into<String>) -> Self {
        TeeError::Cipher {
            code,
            origin,
            reason: reason.into(),
        }
    }

    pub fn session(code: ResultCode, origin: ErrorOrigin, reason: impl Into<String>) -> Self {
        TeeError::Session {
            code,
            origin,
            reason: reason.into(),
        }
    }

    /// Parameter shape mismatch detected by the service
    pub fn bad_parameters(reason: impl Into<String>) -> Self {
        Self::protocol(ResultCode::BAD_PARAMETERS, ErrorOrigin::TrustedApp, reason)
    }

    /// Process issued before any key was committed
    pub fn no_key_configured() -> Self {
        Self::protocol(
            ResultCode::BAD_STATE,
            ErrorOrigin::TrustedApp,
            "no key configured: PrepareKey must precede Process",
        )
    }

    pub fn code(&self) -> ResultCode {
        match self {
            TeeError::Allocation { code, .. } => *code,
            TeeError::Protocol { code, .. } => *code,
            TeeError::Cipher { code, .. } => *code,
            TeeError::Session { code, .. } => *code,
        }
    }

    pub fn origin(&self) -> ErrorOrigin {
        match self {
            TeeError::Allocation { origin, .. } => *origin,
            TeeError::Protocol { origin, .. } => *origin,
            TeeError::Cipher { origin, .. } => *origin,
            TeeError::Session { origin, .. } => *origin,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            TeeError::Allocation { reason, .. } => reason,
            TeeError::Protocol { reason, .. } => reason,
            TeeError::Cipher { reason, .. } => reason,
            TeeError::Session { reason, .. } => reason,
        }
    }

    /// Human-readable taxonomy class
    pub fn kind(&self) -> &'static str {
        match self {
            TeeError::Allocation { .. } => "AllocationError",
            TeeError::Protocol { .. } => "ProtocolError",
            TeeError::Cipher { .. } => "CipherError",
            TeeError::Session { .. } => "SessionError",
        }
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, TeeError::Protocol { .. })
    }
}

impl fmt::Display for TeeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} {}, origin {})",
            self.kind(),
            self.reason(),
            self.code(),
            self.code().name(),
            self.origin()
        )
    }
}

impl std::error::Error for TeeError {}
