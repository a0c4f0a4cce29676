use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// AES chaining mode hosted by the cipher service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CipherMode {
    Ecb, // no chaining, block aligned
    Cbc, // block aligned
    Ctr, // stream, any length
    Xts, // two keys, block aligned
}

impl CipherMode {
    pub const ALL: [CipherMode; 4] = [
        CipherMode::Ecb,
        CipherMode::Cbc,
        CipherMode::Ctr,
        CipherMode::Xts,
    ];

    /// Value carried in the PrepareKey command
    pub fn wire_value(&self) -> u32 {
        match self {
            CipherMode::Ecb => 0,
            CipherMode::Cbc => 1,
            CipherMode::Ctr => 2,
            CipherMode::Xts => 3,
        }
    }

    pub fn from_wire(value: u32) -> Option<Self> {
        match value {
            0 => Some(CipherMode::Ecb),
            1 => Some(CipherMode::Cbc),
            2 => Some(CipherMode::Ctr),
            3 => Some(CipherMode::Xts),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CipherMode::Ecb => "ECB",
            CipherMode::Cbc => "CBC",
            CipherMode::Ctr => "CTR",
            CipherMode::Xts => "XTS",
        }
    }

    /// Whether the mode only accepts whole 16-byte blocks
    pub fn requires_block_alignment(&self) -> bool {
        !matches!(self, CipherMode::Ctr)
    }

    /// Number of independent AES keys the mode consumes
    pub fn key_count(&self) -> usize {
        match self {
            CipherMode::Xts => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CipherMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CipherMode::ALL
            .iter()
            .copied()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("invalid mode '{}' (expected ECB, CBC, CTR or XTS)", s))
    }
}

/// Cipher direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Encrypt,
    Decrypt,
}

impl Direction {
    pub fn wire_value(&self) -> u32 {
        match self {
            Direction::Encrypt => 0,
            Direction::Decrypt => 1,
        }
    }

    /// Any non-zero value selects decryption
    pub fn from_wire(value: u32) -> Self {
        if value == 0 {
            Direction::Encrypt
        } else {
            Direction::Decrypt
        }
    }

    /// "en" or "de", as in "encrypt" / "decrypt"
    pub fn prefix(&self) -> &'static str {
        match self {
            Direction::Encrypt => "en",
            Direction::Decrypt => "de",
        }
    }

    pub fn inverse(&self) -> Self {
        match self {
            Direction::Encrypt => Direction::Decrypt,
            Direction::Decrypt => Direction::Encrypt,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}crypt", self.prefix())
    }
}

/// AES key size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum KeySize {
    #[default]
    Aes128,
    Aes192,
    Aes256,
}

impl KeySize {
    pub fn bits(&self) -> u32 {
        match self {
            KeySize::Aes128 => 128,
            KeySize::Aes192 => 192,
            KeySize::Aes256 => 256,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            128 => Some(KeySize::Aes128),
            192 => Some(KeySize::Aes192),
            256 => Some(KeySize::Aes256),
            _ => None,
        }
    }
}

impl TryFrom<u32> for KeySize {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        KeySize::from_bits(bits).ok_or_else(|| format!("invalid key size {} (expected 128, 192 or 256)", bits))
    }
}

impl From<KeySize> for u32 {
    fn from(size: KeySize) -> u32 {
        size.bits()
    }
}

impl FromStr for KeySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits: u32 = s
            .trim()
            .parse()
            .map_err(|_| format!("invalid key size '{}'", s))?;
        KeySize::try_from(bits)
    }
}

impl fmt::Display for KeySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// One (mode, direction, key size) tuple committed by PrepareKey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CipherConfig {
    pub mode: CipherMode,
    pub direction: Direction,
    pub key_size: KeySize,
}

impl CipherConfig {
    pub fn new(mode: CipherMode, direction: Direction, key_size: KeySize) -> Self {
        Self {
            mode,
            direction,
            key_size,
        }
    }

    /// Same mode and key size, opposite direction
    pub fn inverse(&self) -> Self {
        Self {
            direction: self.direction.inverse(),
            ..*self
        }
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self::new(CipherMode::Ecb, Direction::Encrypt, KeySize::Aes128)
    }
}

impl fmt::Display for CipherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, keysize={} bits",
            self.mode, self.direction, self.key_size
        )
    }
}

/// How the input buffer is filled before each timed invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Buffer stays zero-filled for the whole run
    #[default]
    Zero,
    /// Buffer is refilled from the entropy source before every iteration (untimed)
    Random,
}

impl fmt::Display for InputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputMode::Zero => write!(f, "zero"),
            InputMode::Random => write!(f, "random"),
        }
    }
}

impl FromStr for InputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zero" => Ok(InputMode::Zero),
            "random" => Ok(InputMode::Random),
            _ => Err(format!("invalid input mode '{}' (expected zero or random)", s)),
        }
    }
}
