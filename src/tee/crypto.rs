use aes::{Aes128, Aes192, Aes256};
use cipher::consts::U16;
use cipher::generic_array::GenericArray;
use cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser,
    InnerIvInit, KeyInit, StreamCipher,
};
use std::fmt;
use tracing::{debug, trace};
use xts_mode::Xts128;

use super::errors::{ErrorOrigin, ResultCode, TeeError};
use crate::types::{CipherConfig, CipherMode, Direction, KeySize};

pub const AES_BLOCK_SIZE: usize = 16;

/// Longest key material any configuration consumes (XTS with two 256-bit keys)
pub const MAX_KEY_MATERIAL: usize = 64;

/// Key bytes and IV provisioned into the cipher service.
///
/// PrepareKey takes the first `key_bytes * key_count` bytes for the
/// requested configuration; the IV seeds every Process repetition
/// (CBC/CTR initial block, XTS tweak).
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: Vec<u8>,
    iv: [u8; AES_BLOCK_SIZE],
}

impl KeyMaterial {
    pub fn new(key: Vec<u8>, iv: [u8; AES_BLOCK_SIZE]) -> Self {
        Self { key, iv }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; AES_BLOCK_SIZE] {
        &self.iv
    }

    /// Bytes needed for a configuration
    pub fn required_len(config: &CipherConfig) -> usize {
        config.key_size.bytes() * config.mode.key_count()
    }
}

impl Default for KeyMaterial {
    /// Ascending bytes 0x00, 0x01, ... for both key and IV
    fn default() -> Self {
        let key = (0..MAX_KEY_MATERIAL as u8).collect();
        let mut iv = [0u8; AES_BLOCK_SIZE];
        for (i, byte) in iv.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Self { key, iv }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_len", &self.key.len())
            .finish_non_exhaustive()
    }
}

/// Key object that only lives while a key is being prepared
pub struct TransientKey {
    key_size: KeySize,
    key_count: usize,
    data: Vec<u8>,
}

impl TransientKey {
    /// Allocate an empty key object sized for the configuration
    pub fn allocate(config: &CipherConfig) -> Result<Self, TeeError> {
        let capacity = KeyMaterial::required_len(config);
        trace!(capacity, "transient key allocated");
        Ok(Self {
            key_size: config.key_size,
            key_count: config.mode.key_count(),
            data: Vec::with_capacity(capacity),
        })
    }

    /// Copy the secret value in; fails when the material is too short
    pub fn populate(&mut self, material: &KeyMaterial) -> Result<(), TeeError> {
        let needed = self.key_size.bytes() * self.key_count;
        if material.key().len() < needed {
            return Err(TeeError::cipher(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::TrustedApp,
                format!(
                    "key material holds {} bytes, {}-bit key needs {}",
                    material.key().len(),
                    self.key_size.bits(),
                    needed
                ),
            ));
        }
        self.data.clear();
        self.data.extend_from_slice(&material.key()[..needed]);
        Ok(())
    }

    fn is_populated(&self) -> bool {
        self.data.len() == self.key_size.bytes() * self.key_count
    }

    fn part(&self, index: usize) -> &[u8] {
        let len = self.key_size.bytes();
        &self.data[index * len..(index + 1) * len]
    }

    /// Wipe and drop the object; the bound operation keeps its own schedule
    pub fn free(mut self) {
        self.data.iter_mut().for_each(|b| *b = 0);
        trace!("transient key freed");
    }
}

/// Operation allocated for one configuration but not yet keyed
#[derive(Debug)]
pub struct AllocatedOperation {
    config: CipherConfig,
}

impl AllocatedOperation {
    pub fn allocate(config: CipherConfig) -> Result<Self, TeeError> {
        debug!(%config, "operation allocated");
        Ok(Self { config })
    }

    /// Bind a populated key, producing a usable context
    pub fn set_key(
        self,
        key: &TransientKey,
        iv: [u8; AES_BLOCK_SIZE],
    ) -> Result<OperationContext, TeeError> {
        if !key.is_populated() || key.key_size != self.config.key_size {
            return Err(TeeError::cipher(
                ResultCode::BAD_STATE,
                ErrorOrigin::TrustedApp,
                "key object does not match the allocated operation",
            ));
        }

        let block_mode = match self.config.mode {
            CipherMode::Ecb => BlockMode::Ecb,
            CipherMode::Cbc => BlockMode::Cbc,
            CipherMode::Ctr => BlockMode::Ctr,
            CipherMode::Xts => {
                let xts = XtsKey::new(self.config.key_size, key.part(0), key.part(1))?;
                return Ok(OperationContext {
                    config: self.config,
                    engine: CipherEngine::Xts(xts),
                    iv,
                });
            }
        };
        let engine = CipherEngine::Block(AesKey::new(self.config.key_size, key.part(0))?, block_mode);

        Ok(OperationContext {
            config: self.config,
            engine,
            iv,
        })
    }
}

enum AesKey {
    Aes128(Aes128),
    Aes192(Aes192),
    Aes256(Aes256),
}

fn invalid_key_length() -> TeeError {
    TeeError::cipher(
        ResultCode::BAD_PARAMETERS,
        ErrorOrigin::TrustedApp,
        "invalid AES key length",
    )
}

impl AesKey {
    fn new(size: KeySize, key: &[u8]) -> Result<Self, TeeError> {
        let key = match size {
            KeySize::Aes128 => {
                AesKey::Aes128(Aes128::new_from_slice(key).map_err(|_| invalid_key_length())?)
            }
            KeySize::Aes192 => {
                AesKey::Aes192(Aes192::new_from_slice(key).map_err(|_| invalid_key_length())?)
            }
            KeySize::Aes256 => {
                AesKey::Aes256(Aes256::new_from_slice(key).map_err(|_| invalid_key_length())?)
            }
        };
        Ok(key)
    }
}

enum XtsKey {
    Aes128(Xts128<Aes128>),
    Aes192(Xts128<Aes192>),
    Aes256(Xts128<Aes256>),
}

impl XtsKey {
    fn new(size: KeySize, data_key: &[u8], tweak_key: &[u8]) -> Result<Self, TeeError> {
        let key = match size {
            KeySize::Aes128 => XtsKey::Aes128(Xts128::new(
                Aes128::new_from_slice(data_key).map_err(|_| invalid_key_length())?,
                Aes128::new_from_slice(tweak_key).map_err(|_| invalid_key_length())?,
            )),
            KeySize::Aes192 => XtsKey::Aes192(Xts128::new(
                Aes192::new_from_slice(data_key).map_err(|_| invalid_key_length())?,
                Aes192::new_from_slice(tweak_key).map_err(|_| invalid_key_length())?,
            )),
            KeySize::Aes256 => XtsKey::Aes256(Xts128::new(
                Aes256::new_from_slice(data_key).map_err(|_| invalid_key_length())?,
                Aes256::new_from_slice(tweak_key).map_err(|_| invalid_key_length())?,
            )),
        };
        Ok(key)
    }

    fn apply(&self, direction: Direction, tweak: [u8; AES_BLOCK_SIZE], data: &mut [u8]) {
        match (self, direction) {
            (XtsKey::Aes128(xts), Direction::Encrypt) => xts.encrypt_sector(data, tweak),
            (XtsKey::Aes128(xts), Direction::Decrypt) => xts.decrypt_sector(data, tweak),
            (XtsKey::Aes192(xts), Direction::Encrypt) => xts.encrypt_sector(data, tweak),
            (XtsKey::Aes192(xts), Direction::Decrypt) => xts.decrypt_sector(data, tweak),
            (XtsKey::Aes256(xts), Direction::Encrypt) => xts.encrypt_sector(data, tweak),
            (XtsKey::Aes256(xts), Direction::Decrypt) => xts.decrypt_sector(data, tweak),
        }
    }
}

/// Single-key modes; XTS has its own engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockMode {
    Ecb,
    Cbc,
    Ctr,
}

enum CipherEngine {
    /// ECB, CBC and CTR share one key schedule
    Block(AesKey, BlockMode),
    Xts(XtsKey),
}

/// Keyed cipher operation bound to one configuration
pub struct OperationContext {
    config: CipherConfig,
    engine: CipherEngine,
    iv: [u8; AES_BLOCK_SIZE],
}

impl fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OperationContext {
    pub fn config(&self) -> CipherConfig {
        self.config
    }

    /// Reject lengths the configured mode cannot process without padding
    pub fn check_length(&self, len: usize) -> Result<(), TeeError> {
        let mode = self.config.mode;
        if mode.requires_block_alignment() && len % AES_BLOCK_SIZE != 0 {
            return Err(TeeError::cipher(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::TrustedApp,
                format!(
                    "{} needs a multiple of {} bytes, got {}",
                    mode, AES_BLOCK_SIZE, len
                ),
            ));
        }
        if mode == CipherMode::Xts && len < AES_BLOCK_SIZE {
            return Err(TeeError::cipher(
                ResultCode::BAD_PARAMETERS,
                ErrorOrigin::TrustedApp,
                format!("XTS needs at least one block, got {} bytes", len),
            ));
        }
        Ok(())
    }

    /// One init + final pass from `input` into `output`; returns bytes written
    pub fn run(&self, input: &[u8], output: &mut [u8]) -> Result<usize, TeeError> {
        self.check_length(input.len())?;
        if output.len() < input.len() {
            return Err(TeeError::cipher(
                ResultCode::SHORT_BUFFER,
                ErrorOrigin::TrustedApp,
                format!(
                    "output holds {} bytes, input is {}",
                    output.len(),
                    input.len()
                ),
            ));
        }
        let out = &mut output[..input.len()];
        out.copy_from_slice(input);
        self.transform(out);
        Ok(input.len())
    }

    /// One init + final pass over a single aliased region
    pub fn run_in_place(&self, data: &mut [u8]) -> Result<usize, TeeError> {
        self.check_length(data.len())?;
        self.transform(data);
        Ok(data.len())
    }

    fn transform(&self, data: &mut [u8]) {
        let direction = self.config.direction;
        match &self.engine {
            CipherEngine::Xts(key) => key.apply(direction, self.iv, data),
            CipherEngine::Block(AesKey::Aes128(c), mode) => apply_block_mode(c, *mode, direction, &self.iv, data),
            CipherEngine::Block(AesKey::Aes192(c), mode) => apply_block_mode(c, *mode, direction, &self.iv, data),
            CipherEngine::Block(AesKey::Aes256(c), mode) => apply_block_mode(c, *mode, direction, &self.iv, data),
        }
    }
}

fn apply_block_mode<C>(
    cipher: &C,
    mode: BlockMode,
    direction: Direction,
    iv: &[u8; AES_BLOCK_SIZE],
    data: &mut [u8],
) where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16> + Clone,
{
    match mode {
        BlockMode::Ecb => ecb(cipher, direction, data),
        BlockMode::Cbc => cbc_chain(cipher, direction, iv, data),
        // keystream XOR is its own inverse
        BlockMode::Ctr => {
            let core = ctr::CtrCore::inner_iv_init(cipher.clone(), GenericArray::from_slice(iv));
            let mut stream = ctr::Ctr128BE::<C>::from_core(core);
            stream.apply_keystream(data);
        }
    }
}

fn ecb<C>(cipher: &C, direction: Direction, data: &mut [u8])
where
    C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>,
{
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        let block = GenericArray::from_mut_slice(block);
        match direction {
            Direction::Encrypt => cipher.encrypt_block(block),
            Direction::Decrypt => cipher.decrypt_block(block),
        }
    }
}

fn cbc_chain<C>(cipher: &C, direction: Direction, iv: &[u8; AES_BLOCK_SIZE], data: &mut [u8])
where
    C: BlockCipher + BlockEncryptMut + BlockDecryptMut + BlockSizeUser<BlockSize = U16> + Clone,
{
    match direction {
        Direction::Encrypt => {
            let mut chain =
                cbc::Encryptor::<C>::inner_iv_init(cipher.clone(), GenericArray::from_slice(iv));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                chain.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
        Direction::Decrypt => {
            let mut chain =
                cbc::Decryptor::<C>::inner_iv_init(cipher.clone(), GenericArray::from_slice(iv));
            for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                chain.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed(config: CipherConfig, material: &KeyMaterial) -> OperationContext {
        let mut key = TransientKey::allocate(&config).unwrap();
        key.populate(material).unwrap();
        let ctx = AllocatedOperation::allocate(config)
            .unwrap()
            .set_key(&key, *material.iv())
            .unwrap();
        key.free();
        ctx
    }

    #[test]
    fn test_fips197_ecb_known_answer() {
        let material = KeyMaterial::default();
        let config = CipherConfig::new(CipherMode::Ecb, Direction::Encrypt, KeySize::Aes128);
        let ctx = keyed(config, &material);

        let plaintext = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        let mut out = [0u8; 16];
        assert_eq!(ctx.run(&plaintext, &mut out).unwrap(), 16);
        assert_eq!(hex::encode(out), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    fn sp800_38a_material() -> KeyMaterial {
        KeyMaterial::new(
            hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap(),
            [0u8; 16],
        )
    }

    const SP800_38A_PLAINTEXT: &str =
        "6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51";

    fn with_iv(material: KeyMaterial, iv: &str) -> KeyMaterial {
        let iv: [u8; 16] = hex::decode(iv).unwrap().try_into().unwrap();
        KeyMaterial::new(material.key().to_vec(), iv)
    }

    #[test]
    fn test_sp800_38a_cbc_known_answer() {
        let material = with_iv(sp800_38a_material(), "000102030405060708090a0b0c0d0e0f");
        let config = CipherConfig::new(CipherMode::Cbc, Direction::Encrypt, KeySize::Aes128);
        let ctx = keyed(config, &material);

        let plaintext = hex::decode(SP800_38A_PLAINTEXT).unwrap();
        let mut out = [0u8; 32];
        ctx.run(&plaintext, &mut out).unwrap();
        assert_eq!(
            hex::encode(out),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );

        let dec = keyed(config.inverse(), &material);
        dec.run_in_place(&mut out).unwrap();
        assert_eq!(out[..], plaintext[..]);
    }

    #[test]
    fn test_sp800_38a_ctr_known_answer() {
        let material = with_iv(sp800_38a_material(), "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff");
        let config = CipherConfig::new(CipherMode::Ctr, Direction::Encrypt, KeySize::Aes128);
        let ctx = keyed(config, &material);

        let mut data = hex::decode(SP800_38A_PLAINTEXT).unwrap();
        ctx.run_in_place(&mut data).unwrap();
        assert_eq!(
            hex::encode(&data),
            "874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff"
        );
    }

    #[test]
    fn test_ieee1619_xts_known_answer() {
        // vector 1: both keys zero, data unit 0
        let material = KeyMaterial::new(vec![0u8; 32], [0u8; 16]);
        let config = CipherConfig::new(CipherMode::Xts, Direction::Encrypt, KeySize::Aes128);
        let ctx = keyed(config, &material);

        let mut data = [0u8; 32];
        ctx.run_in_place(&mut data).unwrap();
        assert_eq!(
            hex::encode(data),
            "917cf69ebd68b2ec9b9fe9a3eadda692cd43d2f59598ed858c02c2652fbf922e"
        );

        let dec = keyed(config.inverse(), &material);
        dec.run_in_place(&mut data).unwrap();
        assert_eq!(data, [0u8; 32]);
    }

    #[test]
    fn test_round_trip_every_mode_and_size() {
        let material = KeyMaterial::default();
        let plaintext: Vec<u8> = (0..64u8).map(|b| b.wrapping_mul(7)).collect();

        for mode in CipherMode::ALL {
            for size in [KeySize::Aes128, KeySize::Aes192, KeySize::Aes256] {
                let enc = keyed(CipherConfig::new(mode, Direction::Encrypt, size), &material);
                let dec = keyed(CipherConfig::new(mode, Direction::Decrypt, size), &material);

                let mut ciphertext = vec![0u8; plaintext.len()];
                enc.run(&plaintext, &mut ciphertext).unwrap();
                assert_ne!(ciphertext, plaintext, "{} {} left data unchanged", mode, size);

                let mut recovered = ciphertext.clone();
                dec.run_in_place(&mut recovered).unwrap();
                assert_eq!(recovered, plaintext, "{} {} round trip", mode, size);
            }
        }
    }

    #[test]
    fn test_in_place_matches_separate() {
        let material = KeyMaterial::default();
        let ctx = keyed(
            CipherConfig::new(CipherMode::Cbc, Direction::Encrypt, KeySize::Aes256),
            &material,
        );
        let plaintext = [0x5Au8; 48];

        let mut separate = [0u8; 48];
        ctx.run(&plaintext, &mut separate).unwrap();

        let mut aliased = plaintext;
        ctx.run_in_place(&mut aliased).unwrap();
        assert_eq!(separate, aliased);
    }

    #[test]
    fn test_block_modes_reject_partial_blocks() {
        let material = KeyMaterial::default();
        for mode in [CipherMode::Ecb, CipherMode::Cbc, CipherMode::Xts] {
            let ctx = keyed(CipherConfig::new(mode, Direction::Encrypt, KeySize::Aes128), &material);
            let err = ctx.run_in_place(&mut [0u8; 17]).unwrap_err();
            assert_eq!(err.code(), ResultCode::BAD_PARAMETERS);
        }

        let ctr = keyed(
            CipherConfig::new(CipherMode::Ctr, Direction::Encrypt, KeySize::Aes128),
            &material,
        );
        assert_eq!(ctr.run_in_place(&mut [0u8; 17]).unwrap(), 17);
    }

    #[test]
    fn test_xts_rejects_empty_region() {
        let material = KeyMaterial::default();
        let ctx = keyed(
            CipherConfig::new(CipherMode::Xts, Direction::Encrypt, KeySize::Aes128),
            &material,
        );
        assert!(ctx.run_in_place(&mut []).is_err());
    }

    #[test]
    fn test_short_output_buffer() {
        let material = KeyMaterial::default();
        let ctx = keyed(CipherConfig::default(), &material);
        let err = ctx.run(&[0u8; 32], &mut [0u8; 16]).unwrap_err();
        assert_eq!(err.code(), ResultCode::SHORT_BUFFER);
    }

    #[test]
    fn test_populate_rejects_short_material() {
        let material = KeyMaterial::new(vec![0u8; 16], [0u8; 16]);
        let config = CipherConfig::new(CipherMode::Xts, Direction::Encrypt, KeySize::Aes128);
        let mut key = TransientKey::allocate(&config).unwrap();
        let err = key.populate(&material).unwrap_err();
        assert!(matches!(err, TeeError::Cipher { .. }));
    }

    #[test]
    fn test_key_material_debug_hides_bytes() {
        let text = format!("{:?}", KeyMaterial::default());
        assert!(text.contains("key_len: 64"));
        assert!(!text.contains("0x"));
    }
}
