// TEE Module - isolated side of the trust boundary
// Cipher service state machine, parameter model and error taxonomy

// Private modules
mod crypto;

// Public modules
pub mod core;
pub mod errors;
pub mod params;

pub use self::core::{
    CipherService, CommandId, ServiceConfig, ServiceState, PREPARE_KEY_SIGNATURE,
    PROCESS_IN_PLACE_SIGNATURE, PROCESS_SEPARATE_SIGNATURE,
};
pub use crypto::{KeyMaterial, OperationContext, AES_BLOCK_SIZE, MAX_KEY_MATERIAL};
pub use errors::{ErrorOrigin, ResultCode, TeeError};
pub use params::{CommandOutput, ParamType, ParamTypes, TaParam, TaParams, Value, NUM_PARAMS};

// Tests
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CipherConfig, CipherMode, Direction, KeySize};

    fn prepare(service: &mut CipherService, config: CipherConfig) {
        let mut params = [
            TaParam::ValueInput(Value::new(config.direction.wire_value(), config.key_size.bits())),
            TaParam::ValueInput(Value::new(config.mode.wire_value(), 0)),
            TaParam::None,
            TaParam::None,
        ];
        service.invoke(CommandId::PREPARE_KEY, &mut params).unwrap();
    }

    fn in_place(service: &mut CipherService, data: &mut [u8]) -> CommandOutput {
        let mut params = [
            TaParam::MemrefInout(data),
            TaParam::None,
            TaParam::ValueInput(Value::new(1, 0)),
            TaParam::None,
        ];
        service.invoke(CommandId::PROCESS, &mut params).unwrap()
    }

    #[test]
    fn test_encrypt_then_decrypt_round_trip() {
        let mut service = CipherService::new(ServiceConfig::default());
        let config = CipherConfig::new(CipherMode::Ctr, Direction::Encrypt, KeySize::Aes256);
        let plaintext: Vec<u8> = (0..100u8).collect();

        prepare(&mut service, config);
        let mut data = plaintext.clone();
        in_place(&mut service, &mut data);
        assert_ne!(data, plaintext);

        prepare(&mut service, config.inverse());
        let out = in_place(&mut service, &mut data);
        assert_eq!(out.written[0], Some(100));
        assert_eq!(data, plaintext);
    }

    #[test]
    fn test_known_answer_through_service() {
        let mut service = CipherService::new(ServiceConfig::default());
        prepare(&mut service, CipherConfig::default());

        let mut data = hex::decode("00112233445566778899aabbccddeeff").unwrap();
        in_place(&mut service, &mut data);
        assert_eq!(hex::encode(&data), "69c4e0d86a7b0430d8cdb78070b4c55a");
    }

    #[test]
    fn test_separate_and_in_place_agree() {
        let mut service = CipherService::new(ServiceConfig::default());
        prepare(
            &mut service,
            CipherConfig::new(CipherMode::Xts, Direction::Encrypt, KeySize::Aes128),
        );

        let plaintext = [0xA5u8; 64];
        let mut output = [0u8; 64];
        let mut params = [
            TaParam::MemrefInput(&plaintext),
            TaParam::MemrefOutput(&mut output),
            TaParam::ValueInput(Value::new(1, 0)),
            TaParam::None,
        ];
        service.invoke(CommandId::PROCESS, &mut params).unwrap();

        let mut aliased = plaintext;
        in_place(&mut service, &mut aliased);
        assert_eq!(output, aliased);
    }

    #[test]
    fn test_inner_loops_repeat_in_place_pass() {
        let mut single = CipherService::new(ServiceConfig::default());
        prepare(&mut single, CipherConfig::default());
        let mut twice_by_hand = [0u8; 32];
        in_place(&mut single, &mut twice_by_hand);
        in_place(&mut single, &mut twice_by_hand);

        let mut looped = [0u8; 32];
        let mut params = [
            TaParam::MemrefInout(&mut looped),
            TaParam::None,
            TaParam::ValueInput(Value::new(2, 0)),
            TaParam::None,
        ];
        single.invoke(CommandId::PROCESS, &mut params).unwrap();
        assert_eq!(looped, twice_by_hand);
    }
}
