// Cipher Service - isolated-side command handler
//
// Holds at most one keyed operation context per session and dispatches the
// two commands a caller may issue. Every command validates its parameter
// signature before any state is touched.

use tracing::{debug, trace, warn};

use super::crypto::{AllocatedOperation, KeyMaterial, OperationContext, TransientKey};
use super::errors::{ErrorOrigin, ResultCode, TeeError};
use super::params::{signature_of, CommandOutput, ParamType, ParamTypes, TaParam, TaParams};
use crate::types::{CipherConfig, CipherMode, Direction, KeySize};

/// Command identifiers understood by the cipher service
pub struct CommandId;

impl CommandId {
    pub const PREPARE_KEY: u32 = 0;
    pub const PROCESS: u32 = 1;

    pub fn name(command_id: u32) -> &'static str {
        match command_id {
            CommandId::PREPARE_KEY => "PREPARE_KEY",
            CommandId::PROCESS => "PROCESS",
            _ => "UNKNOWN",
        }
    }
}

/// PrepareKey: (direction, key size bits) then (mode)
pub const PREPARE_KEY_SIGNATURE: ParamTypes = ParamTypes::new(
    ParamType::ValueInput,
    ParamType::ValueInput,
    ParamType::None,
    ParamType::None,
);

/// Process with disjoint input and output regions
pub const PROCESS_SEPARATE_SIGNATURE: ParamTypes = ParamTypes::new(
    ParamType::MemrefInput,
    ParamType::MemrefOutput,
    ParamType::ValueInput,
    ParamType::None,
);

/// Process over one aliased region
pub const PROCESS_IN_PLACE_SIGNATURE: ParamTypes = ParamTypes::new(
    ParamType::MemrefInout,
    ParamType::None,
    ParamType::ValueInput,
    ParamType::None,
);

/// Provisioning for a service instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceConfig {
    pub key_material: KeyMaterial,
}

impl ServiceConfig {
    pub fn new(key_material: KeyMaterial) -> Self {
        Self { key_material }
    }
}

/// Lifecycle of one service session
#[derive(Debug)]
pub enum ServiceState {
    Uninitialized,
    KeyReady(OperationContext),
    Closed,
}

impl ServiceState {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceState::Uninitialized => "Uninitialized",
            ServiceState::KeyReady(_) => "KeyReady",
            ServiceState::Closed => "Closed",
        }
    }
}

/// Regions a Process command operates on, borrowed from the in-flight slots
#[derive(Debug)]
pub enum ProcessRegions<'p> {
    Separate {
        input: &'p [u8],
        output: &'p mut [u8],
    },
    InPlace(&'p mut [u8]),
}

/// A command whose parameter shape and value ranges have been checked
#[derive(Debug)]
pub enum TaCommand<'p> {
    PrepareKey(CipherConfig),
    Process {
        regions: ProcessRegions<'p>,
        inner_loops: u32,
    },
}

impl<'p> TaCommand<'p> {
    /// Decode the raw slots, rejecting any shape other than the expected ones
    pub fn decode<'a: 'p>(
        command_id: u32,
        params: &'p mut TaParams<'a>,
    ) -> Result<Self, TeeError> {
        let signature = signature_of(params);
        match command_id {
            CommandId::PREPARE_KEY => {
                let (key, mode) = match &*params {
                    [TaParam::ValueInput(key), TaParam::ValueInput(mode), TaParam::None, TaParam::None] => {
                        (*key, *mode)
                    }
                    _ => {
                        return Err(TeeError::bad_parameters(format!(
                            "PREPARE_KEY expects {}, got {}",
                            PREPARE_KEY_SIGNATURE, signature
                        )))
                    }
                };

                let key_size = KeySize::from_bits(key.b).ok_or_else(|| {
                    TeeError::bad_parameters(format!("unsupported key size {} bits", key.b))
                })?;
                let mode = CipherMode::from_wire(mode.a).ok_or_else(|| {
                    TeeError::protocol(
                        ResultCode::NOT_SUPPORTED,
                        ErrorOrigin::TrustedApp,
                        format!("unsupported mode {}", mode.a),
                    )
                })?;

                Ok(TaCommand::PrepareKey(CipherConfig::new(
                    mode,
                    Direction::from_wire(key.a),
                    key_size,
                )))
            }
            CommandId::PROCESS => {
                let (regions, loops) = match params {
                    [
                        TaParam::MemrefInput(input),
                        TaParam::MemrefOutput(output),
                        TaParam::ValueInput(loops),
                        TaParam::None,
                    ] => (
                        ProcessRegions::Separate {
                            input: &**input,
                            output: &mut **output,
                        },
                        *loops,
                    ),
                    [TaParam::MemrefInout(data), TaParam::None, TaParam::ValueInput(loops), TaParam::None] => {
                        (ProcessRegions::InPlace(&mut **data), *loops)
                    }
                    _ => {
                        return Err(TeeError::bad_parameters(format!(
                            "PROCESS expects {} or {}, got {}",
                            PROCESS_SEPARATE_SIGNATURE, PROCESS_IN_PLACE_SIGNATURE, signature
                        )))
                    }
                };

                if loops.a == 0 {
                    return Err(TeeError::bad_parameters("inner loop count must be at least 1"));
                }

                Ok(TaCommand::Process {
                    regions,
                    inner_loops: loops.a,
                })
            }
            other => Err(TeeError::bad_parameters(format!(
                "unknown command id {}",
                other
            ))),
        }
    }
}

/// Isolated-side handler for one session
#[derive(Debug)]
pub struct CipherService {
    config: ServiceConfig,
    state: ServiceState,
    /// Commands that completed successfully
    completed: u64,
}

impl CipherService {
    pub fn new(config: ServiceConfig) -> Self {
        debug!("cipher service session opened");
        Self {
            config,
            state: ServiceState::Uninitialized,
            completed: 0,
        }
    }

    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Configuration committed by the last successful PrepareKey
    pub fn current_config(&self) -> Option<CipherConfig> {
        match &self.state {
            ServiceState::KeyReady(ctx) => Some(ctx.config()),
            _ => None,
        }
    }

    pub fn completed_commands(&self) -> u64 {
        self.completed
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ServiceState::Closed)
    }

    /// Entry point for one command crossing
    pub fn invoke(
        &mut self,
        command_id: u32,
        params: &mut TaParams<'_>,
    ) -> Result<CommandOutput, TeeError> {
        if self.is_closed() {
            return Err(TeeError::session(
                ResultCode::BAD_STATE,
                ErrorOrigin::Tee,
                "session is closed",
            ));
        }

        trace!(command = CommandId::name(command_id), "invoke");
        let command = TaCommand::decode(command_id, params).inspect_err(|e| {
            warn!(command = CommandId::name(command_id), error = %e, "command rejected")
        })?;
        let result = match command {
            TaCommand::PrepareKey(config) => self.prepare_key(config).map(|_| CommandOutput::default()),
            TaCommand::Process {
                regions,
                inner_loops,
            } => self.process(regions, inner_loops),
        };

        match &result {
            Ok(_) => self.completed += 1,
            Err(e) => warn!(command = CommandId::name(command_id), error = %e, "command failed"),
        }
        result
    }

    /// Replace any prior context with one keyed for `config`
    fn prepare_key(&mut self, config: CipherConfig) -> Result<(), TeeError> {
        if let ServiceState::KeyReady(old) =
            std::mem::replace(&mut self.state, ServiceState::Uninitialized)
        {
            debug!(config = %old.config(), "operation freed");
        }

        let operation = AllocatedOperation::allocate(config)?;
        let mut key = TransientKey::allocate(&config)?;
        let bound = key
            .populate(&self.config.key_material)
            .and_then(|_| operation.set_key(&key, *self.config.key_material.iv()));
        key.free();

        self.state = ServiceState::KeyReady(bound?);
        debug!(%config, "key prepared");
        Ok(())
    }

    fn process(
        &mut self,
        regions: ProcessRegions<'_>,
        inner_loops: u32,
    ) -> Result<CommandOutput, TeeError> {
        let context = match &self.state {
            ServiceState::KeyReady(ctx) => ctx,
            _ => return Err(TeeError::no_key_configured()),
        };

        match regions {
            ProcessRegions::Separate { input, output } => {
                let mut written = 0;
                for _ in 0..inner_loops {
                    written = context.run(input, output)?;
                }
                Ok(CommandOutput::with_written(1, written))
            }
            ProcessRegions::InPlace(data) => {
                let mut written = 0;
                for _ in 0..inner_loops {
                    written = context.run_in_place(data)?;
                }
                Ok(CommandOutput::with_written(0, written))
            }
        }
    }

    /// Free the context and refuse further commands; idempotent
    pub fn close(&mut self) {
        if !self.is_closed() {
            self.state = ServiceState::Closed;
            debug!(completed = self.completed, "cipher service session closed");
        }
    }
}

impl Drop for CipherService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::params::Value;

    fn prepare_params(config: CipherConfig) -> TaParams<'static> {
        [
            TaParam::ValueInput(Value::new(config.direction.wire_value(), config.key_size.bits())),
            TaParam::ValueInput(Value::new(config.mode.wire_value(), 0)),
            TaParam::None,
            TaParam::None,
        ]
    }

    fn process_separate(
        service: &mut CipherService,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<CommandOutput, TeeError> {
        let mut params = [
            TaParam::MemrefInput(input),
            TaParam::MemrefOutput(output),
            TaParam::ValueInput(Value::new(1, 0)),
            TaParam::None,
        ];
        service.invoke(CommandId::PROCESS, &mut params)
    }

    #[test]
    fn test_prepare_then_process_twice() {
        let mut service = CipherService::new(ServiceConfig::default());
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap();
        assert_eq!(service.state_name(), "KeyReady");

        let input = [0u8; 32];
        let mut output = [0u8; 32];
        let out = process_separate(&mut service, &input, &mut output).unwrap();
        assert_eq!(out.written[1], Some(32));
        process_separate(&mut service, &input, &mut output).unwrap();
        assert_eq!(service.completed_commands(), 3);
    }

    #[test]
    fn test_process_before_prepare_key() {
        let mut service = CipherService::new(ServiceConfig::default());
        let err = process_separate(&mut service, &[0u8; 16], &mut [0u8; 16]).unwrap_err();
        assert_eq!(err, TeeError::no_key_configured());
    }

    #[test]
    fn test_malformed_prepare_key_keeps_prior_context() {
        let mut service = CipherService::new(ServiceConfig::default());
        let committed = CipherConfig::new(CipherMode::Cbc, Direction::Encrypt, KeySize::Aes192);
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(committed))
            .unwrap();

        // mode parameter missing
        let mut params = prepare_params(CipherConfig::default());
        params[1] = TaParam::None;
        let err = service.invoke(CommandId::PREPARE_KEY, &mut params).unwrap_err();
        assert!(err.is_protocol());
        assert_eq!(err.code(), ResultCode::BAD_PARAMETERS);
        assert_eq!(service.current_config(), Some(committed));
    }

    #[test]
    fn test_value_ranges_checked_before_replacement() {
        let mut service = CipherService::new(ServiceConfig::default());
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap();

        let mut params = prepare_params(CipherConfig::default());
        params[1] = TaParam::ValueInput(Value::new(9, 0));
        let err = service.invoke(CommandId::PREPARE_KEY, &mut params).unwrap_err();
        assert_eq!(err.code(), ResultCode::NOT_SUPPORTED);

        let mut params = prepare_params(CipherConfig::default());
        params[0] = TaParam::ValueInput(Value::new(0, 100));
        let err = service.invoke(CommandId::PREPARE_KEY, &mut params).unwrap_err();
        assert_eq!(err.code(), ResultCode::BAD_PARAMETERS);

        assert_eq!(service.current_config(), Some(CipherConfig::default()));
    }

    #[test]
    fn test_short_key_material_rolls_back_to_uninitialized() {
        let material = KeyMaterial::new(vec![0u8; 16], [0u8; 16]);
        let mut service = CipherService::new(ServiceConfig::new(material));
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap();

        let xts = CipherConfig::new(CipherMode::Xts, Direction::Encrypt, KeySize::Aes128);
        let err = service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(xts))
            .unwrap_err();
        assert!(matches!(err, TeeError::Cipher { .. }));
        assert_eq!(service.state_name(), "Uninitialized");
    }

    #[test]
    fn test_zero_inner_loops_rejected() {
        let mut service = CipherService::new(ServiceConfig::default());
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap();
        let mut data = [0u8; 16];
        let mut params = [
            TaParam::MemrefInout(&mut data),
            TaParam::None,
            TaParam::ValueInput(Value::new(0, 0)),
            TaParam::None,
        ];
        let err = service.invoke(CommandId::PROCESS, &mut params).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_unknown_command_id() {
        let mut service = CipherService::new(ServiceConfig::default());
        let mut params = prepare_params(CipherConfig::default());
        let err = service.invoke(7, &mut params).unwrap_err();
        assert_eq!(err.code(), ResultCode::BAD_PARAMETERS);
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_malformed_command_is_logged() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut service = CipherService::new(ServiceConfig::default());
            let mut params = prepare_params(CipherConfig::default());
            assert!(service.invoke(7, &mut params).is_err());
        });

        let text = String::from_utf8(log.0.lock().clone()).unwrap();
        assert!(text.contains("command rejected"), "{}", text);
        assert!(text.contains("unknown command id 7"), "{}", text);
    }

    #[test]
    fn test_commands_after_close_fail() {
        let mut service = CipherService::new(ServiceConfig::default());
        service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap();
        service.close();
        service.close();

        let err = service
            .invoke(CommandId::PREPARE_KEY, &mut prepare_params(CipherConfig::default()))
            .unwrap_err();
        assert!(matches!(err, TeeError::Session { .. }));
        assert_eq!(err.origin(), ErrorOrigin::Tee);
    }
}
