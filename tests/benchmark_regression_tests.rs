// Benchmark Regression Tests
//
// End-to-end runs over the in-process service and the standalone socket
// daemon: statistics, throughput accounting, configuration layering and
// shared-memory cleanup on every exit path.
//
// Run with: cargo test --test benchmark_regression_tests

use std::time::Duration;
use tee_aes_perf::benchmark::BenchmarkRunner;
use tee_aes_perf::config::BenchConfig;
use tee_aes_perf::entropy::EntropySource;
use tee_aes_perf::shared_memory::{MemFlags, MemRef, SharedMemoryPool};
use tee_aes_perf::tee::{ErrorOrigin, ResultCode, ServiceConfig, TeeError};
use tee_aes_perf::tee_service::{
    BufferLayout, CipherSession, LocalTransport, SocketTransport, TeeServiceServer, TeeTransport,
};
use tee_aes_perf::types::{CipherConfig, CipherMode, Direction, InputMode, KeySize};

fn encrypt_pattern<T: TeeTransport>(transport: T, config: CipherConfig) -> Vec<u8> {
    let pool = SharedMemoryPool::default();
    let mut session = CipherSession::open(transport, pool.clone()).unwrap();
    session.prepare_key(config).unwrap();

    let input = session.allocate(256, MemFlags::INPUT).unwrap();
    let output = session.allocate(256, MemFlags::OUTPUT).unwrap();
    for (i, b) in input.write().iter_mut().enumerate() {
        *b = i as u8;
    }
    let layout = BufferLayout::separate(MemRef::whole(&input), MemRef::whole(&output)).unwrap();
    assert_eq!(session.process(layout, 3).unwrap(), 256);

    let ciphertext = output.read().to_vec();
    input.release();
    output.release();
    session.close().unwrap();
    assert_eq!(pool.in_use(), 0);
    ciphertext
}

async fn start_daemon(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("cipher.sock").display().to_string();
    let server = TeeServiceServer::new(path.clone(), ServiceConfig::default());
    let listener = server.bind().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    path
}

/// Test: every mode runs end to end and accounts bytes as size x loops x iterations
#[test]
fn test_every_mode_completes() {
    for mode in CipherMode::ALL {
        for direction in [Direction::Encrypt, Direction::Decrypt] {
            let pool = SharedMemoryPool::default();
            let mut session = CipherSession::open(LocalTransport::default(), pool.clone()).unwrap();
            let config = BenchConfig {
                mode,
                direction,
                key_size: KeySize::Aes256,
                buffer_size: 4096,
                outer_iterations: 50,
                inner_loops: 2,
                ..Default::default()
            };
            let report = BenchmarkRunner::new(&mut session, config).run().unwrap();

            assert_eq!(report.summary.count, 50);
            assert_eq!(report.summary.total_bytes, 4096 * 2 * 50);
            assert!(report.summary.throughput_mib_s.unwrap() > 0.0);
            assert!(report.summary.stddev_us.is_some());
            assert!(report.summary.done_line().starts_with("Done. min="));
            assert_eq!(pool.in_use(), 0);
        }
    }
}

/// Test: one session survives several runs with different configurations
#[test]
fn test_session_reused_across_runs() {
    let pool = SharedMemoryPool::default();
    let mut session = CipherSession::open(LocalTransport::default(), pool.clone()).unwrap();

    let first = BenchConfig {
        buffer_size: 512,
        outer_iterations: 10,
        ..Default::default()
    };
    let second = BenchConfig {
        mode: CipherMode::Xts,
        in_place: true,
        input_mode: InputMode::Random,
        ..first.clone()
    };

    BenchmarkRunner::new(&mut session, first).run().unwrap();
    BenchmarkRunner::new(&mut session, second.clone())
        .with_entropy(EntropySource::new_deterministic(7))
        .run()
        .unwrap();

    assert_eq!(session.committed_config(), Some(second.cipher_config()));
    assert_eq!(pool.live_buffers(), 0);
    session.close().unwrap();
}

/// Test: a failed run still returns its buffers and leaves the session usable
#[test]
fn test_failed_run_cleans_up() {
    let pool = SharedMemoryPool::default();
    let mut session = CipherSession::open(LocalTransport::default(), pool.clone()).unwrap();

    let misaligned = BenchConfig {
        mode: CipherMode::Ecb,
        buffer_size: 1000,
        outer_iterations: 5,
        warmup_iterations: 2,
        ..Default::default()
    };
    let err = BenchmarkRunner::new(&mut session, misaligned)
        .run()
        .unwrap_err();
    assert!(matches!(err, TeeError::Cipher { .. }));
    assert_eq!(err.origin(), ErrorOrigin::TrustedApp);
    assert_eq!(pool.in_use(), 0);

    let aligned = BenchConfig {
        buffer_size: 1024,
        outer_iterations: 5,
        ..Default::default()
    };
    let report = BenchmarkRunner::new(&mut session, aligned).run().unwrap();
    assert_eq!(report.summary.count, 5);
}

/// Test: file, then environment, then explicit overrides
#[test]
fn test_configuration_layers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.json");
    std::fs::write(
        &path,
        r#"{ "mode": "CBC", "buffer_size": 2048, "outer_iterations": 30, "key_size": 192 }"#,
    )
    .unwrap();

    let mut config = BenchConfig::from_file(&path).unwrap();
    config
        .apply_env_from(|name| match name {
            "TEE_AES_PERF_BUFFER_SIZE" => Some("256".to_string()),
            "TEE_AES_PERF_DECRYPT" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
    config.outer_iterations = 12;
    config.validate().unwrap();

    assert_eq!(config.mode, CipherMode::Cbc);
    assert_eq!(config.key_size, KeySize::Aes192);
    assert_eq!(config.direction, Direction::Decrypt);
    assert_eq!(config.buffer_size, 256);

    let mut session = CipherSession::open(
        LocalTransport::new(config.service_config().unwrap()),
        SharedMemoryPool::new(config.pool_capacity),
    )
    .unwrap();
    let report = BenchmarkRunner::new(&mut session, config).run().unwrap();
    assert_eq!(report.summary.count, 12);
    assert_eq!(report.summary.total_bytes, 256 * 12);
}

/// Test: the JSON report records configuration and nulls an undefined stddev
#[test]
fn test_json_report() {
    let dir = tempfile::tempdir().unwrap();
    let mut session =
        CipherSession::open(LocalTransport::default(), SharedMemoryPool::default()).unwrap();
    let config = BenchConfig {
        outer_iterations: 1,
        key_hex: Some("00".repeat(16)),
        ..Default::default()
    };
    let report = BenchmarkRunner::new(&mut session, config).run().unwrap();

    let path = dir.path().join("report.json");
    report.write_json(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    assert_eq!(json["transport"], "in-process");
    assert_eq!(json["config"]["mode"], "ECB");
    assert_eq!(json["config"]["key_size"], 128);
    assert_eq!(json["summary"]["count"], 1);
    assert!(json["summary"]["stddev_us"].is_null());
    assert_eq!(json["config"]["key_hex"], "<configured>");
    assert!(json["timestamp"].is_string());
}

/// Test: the socket daemon produces the same ciphertext as the in-process service
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_matches_in_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_daemon(&dir).await;

    for mode in CipherMode::ALL {
        let config = CipherConfig::new(mode, Direction::Encrypt, KeySize::Aes128);
        let socket_path = path.clone();
        let remote = tokio::task::spawn_blocking(move || {
            encrypt_pattern(SocketTransport::new(socket_path), config)
        })
        .await
        .unwrap();
        let local = encrypt_pattern(LocalTransport::default(), config);
        assert_eq!(remote, local, "{}", mode);
    }
}

/// Test: a full benchmark over the socket, and errors arriving unchanged
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_benchmark_and_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = start_daemon(&dir).await;

    let result = tokio::task::spawn_blocking(move || {
        let pool = SharedMemoryPool::default();
        let mut session = CipherSession::open(SocketTransport::new(&path), pool.clone()).unwrap();

        let buf = session.allocate(64, MemFlags::INOUT).unwrap();
        let err = session
            .process(BufferLayout::in_place(MemRef::whole(&buf)), 1)
            .unwrap_err();
        drop(buf);

        let config = BenchConfig {
            mode: CipherMode::Ctr,
            buffer_size: 1000,
            outer_iterations: 25,
            in_place: true,
            ..Default::default()
        };
        let report = BenchmarkRunner::new(&mut session, config).run().unwrap();
        session.close().unwrap();
        (err, report, pool.in_use())
    })
    .await
    .unwrap();

    let (err, report, in_use) = result;
    assert!(err.is_protocol());
    assert_eq!(err.code(), ResultCode::BAD_STATE);
    assert_eq!(err.origin(), ErrorOrigin::TrustedApp);
    assert_eq!(report.transport, "socket");
    assert_eq!(report.summary.count, 25);
    assert_eq!(in_use, 0);
}

/// Test: an unreachable daemon is a session error from the comms layer
#[test]
fn test_unreachable_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let transport = SocketTransport::new(dir.path().join("absent.sock"));
    let err = CipherSession::open(transport, SharedMemoryPool::default())
        .err()
        .unwrap();
    assert!(matches!(err, TeeError::Session { .. }));
    assert_eq!(err.code(), ResultCode::COMMUNICATION);
    assert_eq!(err.origin(), ErrorOrigin::Comms);
}

/// Test: warm-up iterations are not measured
#[test]
fn test_warmup_not_counted() {
    let mut session =
        CipherSession::open(LocalTransport::default(), SharedMemoryPool::default()).unwrap();
    let config = BenchConfig {
        outer_iterations: 4,
        warmup_iterations: 40,
        ..Default::default()
    };
    let report = BenchmarkRunner::new(&mut session, config).run().unwrap();
    assert_eq!(report.summary.count, 4);
    assert!(report.summary.total_time_ns > 0);
    assert!(Duration::from_nanos(report.summary.total_time_ns) < Duration::from_secs(60));
}
