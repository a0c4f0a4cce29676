// Benchmark Runner - timed Process loop over one cipher session
//
// Buffers are allocated once, reused by every iteration and returned to the
// pool on every exit path. Refilling random input happens outside the timed
// window.

use std::time::Duration;
use tracing::{debug, info};

use crate::clock;
use crate::config::BenchConfig;
use crate::entropy::{EntropyConfig, EntropySource};
use crate::report::{BenchmarkReport, Summary};
use crate::shared_memory::{MemFlags, MemRef, SharedBuffer};
use crate::statistics::StatisticsAccumulator;
use crate::tee::TeeError;
use crate::tee_service::{BufferLayout, CipherSession, TeeTransport};
use crate::types::InputMode;

/// Buffers held for the duration of one run
struct RunBuffers {
    input: SharedBuffer,
    output: Option<SharedBuffer>,
}

impl RunBuffers {
    fn allocate<T: TeeTransport>(
        session: &CipherSession<T>,
        config: &BenchConfig,
    ) -> Result<Self, TeeError> {
        if config.in_place {
            let input = session.allocate(config.buffer_size, MemFlags::INOUT)?;
            return Ok(Self {
                input,
                output: None,
            });
        }
        let input = session.allocate(config.buffer_size, MemFlags::INPUT)?;
        // input is dropped (and reclaimed) if this fails
        let output = session.allocate(config.buffer_size, MemFlags::OUTPUT)?;
        Ok(Self {
            input,
            output: Some(output),
        })
    }

    fn layout(&self) -> Result<BufferLayout<'_>, TeeError> {
        match &self.output {
            Some(output) => BufferLayout::separate(MemRef::whole(&self.input), MemRef::whole(output)),
            None => Ok(BufferLayout::in_place(MemRef::whole(&self.input))),
        }
    }

    fn release(self) {
        self.input.release();
        if let Some(output) = self.output {
            output.release();
        }
    }
}

/// Drives outer iterations of timed Process commands
pub struct BenchmarkRunner<'s, T: TeeTransport> {
    session: &'s mut CipherSession<T>,
    config: BenchConfig,
    entropy: Option<EntropySource>,
}

impl<'s, T: TeeTransport> BenchmarkRunner<'s, T> {
    pub fn new(session: &'s mut CipherSession<T>, config: BenchConfig) -> Self {
        Self {
            session,
            config,
            entropy: None,
        }
    }

    /// Use a specific entropy source for random input
    pub fn with_entropy(mut self, entropy: EntropySource) -> Self {
        self.entropy = Some(entropy);
        self
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    fn entropy(&mut self) -> &mut EntropySource {
        let seed = self.config.entropy_seed;
        self.entropy.get_or_insert_with(|| match seed {
            Some(seed) => EntropySource::new_deterministic(seed),
            None => EntropySource::with_config(EntropyConfig::from_env()),
        })
    }

    /// Run warm-up and measured iterations; any command failure ends the run
    pub fn run(&mut self) -> Result<BenchmarkReport, TeeError> {
        let cipher = self.config.cipher_config();
        self.session.ensure_key(cipher)?;

        let buffers = RunBuffers::allocate(self.session, &self.config)?;
        let layout = buffers.layout()?;
        let inner_loops = self.config.inner_loops;
        let random = self.config.input_mode == InputMode::Random;

        for _ in 0..self.config.warmup_iterations {
            if random {
                buffers.input.fill_with(self.entropy());
            }
            self.session.process(layout, inner_loops)?;
        }
        if self.config.warmup_iterations > 0 {
            debug!(iterations = self.config.warmup_iterations, "warm-up complete");
        }

        let outer = self.config.outer_iterations;
        let progress_step = (outer / 10).max(1);
        let mut stats = StatisticsAccumulator::new();
        let mut total = Duration::ZERO;

        for i in 0..outer {
            if random {
                buffers.input.fill_with(self.entropy());
            }
            let elapsed = self.session.timed_process(layout, inner_loops)?;
            stats.update_duration(elapsed);
            total += elapsed;

            if (i + 1) % progress_step == 0 {
                info!(completed = i + 1, total = outer, "progress");
            }
        }

        buffers.release();

        let total_bytes =
            self.config.buffer_size as u64 * u64::from(inner_loops) * stats.count();
        let summary = Summary::from_accumulator(&stats, total_bytes, total);
        Ok(BenchmarkReport::new(
            self.session.transport().name(),
            &self.config,
            clock::resolution(),
            summary,
        ))
    }
}
