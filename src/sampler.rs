use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use rand::{rngs::SmallRng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{ScopeFifo, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        mpsc::{
            channel, sync_channel, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError,
        },
        Arc, Mutex,
    },
    thread::{spawn, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    chain::{ChainError, ChainSettings, ChunkSummary, MetropolisChain, OperatorReport},
    error::ConfigError,
    model::Model,
    operators::OperatorSet,
    state::{ChainState, OwnershipLedger, OwnershipStats},
    storage::{SampleSink, SinkFactory},
    tempering::{accept_swap, incremental_ladder, validate_ladder, SwapScheme, SwapStats},
};

/// Maximum time the controller waits for workers before it looks at the run
/// handle again.
const COMMAND_POLL: Duration = Duration::from_millis(50);

/// Settings of a Metropolis-coupled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperingSettings {
    /// One temperature per chain, starting with the cold chain.
    pub temperatures: Vec<f64>,
    /// Number of steps each chain runs between two rendezvous.
    pub chunk_length: u64,
    /// Number of steps of every chain.
    pub total_length: u64,
    /// Number of chunks between two swap events.
    pub swap_interval: u64,
    pub swap_scheme: SwapScheme,
    /// Number of pairs drawn at each swap event by the random schemes.
    pub swaps_per_event: usize,
    pub chain: ChainSettings,
    /// Never adapt operators during this run.
    pub disable_coercion: bool,
    pub seed: u64,
    /// Maximum number of initial positions to try per chain.
    pub init_attempts: usize,
}

impl Default for TemperingSettings {
    fn default() -> Self {
        Self {
            temperatures: incremental_ladder(4, 0.1).unwrap_or_else(|_| vec![1.]),
            chunk_length: 1000,
            total_length: 100_000,
            swap_interval: 1,
            swap_scheme: SwapScheme::default(),
            swaps_per_event: 1,
            chain: ChainSettings::default(),
            disable_coercion: false,
            seed: 0,
            init_attempts: 500,
        }
    }
}

impl TemperingSettings {
    pub fn num_chains(&self) -> usize {
        self.temperatures.len()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_ladder(&self.temperatures)?;
        let positive = [
            ("chunk_length", self.chunk_length as usize),
            ("total_length", self.total_length as usize),
            ("swap_interval", self.swap_interval as usize),
            ("swaps_per_event", self.swaps_per_event),
            ("init_attempts", self.init_attempts),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::NonPositive { name: *name });
        }
        self.chain.validate()
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub struct ChainProgress {
    pub chain: usize,
    pub temperature: f64,
    pub finished_steps: u64,
    pub total_steps: u64,
    pub accepted: u64,
    pub started: bool,
    pub runtime: Duration,
}

impl ChainProgress {
    fn new(chain: usize, temperature: f64, total: u64) -> Self {
        Self {
            chain,
            temperature,
            finished_steps: 0,
            total_steps: total,
            accepted: 0,
            started: false,
            runtime: Duration::ZERO,
        }
    }

    fn update(&mut self, summary: &ChunkSummary, duration: Duration) {
        self.finished_steps += summary.steps;
        self.accepted += summary.accepted;
        self.runtime += duration;
    }

    pub fn acceptance_rate(&self) -> Option<f64> {
        if self.finished_steps == 0 {
            None
        } else {
            Some(self.accepted as f64 / self.finished_steps as f64)
        }
    }
}

pub struct ProgressCallback {
    pub callback: Box<dyn FnMut(Duration, Box<[ChainProgress]>) + Send>,
    pub rate: Duration,
}

/// Final state and statistics of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainReport {
    pub chain: usize,
    pub temperature: f64,
    pub steps: u64,
    pub accepted: u64,
    pub position: Box<[f64]>,
    pub logp: f64,
    pub operators: Vec<OperatorReport>,
}

impl ChainReport {
    pub fn acceptance_rate(&self) -> Option<f64> {
        if self.steps == 0 {
            None
        } else {
            Some(self.accepted as f64 / self.steps as f64)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Ordered by chain index.
    pub chains: Vec<ChainReport>,
    pub swaps: SwapStats,
    pub ownership: OwnershipStats,
    /// Number of completed chunks per chain.
    pub chunks: u64,
    /// Whether the run was stopped before `total_length`.
    pub aborted: bool,
}

enum ChainCommand {
    Run {
        state: ChainState,
        length: u64,
        disable_coercion: bool,
    },
    Finish {
        state: ChainState,
    },
}

enum WorkerEvent {
    Ready {
        chain: usize,
        state: ChainState,
    },
    ChunkDone {
        chain: usize,
        state: ChainState,
        summary: ChunkSummary,
        duration: Duration,
    },
    Finished {
        report: Box<ChainReport>,
    },
    Failed {
        chain: usize,
        error: anyhow::Error,
    },
}

#[derive(Debug)]
enum RunCommand {
    Pause,
    Continue,
    Abort,
}

/// Handle to a run started with [`start_chains`].
pub struct RunHandle {
    main_thread: JoinHandle<Result<RunReport>>,
    commands: SyncSender<RunCommand>,
    responses: Receiver<()>,
    progress: Arc<Mutex<Box<[ChainProgress]>>>,
}

impl RunHandle {
    pub fn is_running(&self) -> bool {
        !self.main_thread.is_finished()
    }

    /// Stop all chains at their next chunk boundary until [`RunHandle::resume`].
    pub fn pause(&mut self) -> Result<()> {
        self.send(RunCommand::Pause)
            .context("Could not send pause command to controller thread")
    }

    pub fn resume(&mut self) -> Result<()> {
        self.send(RunCommand::Continue)
            .context("Could not send resume command to controller thread")
    }

    fn send(&mut self, command: RunCommand) -> Result<()> {
        self.commands.send(command)?;
        self.responses
            .recv()
            .context("Could not recieve response from controller thread")?;
        Ok(())
    }

    pub fn progress(&self) -> Box<[ChainProgress]> {
        self.progress.lock().expect("Poisoned lock").clone()
    }

    /// Stop the run at the next chunk boundary and return what was sampled.
    pub fn abort(mut self) -> Result<RunReport> {
        // The controller may already be done.
        let _ = self.send(RunCommand::Abort);
        self.await_completion()
    }

    /// Wait until every chain has finished.
    ///
    /// A paused run is resumed.
    pub fn await_completion(self) -> Result<RunReport> {
        let RunHandle {
            main_thread,
            commands,
            ..
        } = self;
        drop(commands);
        match main_thread.join() {
            Err(payload) => std::panic::resume_unwind(payload),
            Ok(result) => result,
        }
    }
}

/// Start one chain per temperature of `settings` on its own thread.
///
/// Configuration errors are returned before any thread is started and can be
/// downcast to [`ConfigError`].
pub fn start_chains<M: Model, F: SinkFactory>(
    model: M,
    settings: TemperingSettings,
    sinks: F,
    callback: Option<ProgressCallback>,
) -> Result<RunHandle> {
    settings.validate()?;
    let dim = model.dim();
    if dim == 0 {
        return Err(ConfigError::EmptyModel.into());
    }
    let operator_sets = (0..settings.num_chains())
        .map(|chain| {
            let operators = model
                .operators(chain)
                .with_context(|| format!("Could not create operators of chain {}", chain))?;
            operators
                .validate(dim)
                .with_context(|| format!("Invalid operators for chain {}", chain))?;
            Ok(operators)
        })
        .collect::<Result<Vec<_>>>()?;

    let progress: Box<[ChainProgress]> = settings
        .temperatures
        .iter()
        .enumerate()
        .map(|(chain, &temperature)| ChainProgress::new(chain, temperature, settings.total_length))
        .collect();
    let progress = Arc::new(Mutex::new(progress));
    let progress_inner = progress.clone();

    let (commands_tx, commands_rx) = sync_channel(0);
    let (responses_tx, responses_rx) = sync_channel(0);

    info!(
        chains = settings.num_chains(),
        dim,
        chunk_length = settings.chunk_length,
        total_length = settings.total_length,
        swap_interval = settings.swap_interval,
        "starting coupled chains"
    );

    let main_thread = spawn(move || {
        let num_chains = settings.num_chains();
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_chains + 1) // One more thread because the controller also uses one
            .thread_name(|i| format!("mc3-worker-{}", i))
            .build()
            .context("Could not start thread pool")?;

        let ledger = OwnershipLedger::new();
        let ledger_ref = &ledger;
        let settings_ref = &settings;
        let model_ref = &model;
        let sinks_ref = &sinks;

        let outcome = pool.scope_fifo(move |scope| {
            let (events_tx, events_rx) = channel();
            let chains = operator_sets
                .into_iter()
                .enumerate()
                .map(|(chain, operators)| {
                    Some(spawn_worker(
                        scope,
                        Worker {
                            model: model_ref,
                            chain,
                            settings: settings_ref,
                            sinks: sinks_ref,
                            ledger: ledger_ref,
                        },
                        operators,
                        events_tx.clone(),
                    ))
                })
                .collect_vec();
            drop(events_tx);

            let mut controller = Controller {
                settings: settings_ref,
                commands: commands_rx,
                responses: responses_tx,
                events: events_rx,
                chains,
                slots: (0..num_chains).map(|_| None).collect(),
                progress: progress_inner,
                callback,
                swaps: SwapStats::new(),
                swap_rng: swap_rng(settings_ref.seed, num_chains),
                clock: Clock::new(),
                last_progress: Instant::now(),
                paused: false,
                aborted: false,
                disconnected: false,
                failure: None,
                chunks: 0,
            };

            let result = controller.run();
            // Run finalization even if something failed
            let mut reports = controller.finish();
            controller.report_progress(true);
            result?;
            if let Some(error) = controller.failure.take() {
                return Err(error);
            }
            reports.sort_unstable_by_key(|report| report.chain);
            Ok((reports, controller.swaps, controller.chunks, controller.aborted))
        });

        let (chains, swaps, chunks, aborted) = outcome?;
        let report = RunReport {
            chains,
            swaps,
            ownership: ledger.stats(),
            chunks,
            aborted,
        };
        info!(
            chunks,
            aborted,
            swaps_attempted = report.swaps.attempted(),
            swaps_accepted = report.swaps.accepted(),
            "coupled run finished"
        );
        Ok(report)
    });

    Ok(RunHandle {
        main_thread,
        commands: commands_tx,
        responses: responses_rx,
        progress,
    })
}

fn swap_rng(seed: u64, num_chains: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(num_chains as u64);
    rng
}

/// Everything a chain thread borrows from the controller.
struct Worker<'scope, M, F> {
    model: &'scope M,
    chain: usize,
    settings: &'scope TemperingSettings,
    sinks: &'scope F,
    ledger: &'scope OwnershipLedger,
}

fn spawn_worker<'scope, M: Model, F: SinkFactory>(
    scope: &ScopeFifo<'scope>,
    worker: Worker<'scope, M, F>,
    operators: OperatorSet,
    events: Sender<WorkerEvent>,
) -> Sender<ChainCommand> {
    let (commands_tx, commands_rx) = channel();
    scope.spawn_fifo(move |_| {
        let chain = worker.chain;
        // Other chains hold the event channel open, so panics become failures.
        let result = catch_unwind(AssertUnwindSafe(|| {
            worker.run(operators, commands_rx, &events)
        }))
        .unwrap_or_else(|payload| Err(anyhow!("Chain panicked: {}", panic_message(&*payload))));
        let event = match result {
            Ok(report) => WorkerEvent::Finished {
                report: Box::new(report),
            },
            Err(error) => {
                warn!(chain, error = %error, "chain failed");
                WorkerEvent::Failed { chain, error }
            }
        };
        // The controller stops listening once every chain has reported.
        let _ = events.send(event);
    });
    commands_tx
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

impl<M: Model, F: SinkFactory> Worker<'_, M, F> {
    fn run(
        &self,
        operators: OperatorSet,
        commands: Receiver<ChainCommand>,
        events: &Sender<WorkerEvent>,
    ) -> Result<ChainReport> {
        let chain = self.chain;
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        rng.set_stream(chain as u64);

        let density = self
            .model
            .density(chain)
            .context("Failed to create model density")?;
        let mut sink = self
            .sinks
            .new_sink(chain)
            .context("Failed to create sample sink")?;
        let step_rng = SmallRng::from_rng(&mut rng);
        let mut sampler = MetropolisChain::new(
            chain,
            density,
            operators,
            self.settings.temperatures[chain],
            self.settings.chain,
            step_rng,
        )?;

        let mut initval = vec![0f64; self.model.dim()];
        let mut error = None;
        for _ in 0..self.settings.init_attempts {
            self.model
                .init_position(&mut rng, &mut initval)
                .context("Failed to generate a new initial position")?;
            match sampler.set_position(&initval) {
                Ok(()) => {
                    error = None;
                    break;
                }
                Err(err @ ChainError::InvalidInitialPosition(_)) => error = Some(err),
                Err(err) => return Err(err).context("Could not evaluate initial position"),
            }
        }
        if let Some(error) = error {
            return Err(anyhow::Error::from(error).context("All initialization points failed"));
        }

        let state = sampler.take_state().ok_or(ChainError::NoState)?;
        events
            .send(WorkerEvent::Ready { chain, state })
            .map_err(|_| anyhow!("Controller thread stopped"))?;

        loop {
            let command = commands
                .recv()
                .context("Controller thread stopped before the chain finished")?;
            match command {
                ChainCommand::Run {
                    state,
                    length,
                    disable_coercion,
                } => {
                    let id = state.id();
                    self.ledger.claim(id, chain);
                    sampler.install_state(state)?;
                    let start = Instant::now();
                    let summary = sampler.run(length, disable_coercion, &mut sink)?;
                    let duration = start.elapsed();
                    let state = sampler.take_state().ok_or(ChainError::NoState)?;
                    self.ledger.release(id, chain);
                    events
                        .send(WorkerEvent::ChunkDone {
                            chain,
                            state,
                            summary,
                            duration,
                        })
                        .map_err(|_| anyhow!("Controller thread stopped"))?;
                }
                ChainCommand::Finish { state } => {
                    sampler.install_state(state)?;
                    sink.flush().context("Could not flush sample sink")?;
                    sampler.finish();
                    let operators = sampler.operator_report();
                    let state = sampler.take_state().ok_or(ChainError::NoState)?;
                    return Ok(ChainReport {
                        chain,
                        temperature: sampler.temperature(),
                        steps: sampler.steps(),
                        accepted: sampler.accepted(),
                        logp: state.logp(),
                        position: state.into_position(),
                        operators,
                    });
                }
            }
        }
    }
}

/// Wall clock time of the run without the time spent paused.
struct Clock {
    start: Instant,
    pause_start: Option<Instant>,
    pause_time: Duration,
}

impl Clock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            pause_start: None,
            pause_time: Duration::ZERO,
        }
    }

    fn pause(&mut self) {
        self.pause_start.get_or_insert_with(Instant::now);
    }

    fn resume(&mut self) {
        if let Some(start) = self.pause_start.take() {
            self.pause_time += start.elapsed();
        }
    }

    fn elapsed(&self) -> Duration {
        let mut elapsed = self.start.elapsed().saturating_sub(self.pause_time);
        if let Some(start) = self.pause_start {
            elapsed = elapsed.saturating_sub(start.elapsed());
        }
        elapsed
    }
}

struct Controller<'scope> {
    settings: &'scope TemperingSettings,
    commands: Receiver<RunCommand>,
    responses: SyncSender<()>,
    events: Receiver<WorkerEvent>,
    /// `None` once the chain has failed.
    chains: Vec<Option<Sender<ChainCommand>>>,
    /// States of the idle chains, indexed by chain.
    slots: Vec<Option<ChainState>>,
    progress: Arc<Mutex<Box<[ChainProgress]>>>,
    callback: Option<ProgressCallback>,
    swaps: SwapStats,
    swap_rng: ChaCha8Rng,
    clock: Clock,
    last_progress: Instant,
    paused: bool,
    aborted: bool,
    disconnected: bool,
    failure: Option<anyhow::Error>,
    chunks: u64,
}

impl Controller<'_> {
    fn run(&mut self) -> Result<()> {
        self.report_progress(true);
        self.await_ready()?;

        let total = self.settings.total_length;
        let mut steps = 0u64;
        let mut swap_events = 0u64;
        while steps < total {
            self.poll_commands()?;
            self.wait_while_paused()?;
            if self.aborted {
                info!(steps, "run aborted");
                break;
            }
            if self.failure.is_some() {
                break;
            }

            let length = self.settings.chunk_length.min(total - steps);
            self.run_chunk(length)?;
            if self.failure.is_some() {
                break;
            }
            steps += length;
            self.chunks += 1;

            if self.chunks % self.settings.swap_interval == 0 && steps < total {
                self.swap_event(swap_events)?;
                swap_events += 1;
            }
        }
        Ok(())
    }

    fn await_ready(&mut self) -> Result<()> {
        let mut pending = self.chains.iter().flatten().count();
        while pending > 0 {
            match self.events.recv_timeout(self.timeout()) {
                Ok(WorkerEvent::Ready { chain, state }) => {
                    self.slots[chain] = Some(state);
                    self.progress.lock().expect("Poisoned lock")[chain].started = true;
                    pending -= 1;
                }
                Ok(WorkerEvent::Failed { chain, error }) => {
                    self.fail(chain, error);
                    pending -= 1;
                }
                Ok(_) => bail!("Unexpected message from chain during initialization"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("All chain threads stopped"),
            }
            self.poll_commands()?;
            self.report_progress(false);
        }
        Ok(())
    }

    /// Let every chain run `length` steps and wait until all are idle again.
    fn run_chunk(&mut self, length: u64) -> Result<()> {
        let mut pending = 0;
        for (chain, sender) in self.chains.iter().enumerate() {
            let Some(sender) = sender else {
                continue;
            };
            let state = self.slots[chain]
                .take()
                .with_context(|| format!("State of chain {} is missing", chain))?;
            sender
                .send(ChainCommand::Run {
                    state,
                    length,
                    disable_coercion: self.settings.disable_coercion,
                })
                .map_err(|_| anyhow!("Chain {} stopped unexpectedly", chain))?;
            pending += 1;
        }

        while pending > 0 {
            match self.events.recv_timeout(self.timeout()) {
                Ok(WorkerEvent::ChunkDone {
                    chain,
                    state,
                    summary,
                    duration,
                }) => {
                    self.slots[chain] = Some(state);
                    self.progress.lock().expect("Poisoned lock")[chain].update(&summary, duration);
                    pending -= 1;
                }
                Ok(WorkerEvent::Failed { chain, error }) => {
                    self.fail(chain, error);
                    pending -= 1;
                }
                Ok(_) => bail!("Unexpected message from chain during a chunk"),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => bail!("All chain threads stopped"),
            }
            self.poll_commands()?;
            self.report_progress(false);
        }
        Ok(())
    }

    /// Propose and resolve exchanges while all chains are idle.
    fn swap_event(&mut self, event: u64) -> Result<()> {
        let num_chains = self.slots.len();
        let pairs = self.settings.swap_scheme.pairs(
            &mut self.swap_rng,
            num_chains,
            event,
            self.settings.swaps_per_event,
        );
        let temperatures = &self.settings.temperatures;
        for (i, j) in pairs {
            let logp_i = self.slots[i]
                .as_ref()
                .with_context(|| format!("State of chain {} is missing", i))?
                .logp();
            let logp_j = self.slots[j]
                .as_ref()
                .with_context(|| format!("State of chain {} is missing", j))?
                .logp();
            let accepted = accept_swap(
                &mut self.swap_rng,
                temperatures[i],
                logp_i,
                temperatures[j],
                logp_j,
            );
            self.swaps.record(i, j, accepted);
            if accepted {
                self.slots.swap(i, j);
            }
            debug!(event, i, j, logp_i, logp_j, accepted, "swap proposal");
        }
        Ok(())
    }

    /// Hand the states back to the chains and collect their reports.
    fn finish(&mut self) -> Vec<ChainReport> {
        for (chain, sender) in self.chains.iter_mut().enumerate() {
            if let (Some(sender), Some(state)) = (sender.take(), self.slots[chain].take()) {
                let _ = sender.send(ChainCommand::Finish { state });
            }
        }

        let mut reports = Vec::with_capacity(self.slots.len());
        // Ends when every chain thread has returned.
        while let Ok(event) = self.events.recv() {
            match event {
                WorkerEvent::Finished { report } => {
                    let mut progress = self.progress.lock().expect("Poisoned lock");
                    progress[report.chain].finished_steps = report.steps;
                    reports.push(*report);
                }
                WorkerEvent::Failed { chain, error } => self.fail(chain, error),
                WorkerEvent::Ready { .. } | WorkerEvent::ChunkDone { .. } => {}
            }
        }
        reports
    }

    fn fail(&mut self, chain: usize, error: anyhow::Error) {
        self.chains[chain] = None;
        if self.failure.is_none() {
            self.failure = Some(error.context(format!("Chain {} failed", chain)));
        }
    }

    fn poll_commands(&mut self) -> Result<()> {
        while !self.disconnected {
            match self.commands.try_recv() {
                Ok(command) => self.handle(command)?,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.on_disconnect(),
            }
        }
        Ok(())
    }

    fn wait_while_paused(&mut self) -> Result<()> {
        while self.paused && !self.disconnected {
            match self.commands.recv_timeout(self.timeout()) {
                Ok(command) => self.handle(command)?,
                Err(RecvTimeoutError::Timeout) => self.report_progress(false),
                Err(RecvTimeoutError::Disconnected) => self.on_disconnect(),
            }
        }
        Ok(())
    }

    fn handle(&mut self, command: RunCommand) -> Result<()> {
        debug!(?command, "run command");
        match command {
            RunCommand::Pause => {
                self.paused = true;
                self.clock.pause();
            }
            RunCommand::Continue => {
                self.paused = false;
                self.clock.resume();
            }
            RunCommand::Abort => {
                self.aborted = true;
                self.paused = false;
                self.clock.resume();
            }
        }
        self.responses
            .send(())
            .context("Could not send response to run handle")
    }

    /// Without a handle nobody can resume the run, so it continues.
    fn on_disconnect(&mut self) {
        self.disconnected = true;
        self.paused = false;
        self.clock.resume();
    }

    fn timeout(&self) -> Duration {
        match &self.callback {
            Some(ProgressCallback { rate, .. }) => rate
                .checked_sub(self.last_progress.elapsed())
                .unwrap_or(Duration::ZERO)
                .min(COMMAND_POLL),
            None => COMMAND_POLL,
        }
    }

    fn report_progress(&mut self, force: bool) {
        let Some(ProgressCallback { callback, rate }) = &mut self.callback else {
            return;
        };
        if !force && self.last_progress.elapsed() < *rate {
            return;
        }
        let progress = self.progress.lock().expect("Poisoned lock").clone();
        callback(self.clock.elapsed(), progress);
        self.last_progress = Instant::now();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::test_models::GaussianModel;
    use super::*;
    use crate::{
        model::{Infallible, LogDensity},
        operators::{RandomWalkOperator, Target},
        storage::VecSink,
    };

    fn model() -> GaussianModel {
        GaussianModel {
            dim: 3,
            mu: 0.5,
            window: 1.,
        }
    }

    #[test]
    fn run_to_completion() -> Result<()> {
        let settings = TemperingSettings {
            temperatures: vec![1., 0.8, 0.6],
            chunk_length: 30,
            total_length: 100,
            swap_interval: 2,
            seed: 5,
            ..Default::default()
        };
        let sink = Arc::new(Mutex::new(VecSink::new()));
        let handle = start_chains(model(), settings, sink.clone(), None)?;
        let report = handle.await_completion()?;

        // Chunks of 30, 30, 30 and 10 steps.
        assert_eq!(report.chunks, 4);
        assert!(!report.aborted);
        assert_eq!(report.chains.len(), 3);
        for (chain, chain_report) in report.chains.iter().enumerate() {
            assert_eq!(chain_report.chain, chain);
            assert_eq!(chain_report.steps, 100);
            assert!(chain_report.logp.is_finite());
            assert_eq!(chain_report.position.len(), 3);
        }
        // A swap after the second chunk only.
        assert_eq!(report.swaps.attempted(), 1);
        assert_eq!(report.ownership.conflicts, 0);
        assert_eq!(report.ownership.claims, 12);

        let sink = sink.lock().expect("Poisoned lock");
        for chain in 0..3 {
            assert_eq!(sink.chain(chain).count(), 101);
            let mut steps = sink.chain(chain).map(|s| s.step).collect_vec();
            steps.sort_unstable();
            assert_eq!(steps, (0..=100).collect_vec());
        }
        Ok(())
    }

    #[test]
    fn configuration_errors_before_start() {
        let settings = TemperingSettings {
            temperatures: vec![0.5, 1.],
            ..Default::default()
        };
        let err = start_chains(model(), settings, (), None)
            .err()
            .expect("ladder is not monotonic");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::NonMonotonicLadder { .. })
        ));

        let settings = TemperingSettings {
            swap_interval: 0,
            ..Default::default()
        };
        let err = start_chains(model(), settings, (), None)
            .err()
            .expect("swap interval is zero");
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NonPositive {
                name: "swap_interval"
            })
        );

        let empty = GaussianModel {
            dim: 0,
            mu: 0.,
            window: 1.,
        };
        let err = start_chains(empty, TemperingSettings::default(), (), None)
            .err()
            .expect("model without dimensions");
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::EmptyModel)
        );
    }

    #[test]
    fn pause_resume_and_abort() -> Result<()> {
        let settings = TemperingSettings {
            temperatures: vec![1., 0.5],
            chunk_length: 10,
            total_length: 1_000_000_000,
            ..Default::default()
        };
        let mut handle = start_chains(model(), settings, (), None)?;
        handle.pause()?;
        handle.pause()?;
        assert!(handle.is_running());
        let paused = handle.progress();
        std::thread::sleep(Duration::from_millis(50));
        // At most one chunk was still running when the pause arrived.
        let later = handle.progress();
        for (before, after) in paused.iter().zip(later.iter()) {
            assert!(after.finished_steps <= before.finished_steps + 10);
        }
        handle.resume()?;
        let report = handle.abort()?;
        assert!(report.aborted);
        assert_eq!(report.chains.len(), 2);
        assert!(report.chains.iter().all(|c| c.steps < 1_000_000_000));
        assert_eq!(report.chains[0].steps, report.chains[1].steps);
        Ok(())
    }

    #[test]
    fn progress_callback() -> Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_inner = calls.clone();
        let callback = ProgressCallback {
            callback: Box::new(move |_elapsed, progress| {
                calls_inner.lock().expect("Poisoned lock").push(progress);
            }),
            rate: Duration::from_millis(1),
        };
        let settings = TemperingSettings {
            temperatures: vec![1., 0.5],
            chunk_length: 50,
            total_length: 500,
            ..Default::default()
        };
        let handle = start_chains(model(), settings, (), Some(callback))?;
        handle.await_completion()?;

        let calls = calls.lock().expect("Poisoned lock");
        assert!(calls.len() >= 2);
        let last = calls.last().expect("no progress reported");
        assert!(last.iter().all(|p| p.finished_steps == 500 && p.started));
        assert!(last.iter().all(|p| p.acceptance_rate().is_some()));
        Ok(())
    }

    #[test]
    fn failing_chain_reports_error() {
        struct BrokenModel;

        impl Model for BrokenModel {
            type Density<'model> = crate::chain::test_logps::NormalLogp;

            fn dim(&self) -> usize {
                1
            }

            fn density(&self, chain: usize) -> Result<Self::Density<'_>> {
                if chain == 1 {
                    bail!("no density for chain 1");
                }
                Ok(crate::chain::test_logps::NormalLogp {
                    dim: 1,
                    mu: 0.,
                    sd: 1.,
                })
            }

            fn operators(&self, chain: usize) -> Result<OperatorSet> {
                model().operators(chain)
            }

            fn init_position<R: rand::Rng + ?Sized>(
                &self,
                _rng: &mut R,
                position: &mut [f64],
            ) -> Result<()> {
                position.fill(0.);
                Ok(())
            }
        }

        let settings = TemperingSettings {
            temperatures: vec![1., 0.5, 0.25],
            chunk_length: 10,
            total_length: 100,
            ..Default::default()
        };
        let handle = start_chains(BrokenModel, settings, (), None).expect("valid settings");
        let err = handle.await_completion().expect_err("chain 1 has no density");
        assert!(format!("{:#}", err).contains("no density for chain 1"));
    }

    #[test]
    fn panicking_chain_ends_the_run() {
        struct PanickingLogp {
            chain: usize,
        }

        impl LogDensity for PanickingLogp {
            type LogpError = Infallible;

            fn dim(&self) -> usize {
                1
            }

            fn logp(&mut self, position: &[f64]) -> Result<f64, Infallible> {
                if self.chain == 1 && position[0].abs() > 3. {
                    panic!("density of chain 1 left its range");
                }
                Ok(-position[0] * position[0] / 2.)
            }
        }

        struct PanickingModel;

        impl Model for PanickingModel {
            type Density<'model> = PanickingLogp;

            fn dim(&self) -> usize {
                1
            }

            fn density(&self, chain: usize) -> Result<PanickingLogp> {
                Ok(PanickingLogp { chain })
            }

            fn operators(&self, _chain: usize) -> Result<OperatorSet> {
                Ok(OperatorSet::new().with(RandomWalkOperator::new(Target::All, 10.)?, 1.))
            }

            fn init_position<R: rand::Rng + ?Sized>(
                &self,
                _rng: &mut R,
                position: &mut [f64],
            ) -> Result<()> {
                position.fill(0.);
                Ok(())
            }
        }

        let settings = TemperingSettings {
            temperatures: vec![1., 0.5],
            chunk_length: 10,
            total_length: 1_000_000,
            disable_coercion: true,
            ..Default::default()
        };
        let handle = start_chains(PanickingModel, settings, (), None).expect("valid settings");
        let (done_tx, done_rx) = channel();
        spawn(move || {
            let _ = done_tx.send(handle.await_completion());
        });
        let err = done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("run did not end after a chain panicked")
            .expect_err("chain 1 panicked");
        let message = format!("{:#}", err);
        assert!(message.contains("Chain 1 failed"), "{}", message);
        assert!(message.contains("left its range"), "{}", message);
    }

    #[test]
    fn settings_from_json() -> Result<()> {
        let settings: TemperingSettings = serde_json::from_str(
            r#"{
                "temperatures": [1.0, 0.5],
                "chunk_length": 20,
                "swap_scheme": "AlternatingAdjacent",
                "chain": {"sampling_interval": 5, "coercion": {"delay": 100}}
            }"#,
        )?;
        assert_eq!(settings.num_chains(), 2);
        assert_eq!(settings.chunk_length, 20);
        assert_eq!(settings.total_length, 100_000);
        assert_eq!(settings.swap_scheme, SwapScheme::AlternatingAdjacent);
        assert_eq!(settings.chain.sampling_interval, 5);
        assert_eq!(settings.chain.coercion.delay, 100);
        assert_eq!(settings.chain.coercion.interval, 100);
        assert!(settings.validate().is_ok());

        let json = serde_json::to_string(&settings)?;
        let back: TemperingSettings = serde_json::from_str(&json)?;
        assert_eq!(back, settings);
        Ok(())
    }
}
