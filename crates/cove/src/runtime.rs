//! Async service handle.
//!
//! The script engine is single-threaded and not `Send`, so the registry and
//! the execution engine live on one dedicated thread. [`Cove`] is a cheap,
//! cloneable handle that sends that thread commands and awaits the replies;
//! the command channel is the single serial flow every registry mutation
//! and every script goes through.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::context::{ContextInfo, ContextOptions};
use crate::engine::{
    EvaluateOptions, ExecutionEngine, ExecutionResult, RunOptions, Target, expression_source,
};
use crate::error::{Error, Result};

/// Slack given to the engine's own deadline before the handle reports a
/// timeout on its behalf.
const DEADLINE_GRACE: Duration = Duration::from_millis(25);

/// Pending commands before senders wait.
const COMMAND_BUFFER: usize = 64;

/// Engine thread stack; deep script recursion runs on it.
const ENGINE_STACK_BYTES: usize = 8 * 1024 * 1024;

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Create {
        id: String,
        options: ContextOptions,
        reply: Reply<Result<ContextInfo>>,
    },
    Info {
        id: String,
        reply: Reply<Result<ContextInfo>>,
    },
    List {
        include_details: bool,
        reply: Reply<Vec<ContextInfo>>,
    },
    Destroy {
        id: String,
        reply: Reply<Result<bool>>,
    },
    GenerateId {
        reply: Reply<String>,
    },
    Run {
        code: String,
        target: Target,
        options: RunOptions,
        cancel: Arc<AtomicBool>,
        reply: Reply<Result<ExecutionResult>>,
    },
    MemoryCheck {
        reply: Reply<Result<bool>>,
    },
    Sweep {
        reply: Option<Reply<Vec<String>>>,
    },
    Shutdown {
        reply: Reply<usize>,
    },
}

/// Handle to a running sandbox service.
///
/// Clones share the same engine. The engine thread stops once
/// [`shutdown`](Cove::shutdown) is called or every handle is dropped.
#[derive(Clone)]
pub struct Cove {
    commands: mpsc::Sender<Command>,
    config: Arc<EngineConfig>,
}

impl fmt::Debug for Cove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cove")
            .field("config", &self.config)
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl Cove {
    /// Start the engine thread and the idle sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        Self::start_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Start with a custom clock for context timestamps and idle eviction.
    pub async fn start_with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();

        let engine_config = config.clone();
        std::thread::Builder::new()
            .name("cove-engine".to_string())
            .stack_size(ENGINE_STACK_BYTES)
            .spawn(move || worker_loop(engine_config, clock, receiver, ready_tx))
            .map_err(|e| Error::context_error(format!("failed to spawn engine thread: {}", e)))?;

        ready_rx.await.map_err(|_| Error::engine_unavailable())??;

        tokio::spawn(sweep_loop(commands.downgrade(), config.sweep_interval));

        tracing::info!(
            max_contexts = config.max_contexts,
            default_timeout_ms = config.default_timeout.as_millis() as u64,
            "engine started"
        );
        Ok(Self { commands, config })
    }

    /// The configuration the engine was started with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::engine_unavailable())?;
        response.await.map_err(|_| Error::engine_unavailable())
    }

    /// Create a context.
    pub async fn create(&self, id: impl Into<String>, options: ContextOptions) -> Result<ContextInfo> {
        let id = id.into();
        self.request(|reply| Command::Create { id, options, reply })
            .await?
    }

    /// Look a context up and mark it used.
    pub async fn get(&self, id: impl Into<String>) -> Result<ContextInfo> {
        self.info(id).await
    }

    /// Summary of a context, including binding names.
    pub async fn info(&self, id: impl Into<String>) -> Result<ContextInfo> {
        let id = id.into();
        self.request(|reply| Command::Info { id, reply }).await?
    }

    /// Every live context, most recently used first.
    pub async fn list(&self, include_details: bool) -> Result<Vec<ContextInfo>> {
        self.request(|reply| Command::List {
            include_details,
            reply,
        })
        .await
    }

    /// Remove a context.
    pub async fn destroy(&self, id: impl Into<String>) -> Result<bool> {
        let id = id.into();
        self.request(|reply| Command::Destroy { id, reply }).await?
    }

    /// A fresh context id.
    pub async fn generate_id(&self) -> Result<String> {
        self.request(|reply| Command::GenerateId { reply }).await
    }

    /// Run code.
    ///
    /// The run races a deadline of the effective timeout plus a small grace.
    /// If the deadline wins, a `Timeout` result is returned and the engine is
    /// told to stop; the engine thread may stay busy until its own
    /// interrupt check notices.
    pub async fn run(&self, code: impl Into<String>, options: RunOptions) -> Result<ExecutionResult> {
        let target = match &options.context_id {
            Some(id) => Target::Existing(id.clone()),
            None => Target::Ephemeral(self.generate_id().await?),
        };
        let context_id = target.id().to_string();
        let timeout = self.config.effective_timeout(options.timeout_ms);
        let cancel = Arc::new(AtomicBool::new(false));
        let started = Instant::now();

        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Run {
                code: code.into(),
                target,
                options,
                cancel: cancel.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::engine_unavailable())?;

        match tokio::time::timeout(timeout + DEADLINE_GRACE, response).await {
            Ok(result) => result.map_err(|_| Error::engine_unavailable())?,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                tracing::warn!(
                    context_id = %context_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "run did not settle before its deadline"
                );
                Ok(ExecutionResult::timed_out(context_id, timeout, started.elapsed()))
            }
        }
    }

    /// Evaluate an expression.
    pub async fn evaluate(
        &self,
        expression: impl AsRef<str>,
        options: EvaluateOptions,
    ) -> Result<ExecutionResult> {
        self.run(expression_source(expression.as_ref()), options.into())
            .await
    }

    /// Fail if script heap usage is above the configured ceiling.
    pub async fn memory_check(&self) -> Result<bool> {
        self.request(|reply| Command::MemoryCheck { reply }).await?
    }

    /// Evict idle contexts now; returns the evicted ids.
    pub async fn sweep_idle(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::Sweep { reply: Some(reply) })
            .await
    }

    /// Drop every context and stop the engine thread.
    ///
    /// Returns how many contexts were dropped. Every handle fails with
    /// `ContextError` afterwards.
    pub async fn shutdown(&self) -> Result<usize> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// Body of the engine thread.
fn worker_loop(
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    mut commands: mpsc::Receiver<Command>,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut engine = match ExecutionEngine::new(config, clock) {
        Ok(engine) => {
            let _ = ready.send(Ok(()));
            engine
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Create { id, options, reply } => {
                let _ = reply.send(engine.registry_mut().create(&id, options));
            }
            Command::Info { id, reply } => {
                let _ = reply.send(engine.registry_mut().info(&id));
            }
            Command::List {
                include_details,
                reply,
            } => {
                let _ = reply.send(engine.registry().list(include_details));
            }
            Command::Destroy { id, reply } => {
                let _ = reply.send(engine.registry_mut().destroy(&id));
            }
            Command::GenerateId { reply } => {
                let _ = reply.send(engine.registry().generate_id());
            }
            Command::Run {
                code,
                target,
                options,
                cancel,
                reply,
            } => {
                let result = engine.run_in(&code, target, &options, Some(cancel));
                if reply.send(result).is_err() {
                    tracing::debug!("run finished after its caller gave up");
                }
            }
            Command::MemoryCheck { reply } => {
                let _ = reply.send(engine.registry().memory_check());
            }
            Command::Sweep { reply } => {
                let evicted = engine.registry_mut().sweep_idle();
                if let Some(reply) = reply {
                    let _ = reply.send(evicted);
                }
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(engine.shutdown());
                break;
            }
        }
    }

    let remaining = engine.shutdown();
    tracing::info!(remaining, "engine stopped");
}

/// Periodic idle sweep. Ends once every handle is gone or the engine stops.
async fn sweep_loop(commands: mpsc::WeakSender<Command>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(commands) = commands.upgrade() else {
            break;
        };
        if commands.send(Command::Sweep { reply: None }).await.is_err() {
            break;
        }
    }
    tracing::debug!("idle sweep stopped");
}
