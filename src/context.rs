//! Execution-context launchers.
//!
//! A launcher turns [`LoadParams`] into a running context and hands back the
//! two envelope channels plus the means to stop it. The Session Manager never
//! sees whether a context is a tokio task or a child process.

use std::{io, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use extension_sdk::{
    envelope::{Envelope, EnvelopeCodec},
    frame::{FrameCodec, FrameError},
    message::LoadParams,
    runtime::{spawn_in_process, ContextChannels, Extension, RuntimeConfig},
};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    process::{Child, Command as TokioCommand},
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("no extension registered for entrypoint `{0}`")]
    UnknownEntrypoint(String),
    #[error("could not start `{entrypoint}`: {source}")]
    Spawn {
        entrypoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` has no {1} pipe")]
    MissingPipe(String, &'static str),
    #[error("launch record could not be sent: {0}")]
    Handshake(#[from] FrameError),
}

/// Asks a running context to stop. Dropping it without calling
/// [`terminate`](Self::terminate) leaves the context running.
#[derive(Debug)]
pub struct Terminator(oneshot::Sender<()>);

impl Terminator {
    /// The context side watches `rx` and stops when it fires.
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self(tx)
    }

    pub fn terminate(self) {
        let _ = self.0.send(());
    }
}

/// Resolves with a human-readable reason once the context is gone.
#[derive(Debug)]
pub struct ExitStatus(oneshot::Receiver<String>);

impl ExitStatus {
    pub fn new(rx: oneshot::Receiver<String>) -> Self {
        Self(rx)
    }

    pub async fn reason(self) -> String {
        self.0.await.unwrap_or_else(|_| "execution context vanished".to_string())
    }
}

/// A launched context. `from_context` yields `None` once the context has
/// ended, for whatever reason.
pub struct ContextHandle {
    pub to_context: mpsc::UnboundedSender<Envelope>,
    pub from_context: mpsc::UnboundedReceiver<Envelope>,
    pub terminator: Terminator,
    pub exit: ExitStatus,
}

#[async_trait]
pub trait ContextLauncher: Send + Sync {
    async fn launch(&self, params: &LoadParams) -> Result<ContextHandle, LaunchError>;
}

// -----------------------------------------------------------------------------
// In-process contexts
// -----------------------------------------------------------------------------

pub type ExtensionFactory = Arc<dyn Fn() -> Box<dyn Extension> + Send + Sync>;

/// Runs registered extensions as tokio tasks inside the host process.
#[derive(Clone)]
pub struct InProcessLauncher {
    factories: Arc<DashMap<String, ExtensionFactory>>,
    config: RuntimeConfig,
}

impl InProcessLauncher {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { factories: Arc::new(DashMap::new()), config }
    }

    /// Registers a factory; each `load` of `entrypoint` gets a fresh extension.
    pub fn register<F, E>(&self, entrypoint: &str, factory: F)
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension,
    {
        let factory: ExtensionFactory = Arc::new(move || Box::new(factory()) as Box<dyn Extension>);
        if self.factories.insert(entrypoint.to_string(), factory).is_some() {
            warn!(entrypoint, "replacing registered extension");
        }
    }

    pub fn entrypoints(&self) -> Vec<String> {
        self.factories.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ContextLauncher for InProcessLauncher {
    async fn launch(&self, params: &LoadParams) -> Result<ContextHandle, LaunchError> {
        let factory = self
            .factories
            .get(&params.entrypoint)
            .map(|f| f.value().clone())
            .ok_or_else(|| LaunchError::UnknownEntrypoint(params.entrypoint.clone()))?;

        let ContextChannels { to_context, from_context, mut task } = spawn_in_process(factory(), params.clone(), self.config);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let joined = tokio::select! {
                Ok(()) = kill_rx => None,
                joined = &mut task => Some(joined),
            };
            let reason = match joined {
                None => {
                    task.abort();
                    "unloaded".to_string()
                }
                Some(Ok(Ok(()))) => "finished".to_string(),
                Some(Ok(Err(err))) => format!("failed: {err:#}"),
                Some(Err(err)) if err.is_panic() => "panicked".to_string(),
                Some(Err(err)) => format!("aborted: {err}"),
            };
            let _ = exit_tx.send(reason);
        });

        Ok(ContextHandle { to_context, from_context, terminator: Terminator(kill_tx), exit: ExitStatus(exit_rx) })
    }
}

// -----------------------------------------------------------------------------
// Child-process contexts
// -----------------------------------------------------------------------------

/// How long a child that closed its stdout gets to exit on its own.
pub const DEFAULT_OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Starts the entrypoint as an executable speaking framed envelopes on its
/// stdin/stdout. Its stderr is inherited so its logs land next to ours, and
/// its environment carries the host's [`RuntimeConfig`] (see
/// [`RuntimeConfig::from_env`]).
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    /// Relative entrypoints resolve against this directory.
    base_dir: Option<PathBuf>,
    runtime: RuntimeConfig,
    output_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(base_dir: Option<PathBuf>, runtime: RuntimeConfig) -> Self {
        Self { base_dir, runtime, output_grace: DEFAULT_OUTPUT_GRACE }
    }

    pub fn with_output_grace(mut self, grace: Duration) -> Self {
        self.output_grace = grace;
        self
    }

    fn resolve(&self, entrypoint: &str) -> PathBuf {
        let path = PathBuf::from(entrypoint);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }

    fn command(&self, entrypoint: &str) -> TokioCommand {
        let mut command = TokioCommand::new(self.resolve(entrypoint));
        command
            .envs(self.runtime.env_vars())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }
}

enum Ending {
    Unloaded,
    Exited(io::Result<std::process::ExitStatus>),
    OutputClosed,
}

fn describe_exit(status: io::Result<std::process::ExitStatus>) -> String {
    match status {
        Ok(status) if status.success() => "finished".to_string(),
        Ok(status) => format!("exited with {status}"),
        Err(err) => format!("lost track of process: {err}"),
    }
}

async fn kill(child: &mut Child, entrypoint: &str) {
    if let Err(err) = child.kill().await {
        warn!(entrypoint, error = %err, "could not kill execution context");
    }
}

#[async_trait]
impl ContextLauncher for ProcessLauncher {
    async fn launch(&self, params: &LoadParams) -> Result<ContextHandle, LaunchError> {
        let max_frame_len = self.runtime.max_frame_len;
        let mut child = self
            .command(&params.entrypoint)
            .spawn()
            .map_err(|source| LaunchError::Spawn { entrypoint: params.entrypoint.clone(), source })?;
        info!(entrypoint = %params.entrypoint, pid = ?child.id(), "execution context process started");

        let stdin = child.stdin.take().ok_or_else(|| LaunchError::MissingPipe(params.entrypoint.clone(), "stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| LaunchError::MissingPipe(params.entrypoint.clone(), "stdout"))?;

        // The launch record goes first, as a bare frame.
        let mut writer = FramedWrite::new(stdin, FrameCodec::with_max_frame_len(max_frame_len));
        let record = serde_json::to_vec(params).map_err(FrameError::from)?;
        writer.send(Bytes::from(record)).await?;
        let mut writer = writer.map_encoder(EnvelopeCodec::new);

        let (to_context, mut inbound) = mpsc::unbounded_channel::<Envelope>();
        let (outbound, from_context) = mpsc::unbounded_channel::<Envelope>();
        let entrypoint = params.entrypoint.clone();

        // ── task that proxies to_context → child.stdin ────────────────────
        tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                if let Err(err) = writer.send(envelope).await {
                    debug!(error = %err, "context stdin closed");
                    break;
                }
            }
        });

        // ── task that reads child.stdout → from_context ───────────────────
        let mut reader = FramedRead::new(stdout, EnvelopeCodec::new(FrameCodec::with_max_frame_len(max_frame_len)));
        let reader_entrypoint = entrypoint.clone();
        let (output_closed, output_closed_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            while let Some(next) = reader.next().await {
                match next {
                    Ok(envelope) => {
                        if outbound.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(entrypoint = %reader_entrypoint, error = %err, "context stdout unusable");
                        break;
                    }
                }
            }
            let _ = output_closed.send(());
        });

        // ── supervisor: kill on request or once stdout is gone for good ───
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let grace = self.output_grace;
        tokio::spawn(async move {
            let ending = tokio::select! {
                Ok(()) = kill_rx => Ending::Unloaded,
                status = child.wait() => Ending::Exited(status),
                Ok(()) = output_closed_rx => Ending::OutputClosed,
            };
            let reason = match ending {
                Ending::Unloaded => {
                    kill(&mut child, &entrypoint).await;
                    "unloaded".to_string()
                }
                Ending::Exited(status) => describe_exit(status),
                // Without stdout nothing the context does can reach the host.
                Ending::OutputClosed => match timeout(grace, child.wait()).await {
                    Ok(status) => describe_exit(status),
                    Err(_) => {
                        warn!(entrypoint = %entrypoint, "context closed its output but kept running, killing it");
                        kill(&mut child, &entrypoint).await;
                        "closed its output without exiting".to_string()
                    }
                },
            };
            let _ = exit_tx.send(reason);
        });

        Ok(ContextHandle { to_context, from_context, terminator: Terminator(kill_tx), exit: ExitStatus(exit_rx) })
    }
}
