//! Drives an [`Extension`] inside an execution context.
//!
//! Two ways in:
//! * [`spawn_in_process`]: the context is a tokio task; envelopes travel over
//!   unbounded channels.
//! * [`run_stdio`]: the context is a child process; the first frame on stdin
//!   carries the [`InitContext`], then framed envelopes flow both ways.
//!
//! Usage:
//! ```ignore
//! struct Hello;
//!
//! #[async_trait]
//! impl Extension for Hello {
//!     async fn run(&mut self, cx: CommandContext) -> anyhow::Result<()> {
//!         cx.render(Element::new("Detail").prop("markdown", "# Hello"));
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     run_stdio(Hello, RuntimeConfig::from_env()).await
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::{
    io,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{BusError, Incoming, MessageBus, RequestOptions, Subscription},
    envelope::{Envelope, EnvelopeCodec},
    frame::{FrameCodec, DEFAULT_MAX_FRAME_LEN},
    message::{CommandMode, InitContext},
    reconciler::{spawn_render_loop, Element, RenderHandle, DEFAULT_COMMIT_INTERVAL},
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub commit_interval: Duration,
    /// Applied to [`CommandContext::request`] calls that set no timeout.
    pub request_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Variables a host sets on a child context so it runs with the host's
/// settings. The host reads the same names from its own configuration.
pub const COMMIT_INTERVAL_ENV: &str = "EXTENSION_HOST_COMMIT_INTERVAL_MS";
pub const REQUEST_TIMEOUT_ENV: &str = "EXTENSION_HOST_REQUEST_TIMEOUT_MS";
pub const MAX_FRAME_BYTES_ENV: &str = "EXTENSION_HOST_MAX_FRAME_BYTES";

impl RuntimeConfig {
    /// Reads the `EXTENSION_HOST_*` variables a host passed down. Missing or
    /// malformed values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str, default: u64| match lookup(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, "ignoring malformed setting");
                default
            }),
            None => default,
        };
        Self {
            commit_interval: Duration::from_millis(parse(COMMIT_INTERVAL_ENV, defaults.commit_interval.as_millis() as u64)),
            request_timeout: Duration::from_millis(parse(REQUEST_TIMEOUT_ENV, defaults.request_timeout.as_millis() as u64)),
            max_frame_len: parse(MAX_FRAME_BYTES_ENV, defaults.max_frame_len as u64) as usize,
        }
    }

    /// The inverse of [`from_lookup`](Self::from_lookup).
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (COMMIT_INTERVAL_ENV, self.commit_interval.as_millis().to_string()),
            (REQUEST_TIMEOUT_ENV, self.request_timeout.as_millis().to_string()),
            (MAX_FRAME_BYTES_ENV, self.max_frame_len.to_string()),
        ]
    }
}

/// Implemented by every extension command.
///
/// In `view` mode the command stays mounted after `run` returns: its UI keeps
/// rendering and its handlers keep firing until the session is unloaded. In
/// the other modes the context ends when `run` returns. An `Err` or a panic
/// ends the context either way and is reported upstream as a termination.
#[async_trait]
pub trait Extension: Send + 'static {
    async fn run(&mut self, cx: CommandContext) -> Result<()>;
}

#[async_trait]
impl Extension for Box<dyn Extension> {
    async fn run(&mut self, cx: CommandContext) -> Result<()> {
        (**self).run(cx).await
    }
}

/// What an extension sees of its execution context. Cheap to clone, so it can
/// be moved into callbacks.
#[derive(Clone)]
pub struct CommandContext {
    bus: MessageBus,
    init: InitContext,
    renderer: Option<RenderHandle>,
    request_timeout: Duration,
}

impl CommandContext {
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn init(&self) -> &InitContext {
        &self.init
    }

    pub fn mode(&self) -> CommandMode {
        self.init.mode
    }

    pub fn preferences(&self) -> &Map<String, Value> {
        &self.init.preferences
    }

    pub fn launch_arguments(&self) -> &Map<String, Value> {
        &self.init.launch_arguments
    }

    /// Schedule `element` as the new UI snapshot.
    pub fn render(&self, element: Element) {
        match &self.renderer {
            Some(renderer) => {
                if !renderer.render(element) {
                    debug!("render loop already stopped, snapshot dropped");
                }
            }
            None => warn!(mode = %self.init.mode, "render called by a command without a view, ignoring"),
        }
    }

    pub async fn request(&self, action: &str, payload: Value, mut options: RequestOptions) -> Result<Value, BusError> {
        options.timeout.get_or_insert(self.request_timeout);
        self.bus.request(action, payload, options).await
    }

    pub async fn request_as<T: DeserializeOwned>(&self, action: &str, payload: Value) -> Result<T, BusError> {
        self.bus.request_as(action, payload, RequestOptions { timeout: Some(self.request_timeout), ..Default::default() }).await
    }

    pub fn emit(&self, action: &str, payload: Value) {
        self.bus.emit(action, payload)
    }

    pub fn subscribe<F>(&self, action: &str, callback: F) -> Subscription
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        self.bus.subscribe(action, callback)
    }
}

/// Channels to and from an in-process context. `from_context` closes once the
/// context is gone, however it ended.
pub struct ContextChannels {
    pub to_context: UnboundedSender<Envelope>,
    pub from_context: UnboundedReceiver<Envelope>,
    pub task: JoinHandle<Result<()>>,
}

pub fn spawn_in_process<E: Extension>(extension: E, init: InitContext, config: RuntimeConfig) -> ContextChannels {
    let (to_context, inbound) = mpsc::unbounded_channel();
    let (outbound, from_context) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_context(extension, init, config, inbound, outbound));
    ContextChannels { to_context, from_context, task }
}

/// Runs the context until it ends, forwarding everything its bus sends to
/// `outbound`. Dropping `outbound` on return is what tells the other side the
/// context is gone.
async fn run_context<E: Extension>(
    mut extension: E,
    init: InitContext,
    config: RuntimeConfig,
    inbound: UnboundedReceiver<Envelope>,
    outbound: UnboundedSender<Envelope>,
) -> Result<()> {
    let (bus, mut bus_out) = MessageBus::channel();
    let entrypoint = init.entrypoint.clone();

    let drive = drive(&mut extension, init, config, bus.clone(), inbound);
    tokio::pin!(drive);

    let result = loop {
        tokio::select! {
            result = &mut drive => break result,
            Some(envelope) = bus_out.recv() => {
                if outbound.send(envelope).is_err() {
                    debug!(entrypoint = %entrypoint, "context outbound closed");
                }
            }
        }
    };

    while let Ok(envelope) = bus_out.try_recv() {
        let _ = outbound.send(envelope);
    }
    bus.close();

    match &result {
        Ok(()) => info!(entrypoint = %entrypoint, "command finished"),
        Err(err) => error!(entrypoint = %entrypoint, error = %err, "command failed"),
    }
    result
}

async fn drive<E: Extension>(
    extension: &mut E,
    init: InitContext,
    config: RuntimeConfig,
    bus: MessageBus,
    inbound: UnboundedReceiver<Envelope>,
) -> Result<()> {
    let mode = init.mode;
    let mut pump = AbortOnDrop({
        let bus = bus.clone();
        tokio::spawn(async move { bus.pump(inbound).await })
    });

    let (renderer, _render_task) = match mode.renders() {
        true => {
            let (handle, task) = spawn_render_loop(bus.clone(), config.commit_interval);
            (Some(handle), Some(AbortOnDrop(task)))
        }
        false => (None, None),
    };

    let cx = CommandContext { bus, init, renderer, request_timeout: config.request_timeout };
    let result = extension.run(cx).await;

    if result.is_ok() && mode.renders() {
        // Stay mounted until the host side goes away.
        let _ = (&mut pump.0).await;
    }
    result
}

/// Helper tasks die with the context, including when its task is aborted.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Child-process entry point: serve `extension` over framed stdin/stdout.
/// Returns once the command ends or stdin closes.
pub async fn run_stdio<E: Extension>(extension: E, config: RuntimeConfig) -> Result<()> {
    let mut frames = FramedRead::new(io::stdin(), FrameCodec::with_max_frame_len(config.max_frame_len));
    let mut writer = FramedWrite::new(io::stdout(), EnvelopeCodec::new(FrameCodec::with_max_frame_len(config.max_frame_len)));

    // The first frame is the raw launch record, not an envelope.
    let first = frames
        .next()
        .await
        .ok_or_else(|| anyhow!("stdin closed before the launch record arrived"))?
        .context("reading launch record frame")?;
    let init: InitContext = serde_json::from_slice(&first).context("decoding launch record")?;
    info!(entrypoint = %init.entrypoint, mode = %init.mode, "execution context starting");

    // Same buffer from here on, decoded as envelopes.
    let mut reader = frames.map_decoder(EnvelopeCodec::new);
    let ContextChannels { to_context, mut from_context, task } = spawn_in_process(extension, init, config);

    let stdin_task = tokio::spawn(async move {
        while let Some(next) = reader.next().await {
            match next {
                Ok(envelope) => {
                    if to_context.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = %err, "stdin stream unusable");
                    break;
                }
            }
        }
        debug!("stdin closed");
    });

    while let Some(envelope) = from_context.recv().await {
        writer.send(envelope).await.context("writing frame to stdout")?;
    }
    stdin_task.abort();

    task.await.map_err(|err| anyhow!("command task aborted: {err}"))?
}
