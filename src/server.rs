use std::sync::Arc;

use anyhow::{Context as _, Result};
use extension_sdk::{
    envelope::{Envelope, EnvelopeCodec},
    frame::FrameCodec,
};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{error, info};

use crate::{context::ContextLauncher, session::SessionManager};

/// Runs a Session Manager on one duplex byte stream until the host closes its
/// side. Every session is torn down when that happens.
pub async fn serve<R, W>(reader: R, writer: W, launcher: Arc<dyn ContextLauncher>, max_frame_len: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let codec = EnvelopeCodec::new(FrameCodec::with_max_frame_len(max_frame_len));
    let mut inbound = FramedRead::new(reader, codec);
    let mut outbound = FramedWrite::new(writer, codec);

    let (upstream, mut upstream_rx) = mpsc::unbounded_channel::<Envelope>();
    let manager = SessionManager::new(launcher, upstream);
    info!("extension host ready");

    let reason = loop {
        tokio::select! {
            next = inbound.next() => match next {
                Some(Ok(envelope)) => manager.route(envelope).await,
                Some(Err(err)) => {
                    error!(error = %err, "host stream unusable");
                    break format!("host stream failed: {err}");
                }
                None => break "host channel closed".to_string(),
            },
            Some(envelope) = upstream_rx.recv() => {
                outbound.send(envelope).await.context("writing frame to host")?;
            }
        }
    };

    manager.shutdown_all(&reason);
    // Best effort: the host may still be reading.
    while let Ok(envelope) = upstream_rx.try_recv() {
        if outbound.send(envelope).await.is_err() {
            break;
        }
    }
    info!(reason = %reason, "extension host stopped");
    Ok(())
}
