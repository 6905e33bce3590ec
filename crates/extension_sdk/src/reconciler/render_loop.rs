use std::time::Duration;

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, trace, warn};

use crate::{bus::MessageBus, message::CoreAction};

use super::{Container, Element};

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(16);

/// Cheap, cloneable entry point for scheduling renders. When every handle is
/// dropped the loop flushes one last time and exits.
#[derive(Clone, Debug)]
pub struct RenderHandle {
    tx: mpsc::UnboundedSender<Element>,
}

impl RenderHandle {
    /// Reconcile `element` now and schedule a commit. Returns `false` once the
    /// loop is gone.
    pub fn render(&self, element: Element) -> bool {
        self.tx.send(element).is_ok()
    }
}

/// Owns the [`Container`] and coalesces renders: the first dirtying render
/// after a commit arms a deadline `interval` away, later renders before it
/// only update the tree, and one commit goes out when it fires.
pub struct RenderLoop {
    container: Container,
    bus: MessageBus,
    interval: Duration,
    rx: mpsc::UnboundedReceiver<Element>,
}

impl RenderLoop {
    pub fn new(bus: MessageBus, interval: Duration) -> (Self, RenderHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let container = Container::new(bus.clone());
        (Self { container, bus, interval, rx }, RenderHandle { tx })
    }

    pub async fn run(mut self) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                next = self.rx.recv() => match next {
                    Some(element) => {
                        self.container.reconcile(element);
                        if deadline.is_none() && self.container.is_dirty() {
                            deadline = Some(Instant::now() + self.interval);
                        }
                    }
                    None => {
                        self.flush();
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush();
                }
            }
        }
        debug!("render loop stopped");
    }

    fn flush(&mut self) {
        let Some(commit) = self.container.commit() else {
            trace!("nothing to commit");
            return;
        };
        match serde_json::to_value(&commit) {
            Ok(payload) => self.bus.emit(CoreAction::Render.as_ref(), payload),
            Err(err) => warn!(error = %err, "render commit could not be serialised"),
        }
    }
}

pub fn spawn_render_loop(bus: MessageBus, interval: Duration) -> (RenderHandle, JoinHandle<()>) {
    let (render_loop, handle) = RenderLoop::new(bus, interval);
    (handle, tokio::spawn(render_loop.run()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use serde_json::json;

    fn detail(text: &str) -> Element {
        Element::new("Detail").prop("markdown", text)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_renders_yields_one_commit_with_last_state() {
        let (bus, mut rx) = MessageBus::channel();
        let (handle, task) = spawn_render_loop(bus, DEFAULT_COMMIT_INTERVAL);

        for n in 1..=5 {
            assert!(handle.render(detail(&format!("state {n}"))));
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        match rx.recv().await.unwrap() {
            Envelope::Event(event) => {
                assert_eq!(event.action, "render");
                assert_eq!(event.payload["root"]["props"]["markdown"], json!("state 5"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        drop(handle);
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn renders_in_separate_windows_commit_separately() {
        let (bus, mut rx) = MessageBus::channel();
        let (handle, _task) = spawn_render_loop(bus, DEFAULT_COMMIT_INTERVAL);

        handle.render(detail("one"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.render(detail("two"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut seen = Vec::new();
        while let Ok(Envelope::Event(event)) = rx.try_recv() {
            seen.push(event.payload["root"]["props"]["markdown"].clone());
        }
        assert_eq!(seen, vec![json!("one"), json!("two")]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_flushes_pending_render() {
        let (bus, mut rx) = MessageBus::channel();
        let (handle, task) = spawn_render_loop(bus, Duration::from_secs(60));
        handle.render(detail("last"));
        drop(handle);
        task.await.unwrap();

        match rx.try_recv().unwrap() {
            Envelope::Event(event) => assert_eq!(event.payload["root"]["props"]["markdown"], json!("last")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
