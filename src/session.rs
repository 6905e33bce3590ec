//! Owns running execution contexts and routes envelopes between the host and
//! them.
//!
//! Every session gets one forwarding task that drains its context's outbound
//! channel, so a slow or stuck context never holds up routing for the others.
//! Host → context traffic goes over an unbounded channel and never blocks.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use extension_sdk::{
    envelope::{
        Envelope, Event, Request, Response, ACTION_NOT_FOUND, CONTEXT_TERMINATED, INTERNAL_ERROR, INVALID_PARAMS,
        UNKNOWN_SESSION,
    },
    message::{CoreAction, LoadParams, LoadResult, SessionInfo, SessionTerminated, UnloadParams},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{error::SendError, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::context::{ContextHandle, ContextLauncher, ExitStatus, LaunchError, Terminator};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No running command with session {0}")]
    UnknownSession(String),
    #[error("invalid parameters for `{action}`: {reason}")]
    InvalidParams { action: String, reason: String },
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl SessionError {
    /// Error code used when the failure is reported in a response envelope.
    pub fn code(&self) -> i64 {
        match self {
            SessionError::UnknownSession(_) => UNKNOWN_SESSION,
            SessionError::InvalidParams { .. } => INVALID_PARAMS,
            SessionError::Launch(_) => INTERNAL_ERROR,
        }
    }
}

struct Session {
    info: SessionInfo,
    to_context: UnboundedSender<Envelope>,
    terminator: Terminator,
    /// Host-originated requests the context has not answered yet.
    host_requests: Arc<DashSet<String>>,
    forwarder: JoinHandle<()>,
}

/// A context-originated request waiting for the host's answer.
struct ContextRequest {
    session_id: String,
    /// The id the context chose; the host only ever sees the upstream id.
    original_id: String,
}

struct ManagerInner {
    launcher: Arc<dyn ContextLauncher>,
    upstream: UnboundedSender<Envelope>,
    sessions: DashMap<String, Session>,
    /// Keyed by upstream id, `<sessionId>:<original id>`.
    context_requests: DashMap<String, ContextRequest>,
    next_session: AtomicU64,
}

impl ManagerInner {
    fn send_upstream(&self, envelope: Envelope) {
        if self.upstream.send(envelope).is_err() {
            debug!("upstream closed, dropping envelope");
        }
    }

    /// Stops the context and drops its routes. Host requests still waiting on
    /// it are answered right away.
    fn retire(&self, session_id: &str, session: Session) {
        session.terminator.terminate();
        session.forwarder.abort();
        self.context_requests.retain(|_, pending| pending.session_id != session_id);

        for request_id in session.host_requests.iter() {
            let response = Response::fail(request_id.key().clone(), CONTEXT_TERMINATED, "Execution context terminated", None);
            self.send_upstream(Envelope::from(response).with_session_id(session_id));
        }
    }

    fn notify_terminated(&self, session_id: &str, reason: &str) {
        let terminated = SessionTerminated { session_id: session_id.to_string(), reason: reason.to_string() };
        match serde_json::to_value(&terminated) {
            Ok(payload) => self.send_upstream(Event::new(CoreAction::SessionTerminated.as_ref(), payload).into()),
            Err(err) => warn!(session_id, error = %err, "could not encode termination notice"),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// `upstream` carries everything the manager sends to the host.
    pub fn new(launcher: Arc<dyn ContextLauncher>, upstream: UnboundedSender<Envelope>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                launcher,
                upstream,
                sessions: DashMap::new(),
                context_requests: DashMap::new(),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub async fn load(&self, params: LoadParams) -> Result<LoadResult, SessionError> {
        let (result, registered) = self.start(params).await?;
        let _ = registered.send(());
        Ok(result)
    }

    /// Launches and registers a session. Its forwarder holds the context's
    /// traffic back until `registered` fires, so the caller can put the load
    /// response on the wire first.
    async fn start(&self, params: LoadParams) -> Result<(LoadResult, oneshot::Sender<()>), SessionError> {
        let ContextHandle { to_context, from_context, terminator, exit } = self.inner.launcher.launch(&params).await?;

        let session_id = format!("S{}", self.inner.next_session.fetch_add(1, Ordering::Relaxed));
        let host_requests = Arc::new(DashSet::new());
        let (registered, ready) = oneshot::channel();
        let forwarder = tokio::spawn(forward(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            ready,
            from_context,
            exit,
            host_requests.clone(),
        ));

        let info = SessionInfo {
            session_id: session_id.clone(),
            entrypoint: params.entrypoint.clone(),
            mode: params.mode,
            created_at: Utc::now(),
        };
        self.inner
            .sessions
            .insert(session_id.clone(), Session { info, to_context, terminator, host_requests, forwarder });
        info!(session_id = %session_id, entrypoint = %params.entrypoint, mode = %params.mode, "session loaded");

        Ok((LoadResult { session_id }, registered))
    }

    /// Terminates the context regardless of in-flight requests. Late traffic
    /// from it is dropped.
    pub fn unload(&self, session_id: &str) -> Result<(), SessionError> {
        let (_, session) = self
            .inner
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))?;
        self.inner.retire(session_id, session);
        info!(session_id, "session unloaded");
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.inner.sessions.iter().map(|s| s.info.clone()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.session_id.cmp(&b.session_id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Terminates every session, e.g. because the host channel closed.
    pub fn shutdown_all(&self, reason: &str) {
        let ids: Vec<String> = self.inner.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.inner.sessions.remove(&id) {
                self.inner.retire(&id, session);
                self.inner.notify_terminated(&id, reason);
            }
        }
        info!(reason, "all sessions shut down");
    }

    /// Entry point for everything the host sends.
    pub async fn route(&self, mut envelope: Envelope) {
        let session_id = envelope.take_session_id();
        let envelope = match envelope {
            // Responses find their context through the upstream id alone.
            Envelope::Response(response) => return self.route_response(response),
            other => other,
        };
        let Some(session_id) = session_id else {
            self.route_unscoped(envelope).await;
            return;
        };

        let (envelope, code, message) = match self.inner.sessions.get(&session_id) {
            Some(session) => {
                let request_id = match &envelope {
                    Envelope::Request(request) => Some(request.id.clone()),
                    _ => None,
                };
                if let Some(id) = &request_id {
                    session.host_requests.insert(id.clone());
                }
                match session.to_context.send(envelope) {
                    Ok(()) => return,
                    Err(SendError(envelope)) => {
                        // The context is gone but not retired yet. Untrack the
                        // request so it is answered here and only here.
                        if let Some(id) = &request_id {
                            session.host_requests.remove(id);
                        }
                        (envelope, CONTEXT_TERMINATED, "Execution context terminated".to_string())
                    }
                }
            }
            None => (envelope, UNKNOWN_SESSION, SessionError::UnknownSession(session_id.clone()).to_string()),
        };

        warn!(session_id = %session_id, action = ?envelope.action(), "traffic for unreachable session dropped");
        if let Envelope::Request(request) = envelope {
            let response = Response::fail(request.id, code, message, None);
            self.inner.send_upstream(Envelope::from(response).with_session_id(session_id));
        }
    }

    /// Hands the host's answer back to the context that asked, under the id
    /// that context chose.
    fn route_response(&self, mut response: Response) {
        let Some((_, pending)) = self.inner.context_requests.remove(&response.id) else {
            debug!(request_id = %response.id, "response for unknown request dropped");
            return;
        };
        response.id = pending.original_id;
        let delivered = self
            .inner
            .sessions
            .get(&pending.session_id)
            .map(|s| s.to_context.send(response.into()).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(session_id = %pending.session_id, "response for a session that is gone");
        }
    }

    /// Manager operations.
    async fn route_unscoped(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request(request) => {
                let (response, registered) = self.handle_manager_request(&request).await;
                self.inner.send_upstream(response.into());
                if let Some(registered) = registered {
                    let _ = registered.send(());
                }
            }
            Envelope::Response(response) => self.route_response(response),
            Envelope::Event(event) => {
                warn!(action = %event.action, "event without session id dropped");
            }
        }
    }

    /// A successful `load` also hands back the signal that releases the new
    /// session's traffic.
    async fn handle_manager_request(&self, request: &Request) -> (Response, Option<oneshot::Sender<()>>) {
        let mut registered = None;
        let outcome = match request.action.parse::<CoreAction>() {
            Ok(CoreAction::Load) => match params::<LoadParams>(request) {
                Ok(p) => self.start(p).await.and_then(|(result, signal)| {
                    registered = Some(signal);
                    to_value(&request.action, &result)
                }),
                Err(err) => Err(err),
            },
            Ok(CoreAction::Unload) => {
                params::<UnloadParams>(request).and_then(|p| self.unload(&p.session_id)).map(|()| Value::Null)
            }
            Ok(CoreAction::List) => to_value(&request.action, &self.list()),
            _ => {
                warn!(action = %request.action, "unknown manager action");
                let response = Response::fail(
                    request.id.clone(),
                    ACTION_NOT_FOUND,
                    format!("Action not found: {}", request.action),
                    None,
                );
                return (response, None);
            }
        };

        let response = match outcome {
            Ok(payload) => Response::success(request.id.clone(), payload),
            Err(err) => {
                warn!(action = %request.action, error = %err, "manager request failed");
                Response::fail(request.id.clone(), err.code(), err.to_string(), None)
            }
        };
        (response, registered)
    }
}

fn params<T: DeserializeOwned>(request: &Request) -> Result<T, SessionError> {
    serde_json::from_value(request.payload.clone())
        .map_err(|err| SessionError::InvalidParams { action: request.action.clone(), reason: err.to_string() })
}

fn to_value<T: serde::Serialize>(action: &str, value: &T) -> Result<Value, SessionError> {
    serde_json::to_value(value).map_err(|err| SessionError::InvalidParams { action: action.to_string(), reason: err.to_string() })
}

/// Drains one context. When its channel closes while the session is still
/// registered, the context crashed or exited on its own.
async fn forward(
    manager: Weak<ManagerInner>,
    session_id: String,
    ready: oneshot::Receiver<()>,
    mut from_context: UnboundedReceiver<Envelope>,
    exit: ExitStatus,
    host_requests: Arc<DashSet<String>>,
) {
    // Exit handling looks the session up, so wait until it is registered. The
    // signal only goes away unsent once registration is done.
    let _ = ready.await;
    while let Some(envelope) = from_context.recv().await {
        let Some(manager) = manager.upgrade() else { return };
        let envelope = match envelope {
            Envelope::Request(mut request) => {
                // Contexts pick their own ids; scope them so no two sessions
                // can collide upstream.
                let upstream_id = format!("{session_id}:{}", request.id);
                let original_id = std::mem::replace(&mut request.id, upstream_id.clone());
                manager
                    .context_requests
                    .insert(upstream_id, ContextRequest { session_id: session_id.clone(), original_id });
                Envelope::Request(request)
            }
            Envelope::Response(response) => {
                if host_requests.remove(&response.id).is_none() {
                    debug!(session_id = %session_id, request_id = %response.id, "context answered an unknown request");
                    continue;
                }
                Envelope::Response(response)
            }
            event => event,
        };
        // Whatever tag the context put on it, the manager's wins.
        manager.send_upstream(envelope.with_session_id(session_id.as_str()));
    }

    let reason = exit.reason().await;
    let Some(manager) = manager.upgrade() else { return };
    if let Some((_, session)) = manager.sessions.remove(&session_id) {
        warn!(session_id = %session_id, reason = %reason, "execution context terminated");
        manager.retire(&session_id, session);
        manager.notify_terminated(&session_id, &reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextLauncher, ExitStatus, InProcessLauncher, LaunchError, Terminator};
    use async_trait::async_trait;
    use extension_sdk::{
        message::CommandMode,
        runtime::{CommandContext, Extension, RuntimeConfig},
        RequestOptions,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// The test's side of a launched context.
    struct Scripted {
        input: mpsc::UnboundedReceiver<Envelope>,
        output: mpsc::UnboundedSender<Envelope>,
        exit: oneshot::Sender<String>,
    }

    /// Hands each launched context to the test instead of running anything.
    #[derive(Default)]
    struct ScriptedLauncher {
        launched: Mutex<Vec<Scripted>>,
    }

    impl ScriptedLauncher {
        fn take(&self) -> Scripted {
            self.launched.lock().unwrap().remove(0)
        }
    }

    #[async_trait]
    impl ContextLauncher for ScriptedLauncher {
        async fn launch(&self, _params: &LoadParams) -> Result<ContextHandle, LaunchError> {
            let (to_context, input) = mpsc::unbounded_channel();
            let (output, from_context) = mpsc::unbounded_channel();
            let (kill_tx, _kill_rx) = oneshot::channel();
            let (exit, exit_rx) = oneshot::channel();
            self.launched.lock().unwrap().push(Scripted { input, output, exit });
            Ok(ContextHandle {
                to_context,
                from_context,
                terminator: Terminator::new(kill_tx),
                exit: ExitStatus::new(exit_rx),
            })
        }
    }

    fn scripted() -> (SessionManager, Arc<ScriptedLauncher>, mpsc::UnboundedReceiver<Envelope>) {
        let launcher = Arc::new(ScriptedLauncher::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionManager::new(launcher.clone(), tx), launcher, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("nothing upstream")
            .expect("upstream closed")
    }

    struct Idle;

    #[async_trait]
    impl Extension for Idle {
        async fn run(&mut self, _cx: CommandContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Asker;

    #[async_trait]
    impl Extension for Asker {
        async fn run(&mut self, cx: CommandContext) -> anyhow::Result<()> {
            let value = cx.request("storage.get", json!({"key": "x"}), RequestOptions::timeout_ms(1000)).await?;
            cx.emit("got", value);
            Ok(())
        }
    }

    fn manager() -> (SessionManager, mpsc::UnboundedReceiver<Envelope>) {
        let launcher = InProcessLauncher::new(RuntimeConfig::default());
        launcher.register("idle", || Idle);
        launcher.register("asker", || Asker);
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionManager::new(Arc::new(launcher), tx), rx)
    }

    #[tokio::test]
    async fn session_ids_are_sequential() {
        let (mgr, _rx) = manager();
        let a = mgr.load(LoadParams::new("idle", CommandMode::View)).await.unwrap();
        let b = mgr.load(LoadParams::new("idle", CommandMode::View)).await.unwrap();
        assert_eq!(a.session_id, "S1");
        assert_eq!(b.session_id, "S2");

        let listed: Vec<_> = mgr.list().into_iter().map(|s| s.session_id).collect();
        assert_eq!(listed, vec!["S1", "S2"]);
    }

    #[tokio::test]
    async fn unload_unknown_session_reports_exact_message() {
        let (mgr, _rx) = manager();
        let err = mgr.unload("S9").unwrap_err();
        assert_eq!(err.to_string(), "No running command with session S9");
        assert_eq!(err.code(), UNKNOWN_SESSION);
    }

    #[tokio::test]
    async fn failed_launch_registers_nothing() {
        let (mgr, _rx) = manager();
        let err = mgr.load(LoadParams::new("nope", CommandMode::View)).await.unwrap_err();
        assert!(matches!(err, SessionError::Launch(_)));
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn context_request_round_trips_through_host() {
        let (mgr, mut rx) = manager();
        let sid = mgr.load(LoadParams::new("asker", CommandMode::NoView)).await.unwrap().session_id;

        let request = match rx.recv().await.unwrap() {
            Envelope::Request(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(request.session_id.as_deref(), Some(sid.as_str()));
        assert_eq!(request.action, "storage.get");

        // The host answers by correlation id alone.
        mgr.route(Response::success(request.id, json!({"value": "bar"})).into()).await;

        match rx.recv().await.unwrap() {
            Envelope::Event(e) => {
                assert_eq!(e.action, "got");
                assert_eq!(e.session_id.as_deref(), Some(sid.as_str()));
                assert_eq!(e.payload["value"], json!("bar"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_request_for_unknown_session_gets_error_response() {
        let (mgr, mut rx) = manager();
        let request = Request { id: "r1".into(), action: "anything".into(), payload: json!(null), session_id: Some("S7".into()) };
        mgr.route(request.into()).await;

        match rx.recv().await.unwrap() {
            Envelope::Response(r) => {
                assert_eq!(r.id, "r1");
                assert_eq!(r.session_id.as_deref(), Some("S7"));
                assert_eq!(r.error.unwrap().code, UNKNOWN_SESSION);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn list_request_is_answered_by_manager() {
        let (mgr, mut rx) = manager();
        mgr.load(LoadParams::new("idle", CommandMode::View)).await.unwrap();
        mgr.route(Request { id: "l1".into(), action: "list".into(), payload: json!(null), session_id: None }.into())
            .await;

        match rx.recv().await.unwrap() {
            Envelope::Response(r) => {
                let sessions: Vec<SessionInfo> = serde_json::from_value(r.payload.unwrap()).unwrap();
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].entrypoint, "idle");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_to_a_dead_context_is_rejected_once() {
        let (mgr, launcher, mut rx) = scripted();
        mgr.load(LoadParams::new("gone", CommandMode::NoView)).await.unwrap();
        let Scripted { input, output, exit } = launcher.take();

        // The context is gone but its exit has not been reported yet.
        drop(input);
        drop(output);
        tokio::task::yield_now().await;
        let request = Request { id: "h1".into(), action: "work".into(), payload: json!(null), session_id: Some("S1".into()) };
        mgr.route(request.into()).await;
        exit.send("crashed".into()).unwrap();

        let mut answers = Vec::new();
        loop {
            match recv(&mut rx).await {
                Envelope::Response(r) => answers.push(r),
                Envelope::Event(e) if e.action == "sessionTerminated" => {
                    assert_eq!(e.payload["reason"], json!("crashed"));
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].id, "h1");
        assert_eq!(answers[0].session_id.as_deref(), Some("S1"));
        assert_eq!(answers[0].error.as_ref().unwrap().code, CONTEXT_TERMINATED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sessions_may_reuse_request_ids() {
        let (mgr, launcher, mut rx) = scripted();
        mgr.load(LoadParams::new("one", CommandMode::NoView)).await.unwrap();
        mgr.load(LoadParams::new("two", CommandMode::NoView)).await.unwrap();
        let mut first = launcher.take();
        let mut second = launcher.take();

        for ctx in [&first, &second] {
            let ask = Request { id: "dup".into(), action: "storage.get".into(), payload: json!(null), session_id: None };
            ctx.output.send(ask.into()).unwrap();
        }
        let mut upstream = Vec::new();
        for _ in 0..2 {
            match recv(&mut rx).await {
                Envelope::Request(r) => upstream.push((r.session_id.unwrap(), r.id)),
                other => panic!("unexpected {other:?}"),
            }
        }
        upstream.sort();
        assert_eq!(
            upstream,
            vec![("S1".to_string(), "S1:dup".to_string()), ("S2".to_string(), "S2:dup".to_string())]
        );

        mgr.route(Response::success("S1:dup", json!({"value": "secret"})).into()).await;

        match first.input.recv().await.unwrap() {
            Envelope::Response(r) => {
                assert_eq!(r.id, "dup");
                assert_eq!(r.payload, Some(json!({"value": "secret"})));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(second.input.try_recv().is_err());

        // S2's request is still outstanding and gets its own answer.
        mgr.route(Response::success("S2:dup", json!({"value": "other"})).into()).await;
        match second.input.recv().await.unwrap() {
            Envelope::Response(r) => assert_eq!(r.payload, Some(json!({"value": "other"}))),
            other => panic!("unexpected {other:?}"),
        }
    }
}
