//! Host side of the RPC channel
//!
//! One supervisor task per plugin owns the child process and both halves of
//! the framed channel. Callers talk to it through [`RpcClient`], which hands
//! each request a oneshot for its response. Responses may arrive in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use goplug_plugin_api::rpc::protocol::{decode, encode_frame, frame_codec};
use goplug_plugin_api::rpc::{DynamicData, Method, Reply, Request, Response, WireError};
use goplug_plugin_api::{CallbackKind, HookResponse, Identity, Value};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::process::{BoxedChannel, reap};
use crate::error::{PluginHostError, Result};
use crate::lifecycle::{LifecycleState, StateCell};

/// Outcome the plugin sent back; the outer error is the transport's
pub(crate) type CallResult = std::result::Result<Reply, WireError>;

struct Outgoing {
    request: Request,
    reply: oneshot::Sender<CallResult>,
}

/// Exit state of the supervised child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    /// Exited after the host asked it to
    Stopped(String),
    /// Exited on its own or dropped the channel
    Crashed(String),
}

struct ClientInner {
    name: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    status: watch::Receiver<ChildStatus>,
    stopping: Arc<AtomicBool>,
    stop: Mutex<Option<oneshot::Sender<Instant>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    call_timeout: Option<Duration>,
    pid: Option<u32>,
}

/// Cheap, cloneable handle to a supervised RPC plugin
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl RpcClient {
    /// Start supervising `child` over `channel`.
    ///
    /// `state` is moved to FAILED if the child exits without being asked to.
    pub(crate) fn start(
        name: impl Into<String>,
        child: Child,
        channel: BoxedChannel,
        call_timeout: Option<Duration>,
        unload_grace: Duration,
        state: Arc<StateCell>,
    ) -> Self {
        let name = name.into();
        let pid = child.id();
        let (outgoing, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ChildStatus::Running);
        let (stop_tx, stop_rx) = oneshot::channel();
        let stopping = Arc::new(AtomicBool::new(false));

        let supervisor = Supervisor {
            name: name.clone(),
            child,
            requests: rx,
            stop: stop_rx,
            stopping: Arc::clone(&stopping),
            unload_grace,
            state,
            status: status_tx,
        };
        let handle = tokio::spawn(supervisor.run(channel));

        Self {
            inner: Arc::new(ClientInner {
                name,
                next_id: AtomicU64::new(1),
                outgoing,
                status,
                stopping,
                stop: Mutex::new(Some(stop_tx)),
                supervisor: Mutex::new(Some(handle)),
                call_timeout,
                pid,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// OS process id of the child, while it runs
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn status(&self) -> ChildStatus {
        self.inner.status.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.status() != ChildStatus::Running
    }

    fn closed(&self) -> PluginHostError {
        PluginHostError::ChannelClosed {
            name: self.inner.name.clone(),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A call that exceeds the configured deadline fails with `RPC_TIMEOUT`; the
    /// channel stays usable and the late response is discarded.
    pub(crate) async fn call(&self, service: &str, method: Method) -> Result<CallResult> {
        self.call_within(service, method, self.inner.call_timeout).await
    }

    async fn call_within(
        &self,
        service: &str,
        method: Method,
        deadline: Option<Duration>,
    ) -> Result<CallResult> {
        if self.is_closed() {
            return Err(self.closed());
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let method_name = method.name();
        let (reply, rx) = oneshot::channel();
        let request = Request {
            id,
            service: service.to_string(),
            method,
        };
        self.inner
            .outgoing
            .send(Outgoing { request, reply })
            .map_err(|_| self.closed())?;

        let received = match deadline {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(plugin = %self.inner.name, method = method_name, ?timeout, "RPC call timed out");
                    return Err(PluginHostError::RpcTimeout {
                        name: self.inner.name.clone(),
                        method: method_name.to_string(),
                        timeout,
                    });
                }
            },
            None => rx.await,
        };
        received.map_err(|_| self.closed())
    }

    fn unexpected(&self, reply: Reply) -> PluginHostError {
        PluginHostError::Protocol {
            name: self.inner.name.clone(),
            message: format!("unexpected reply {reply:?}"),
        }
    }

    fn wire(&self, error: WireError) -> PluginHostError {
        match error {
            WireError::Dispatch { error } => PluginHostError::Dispatch(error),
            other => PluginHostError::Protocol {
                name: self.inner.name.clone(),
                message: other.to_string(),
            },
        }
    }

    pub async fn identify(&self, service: &str) -> Result<Identity> {
        match self.call(service, Method::Identify).await? {
            Ok(Reply::Identity(identity)) => Ok(identity),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(self.wire(e)),
        }
    }

    pub async fn identify_string(&self, service: &str) -> Result<String> {
        match self.call(service, Method::IdentifyString).await? {
            Ok(Reply::IdentityString(text)) => Ok(text),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(self.wire(e)),
        }
    }

    pub async fn get_data(&self, service: &str) -> Result<DynamicData> {
        match self.call(service, Method::GetData).await? {
            Ok(Reply::Data(data)) => Ok(data),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(self.wire(e)),
        }
    }

    pub async fn list_services(&self) -> Result<Vec<String>> {
        match self.call("", Method::ListServices).await? {
            Ok(Reply::Services(names)) => Ok(names),
            Ok(other) => Err(self.unexpected(other)),
            Err(e) => Err(self.wire(e)),
        }
    }

    /// Call a hook. Plugin-side hook failures become `HOOK_FAILED`.
    pub async fn call_hook(&self, service: &str, name: &str, args: Vec<Value>) -> Result<HookResponse> {
        let method = Method::CallHook {
            name: name.to_string(),
            args,
        };
        match self.call(service, method).await? {
            Ok(Reply::Hook(response)) => Ok(response),
            Ok(other) => Err(self.unexpected(other)),
            Err(WireError::Plugin { message }) => Err(PluginHostError::HookFailed {
                name: self.inner.name.clone(),
                hook: name.to_string(),
                message,
            }),
            Err(e) => Err(self.wire(e)),
        }
    }

    /// Run a lifecycle callback inside the plugin.
    ///
    /// `run` lasts until the plugin is cancelled, so it is exempt from the
    /// per-call deadline.
    pub async fn lifecycle(&self, service: &str, kind: CallbackKind, args: Vec<Value>) -> Result<()> {
        let deadline = match kind {
            CallbackKind::Run => None,
            _ => self.inner.call_timeout,
        };
        match self
            .call_within(service, Method::Lifecycle { kind, args }, deadline)
            .await?
        {
            Ok(Reply::Lifecycle) => Ok(()),
            Ok(other) => Err(self.unexpected(other)),
            Err(WireError::CallbackNotDefined { callback }) => {
                Err(PluginHostError::CallbackNotDefined {
                    name: self.inner.name.clone(),
                    kind: callback,
                })
            }
            Err(WireError::Plugin { message }) => Err(PluginHostError::CallbackFailed {
                name: self.inner.name.clone(),
                kind,
                message,
            }),
            Err(e) => Err(self.wire(e)),
        }
    }

    /// Ask the child to exit, wait up to `grace`, then kill it.
    ///
    /// `grace` bounds the whole exchange: the `Shutdown` reply and the exit.
    /// Returns once the child has been reaped. Safe to call more than once.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.stopping.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;

        if !self.is_closed() {
            let request = self.call_within("", Method::Shutdown, None);
            match tokio::time::timeout_at(deadline, request).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(plugin = %self.inner.name, error = %e, "Shutdown request failed"),
                Err(_) => tracing::debug!(plugin = %self.inner.name, "Shutdown request not answered"),
            }
        }

        let stop = self
            .inner
            .stop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = stop {
            let _ = stop.send(deadline);
        }

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor
            && let Err(e) = supervisor.await
        {
            tracing::error!(plugin = %self.inner.name, error = %e, "Supervisor task failed");
        }
    }
}

struct Supervisor {
    name: String,
    child: Child,
    requests: mpsc::UnboundedReceiver<Outgoing>,
    stop: oneshot::Receiver<Instant>,
    stopping: Arc<AtomicBool>,
    unload_grace: Duration,
    state: Arc<StateCell>,
    status: watch::Sender<ChildStatus>,
}

impl Supervisor {
    async fn run(mut self, channel: BoxedChannel) {
        let (reader, writer) = tokio::io::split(channel);
        let mut frames = FramedRead::new(reader, frame_codec());
        let mut sink = FramedWrite::new(writer, frame_codec());
        let mut pending: HashMap<u64, oneshot::Sender<CallResult>> = HashMap::new();
        let mut exit_deadline = None;

        let reason = loop {
            tokio::select! {
                outgoing = self.requests.recv() => {
                    let Some(Outgoing { request, reply }) = outgoing else {
                        break "client dropped".to_string();
                    };
                    let id = request.id;
                    let bytes = match encode_frame(&request) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let _ = reply.send(Err(WireError::Protocol { message: e.to_string() }));
                            continue;
                        }
                    };
                    pending.insert(id, reply);
                    if let Err(e) = sink.send(bytes).await {
                        break format!("write failed: {e}");
                    }
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => match decode::<Response>(&frame) {
                            Ok(response) => {
                                pending.retain(|_, tx| !tx.is_closed());
                                if let Some(tx) = pending.remove(&response.id) {
                                    let _ = tx.send(response.result);
                                } else {
                                    tracing::debug!(plugin = %self.name, id = response.id, "Discarding late response");
                                }
                            }
                            Err(e) => {
                                tracing::warn!(plugin = %self.name, error = %e, "Undecodable response");
                            }
                        },
                        Some(Err(e)) => break format!("read failed: {e}"),
                        None => break "channel closed".to_string(),
                    }
                }
                status = self.child.wait() => {
                    break match status {
                        Ok(status) => status.to_string(),
                        Err(e) => format!("wait failed: {e}"),
                    };
                }
                stop = &mut self.stop => {
                    exit_deadline = stop.ok();
                    break "stop requested".to_string();
                }
            }
        };

        // Pending callers see their sender dropped and report CHANNEL_CLOSED
        drop(pending);
        drop(sink);
        drop(frames);

        let requested = self.stopping.load(Ordering::Acquire);
        let exit_deadline = exit_deadline.unwrap_or_else(|| Instant::now() + self.unload_grace);
        let exit = match tokio::time::timeout_at(exit_deadline, self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("wait failed: {e}"),
            Err(_) => {
                tracing::warn!(plugin = %self.name, grace = ?self.unload_grace, "Plugin did not exit in time, killing");
                reap(&mut self.child).await
            }
        };

        if requested {
            tracing::debug!(plugin = %self.name, %exit, "Plugin process stopped");
            let _ = self.status.send(ChildStatus::Stopped(exit));
        } else {
            tracing::error!(plugin = %self.name, %reason, %exit, "Plugin process crashed");
            if self.state.transition(LifecycleState::Failed).is_err() {
                tracing::debug!(plugin = %self.name, state = %self.state.get(), "Crash after unload");
            }
            let _ = self.status.send(ChildStatus::Crashed(exit));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn silent_child() -> Child {
        tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_waits_one_grace_in_total() {
        // The far end never answers, so the Shutdown reply never comes
        let (host, _plugin) = tokio::io::duplex(4096);
        let state = Arc::new(StateCell::new(LifecycleState::Initialized));
        let client = RpcClient::start(
            "mute[rpc]",
            silent_child(),
            Box::pin(host),
            None,
            Duration::from_secs(3),
            Arc::clone(&state),
        );

        let started = Instant::now();
        client.shutdown(Duration::from_millis(300)).await;
        assert!(
            started.elapsed() < Duration::from_millis(1500),
            "took {:?}",
            started.elapsed()
        );
        assert!(matches!(client.status(), ChildStatus::Stopped(_)));
        assert_eq!(state.get(), LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn test_oversized_request_is_refused_locally() {
        let (host, _plugin) = tokio::io::duplex(4096);
        let state = Arc::new(StateCell::new(LifecycleState::Initialized));
        let client = RpcClient::start(
            "big[rpc]",
            silent_child(),
            Box::pin(host),
            None,
            Duration::from_millis(200),
            Arc::clone(&state),
        );

        let huge = Value::from("x".repeat(goplug_plugin_api::rpc::protocol::MAX_FRAME_LEN));
        let err = client.call_hook("", "Echo", vec![huge]).await.unwrap_err();
        assert!(matches!(err, PluginHostError::Protocol { .. }), "{err}");
        assert!(!client.is_closed());
        assert_eq!(state.get(), LifecycleState::Initialized);

        client.shutdown(Duration::from_millis(100)).await;
    }
}
