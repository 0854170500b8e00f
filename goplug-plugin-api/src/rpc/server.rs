//! Plugin side of the RPC channel
//!
//! An RPC plugin's `main` builds a [`ServeConfig`] and awaits [`serve`]. The
//! function verifies the cookie the host put in the environment, listens on a
//! loopback port, prints the handshake line, and then answers requests until
//! the host disconnects or sends `Shutdown`. Anything the plugin logs must go
//! to stderr; stdout carries the handshake line only.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::handshake::{HandshakeConfig, HandshakeLine, Network};
use super::protocol::{
    DynamicData, Method, Reply, Request, Response, WireError, decode, encode_frame, frame_codec,
};
use crate::Plugin;
use crate::context::{PluginContext, PluginId, ValueBag};
use crate::error::PluginError;
use crate::hooks::HookRegistry;
use crate::types::{Callback, Identity};
use crate::value::TypeRegistry;

/// Services an RPC plugin exposes, plus handshake parameters
#[derive(Default)]
pub struct ServeConfig {
    handshake: HandshakeConfig,
    services: Vec<(String, Arc<dyn Plugin>)>,
}

impl ServeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `plugin` as a service named after its identity
    pub fn plugin<P: Plugin + 'static>(self, plugin: P) -> Self {
        let name = plugin.identity().name;
        self.service(name, Arc::new(plugin))
    }

    /// Register a service under an explicit name. The first service registered
    /// answers requests that name no service.
    pub fn service(mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Self {
        self.services.push((name.into(), plugin));
        self
    }

    pub fn handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }
}

struct Service {
    identity: Identity,
    types: TypeRegistry,
    context: PluginContext,
}

/// Live services of a serving plugin
pub(crate) struct Services {
    order: Vec<String>,
    by_name: BTreeMap<String, Service>,
}

impl Services {
    pub(crate) fn new(config: &ServeConfig, cancel: &CancellationToken) -> Self {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(PathBuf::from))
            .unwrap_or_default();

        let mut order = Vec::new();
        let mut by_name = BTreeMap::new();
        for (index, (name, plugin)) in config.services.iter().enumerate() {
            let identity = plugin.identity();
            let id = PluginId(index as u64);

            let hooks = Arc::new(HookRegistry::new(id));
            hooks.set_identity(identity.name.clone());
            plugin.register_hooks(&hooks);

            let mut types = TypeRegistry::new();
            plugin.declare_types(&mut types);

            let context = PluginContext::new(
                id,
                identity.name.clone(),
                dir.clone(),
                hooks,
                Arc::new(ValueBag::new()),
            )
            .with_cancellation(cancel.child_token());

            order.push(name.clone());
            by_name.insert(
                name.clone(),
                Service {
                    identity,
                    types,
                    context,
                },
            );
        }
        Self { order, by_name }
    }

    fn lookup(&self, service: &str) -> Result<&Service, WireError> {
        let name = if service.is_empty() {
            self.order.first().map(String::as_str).unwrap_or_default()
        } else {
            service
        };
        self.by_name.get(name).ok_or_else(|| WireError::UnknownService {
            service: service.to_string(),
        })
    }

    /// Answer one request. Runs on a blocking thread; hooks and callbacks are
    /// ordinary synchronous functions.
    pub(crate) fn handle(&self, service: &str, method: Method) -> Result<Reply, WireError> {
        let svc = self.lookup(service)?;
        match method {
            Method::Identify => Ok(Reply::Identity(svc.identity.clone())),
            Method::IdentifyString => Ok(Reply::IdentityString(svc.identity.to_json_pretty()?)),
            Method::GetData => {
                let mut types: Vec<String> = svc.types.names().map(String::from).collect();
                types.sort();
                Ok(Reply::Data(DynamicData {
                    values: svc.context.values().snapshot(),
                    hooks: svc.context.hooks().list(),
                    types,
                }))
            }
            Method::CallHook { name, args } => {
                svc.types.check_all(&args)?;
                let response = svc.context.call_hook(&name, &args)?;
                svc.types.check(&response.value)?;
                Ok(Reply::Hook(response))
            }
            Method::Lifecycle { kind, args } => {
                let func = svc
                    .identity
                    .callbacks
                    .get(kind)
                    .and_then(Callback::func)
                    .ok_or(WireError::CallbackNotDefined { callback: kind })?;
                func(&svc.context, &args)?;
                Ok(Reply::Lifecycle)
            }
            Method::ListServices => Ok(Reply::Services(self.order.clone())),
            Method::Shutdown => Ok(Reply::Shutdown),
        }
    }
}

/// Run the plugin side of the channel until the host disconnects.
///
/// Fails with [`PluginError::NoServices`] when no service is registered and
/// with [`PluginError::Handshake`] when the binary was not launched by a host
/// holding the right cookie.
pub async fn serve(config: ServeConfig) -> Result<(), PluginError> {
    if config.services.is_empty() {
        let program = std::env::args().next().unwrap_or_default();
        return Err(PluginError::NoServices(program));
    }

    let key = &config.handshake.cookie_key;
    match std::env::var(key) {
        Ok(value) if value == config.handshake.cookie_value => {}
        _ => {
            eprintln!(
                "This binary is a goplug plugin. It is not meant to be executed directly; \
                 load it through a goplug host."
            );
            return Err(PluginError::Handshake(format!(
                "cookie '{key}' missing or wrong"
            )));
        }
    }

    let cancel = CancellationToken::new();
    let services = Arc::new(Services::new(&config, &cancel));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    let line = HandshakeLine::new(&config.handshake, Network::Tcp, address.to_string());
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }

    let (stream, peer) = listener.accept().await?;
    tracing::debug!(%peer, "Host connected");
    serve_connection(stream, services, cancel).await
}

/// Answer requests on an established channel
pub(crate) async fn serve_connection<S>(
    stream: S,
    services: Arc<Services>,
    cancel: CancellationToken,
) -> Result<(), PluginError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, frame_codec());
    let mut sink = FramedWrite::new(writer, frame_codec());

    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let bytes = match encode_frame(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(id = response.id, error = %e, "Failed to encode response");
                    let fallback = Response {
                        id: response.id,
                        result: Err(WireError::Protocol {
                            message: e.to_string(),
                        }),
                    };
                    match encode_frame(&fallback) {
                        Ok(bytes) => bytes,
                        Err(_) => continue,
                    }
                }
            };
            if let Err(e) = sink.send(bytes).await {
                tracing::warn!(error = %e, "Host channel closed while writing");
                break;
            }
        }
    });

    let mut result = Ok(());
    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                result = Err(PluginError::Io(e));
                break;
            }
        };
        let request: Request = match decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable request");
                continue;
            }
        };

        if request.method == Method::Shutdown {
            tracing::debug!("Shutdown requested");
            cancel.cancel();
            let _ = tx.send(Response {
                id: request.id,
                result: Ok(Reply::Shutdown),
            });
            break;
        }

        let services = Arc::clone(&services);
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = services.handle(&request.service, request.method);
            let _ = tx.send(Response {
                id: request.id,
                result,
            });
        });
    }

    cancel.cancel();
    drop(tx);
    let _ = writer_task.await;
    result
}
