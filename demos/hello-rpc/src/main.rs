//! Hello RPC - a goplug plugin that runs as a child process
//!
//! The host launches the binary, reads the handshake line from stdout and
//! then speaks the framed protocol over the announced socket. Copy the built
//! binary into the plugin root as `goplug-hello-rpc` and call it with:
//!
//! ```bash
//! goplug call hello-rpc Greet world
//! ```

use goplug_plugin_api::rpc::{ServeConfig, serve};
use goplug_plugin_api::{
    CallbackKind, HookRegistry, Identity, Plugin, PluginContext, PluginError, Value,
};

struct HelloRpc;

fn initialise(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    ctx.set_value("pid", i64::from(std::process::id()));
    ctx.log_info("hello-rpc ready");
    Ok(())
}

fn greet(_ctx: &PluginContext, args: &[Value]) -> Result<Value, PluginError> {
    let name = args[0].as_str().unwrap_or("stranger");
    Ok(Value::String(format!(
        "Hello, {name}, from process {}!",
        std::process::id()
    )))
}

impl Plugin for HelloRpc {
    fn identity(&self) -> Identity {
        Identity::new("hello-rpc", env!("CARGO_PKG_VERSION"))
            .maintainer("goplug maintainers")
            .description(env!("CARGO_PKG_DESCRIPTION"))
            .repository(env!("CARGO_PKG_REPOSITORY"))
            .rpc()
            .on(CallbackKind::Initialise, "Initialise", initialise)
    }

    fn register_hooks(&self, hooks: &HookRegistry) {
        hooks.register("Greet", greet, ["string"]);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = serve(ServeConfig::new().plugin(HelloRpc)).await {
        tracing::error!(error = %e, "hello-rpc stopped");
        std::process::exit(1);
    }
}
