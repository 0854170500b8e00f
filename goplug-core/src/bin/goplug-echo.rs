//! Reference RPC plugin
//!
//! Launched by a goplug host, never directly. Hooks:
//!
//! - `Echo(string)` returns its argument
//! - `Sum(int, int)` returns the sum
//! - `Sleep(int)` blocks for that many milliseconds
//! - `Crash()` exits the process without replying

use std::time::Duration;

use goplug_plugin_api::rpc::{ServeConfig, serve};
use goplug_plugin_api::{
    CallbackKind, HookRegistry, Identity, Plugin, PluginContext, PluginError, Value,
};
use tracing_subscriber::EnvFilter;

struct Echo;

fn initialise(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    ctx.set_value("initialised", true);
    ctx.log_info("echo initialised");
    Ok(())
}

fn run(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    let mut ticks: i64 = 0;
    while !ctx.is_cancelled() {
        std::thread::sleep(Duration::from_millis(10));
        ticks += 1;
        ctx.set_value("ticks", ticks);
    }
    ctx.log_debug("run loop cancelled");
    Ok(())
}

fn notify(ctx: &PluginContext, args: &[Value]) -> Result<(), PluginError> {
    ctx.log_info(&format!("notified with {} argument(s)", args.len()));
    Ok(())
}

fn sum(_ctx: &PluginContext, args: &[Value]) -> Result<Value, PluginError> {
    let a = args[0].as_int().unwrap_or_default();
    let b = args[1].as_int().unwrap_or_default();
    a.checked_add(b)
        .map(Value::Int)
        .ok_or_else(|| PluginError::custom("overflow"))
}

fn sleep(_ctx: &PluginContext, args: &[Value]) -> Result<Value, PluginError> {
    let millis = args[0].as_int().unwrap_or_default().max(0);
    std::thread::sleep(Duration::from_millis(millis.unsigned_abs()));
    Ok(Value::Nil)
}

impl Plugin for Echo {
    fn identity(&self) -> Identity {
        Identity::new("echo", env!("CARGO_PKG_VERSION"))
            .maintainer("goplug maintainers")
            .description("Echoes, adds and sleeps on request")
            .repository(env!("CARGO_PKG_REPOSITORY"))
            .rpc()
            .on(CallbackKind::Initialise, "Initialise", initialise)
            .on(CallbackKind::Run, "Run", run)
            .on(CallbackKind::Notify, "Notify", notify)
    }

    fn register_hooks(&self, hooks: &HookRegistry) {
        hooks.register("Echo", |_, args| Ok(args[0].clone()), ["string"]);
        hooks.register("Sum", sum, ["int", "int"]);
        hooks.register("Sleep", sleep, ["int"]);
        hooks.register(
            "Crash",
            |_, _| -> Result<Value, PluginError> { std::process::exit(3) },
            Vec::<&str>::new(),
        );
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the handshake line only
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    if let Err(e) = serve(ServeConfig::new().plugin(Echo)).await {
        tracing::error!(error = %e, "echo plugin stopped");
        std::process::exit(1);
    }
}
