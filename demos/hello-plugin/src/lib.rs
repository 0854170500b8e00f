//! Hello Plugin - a native goplug plugin
//!
//! ## Building
//!
//! ```bash
//! cargo build --release
//! ```
//!
//! ## Installing
//!
//! The host only looks at files matching its discovery glob (`goplug-*` by
//! default):
//!
//! ```bash
//! cp target/release/libhello_plugin.so ~/.config/goplug/plugins/goplug-hello.so
//! goplug call hello Greet world
//! ```

use goplug_plugin_api::{
    CallbackKind, HookRegistry, Identity, Plugin, PluginContext, PluginError, Value,
    export_plugin,
};

#[derive(Default)]
pub struct HelloPlugin;

fn initialise(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    ctx.set_value("greetings", 0i64);
    ctx.log_info("Hello plugin loaded!");
    Ok(())
}

fn notify(ctx: &PluginContext, args: &[Value]) -> Result<(), PluginError> {
    ctx.log_debug(&format!("notified with {} argument(s)", args.len()));
    Ok(())
}

fn greet(ctx: &PluginContext, args: &[Value]) -> Result<Value, PluginError> {
    let name = args[0].as_str().unwrap_or("stranger");
    let count = ctx
        .value("greetings")
        .and_then(|v| v.as_int())
        .unwrap_or_default()
        + 1;
    ctx.set_value("greetings", count);
    Ok(Value::String(format!("Hello, {name}!")))
}

impl Plugin for HelloPlugin {
    fn identity(&self) -> Identity {
        Identity::new("hello", env!("CARGO_PKG_VERSION"))
            .maintainer("goplug maintainers")
            .description(env!("CARGO_PKG_DESCRIPTION"))
            .repository(env!("CARGO_PKG_REPOSITORY"))
            .native()
            .on(CallbackKind::Initialise, "Initialise", initialise)
            .on(CallbackKind::Notify, "Notify", notify)
    }

    fn register_hooks(&self, hooks: &HookRegistry) {
        hooks.register("Greet", greet, ["string"]);
    }
}

export_plugin!(HelloPlugin);
