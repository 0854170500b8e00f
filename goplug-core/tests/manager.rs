//! Manager tests with in-process plugins linked into the test binary

use std::sync::Arc;
use std::time::Duration;

use goplug_core::{
    ErrorKind, HostConfig, LifecycleState, Manager, Mechanism, PluginHostError, status_key,
};
use goplug_plugin_api::{
    CallbackKind, HookRegistry, Identity, NIL_RESPONSE, Plugin, PluginContext, PluginError, Value,
    args,
};
use tempfile::TempDir;

struct Hello;

impl Plugin for Hello {
    fn identity(&self) -> Identity {
        Identity::new("hello", "1.0.0")
            .maintainer("x@y")
            .description("d")
            .repository("r")
            .native()
    }

    fn register_hooks(&self, hooks: &HookRegistry) {
        hooks.register("Greet", |_, _| Ok(Value::Nil), Vec::<&str>::new());
    }
}

fn initialise(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    ctx.set_value("ready", true);
    Ok(())
}

fn spin(ctx: &PluginContext, _args: &[Value]) -> Result<(), PluginError> {
    while !ctx.is_cancelled() {
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

struct Calc;

impl Plugin for Calc {
    fn identity(&self) -> Identity {
        Identity::new("calc", "2.1.0")
            .maintainer("x@y")
            .description("adds")
            .repository("r")
            .native()
            .on(CallbackKind::Initialise, "Initialise", initialise)
            .on(CallbackKind::Run, "Run", spin)
    }

    fn register_hooks(&self, hooks: &HookRegistry) {
        hooks.register(
            "Sum",
            |_, args| {
                let a = args[0].as_int().unwrap_or_default();
                let b = args[1].as_int().unwrap_or_default();
                Ok(Value::Int(a + b))
            },
            ["int", "int"],
        );
    }
}

fn manager(dir: &TempDir) -> Manager {
    Manager::new(HostConfig::default().with_plugin_dir(dir.path())).unwrap()
}

#[tokio::test]
async fn minimal_in_process_plugin_answers_greet() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    mgr.register_static(Arc::new(Hello)).await.unwrap();

    let report = mgr.register_plugins().await.unwrap();
    assert!(report.is_ok());
    assert!(report.done.is_empty());

    let handle = mgr.get_by_name("hello").unwrap();
    assert_eq!(handle.mechanism(), Mechanism::Native);
    assert_eq!(handle.state(), LifecycleState::Initialized);
    assert!(handle.is_configured());

    let response = mgr.call_hook("hello", "Greet", args![]).await.unwrap();
    assert_eq!(response.type_tag, NIL_RESPONSE);
    assert!(response.value.is_nil());
}

#[tokio::test]
async fn missing_initialise_is_a_warning_not_an_error() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    mgr.register_static(Arc::new(Hello)).await.unwrap();

    assert!(!mgr.is_error());
    let kinds: Vec<ErrorKind> = mgr.warnings().iter().map(|w| w.kind).collect();
    assert!(kinds.contains(&ErrorKind::CallbackNotDefined), "{kinds:?}");
}

#[tokio::test]
async fn hook_arguments_are_checked_against_the_signature() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    mgr.register_static(Arc::new(Calc)).await.unwrap();

    let err = mgr.call_hook("calc", "Sum", args![1]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgArity);
    assert_eq!(mgr.error().map(|d| d.kind), Some(ErrorKind::ArgArity));

    let err = mgr.call_hook("calc", "Sum", args!["a", "b"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArgType);
    assert!(err.to_string().contains("position 0"), "{err}");

    let response = mgr.call_hook("calc", "Sum", args![1, 2]).await.unwrap();
    assert_eq!(response.value, Value::Int(3));
    assert!(!mgr.is_error());

    // Dispatch errors leave the handle usable
    assert_eq!(
        mgr.get_by_name("calc").unwrap().state(),
        LifecycleState::Initialized
    );
}

#[tokio::test]
async fn unknown_hook_is_hook_not_found() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    mgr.register_static(Arc::new(Calc)).await.unwrap();
    let err = mgr.call_hook("calc", "Product", args![1, 2]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HookNotFound);
}

#[tokio::test]
async fn initialise_writes_the_value_bag() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    let handle = mgr.register_static(Arc::new(Calc)).await.unwrap();

    let values = handle.values();
    assert_eq!(values.get("ready"), Some(Value::Bool(true)));
    assert_eq!(
        values.get(&status_key(Mechanism::Native, CallbackKind::Initialise)),
        Some(Value::from("OK"))
    );
    assert!(values.contains("native-init-timestamp"));
}

#[tokio::test]
async fn unload_removes_handle_and_cancels_run() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    let handle = mgr.register_static(Arc::new(Calc)).await.unwrap();

    mgr.invoke("calc", CallbackKind::Run, Vec::new()).await.unwrap();
    assert_eq!(handle.running_tasks(), 1);

    mgr.unload("calc").await.unwrap();
    assert_eq!(handle.state(), LifecycleState::Unloaded);
    assert_eq!(handle.running_tasks(), 0);
    assert_eq!(
        handle.values().get("native-run"),
        Some(Value::from("cancelled"))
    );

    let err = mgr.get_by_name("calc").unwrap_err();
    assert!(matches!(err, PluginHostError::NotFound { .. }));
    let err = mgr.call_hook("calc", "Sum", args![1, 2]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(mgr.size(), 0);
}

#[tokio::test]
async fn undefined_callback_over_invoke_is_warning() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    mgr.register_static(Arc::new(Calc)).await.unwrap();

    let err = mgr
        .invoke("calc", CallbackKind::Execute, Vec::new())
        .await
        .unwrap_err();
    assert!(err.is_warning());
    assert!(!mgr.is_error());
    assert_eq!(mgr.warnings().len(), 1);
}

#[tokio::test]
async fn dispose_unloads_everything() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    let hello = mgr.register_static(Arc::new(Hello)).await.unwrap();
    let calc = mgr.register_static(Arc::new(Calc)).await.unwrap();
    assert_eq!(mgr.size(), 2);
    assert_eq!(mgr.list().len(), 2);

    mgr.dispose().await.unwrap();
    assert_eq!(mgr.size(), 0);
    assert_eq!(hello.state(), LifecycleState::Unloaded);
    assert_eq!(calc.state(), LifecycleState::Unloaded);
}

#[tokio::test]
async fn snapshot_renders_identity_hooks_and_values() {
    let dir = TempDir::new().unwrap();
    let mgr = manager(&dir);
    let handle = mgr.register_static(Arc::new(Calc)).await.unwrap();

    let snapshot = handle.snapshot().await;
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["identity"]["name"], "calc");
    assert_eq!(json["state"], "initialized");
    assert!(json["values"].get("ready").is_some());
    assert_eq!(json["hooks"].as_array().map(Vec::len), Some(1));
}
