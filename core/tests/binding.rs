use anyhow::{bail, Context, Result};
use infer_bridge::binding::{
    call, HostFunction, HostObject, HostValue, EXPECTED_PARSED_MODEL, WRONG_ARGUMENT_COUNT,
    WRONG_ARGUMENT_TYPE,
};
use infer_bridge::{BridgeConfig, EngineInstance, ErrorKind, Host, ReferenceCore};
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../tests/fixtures")
        .join(name)
        .display()
        .to_string()
}

fn setup() -> Result<(Host, HostObject)> {
    let host = Host::new(&BridgeConfig {
        worker_threads: 2,
        ..BridgeConfig::default()
    })?;
    let engine = EngineInstance::new(&host, Arc::new(ReferenceCore::new()));
    Ok((host, HostObject::Engine(Rc::new(engine))))
}

/// Call an asynchronous method and wait for its value.
fn await_call(
    host: &Host,
    target: &HostObject,
    method: &str,
    args: &[HostValue],
) -> Result<HostValue> {
    let promise = call(target, method, args)?
        .into_promise()
        .with_context(|| format!("{method} did not return a promise"))?;
    Ok(host.block_on(promise)?)
}

fn object(value: HostValue) -> Result<HostObject> {
    match value {
        HostValue::Object(object) => Ok(object),
        other => bail!("expected an object, got {:?}", other),
    }
}

fn executable(host: &Host, engine: &HostObject) -> Result<HostObject> {
    let model = object(await_call(
        host,
        engine,
        "parseModel",
        &[
            HostValue::string(fixture("classifier.yaml")),
            HostValue::string(fixture("classifier.bin")),
        ],
    )?)?;
    object(await_call(
        host,
        engine,
        "compile",
        &[HostValue::Object(model), HostValue::string("CPU")],
    )?)
}

#[test]
fn pipeline_through_binding_surface() -> Result<()> {
    let (host, engine) = setup()?;
    let executable = executable(&host, &engine)?;
    assert_eq!(executable.type_name(), "ExecutableModel");

    let request = object(
        call(&executable, "createInferenceRequest", &[])?
            .into_value()
            .context("expected a value")?,
    )?;
    call(&request, "infer", &[])?;

    let buffer = object(
        call(&request, "getResultBuffer", &[HostValue::string("output")])?
            .into_value()
            .context("expected a value")?,
    )?;
    match buffer {
        HostObject::Buffer(buffer) => assert_eq!(buffer.byte_len(), 602112),
        other => bail!("expected a buffer, got {}", other.type_name()),
    }
    Ok(())
}

#[test]
fn compile_with_wrong_stage_fails_without_scheduling() -> Result<()> {
    let (host, engine) = setup()?;
    let executable = executable(&host, &engine)?;
    let submitted = host.workers().submitted();

    let outcome = call(
        &engine,
        "compile",
        &[HostValue::Object(executable), HostValue::string("CPU")],
    )?;
    let promise = outcome.into_promise().context("expected a promise")?;
    assert!(promise.is_rejected());
    assert_eq!(host.pending_tasks(), 0);
    assert_eq!(host.workers().submitted(), submitted);

    let err = host.block_on(promise).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.to_string(), EXPECTED_PARSED_MODEL);

    // A well-typed first argument with a bad device name fails differently.
    let model = object(await_call(
        &host,
        &engine,
        "parseModel",
        &[
            HostValue::string(fixture("classifier.yaml")),
            HostValue::string(fixture("classifier.bin")),
        ],
    )?)?;
    let promise = call(
        &engine,
        "compile",
        &[HostValue::Object(model), HostValue::Number(0.0)],
    )?
    .into_promise()
    .context("expected a promise")?;
    let err = host.block_on(promise).unwrap_err();
    assert_eq!(err.to_string(), WRONG_ARGUMENT_TYPE);
    Ok(())
}

#[test]
fn argument_count_is_checked() -> Result<()> {
    let (host, engine) = setup()?;

    let err = call(&engine, "enumerateVersions", &[]).err().context("expected an error")?;
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.to_string(), WRONG_ARGUMENT_COUNT);

    let executable = executable(&host, &engine)?;
    let err = call(&executable, "createInferenceRequest", &[HostValue::Null])
        .err()
        .context("expected an error")?;
    assert_eq!(err.to_string(), WRONG_ARGUMENT_COUNT);

    let promise = call(&executable, "createInferenceRequestAsync", &[HostValue::Null])?
        .into_promise()
        .context("expected a promise")?;
    assert!(promise.is_rejected());
    assert_eq!(host.pending_tasks(), 0);
    Ok(())
}

#[test]
fn parse_model_rejects_mixed_argument_kinds() -> Result<()> {
    let (host, engine) = setup()?;
    let promise = call(
        &engine,
        "parseModel",
        &[HostValue::Number(1.0), HostValue::string("weights.bin")],
    )?
    .into_promise()
    .context("expected a promise")?;
    let err = host.block_on(promise).unwrap_err();
    assert_eq!(err.to_string(), WRONG_ARGUMENT_TYPE);
    assert_eq!(host.workers().submitted(), 0);
    Ok(())
}

#[test]
fn parse_model_accepts_in_memory_buffers() -> Result<()> {
    let (host, engine) = setup()?;
    let description = std::fs::read(fixture("classifier.yaml"))?;
    let weights = std::fs::read(fixture("classifier.bin"))?;
    let model = object(await_call(
        &host,
        &engine,
        "parseModel",
        &[HostValue::bytes(description), HostValue::bytes(weights)],
    )?)?;
    assert_eq!(model.type_name(), "ParsedModel");
    Ok(())
}

#[test]
fn enumerate_versions_uses_host_field_names() -> Result<()> {
    let (_host, engine) = setup()?;
    let versions = call(&engine, "enumerateVersions", &[HostValue::string("CPU")])?
        .into_value()
        .context("expected a value")?;
    let cpu = versions
        .as_map()
        .and_then(|m| m.get("CPU"))
        .and_then(HostValue::as_map)
        .context("missing CPU entry")?;
    assert_eq!(cpu.get("apiVersionMajor").and_then(HostValue::as_number), Some(2.0));
    assert_eq!(cpu.get("apiVersionMinor").and_then(HostValue::as_number), Some(1.0));
    assert!(cpu.contains_key("buildNumber"));

    let err = call(&engine, "enumerateVersions", &[HostValue::string("UNKNOWN_DEVICE")])
        .err()
        .context("expected an error")?;
    assert_eq!(err.kind(), ErrorKind::Engine);
    Ok(())
}

#[test]
fn completion_notifier_through_binding_surface() -> Result<()> {
    let (host, engine) = setup()?;
    let executable = executable(&host, &engine)?;
    let request = object(
        await_call(&host, &executable, "createInferenceRequestAsync", &[])?,
    )?;

    let calls = Rc::new(Cell::new(0));
    let sink = Rc::clone(&calls);
    call(
        &request,
        "registerCompletionNotifier",
        &[HostValue::Function(HostFunction::new(move || sink.set(sink.get() + 1)))],
    )?;
    call(&request, "startAsync", &[])?;
    assert!(host.run_until(|| calls.get() == 1, Duration::from_secs(5)));

    let err = call(&request, "registerCompletionNotifier", &[HostValue::Bool(true)])
        .err()
        .context("expected an error")?;
    assert_eq!(err.to_string(), WRONG_ARGUMENT_TYPE);

    await_call(&host, &request, "inferAsync", &[])?;
    Ok(())
}

#[test]
fn unknown_methods_and_buffers_are_reported() -> Result<()> {
    let (host, engine) = setup()?;
    let err = call(&engine, "explode", &[]).err().context("expected an error")?;
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let executable = executable(&host, &engine)?;
    let request = object(
        call(&executable, "createInferenceRequest", &[])?
            .into_value()
            .context("expected a value")?,
    )?;
    let err = call(&request, "getResultBuffer", &[HostValue::string("logits")])
        .err()
        .context("expected an error")?;
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    Ok(())
}
