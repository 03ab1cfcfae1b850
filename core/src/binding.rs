//! Dynamically typed call surface for embedding hosts.
//!
//! Hosts that cannot name Rust types hold wrappers as opaque
//! [`HostObject`]s and invoke operations by method name with a list of
//! [`HostValue`] arguments. Argument count and kind are checked before any
//! work is scheduled: synchronous methods return the error directly, and
//! asynchronous methods hand back an already-rejected promise.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::bridge::Promise;
use crate::error::{BridgeError, Result};
use crate::inference::{
    EngineInstance, ExecutableModel, InferenceRequest, ParsedModel, ResultBuffer,
};
use crate::native::{ModelSource, Version};

pub const WRONG_ARGUMENT_COUNT: &str = "Wrong number of arguments";
pub const WRONG_ARGUMENT_TYPE: &str = "Wrong type of arguments";
pub const INVALID_ARGUMENT: &str = "Invalid argument";
pub const EXPECTED_PARSED_MODEL: &str = "The first argument should be a ParsedModel object";

/// A host callable taking no arguments.
#[derive(Clone)]
pub struct HostFunction(Rc<RefCell<dyn FnMut()>>);

impl HostFunction {
    pub fn new(f: impl FnMut() + 'static) -> Self {
        Self(Rc::new(RefCell::new(f)))
    }

    fn call(&self) {
        if let Ok(mut f) = self.0.try_borrow_mut() {
            (*f)();
        }
    }
}

/// A wrapper held by the host.
#[derive(Clone)]
pub enum HostObject {
    Engine(Rc<EngineInstance>),
    Model(ParsedModel),
    Executable(Rc<ExecutableModel>),
    Request(InferenceRequest),
    Buffer(Rc<ResultBuffer>),
}

impl HostObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Engine(_) => "EngineInstance",
            Self::Model(_) => "ParsedModel",
            Self::Executable(_) => "ExecutableModel",
            Self::Request(_) => "InferenceRequest",
            Self::Buffer(_) => "ResultBuffer",
        }
    }
}

/// A value crossing the binding surface.
#[derive(Clone)]
pub enum HostValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Arc<[u8]>),
    Map(BTreeMap<String, HostValue>),
    Object(HostObject),
    Function(HostFunction),
}

impl HostValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes(b.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, HostValue>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Number(n) => write!(f, "Number({n})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Bytes(b) => write!(f, "Bytes(len={})", b.len()),
            Self::Map(m) => f.debug_map().entries(m.iter()).finish(),
            Self::Object(o) => write!(f, "Object({})", o.type_name()),
            Self::Function(_) => f.write_str("Function"),
        }
    }
}

/// Result of a binding call.
pub enum Outcome {
    Value(HostValue),
    Pending(Promise<HostValue>),
}

impl Outcome {
    pub fn into_value(self) -> Option<HostValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Pending(_) => None,
        }
    }

    pub fn into_promise(self) -> Option<Promise<HostValue>> {
        match self {
            Self::Pending(p) => Some(p),
            Self::Value(_) => None,
        }
    }
}

fn wrong_count() -> BridgeError {
    BridgeError::invalid_argument(WRONG_ARGUMENT_COUNT)
}

fn wrong_type() -> BridgeError {
    BridgeError::invalid_argument(WRONG_ARGUMENT_TYPE)
}

fn arity(args: &[HostValue], expected: usize) -> Result<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(wrong_count())
    }
}

fn string_arg(value: &HostValue) -> Result<&str> {
    value.as_str().ok_or_else(wrong_type)
}

/// Run an asynchronous method: argument errors become a rejected promise.
fn pending<T: 'static>(
    start: impl FnOnce() -> Result<Promise<T>>,
    wrap: impl FnOnce(T) -> HostValue + 'static,
) -> Outcome {
    match start() {
        Ok(promise) => Outcome::Pending(promise.map(move |value| Ok(wrap(value)))),
        Err(err) => Outcome::Pending(Promise::rejected(err)),
    }
}

/// Invoke `method` on `target`.
pub fn call(target: &HostObject, method: &str, args: &[HostValue]) -> Result<Outcome> {
    match target {
        HostObject::Engine(engine) => call_engine(engine, method, args),
        HostObject::Model(_) | HostObject::Buffer(_) => {
            Err(unknown_method(target.type_name(), method))
        }
        HostObject::Executable(executable) => call_executable(executable, method, args),
        HostObject::Request(request) => call_request(request, method, args),
    }
}

fn unknown_method(type_name: &str, method: &str) -> BridgeError {
    BridgeError::invalid_argument(format!(
        "{INVALID_ARGUMENT}: {type_name} has no method '{method}'"
    ))
}

fn call_engine(engine: &Rc<EngineInstance>, method: &str, args: &[HostValue]) -> Result<Outcome> {
    match method {
        "enumerateVersions" => {
            arity(args, 1)?;
            let versions = engine.enumerate_versions(string_arg(&args[0])?)?;
            Ok(Outcome::Value(HostValue::Map(
                versions
                    .into_iter()
                    .map(|(name, version)| (name, version_value(version)))
                    .collect(),
            )))
        }
        "parseModel" => Ok(pending(
            || {
                arity(args, 2)?;
                Ok(engine.parse_model(model_source(&args[0], &args[1])?))
            },
            |model| HostValue::Object(HostObject::Model(model)),
        )),
        "registerExtension" => {
            arity(args, 1)?;
            engine.register_extension(string_arg(&args[0])?)?;
            Ok(Outcome::Value(HostValue::Null))
        }
        "setDeviceConfig" => {
            arity(args, 2)?;
            engine.set_device_config(string_arg(&args[0])?, string_arg(&args[1])?)?;
            Ok(Outcome::Value(HostValue::Null))
        }
        "compile" => Ok(pending(
            || {
                arity(args, 2)?;
                let model = match args[0].as_object() {
                    Some(HostObject::Model(model)) => model,
                    _ => return Err(BridgeError::invalid_argument(EXPECTED_PARSED_MODEL)),
                };
                Ok(engine.compile(model, string_arg(&args[1])?))
            },
            |executable| HostValue::Object(HostObject::Executable(Rc::new(executable))),
        )),
        _ => Err(unknown_method("EngineInstance", method)),
    }
}

fn model_source(model: &HostValue, weights: &HostValue) -> Result<ModelSource> {
    match (model, weights) {
        (HostValue::String(model), HostValue::String(weights)) => Ok(ModelSource::Files {
            model: model.into(),
            weights: weights.into(),
        }),
        (HostValue::String(description), HostValue::Bytes(weights)) => Ok(ModelSource::Memory {
            description: description.clone(),
            weights: Arc::clone(weights),
        }),
        (HostValue::Bytes(description), HostValue::Bytes(weights)) => {
            let description = std::str::from_utf8(description)
                .map_err(|_| BridgeError::invalid_argument(INVALID_ARGUMENT))?;
            Ok(ModelSource::Memory {
                description: description.to_string(),
                weights: Arc::clone(weights),
            })
        }
        _ => Err(wrong_type()),
    }
}

fn version_value(version: Version) -> HostValue {
    let mut map = BTreeMap::new();
    map.insert(
        "apiVersionMajor".to_string(),
        HostValue::Number(f64::from(version.api_major)),
    );
    map.insert(
        "apiVersionMinor".to_string(),
        HostValue::Number(f64::from(version.api_minor)),
    );
    if let Some(build) = version.build_number {
        map.insert("buildNumber".to_string(), HostValue::String(build));
    }
    if let Some(description) = version.description {
        map.insert("description".to_string(), HostValue::String(description));
    }
    HostValue::Map(map)
}

fn call_executable(
    executable: &Rc<ExecutableModel>,
    method: &str,
    args: &[HostValue],
) -> Result<Outcome> {
    match method {
        "createInferenceRequest" => {
            arity(args, 0)?;
            let request = executable.create_inference_request()?;
            Ok(Outcome::Value(HostValue::Object(HostObject::Request(request))))
        }
        "createInferenceRequestAsync" => Ok(pending(
            || {
                arity(args, 0)?;
                Ok(executable.create_inference_request_async())
            },
            |request| HostValue::Object(HostObject::Request(request)),
        )),
        _ => Err(unknown_method("ExecutableModel", method)),
    }
}

fn call_request(request: &InferenceRequest, method: &str, args: &[HostValue]) -> Result<Outcome> {
    match method {
        "infer" => {
            arity(args, 0)?;
            request.infer()?;
            Ok(Outcome::Value(HostValue::Null))
        }
        "inferAsync" => Ok(pending(
            || {
                arity(args, 0)?;
                Ok(request.infer_async())
            },
            |()| HostValue::Null,
        )),
        "startAsync" => {
            arity(args, 0)?;
            request.start_async()?;
            Ok(Outcome::Value(HostValue::Null))
        }
        "registerCompletionNotifier" => {
            arity(args, 1)?;
            let callback = match &args[0] {
                HostValue::Function(f) => f.clone(),
                _ => return Err(wrong_type()),
            };
            request.register_completion_notifier(move || callback.call())?;
            Ok(Outcome::Value(HostValue::Null))
        }
        "getResultBuffer" => {
            arity(args, 1)?;
            let buffer = request.get_result_buffer(string_arg(&args[0])?)?;
            Ok(Outcome::Value(HostValue::Object(HostObject::Buffer(Rc::new(
                buffer,
            )))))
        }
        _ => Err(unknown_method("InferenceRequest", method)),
    }
}
