//! A scripted foreign runtime for tests. Records every call it receives.
//!
//! It understands just enough of the engine's surface to drive the model
//! lifecycle: `isa`, the abstract collection types, `getfield`, `Docs.doc`,
//! `string`, and whatever functions a test registers. [`MockRuntime::iesopt`]
//! preloads a working `generate!`/`optimize!` pair.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Arg, BridgeError, BridgeResult, ForeignValue, Runtime};
use crate::consts::ENGINE_MODULE;

/// A function body: positional and keyword arguments in, object or message out.
pub type MockFn =
    Arc<dyn Fn(&[MockObject], &[(String, MockObject)]) -> Result<MockObject, String> + Send + Sync>;

/// A value living inside the mock runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum MockObject {
    Nothing,
    Module(String),
    Function(String),
    Symbol(String),
    Type(String),
    /// `(x) -> (x isa T)`
    Predicate(String),
    Data(Value),
    Opaque {
        type_name: String,
        supertypes: Vec<String>,
    },
}

/// Type names the mock knows about. Anything else is undefined.
const KNOWN_TYPES: &[&str] = &[
    "Any",
    "Nothing",
    "Bool",
    "Int64",
    "Integer",
    "Float64",
    "AbstractFloat",
    "Real",
    "Number",
    "String",
    "AbstractString",
    "Symbol",
    "Vector",
    "AbstractVector",
    "AbstractArray",
    "Dict",
    "AbstractDict",
    "Set",
    "AbstractSet",
    "Module",
    "Function",
];

impl MockObject {
    fn type_names(&self) -> Vec<&str> {
        let mut names = match self {
            MockObject::Nothing => vec!["Nothing"],
            MockObject::Module(_) => vec!["Module"],
            MockObject::Function(_) | MockObject::Predicate(_) => vec!["Function"],
            MockObject::Symbol(_) => vec!["Symbol"],
            MockObject::Type(_) => vec!["Type"],
            MockObject::Data(Value::Null) => vec!["Nothing"],
            MockObject::Data(Value::Bool(_)) => vec!["Bool", "Integer", "Real", "Number"],
            MockObject::Data(Value::Number(n)) if n.is_f64() => {
                vec!["Float64", "AbstractFloat", "Real", "Number"]
            }
            MockObject::Data(Value::Number(_)) => vec!["Int64", "Integer", "Real", "Number"],
            MockObject::Data(Value::String(_)) => vec!["String", "AbstractString"],
            MockObject::Data(Value::Array(_)) => vec!["Vector", "AbstractVector", "AbstractArray"],
            MockObject::Data(Value::Object(_)) => vec!["Dict", "AbstractDict"],
            MockObject::Opaque {
                type_name,
                supertypes,
            } => std::iter::once(type_name.as_str())
                .chain(supertypes.iter().map(String::as_str))
                .collect(),
        };
        names.push("Any");
        names
    }

    /// `self isa type_name`, or `None` if the type is undefined.
    fn isa(&self, type_name: &str) -> Option<bool> {
        let names = self.type_names();
        if names.contains(&type_name) {
            return Some(true);
        }
        KNOWN_TYPES.contains(&type_name).then_some(false)
    }

    fn summary(&self) -> String {
        match self {
            MockObject::Nothing => "nothing".to_string(),
            MockObject::Module(name) | MockObject::Type(name) => name.clone(),
            MockObject::Function(path) => format!("{path} (generic function)"),
            MockObject::Symbol(text) => format!(":{text}"),
            MockObject::Predicate(type_name) => format!("#1 (x isa {type_name})"),
            MockObject::Data(value) => value.to_string(),
            MockObject::Opaque { type_name, .. } => format!("<{type_name}>"),
        }
    }

    fn plain(&self) -> Option<Value> {
        match self {
            MockObject::Data(value @ (Value::Bool(_) | Value::Number(_) | Value::String(_))) => {
                Some(value.clone())
            }
            _ => None,
        }
    }
}

/// What the mock was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Start(String),
    Resolve(String),
    Eval(String),
    Symbol(String),
    /// Application of a named function, or of an anonymous predicate (`"#predicate"`).
    Call(String),
    Release(Vec<u64>),
}

pub struct MockRuntime {
    startup_error: Option<String>,
    functions: HashMap<String, MockFn>,
    bindings: HashMap<String, MockObject>,
    docs: HashMap<String, String>,
    starts: AtomicUsize,
    objects: Mutex<Vec<Option<MockObject>>>,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// A runtime with the builtins but no engine functions.
    pub fn new() -> Self {
        let mut runtime = Self {
            startup_error: None,
            functions: HashMap::new(),
            bindings: HashMap::new(),
            docs: HashMap::new(),
            starts: AtomicUsize::new(0),
            objects: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        };
        for name in ["AbstractVector", "AbstractSet", "AbstractDict"] {
            runtime
                .bindings
                .insert(name.to_string(), MockObject::Type(name.to_string()));
        }
        runtime
            .bindings
            .insert(ENGINE_MODULE.to_string(), MockObject::Module(ENGINE_MODULE.to_string()));
        runtime
    }

    /// A runtime whose engine generates any source except ones whose path
    /// contains `malformed`, and optimizes every generated model.
    pub fn iesopt() -> Self {
        Self::new()
            .with_function("IESopt.generate!", |args, _kwargs| match args.first() {
                Some(MockObject::Data(Value::String(source))) if source.contains("malformed") => {
                    Err(format!("failed to parse model config `{source}`"))
                }
                Some(MockObject::Data(Value::String(_))) => Ok(MockObject::Opaque {
                    type_name: "JuMP.Model".to_string(),
                    supertypes: vec![],
                }),
                other => Err(format!("MethodError: no method matching generate!({other:?})")),
            })
            .with_function("IESopt.optimize!", |args, _kwargs| match args.first() {
                Some(MockObject::Opaque { type_name, .. }) if type_name == "JuMP.Model" => {
                    Ok(MockObject::Nothing)
                }
                other => Err(format!("MethodError: no method matching optimize!({other:?})")),
            })
            .with_function("IESopt.JuMP.objective_value", |_args, _kwargs| {
                Ok(MockObject::Data(serde_json::json!(42.5)))
            })
    }

    /// Make `start` fail with `message`.
    pub fn failing_startup(mut self, message: impl Into<String>) -> Self {
        self.startup_error = Some(message.into());
        self
    }

    pub fn with_function<F>(mut self, path: &str, f: F) -> Self
    where
        F: Fn(&[MockObject], &[(String, MockObject)]) -> Result<MockObject, String>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(path.to_string(), Arc::new(f));
        self
    }

    pub fn with_binding(mut self, path: &str, object: MockObject) -> Self {
        self.bindings.insert(path.to_string(), object);
        self
    }

    /// Register a documented binding `IESopt.<name>`.
    pub fn with_doc(mut self, name: &str, text: &str) -> Self {
        let path = format!("{ENGINE_MODULE}.{name}");
        self.bindings
            .insert(path.clone(), MockObject::Type(path.clone()));
        self.docs.insert(path, text.to_string());
        self
    }

    /// Point `IESopt.IESoptLib.get_path(:examples)` at `dir`.
    pub fn with_examples_dir(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into().to_string_lossy().into_owned();
        self.with_function("IESopt.IESoptLib.get_path", move |args, _kwargs| {
            match args.first() {
                Some(MockObject::Symbol(s)) if s == "examples" => {
                    Ok(MockObject::Data(Value::String(dir.clone())))
                }
                other => Err(format!("unknown library path {other:?}")),
            }
        })
    }

    /// How many times `start` ran.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    /// How many times the function at `path` was applied.
    pub fn call_count(&self, path: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, MockCall::Call(p) if p == path))
            .count()
    }

    /// Number of handles currently held by the runtime.
    pub fn live_handles(&self) -> usize {
        lock(&self.objects).iter().filter(|o| o.is_some()).count()
    }

    fn record(&self, call: MockCall) {
        lock(&self.calls).push(call);
    }

    fn store(&self, object: MockObject) -> ForeignValue {
        let summary = object.summary();
        let plain = object.plain();
        let mut objects = lock(&self.objects);
        objects.push(Some(object));
        let value = ForeignValue::new(objects.len() as u64, summary);
        match plain {
            Some(plain) => value.with_plain(plain),
            None => value,
        }
    }

    fn object(&self, value: &ForeignValue) -> BridgeResult<MockObject> {
        let index = value.handle().checked_sub(1).ok_or_else(|| {
            BridgeError::Protocol(format!("invalid handle {}", value.handle()))
        })?;
        lock(&self.objects)
            .get(index as usize)
            .cloned()
            .flatten()
            .ok_or_else(|| BridgeError::Protocol(format!("unknown handle {}", value.handle())))
    }

    fn decode(&self, arg: &Arg) -> BridgeResult<MockObject> {
        match arg {
            Arg::Value(value) => self.object(value),
            Arg::Data(data) => Ok(MockObject::Data(data.clone())),
        }
    }

    fn lookup(&self, path: &str) -> Option<MockObject> {
        if let Some(object) = self.bindings.get(path) {
            return Some(object.clone());
        }
        if self.functions.contains_key(path) || BUILTINS.contains(&path) {
            return Some(MockObject::Function(path.to_string()));
        }
        None
    }

    fn apply_builtin(&self, name: &str, args: &[MockObject]) -> Result<MockObject, String> {
        match (name, args) {
            ("isa", [value, MockObject::Type(type_name)]) => value
                .isa(type_name)
                .map(|b| MockObject::Data(Value::Bool(b)))
                .ok_or_else(|| format!("UndefVarError: `{type_name}` not defined")),
            ("getfield", [MockObject::Module(module), MockObject::Symbol(name)]) => self
                .lookup(&format!("{module}.{name}"))
                .ok_or_else(|| format!("UndefVarError: `{name}` not defined in `{module}`")),
            ("Docs.doc", [MockObject::Type(path) | MockObject::Function(path)]) => {
                Ok(MockObject::Data(Value::String(
                    self.docs
                        .get(path)
                        .cloned()
                        .unwrap_or_else(|| format!("No documentation found for `{path}`.")),
                )))
            }
            ("string", [MockObject::Data(Value::String(s))]) => {
                Ok(MockObject::Data(Value::String(s.clone())))
            }
            ("string", [other]) => Ok(MockObject::Data(Value::String(other.summary()))),
            _ => Err(format!("MethodError: no method matching {name}({args:?})")),
        }
    }
}

const BUILTINS: &[&str] = &["isa", "getfield", "Docs.doc", "string"];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse the handful of expressions the mock can evaluate.
fn evaluate(code: &str) -> Result<MockObject, String> {
    let code = code.trim();
    if let Some(module) = code.strip_prefix("import ") {
        return match module.trim() {
            "" => Err("ParseError: incomplete import".to_string()),
            _ => Ok(MockObject::Nothing),
        };
    }
    if let Some(type_name) = code
        .strip_prefix("(x) -> (x isa ")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return Ok(MockObject::Predicate(type_name.trim().to_string()));
    }
    if code.starts_with("Set(") && code.ends_with(')') {
        return Ok(MockObject::Opaque {
            type_name: "Set".to_string(),
            supertypes: vec!["AbstractSet".to_string()],
        });
    }
    serde_json::from_str(code)
        .map(MockObject::Data)
        .map_err(|_| format!("ParseError: cannot parse `{code}`"))
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn start(&self, module: &str) -> BridgeResult<ForeignValue> {
        self.record(MockCall::Start(module.to_string()));
        self.starts.fetch_add(1, Ordering::SeqCst);
        // Give racing callers a chance to pile up on the initializer.
        tokio::task::yield_now().await;
        if let Some(message) = &self.startup_error {
            return Err(BridgeError::Initialization(message.clone()));
        }
        Ok(self.store(MockObject::Module(module.to_string())))
    }

    async fn resolve(&self, path: &str) -> BridgeResult<ForeignValue> {
        self.record(MockCall::Resolve(path.to_string()));
        let object = self
            .lookup(path)
            .ok_or_else(|| BridgeError::AttributeResolution(path.to_string()))?;
        Ok(self.store(object))
    }

    async fn eval(&self, code: &str) -> BridgeResult<ForeignValue> {
        self.record(MockCall::Eval(code.to_string()));
        let object = evaluate(code).map_err(BridgeError::Evaluation)?;
        Ok(self.store(object))
    }

    async fn symbol(&self, text: &str) -> BridgeResult<ForeignValue> {
        self.record(MockCall::Symbol(text.to_string()));
        if text.is_empty() {
            return Err(BridgeError::Evaluation(
                "ArgumentError: empty symbol".to_string(),
            ));
        }
        Ok(self.store(MockObject::Symbol(text.to_string())))
    }

    async fn call(
        &self,
        function: &ForeignValue,
        args: &[Arg],
        kwargs: &[(String, Arg)],
    ) -> BridgeResult<ForeignValue> {
        let target = self.object(function)?;
        let args = args
            .iter()
            .map(|a| self.decode(a))
            .collect::<BridgeResult<Vec<_>>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(name, a)| self.decode(a).map(|object| (name.clone(), object)))
            .collect::<BridgeResult<Vec<_>>>()?;

        let result = match &target {
            MockObject::Function(path) => {
                self.record(MockCall::Call(path.clone()));
                match self.functions.get(path) {
                    Some(f) => f(&args, &kwargs),
                    None => self.apply_builtin(path, &args),
                }
            }
            MockObject::Predicate(type_name) => {
                self.record(MockCall::Call("#predicate".to_string()));
                match args.as_slice() {
                    [value] => value
                        .isa(type_name)
                        .map(|b| MockObject::Data(Value::Bool(b)))
                        .ok_or_else(|| format!("UndefVarError: `{type_name}` not defined")),
                    _ => Err("MethodError: predicate takes one argument".to_string()),
                }
            }
            other => Err(format!(
                "MethodError: objects of type {} are not callable",
                other.type_names()[0]
            )),
        };

        result
            .map(|object| self.store(object))
            .map_err(BridgeError::Evaluation)
    }

    async fn release(&self, handles: &[u64]) -> BridgeResult<()> {
        self.record(MockCall::Release(handles.to_vec()));
        let mut objects = lock(&self.objects);
        for &handle in handles {
            if let Some(slot) = handle
                .checked_sub(1)
                .and_then(|index| objects.get_mut(index as usize))
            {
                *slot = None;
            }
        }
        Ok(())
    }
}
