//! Services built on top of the engine handle: logged evaluation, symbols,
//! type queries and documentation lookup.

use std::fmt;
use std::hash::{Hash, Hasher};
use tracing::{error, info};

use crate::bridge::{BridgeError, BridgeResult, EngineHandle, ForeignValue};
use crate::consts::DOCS_NAMESPACE;

/// Abstract types answered with a direct `isa` call instead of a generated
/// predicate: vector-like, set-like and mapping-like values.
pub const ABSTRACT_CAPABILITIES: &[&str] = &["AbstractVector", "AbstractSet", "AbstractDict"];

/// An identifier in the foreign runtime's namespace.
///
/// Two symbols are equal when their text is equal.
#[derive(Debug, Clone)]
pub struct Symbol {
    text: String,
    value: ForeignValue,
}

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The foreign symbol object.
    pub fn value(&self) -> &ForeignValue {
        &self.value
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.text)
    }
}

fn log_failure(code: &str, err: &BridgeError) {
    error!(code, "exception while executing foreign code `{code}`: {err}");
}

/// Evaluate `code` in the foreign runtime.
///
/// A foreign exception is logged together with the code that raised it and
/// returned unchanged.
pub async fn safe_eval(handle: &EngineHandle, code: &str) -> BridgeResult<ForeignValue> {
    handle.eval(code).await.inspect_err(|e| log_failure(code, e))
}

/// Import a module into the foreign runtime's main namespace.
pub async fn import_module(handle: &EngineHandle, name: &str) -> BridgeResult<()> {
    info!(module = name, "importing foreign module `{name}`");
    safe_eval(handle, &format!("import {name}")).await?;
    Ok(())
}

/// Construct a foreign symbol. Not cached; every call asks the runtime.
pub async fn make_symbol(handle: &EngineHandle, text: &str) -> BridgeResult<Symbol> {
    let value = handle.symbol(text).await?;
    Ok(Symbol {
        text: text.to_string(),
        value,
    })
}

/// Read a boolean answer and release it.
async fn expect_bool(handle: &EngineHandle, value: ForeignValue) -> BridgeResult<bool> {
    handle.discard(&[&value]).await;
    value.as_bool().ok_or_else(|| BridgeError::UnexpectedValue {
        expected: "Bool",
        found: value.summary().to_string(),
    })
}

/// Whether `value` is an instance of the foreign type `type_name`.
///
/// The names in [`ABSTRACT_CAPABILITIES`] resolve the type and `isa` directly.
/// Any other name is checked by compiling `(x) -> (x isa <type_name>)` in the
/// foreign runtime, so it fails (logged, then returned) if `type_name` is not
/// a type there. Intermediate foreign values are released before returning.
pub async fn is_a(handle: &EngineHandle, value: &ForeignValue, type_name: &str) -> BridgeResult<bool> {
    if ABSTRACT_CAPABILITIES.contains(&type_name) {
        let isa = handle.get(Some("isa")).await?;
        let abstract_type = match handle.get(Some(type_name)).await {
            Ok(t) => t,
            Err(e) => {
                handle.discard(&[&isa]).await;
                return Err(e);
            }
        };
        let answer = handle
            .call(&isa, &[value.into(), (&abstract_type).into()], &[])
            .await;
        handle.discard(&[&isa, &abstract_type]).await;
        return expect_bool(handle, answer?).await;
    }

    let code = format!("(x) -> (x isa {type_name})");
    let predicate = safe_eval(handle, &code).await?;
    let answer = handle
        .call(&predicate, &[value.into()], &[])
        .await
        .inspect_err(|e| log_failure(&code, e));
    handle.discard(&[&predicate]).await;
    expect_bool(handle, answer?).await
}

/// The documentation of `binding` inside `namespace`, as text.
///
/// # Panics
///
/// If `namespace` is anything other than `"IESopt"`. This is checked before
/// the foreign runtime is touched.
pub async fn get_docs(handle: &EngineHandle, binding: &str, namespace: &str) -> BridgeResult<String> {
    assert!(
        namespace == DOCS_NAMESPACE,
        "Only the `{DOCS_NAMESPACE}` namespace is currently supported, got `{namespace}`"
    );

    let mut held = Vec::new();
    let text = render_docs(handle, binding, namespace, &mut held).await;
    handle.discard(&held.iter().collect::<Vec<_>>()).await;
    text
}

async fn render_docs(
    handle: &EngineHandle,
    binding: &str,
    namespace: &str,
    held: &mut Vec<ForeignValue>,
) -> BridgeResult<String> {
    let module = keep(held, handle.get(Some(namespace)).await?);
    let getfield = keep(held, handle.get(Some("getfield")).await?);
    let name = make_symbol(handle, binding).await?;
    let name = keep(held, name.value().clone());
    let target = keep(
        held,
        handle
            .call(&getfield, &[(&module).into(), (&name).into()], &[])
            .await?,
    );

    let doc = keep(held, handle.get(Some("Docs.doc")).await?);
    let artifact = keep(held, handle.call(&doc, &[(&target).into()], &[]).await?);

    let string = keep(held, handle.get(Some("string")).await?);
    let text = keep(held, handle.call(&string, &[(&artifact).into()], &[]).await?);
    Ok(match text.as_str() {
        Some(s) => s.to_string(),
        None => text.summary().to_string(),
    })
}

/// Remember `value` for release and hand back a copy of the reference.
fn keep(held: &mut Vec<ForeignValue>, value: ForeignValue) -> ForeignValue {
    held.push(value.clone());
    value
}
