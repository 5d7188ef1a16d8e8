use super::pac_functions::PAC_FUNCTIONS;
use crate::error::ScriptError;
use boa_engine::{
    js_string, native_function::NativeFunction, Context, JsObject, JsResult, JsString, JsValue,
    Source,
};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Name of the function every routing script must define.
pub const ENTRY_POINT: &str = "FindProxyForURL";

static NEXT_SCRIPT_ID: AtomicU64 = AtomicU64::new(1);

// Boa contexts are !Send, so each worker thread keeps its own evaluated copy
// of the most recently used script. The id check makes a context built from
// one script version unusable for another.
thread_local! {
    static COMPILED: RefCell<Option<CompiledContext>> = const { RefCell::new(None) };
}

/// A validated PAC routing script.
///
/// # Script Interface
///
/// Scripts must define a `FindProxyForURL` function:
///
/// ```javascript
/// function FindProxyForURL(url, host) {
///     if (shExpMatch(host, "*.internal.example")) {
///         return "DIRECT";
///     }
///     if (dnsDomainIs(host, ".onion")) {
///         return "SOCKS5 127.0.0.1:9050";
///     }
///     return "PROXY cache.example:3128; DIRECT";
/// }
/// ```
///
/// The standard PAC helpers (`isPlainHostName`, `dnsDomainIs`,
/// `localHostOrDomainIs`, `dnsDomainLevels`, `shExpMatch`, `isInNet`,
/// `isValidIpAddress`, `convert_addr`) and `alert` are predefined.
/// `isInNet` only matches IP-literal hosts; decisions never block on DNS.
///
/// A `PacScript` is cheap to clone and share across threads; it carries the
/// source text and an id unique to this compilation.
#[derive(Debug, Clone)]
pub struct PacScript {
    id: u64,
    source: Arc<str>,
}

impl PacScript {
    /// Evaluate `source` and check that it defines a callable entry point.
    pub fn compile(source: impl Into<Arc<str>>) -> Result<Self, ScriptError> {
        let source = source.into();
        let id = NEXT_SCRIPT_ID.fetch_add(1, Ordering::Relaxed);
        let compiled = CompiledContext::build(id, &source)?;

        // Keep the context we just built; this thread is likely the next caller.
        COMPILED.with(|slot| *slot.borrow_mut() = Some(compiled));

        Ok(Self { id, source })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Invoke `FindProxyForURL(url, host)` and return its string result.
    pub fn find_proxy(&self, url: &str, host: &str) -> Result<String, ScriptError> {
        COMPILED.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(compiled) = slot.as_mut().filter(|c| c.script_id == self.id) {
                return compiled.call(url, host);
            }
            slot.insert(CompiledContext::build(self.id, &self.source)?)
                .call(url, host)
        })
    }
}

struct CompiledContext {
    script_id: u64,
    context: Context,
    entry: JsObject,
}

impl CompiledContext {
    fn build(script_id: u64, source: &str) -> Result<Self, ScriptError> {
        let mut context = Context::default();

        context
            .register_global_callable(js_string!("alert"), 1, NativeFunction::from_fn_ptr(alert))
            .map_err(|e| ScriptError::Compile(format!("failed to register alert: {e}")))?;
        context
            .eval(Source::from_bytes(PAC_FUNCTIONS.as_bytes()))
            .map_err(|e| ScriptError::Compile(format!("PAC helper library: {e}")))?;
        context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| ScriptError::Compile(e.to_string()))?;

        let global = context.global_object();
        let entry = global
            .get(js_string!(ENTRY_POINT), &mut context)
            .ok()
            .and_then(|val| val.as_callable().cloned())
            .ok_or(ScriptError::MissingEntryPoint(ENTRY_POINT))?;

        Ok(Self {
            script_id,
            context,
            entry,
        })
    }

    fn call(&mut self, url: &str, host: &str) -> Result<String, ScriptError> {
        let args = [
            JsValue::from(JsString::from(url)),
            JsValue::from(JsString::from(host)),
        ];
        let result = self
            .entry
            .call(&JsValue::undefined(), &args, &mut self.context)
            .map_err(|e| ScriptError::Execution(e.to_string()))?;

        match result.as_string() {
            Some(s) => Ok(s.to_std_string_escaped()),
            None => Err(ScriptError::NonStringResult(result.display().to_string())),
        }
    }
}

/// `alert(message)` writes to the proxy log, as browsers do with their consoles.
fn alert(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let message = match args.first() {
        Some(value) => value.to_string(ctx)?.to_std_string_escaped(),
        None => String::new(),
    };
    info!(target: "pac_proxy::script", "{}", message);
    Ok(JsValue::undefined())
}
