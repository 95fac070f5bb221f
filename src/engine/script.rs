//! Script compilation and execution.

use super::compiler::ScriptCache;
use crate::config::ProfilingEvent;
use crate::context::Context;
use crate::error::{ErrorCode, IsolateError, Result, ScriptError};
use std::time::Instant;
use tracing::debug;

/// Outcome of running script code: the produced value as a string, or the
/// failure (a `RuntimeError` script error when the code threw).
pub type RunResult = Result<String>;

/// A compiled unit of code bound to one context.
///
/// Running is repeatable; side effects accumulate in the context's global
/// scope across runs.
#[derive(Clone)]
pub struct Script {
    unbound: v8::Global<v8::UnboundScript>,
    name: String,
    context: Context,
}

impl Script {
    /// Compile `source` against `context`.
    ///
    /// A syntax error comes back as a `CompileError` whose message is the
    /// engine's exception text.
    pub fn compile(context: &Context, name: &str, source: &str) -> Result<Script> {
        let handle = context.global()?;
        let isolate = context.isolate();
        let key = ScriptCache::key(name, source);

        let cached = isolate.inner().scripts.borrow_mut().get(&key);
        let cache_hit = cached.is_some();
        let unbound = match cached {
            Some(unbound) => unbound,
            None => {
                let compiled = isolate.with_context(&handle, |scope| {
                    v8::tc_scope!(let tc, scope);
                    let source = new_string(tc, source)?;
                    match v8::Script::compile(tc, source, None) {
                        Some(script) => {
                            let unbound = script.get_unbound_script(tc);
                            Ok(v8::Global::new(tc, unbound))
                        }
                        None => Err(caught_error(tc, ErrorCode::CompileError, name)),
                    }
                });
                let compiled = match compiled {
                    Ok(compiled) => compiled,
                    Err(e) => {
                        isolate.metrics().record_error(&e.code().to_string());
                        return Err(e);
                    }
                };
                isolate
                    .inner()
                    .scripts
                    .borrow_mut()
                    .insert(key, compiled.clone());
                compiled
            }
        };

        isolate.metrics().record_compile(cache_hit);
        isolate.config().profile(ProfilingEvent::ScriptCompiled {
            isolate: isolate.id(),
            name: name.to_string(),
            cache_hit,
        });
        debug!(context = %context.id(), script = name, cache_hit, "Compiled script");

        Ok(Script {
            unbound,
            name: name.to_string(),
            context: context.clone(),
        })
    }

    /// Resource name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context the script runs in
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Run the script in its context, then drain microtasks once.
    pub fn run(&self) -> RunResult {
        let handle = self.context.global()?;
        let isolate = self.context.isolate();
        let start = Instant::now();

        let result = isolate.with_context(&handle, |scope| {
            v8::tc_scope!(let tc, scope);
            let unbound = v8::Local::new(tc, &self.unbound);
            let script = unbound.bind_to_current_context(tc);
            let result = match script.run(tc) {
                Some(value) => Ok(to_transport_string(tc, value)),
                None => Err(caught_error(tc, ErrorCode::RuntimeError, &self.name)),
            };
            // Reactions queued before a throw still run.
            tc.perform_microtask_checkpoint();
            result
        });

        isolate.metrics().record_run(start.elapsed(), result.is_ok());
        if let Err(e) = &result {
            isolate.metrics().record_error(&e.code().to_string());
        }
        result
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("context", &self.context.id())
            .finish()
    }
}

pub(crate) fn new_string<'s>(
    scope: &mut v8::PinScope<'s, '_, ()>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text).ok_or_else(|| {
        IsolateError::Engine(format!("string of {} bytes exceeds engine limits", text.len()))
    })
}

/// Serialize a value for transport out of the isolate.
///
/// Strings pass through, `undefined` becomes `"undefined"`, values with a
/// JSON form use it, anything else falls back to `String(value)`.
pub(crate) fn to_transport_string(
    scope: &mut v8::PinScope,
    value: v8::Local<v8::Value>,
) -> String {
    if value.is_string() {
        return value.to_rust_string_lossy(scope);
    }
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if !value.is_function() && !value.is_symbol() {
        v8::tc_scope!(let tc, scope);
        if let Some(json) = v8::json::stringify(tc, value) {
            let json = json.to_rust_string_lossy(tc);
            if json != "undefined" {
                return json;
            }
        }
        if tc.has_caught() {
            tc.reset();
        }
    }
    if value.is_symbol() {
        return value
            .to_detail_string(scope)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_default();
    }
    value.to_rust_string_lossy(scope)
}

/// Convert the exception held by `tc` into an error, verbatim.
pub(crate) fn caught_error(
    tc: &mut v8::PinnedRef<v8::TryCatch<v8::HandleScope>>,
    code: ErrorCode,
    resource: &str,
) -> IsolateError {
    let message = match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "script execution was terminated".to_string(),
    };

    let mut error = ScriptError::new(code, message);
    if let Some(stack) = tc.stack_trace() {
        let stack = stack.to_rust_string_lossy(tc);
        if !stack.is_empty() && stack != "undefined" {
            error = error.with_stack(stack);
        }
    }
    if let Some(msg) = tc.message() {
        if let Some(line) = msg.get_line_number(tc) {
            error = error.with_location(resource, line as u32, msg.get_start_column() as u32 + 1);
        }
    }
    IsolateError::Script(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolateConfig;
    use crate::engine::Isolate;

    fn setup() -> (Isolate, Context) {
        let isolate = Isolate::new(&IsolateConfig::default()).unwrap();
        let context = Context::new(&isolate).unwrap();
        (isolate, context)
    }

    #[test]
    fn test_compile_and_run() {
        let (_isolate, context) = setup();
        let script = Script::compile(&context, "sum.js", "40 + 2").unwrap();
        assert_eq!(script.run().unwrap(), "42");
        assert_eq!(script.name(), "sum.js");
    }

    #[test]
    fn test_run_accumulates_side_effects() {
        let (_isolate, context) = setup();
        Script::compile(&context, "init.js", "var counter = 0;")
            .unwrap()
            .run()
            .unwrap();

        let increment = Script::compile(&context, "inc.js", "counter += 1; counter").unwrap();
        assert_eq!(increment.run().unwrap(), "1");
        assert_eq!(increment.run().unwrap(), "2");

        let read = Script::compile(&context, "read.js", "counter").unwrap();
        assert_eq!(read.run().unwrap(), "2");
    }

    #[test]
    fn test_compile_error_is_reported() {
        let (_isolate, context) = setup();
        let err = Script::compile(&context, "bad.js", "function (").unwrap_err();
        let script_err = err.as_script_error().unwrap();
        assert_eq!(script_err.code, ErrorCode::CompileError);
        assert!(!script_err.message.is_empty());
        assert!(script_err.message.contains("SyntaxError"));
    }

    #[test]
    fn test_thrown_string_is_verbatim() {
        let (_isolate, context) = setup();
        let script = Script::compile(&context, "boom.js", "throw 'boom'").unwrap();
        let err = script.run().unwrap_err();
        let script_err = err.as_script_error().unwrap();
        assert_eq!(script_err.code, ErrorCode::RuntimeError);
        assert_eq!(script_err.message, "boom");
    }

    #[test]
    fn test_microtasks_drain_after_throw() {
        let (_isolate, context) = setup();
        let script = Script::compile(
            &context,
            "settle.js",
            "globalThis.settled = false;
             Promise.resolve().then(() => { globalThis.settled = true; });
             throw new Error('after queue');",
        )
        .unwrap();
        assert!(script.run().is_err());

        let read = Script::compile(&context, "read.js", "settled").unwrap();
        assert_eq!(read.run().unwrap(), "true");
    }

    #[test]
    fn test_thrown_error_has_location() {
        let (_isolate, context) = setup();
        let script = Script::compile(&context, "err.js", "\nthrow new TypeError('bad')").unwrap();
        let err = script.run().unwrap_err();
        let script_err = err.as_script_error().unwrap();
        assert_eq!(script_err.message, "TypeError: bad");
        assert_eq!(script_err.location.as_ref().map(|l| l.line), Some(2));
        assert!(script_err.stack.as_deref().unwrap_or("").contains("TypeError"));
    }

    #[test]
    fn test_value_serialization() {
        let (_isolate, context) = setup();
        let run = |src: &str| Script::compile(&context, "v.js", src).unwrap().run().unwrap();

        assert_eq!(run("'hello'"), "hello");
        assert_eq!(run("undefined"), "undefined");
        assert_eq!(run("null"), "null");
        assert_eq!(run("({ a: 1, b: [true] })"), r#"{"a":1,"b":[true]}"#);
        assert_eq!(run("10n"), "10");
        assert_eq!(run("Symbol('x')"), "Symbol(x)");
    }

    #[test]
    fn test_compile_cache_rebinds_across_contexts() {
        let (isolate, first) = setup();
        let second = Context::new(&isolate).unwrap();

        Script::compile(&first, "g.js", "globalThis.tag = 'first'; tag").unwrap();
        let again = Script::compile(&second, "g.js", "globalThis.tag = 'first'; tag").unwrap();

        let stats = isolate.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(again.run().unwrap(), "first");

        let unseen = Script::compile(&first, "typeof.js", "typeof tag").unwrap();
        assert_eq!(unseen.run().unwrap(), "undefined");
    }

    #[test]
    fn test_run_after_context_disposed() {
        let (_isolate, context) = setup();
        let script = Script::compile(&context, "x.js", "1").unwrap();
        context.dispose();
        assert!(matches!(script.run(), Err(IsolateError::Detached(_))));
    }

    #[test]
    fn test_metrics_recorded() {
        let (isolate, context) = setup();
        let script = Script::compile(&context, "m.js", "1").unwrap();
        script.run().unwrap();
        let _ = Script::compile(&context, "t.js", "throw 1").unwrap().run();

        let s = isolate.metrics().snapshot();
        assert_eq!(s.scripts_run, 1);
        assert_eq!(s.scripts_failed, 1);
        assert_eq!(s.errors.get("RUNTIME_ERROR"), Some(&1));
    }
}
