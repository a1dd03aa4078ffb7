//! The shared Python namespace every submission executes against.
//!
//! A [`Namespace`] owns one RustPython interpreter and one globals scope. Every
//! snippet runs with that scope as both its globals and locals, so names bound
//! by one submission stay visible to every later submission until the process
//! exits. Two bindings are reserved:
//!
//! - `fujian_return`: reset to `""` before each execution, read and removed
//!   right after it.
//! - `FUJIAN_WS`: the push handle of the currently open websocket connection,
//!   or `None`.
//!
//! The interpreter is not `Send`; a namespace must stay on the thread that
//! created it (see [`crate::executor`]).

use std::path::{Path, PathBuf};

use rustpython_vm::{
    builtins::{PyBaseExceptionRef, PyDict, PyFloat, PyInt, PyList, PyStr, PyTuple},
    compiler::{CompileError, Mode},
    function::FuncArgs,
    scope::Scope,
    AsObject, Interpreter, PyObjectRef, PyResult, VirtualMachine,
};
use tracing::debug;
use uuid::Uuid;

use crate::capture::CaptureBuffer;
use crate::channel::LiveChannel;
use crate::error::EngineError;

/// Binding read back as the "return" field of an outcome.
pub const RETURN_SLOT: &str = "fujian_return";

/// Binding holding the open websocket connection's push handle.
pub const CHANNEL_SLOT: &str = "FUJIAN_WS";

/// Filename reported in tracebacks for submitted code.
const SOURCE_PATH: &str = "<string>";

/// An unhandled exception raised by executed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

/// What a single `execute` call produced, before output is collected.
pub type RawOutcome = Result<(), Failure>;

/// Interpreter construction options.
#[derive(Debug, Clone, Default)]
pub struct NamespaceSettings {
    /// Directories of pure-Python modules appended to `sys.path`.
    pub module_paths: Vec<PathBuf>,
}

impl NamespaceSettings {
    /// Add any Python 3 standard library found on the host.
    pub fn with_host_stdlib(mut self) -> Self {
        self.module_paths.extend(host_stdlib_paths());
        self
    }
}

/// Candidate locations of a host CPython stdlib. RustPython can import the
/// pure-Python modules from there; its own native modules take precedence.
fn host_stdlib_paths() -> Vec<PathBuf> {
    [
        "/usr/local/lib/python3.13",
        "/usr/local/lib/python3.12",
        "/usr/local/lib/python3.11",
        "/usr/lib/python3.13",
        "/usr/lib/python3.12",
        "/usr/lib/python3.11",
        "/usr/lib/python3",
    ]
    .iter()
    .map(Path::new)
    .filter(|p| p.is_dir())
    .map(Path::to_path_buf)
    .collect()
}

pub struct Namespace {
    interp: Interpreter,
    scope: Scope,
    bound_channel: Option<Uuid>,
}

impl Namespace {
    pub fn new(settings: &NamespaceSettings) -> Result<Self, EngineError> {
        let mut vm_settings = rustpython_vm::Settings::default();
        for path in &settings.module_paths {
            vm_settings.path_list.push(path.display().to_string());
        }

        let interp = Interpreter::with_init(vm_settings, |vm| {
            vm.add_native_modules(rustpython_stdlib::get_module_inits());
        });

        let scope = interp.enter(|vm| {
            let scope = vm.new_scope_with_builtins();
            scope
                .globals
                .set_item("__name__", vm.ctx.new_str("__main__").into(), vm)
                .and_then(|()| scope.globals.set_item(CHANNEL_SLOT, vm.ctx.none(), vm))
                .map_err(|exc| bookkeeping(vm, "seeding globals", &exc))?;
            Ok::<_, EngineError>(scope)
        })?;

        debug!(paths = settings.module_paths.len(), "namespace created");
        Ok(Self {
            interp,
            scope,
            bound_channel: None,
        })
    }

    /// Replace `sys.stdout` and `sys.stderr` with writers feeding the given buffers.
    ///
    /// Whatever writers the previous execution installed are overwritten, not
    /// restored.
    pub fn install_capture(
        &self,
        stdout: &CaptureBuffer,
        stderr: &CaptureBuffer,
    ) -> Result<(), EngineError> {
        self.interp.enter(|vm| {
            install_writers(vm, stdout, stderr)
                .map_err(|exc| bookkeeping(vm, "installing output capture", &exc))
        })
    }

    /// Set `fujian_return` to the empty string.
    pub fn reset_return_slot(&self) -> Result<(), EngineError> {
        self.interp.enter(|vm| {
            self.scope
                .globals
                .set_item(RETURN_SLOT, vm.ctx.new_str("").into(), vm)
                .map_err(|exc| bookkeeping(vm, "resetting the return slot", &exc))
        })
    }

    /// Read `fujian_return` as text and remove the binding.
    ///
    /// The outer error is a bookkeeping failure. The inner error is an
    /// exception raised while converting the value to text (a user-defined
    /// `__str__`), which is reported like any other failure of executed code.
    /// A slot deleted by the executed code reads as empty.
    pub fn take_return_slot(&self) -> Result<Result<String, Failure>, EngineError> {
        self.interp.enter(|vm| {
            let globals = &self.scope.globals;
            let value = globals
                .get_item_opt(RETURN_SLOT, vm)
                .map_err(|exc| bookkeeping(vm, "reading the return slot", &exc))?;
            let Some(value) = value else {
                return Ok(Ok(String::new()));
            };
            globals
                .del_item(RETURN_SLOT, vm)
                .map_err(|exc| bookkeeping(vm, "clearing the return slot", &exc))?;
            Ok(value
                .str(vm)
                .map(|s| s.as_str().to_owned())
                .map_err(|exc| failure_from_exception(vm, &exc)))
        })
    }

    /// Bind `FUJIAN_WS` to `channel`, or to `None`.
    pub fn bind_channel(&mut self, channel: Option<LiveChannel>) -> Result<(), EngineError> {
        let id = channel.as_ref().map(LiveChannel::id);
        self.interp.enter(|vm| {
            let value = match channel {
                Some(channel) => channel_object(vm, channel)
                    .map_err(|exc| bookkeeping(vm, "building the live channel object", &exc))?,
                None => vm.ctx.none(),
            };
            self.scope
                .globals
                .set_item(CHANNEL_SLOT, value, vm)
                .map_err(|exc| bookkeeping(vm, "binding the live channel", &exc))
        })?;
        self.bound_channel = id;
        Ok(())
    }

    /// Clear `FUJIAN_WS` if it still refers to connection `id`.
    ///
    /// Returns whether the binding was cleared. A newer connection's binding is
    /// left in place.
    pub fn release_channel(&mut self, id: Uuid) -> Result<bool, EngineError> {
        if self.bound_channel != Some(id) {
            return Ok(false);
        }
        self.bind_channel(None)?;
        Ok(true)
    }

    /// Id of the connection `FUJIAN_WS` currently refers to.
    pub fn bound_channel(&self) -> Option<Uuid> {
        self.bound_channel
    }

    /// Compile and run `code` with this namespace as globals and locals.
    pub fn execute(&self, code: &str) -> RawOutcome {
        self.interp.enter(|vm| {
            let code_obj = vm
                .compile(code, Mode::Exec, SOURCE_PATH.to_owned())
                .map_err(|err| failure_from_syntax_error(&err))?;
            vm.run_code_obj(code_obj, self.scope.clone())
                .map(drop)
                .map_err(|exc| failure_from_exception(vm, &exc))
        })
    }

    /// `str()` of a global binding, or `None` when unbound.
    #[cfg(test)]
    fn lookup(&self, name: &str) -> Result<Option<String>, EngineError> {
        self.interp.enter(|vm| {
            let value = self
                .scope
                .globals
                .get_item_opt(name, vm)
                .map_err(|exc| bookkeeping(vm, "reading a binding", &exc))?;
            value
                .map(|v| {
                    v.str(vm)
                        .map(|s| s.as_str().to_owned())
                        .map_err(|exc| bookkeeping(vm, "formatting a binding", &exc))
                })
                .transpose()
        })
    }
}

fn bookkeeping(vm: &VirtualMachine, what: &str, exc: &PyBaseExceptionRef) -> EngineError {
    let failure = failure_from_exception(vm, exc);
    EngineError::Bookkeeping(format!("{what}: {}: {}", failure.kind, failure.message))
}

fn failure_from_exception(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> Failure {
    let kind = exc.class().name().to_string();
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
    let mut traceback = String::new();
    if vm.write_exception(&mut traceback, exc).is_err() || traceback.is_empty() {
        traceback = format!("{kind}: {message}\n");
    }
    Failure {
        kind,
        message,
        traceback,
    }
}

fn failure_from_syntax_error(err: &CompileError) -> Failure {
    let (line, _col) = err.python_location();
    let message = err.to_string();
    let traceback = format!(
        "Traceback (most recent call last):\n  File \"{SOURCE_PATH}\", line {line}\nSyntaxError: {message}\n"
    );
    Failure {
        kind: "SyntaxError".to_owned(),
        message,
        traceback,
    }
}

fn install_writers(
    vm: &VirtualMachine,
    stdout: &CaptureBuffer,
    stderr: &CaptureBuffer,
) -> PyResult<()> {
    let out = writer_object(vm, stdout.clone())?;
    let err = writer_object(vm, stderr.clone())?;
    vm.sys_module.set_attr("stdout", out, vm)?;
    vm.sys_module.set_attr("stderr", err, vm)
}

/// A minimal file-like object whose `write` appends to `buffer`.
fn writer_object(vm: &VirtualMachine, buffer: CaptureBuffer) -> PyResult<PyObjectRef> {
    let write_fn = vm.new_function(
        "write",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let text = match args.args.first() {
                Some(obj) => obj.str(vm)?.as_str().to_owned(),
                None => String::new(),
            };
            buffer.write(&text);
            Ok(vm.ctx.new_int(text.chars().count()).into())
        },
    );
    let flush_fn = vm.new_function(
        "flush",
        |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
    );

    let ns = vm.new_module("<capture>", vm.ctx.new_dict(), None);
    ns.set_attr("write", write_fn, vm)?;
    ns.set_attr("flush", flush_fn, vm)?;
    ns.set_attr("closed", vm.ctx.new_bool(false), vm)?;
    ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm)?;
    Ok(ns.into())
}

/// The object executed code sees as `FUJIAN_WS`.
fn channel_object(vm: &VirtualMachine, channel: LiveChannel) -> PyResult<PyObjectRef> {
    let pusher = channel.clone();
    let write_message = vm.new_function(
        "write_message",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let message = args.args.first().ok_or_else(|| {
                vm.new_type_error("write_message() missing required argument: 'message'".to_owned())
            })?;
            let text = message_text(vm, message)?;
            pusher
                .push(text)
                .map_err(|err| vm.new_runtime_error(err.to_string()))?;
            Ok(vm.ctx.none())
        },
    );
    let is_open = vm.new_function(
        "is_open",
        move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            Ok(vm.ctx.new_bool(channel.is_open()).into())
        },
    );

    let ns = vm.new_module(CHANNEL_SLOT, vm.ctx.new_dict(), None);
    ns.set_attr("write_message", write_message, vm)?;
    ns.set_attr("is_open", is_open, vm)?;
    Ok(ns.into())
}

/// Strings go out verbatim; containers and scalars are sent as JSON.
fn message_text(vm: &VirtualMachine, message: &PyObjectRef) -> PyResult<String> {
    if let Some(s) = message.downcast_ref::<PyStr>() {
        return Ok(s.as_str().to_owned());
    }
    Ok(to_json(vm, message)?.to_string())
}

fn to_json(vm: &VirtualMachine, obj: &PyObjectRef) -> PyResult<serde_json::Value> {
    use serde_json::Value;

    if vm.is_none(obj) {
        return Ok(Value::Null);
    }
    // bool is a subclass of int, so test the singletons first.
    if obj.is(&vm.ctx.true_value) {
        return Ok(Value::Bool(true));
    }
    if obj.is(&vm.ctx.false_value) {
        return Ok(Value::Bool(false));
    }
    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_owned()));
    }
    if obj.downcast_ref::<PyInt>().is_some() || obj.downcast_ref::<PyFloat>().is_some() {
        let repr = obj.repr(vm)?;
        return repr
            .as_str()
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .map_err(|_| {
                vm.new_value_error(format!(
                    "Out of range float values are not JSON compliant: {}",
                    repr.as_str()
                ))
            });
    }
    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items = list.borrow_vec().to_vec();
        return items
            .iter()
            .map(|item| to_json(vm, item))
            .collect::<PyResult<Vec<_>>>()
            .map(Value::Array);
    }
    if let Some(tuple) = obj.downcast_ref::<PyTuple>() {
        return tuple
            .as_slice()
            .iter()
            .map(|item| to_json(vm, item))
            .collect::<PyResult<Vec<_>>>()
            .map(Value::Array);
    }
    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (key, value) in dict {
            map.insert(json_key(vm, &key)?, to_json(vm, &value)?);
        }
        return Ok(Value::Object(map));
    }
    Err(vm.new_type_error(format!(
        "Object of type {} is not JSON serializable",
        &*obj.class().name()
    )))
}

/// Object keys follow Python's `json` module: scalars are stringified as
/// their JSON form, so `True` becomes `"true"` and `None` becomes `"null"`.
fn json_key(vm: &VirtualMachine, key: &PyObjectRef) -> PyResult<String> {
    if let Some(s) = key.downcast_ref::<PyStr>() {
        return Ok(s.as_str().to_owned());
    }
    let scalar = vm.is_none(key)
        || key.downcast_ref::<PyInt>().is_some()
        || key.downcast_ref::<PyFloat>().is_some();
    if !scalar {
        return Err(vm.new_type_error(format!(
            "keys must be str, int, float, bool or None, not {}",
            &*key.class().name()
        )));
    }
    Ok(to_json(vm, key)?.to_string())
}
