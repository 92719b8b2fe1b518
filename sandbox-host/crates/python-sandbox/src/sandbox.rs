//! Sandboxed RustPython VM configuration
//!
//! A RustPython interpreter has a single builtins module shared by every
//! frame, so the sandbox restricts by *caller* instead of by namespace:
//! - A frame is trusted when its globals belong to a loaded module or to the
//!   setup scope; the tool namespace and code generated at runtime are not
//! - `__import__`, `getattr`, `hasattr` and the dangerous builtins (open,
//!   eval, exec, compile, ...) are replaced by gates that only restrict
//!   untrusted callers, so the stdlib keeps working unchanged
//! - The tool namespace shadows every builtin outside its allowlist with a
//!   stub and binds strict getattr/hasattr/__import__
//! - `sys.modules` hides its entries from untrusted callers, and imports made
//!   by tool code return views exposing only public, non-module attributes
//! - Injects http_request()/http_get()/http_post() backed by the host bridge
//! - Injects get_secret() as a point lookup over the server's secrets
//! - Captures print() output into a bounded buffer
//! - Sets resource limits (recursion depth)

use rustpython_vm::builtins::{
    PyBaseExceptionRef, PyDict, PyDictRef, PyFloat, PyInt, PyList, PyModule, PyStr, PyTuple, PyType,
};
use rustpython_vm::bytecode::Instruction;
use rustpython_vm::frame::{Frame, FrameRef};
use rustpython_vm::function::{ArgIntoFloat, FuncArgs, PyMethodDef, PyMethodFlags};
use rustpython_vm::signal::UserSignalReceiver;
use rustpython_vm::{
    AsObject, Interpreter, PyObjectRef, PyPayload, PyRef, PyResult, Settings, TryFromObject,
    VirtualMachine,
};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::bridge::{BridgeErrorKind, HostBridge, HttpRequest};

/// Recursion ceiling for tool code; interpreter threads have small stacks.
pub const MAX_RECURSION_DEPTH: usize = 200;

/// Name bound to `__name__` in the tool's module namespace
pub const TOOL_MODULE_NAME: &str = "__tool__";

/// Builtins tool code resolves normally. Exception classes are always visible;
/// everything else in the builtins module is shadowed by a stub.
const TOOL_BUILTINS: &[&str] = &[
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes",
    "callable", "chr", "classmethod", "complex", "dict", "divmod",
    "enumerate", "filter", "float", "format", "frozenset", "hash", "hex",
    "id", "int", "isinstance", "issubclass", "iter", "len", "list", "map",
    "max", "min", "next", "object", "oct", "ord", "pow", "print", "property",
    "range", "repr", "reversed", "round", "set", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "zip", "None", "True",
    "False", "Ellipsis", "NotImplemented", "__build_class__", "__debug__",
    "__doc__",
];

/// Builtins that refuse untrusted callers outright. Trusted stdlib code
/// still reaches the originals.
const GATED_BUILTINS: &[&str] = &[
    "open", "eval", "exec", "compile", "breakpoint", "input", "globals",
    "locals", "vars", "dir", "setattr", "delattr", "help", "exit", "quit",
];

/// Attributes nobody may fetch or assign through the builtins while a tool
/// runs, whoever the caller is. Stdlib code reads them with attribute syntax,
/// which does not go through the gates.
const SENSITIVE_ATTRIBUTES: &[&str] = &[
    "__globals__", "__code__", "__closure__", "__builtins__", "__subclasses__",
    "f_globals", "f_locals", "f_back", "f_builtins", "f_code",
    "gi_frame", "gi_code", "cr_frame", "cr_code", "ag_frame", "ag_code", "tb_frame",
];

/// Modules native code imports on its own behalf, e.g. `repr()` of a module
/// or a codec lookup. They are resolved normally even when a tool frame is
/// innermost, as long as the tool did not remove its own `__import__`.
const RUNTIME_IMPORTS: &[&str] = &[
    "_frozen_importlib", "_frozen_importlib_external", "__reducelib", "copyreg",
    "re", "functools", "warnings", "encodings", "_pycodecs", "_hashlib",
    "locale", "traceback", "json", "zlib", "collections.abc", "array",
];

/// `builtin_gate(name, *args)`: bound to the builtin's name
const BUILTIN_GATE: &PyMethodDef =
    &PyMethodDef::new_const("builtin_gate", builtin_gate_impl, PyMethodFlags::empty(), None);

/// `unavailable(name, *args)`: bound to the shadowed builtin's name
const UNAVAILABLE_BUILTIN: &PyMethodDef =
    &PyMethodDef::new_const("unavailable", unavailable_builtin_impl, PyMethodFlags::empty(), None);

// Thread-local state for the execution running on this thread
thread_local! {
    static STDOUT_BUFFER: RefCell<String> = RefCell::new(String::new());
    static STDOUT_LIMIT: Cell<usize> = Cell::new(usize::MAX);
    static STDOUT_TRUNCATED: Cell<bool> = Cell::new(false);
    static HOST_BRIDGE: RefCell<Option<Arc<dyn HostBridge>>> = RefCell::new(None);
    static SECRETS: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
    static ALLOWED_MODULES: RefCell<HashSet<String>> = RefCell::new(HashSet::new());
    static ORIGINAL_BUILTINS: RefCell<HashMap<String, PyObjectRef>> = RefCell::new(HashMap::new());
    static GATES: RefCell<Vec<PyObjectRef>> = RefCell::new(Vec::new());
    static STRICT_IMPORT: RefCell<Option<PyObjectRef>> = RefCell::new(None);
    static VIEW_BUILDER: RefCell<Option<PyObjectRef>> = RefCell::new(None);
    static TRUSTED_NAMESPACES: RefCell<HashMap<usize, PyDictRef>> = RefCell::new(HashMap::new());
    static TOOL_GLOBALS: RefCell<Option<PyDictRef>> = RefCell::new(None);
    static IMPORT_DENIAL: RefCell<Option<String>> = RefCell::new(None);
}

/// Clear all thread-local state for a fresh execution
pub fn reset_execution_state() {
    STDOUT_BUFFER.with(|sb| sb.borrow_mut().clear());
    STDOUT_LIMIT.with(|l| l.set(usize::MAX));
    STDOUT_TRUNCATED.with(|t| t.set(false));
    HOST_BRIDGE.with(|b| *b.borrow_mut() = None);
    SECRETS.with(|s| s.borrow_mut().clear());
    ALLOWED_MODULES.with(|m| m.borrow_mut().clear());
    ORIGINAL_BUILTINS.with(|o| o.borrow_mut().clear());
    GATES.with(|g| g.borrow_mut().clear());
    STRICT_IMPORT.with(|s| *s.borrow_mut() = None);
    VIEW_BUILDER.with(|v| *v.borrow_mut() = None);
    TRUSTED_NAMESPACES.with(|t| t.borrow_mut().clear());
    TOOL_GLOBALS.with(|g| *g.borrow_mut() = None);
    IMPORT_DENIAL.with(|d| *d.borrow_mut() = None);
}

/// Install per-execution policy before the interpreter is created
pub fn configure_execution(
    bridge: Arc<dyn HostBridge>,
    secrets: &HashMap<String, String>,
    allowed_modules: &[String],
    max_output_bytes: usize,
) {
    HOST_BRIDGE.with(|b| *b.borrow_mut() = Some(bridge));
    SECRETS.with(|s| *s.borrow_mut() = secrets.clone());
    ALLOWED_MODULES.with(|m| *m.borrow_mut() = allowed_modules.iter().cloned().collect());
    STDOUT_LIMIT.with(|l| l.set(max_output_bytes));
}

/// Get the stdout buffer
pub fn get_stdout() -> String {
    STDOUT_BUFFER.with(|sb| sb.borrow().clone())
}

pub fn stdout_truncated() -> bool {
    STDOUT_TRUNCATED.with(Cell::get)
}

/// Take the first import denial recorded during this execution, if any
pub fn take_import_denial() -> Option<String> {
    IMPORT_DENIAL.with(|d| d.borrow_mut().take())
}

/// Append to stdout, honouring the configured limit
pub fn append_stdout(s: &str) {
    STDOUT_BUFFER.with(|sb| {
        let mut buffer = sb.borrow_mut();
        let limit = STDOUT_LIMIT.with(Cell::get);
        let remaining = limit.saturating_sub(buffer.len());
        if s.len() <= remaining {
            buffer.push_str(s);
            return;
        }
        let mut cut = remaining;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        buffer.push_str(&s[..cut]);
        STDOUT_TRUNCATED.with(|t| t.set(true));
    });
}

/// Create a sandboxed Python interpreter
pub fn create_sandboxed_interpreter(
    module_paths: &[String],
    signal_rx: UserSignalReceiver,
) -> Interpreter {
    let mut settings = Settings::default();
    settings.isolated = true;
    settings.user_site_directory = false;
    settings.import_site = false;
    settings.path_list.extend(module_paths.iter().cloned());

    Interpreter::with_init(settings, move |vm| {
        vm.add_native_modules(rustpython_stdlib::get_module_inits());
        vm.add_frozen(rustpython_pylib::FROZEN_STDLIB);
        // Add our sandbox module with the setup hooks
        vm.add_native_module("_sandbox".to_owned(), Box::new(make_sandbox_module));
        vm.set_user_signal_channel(signal_rx);
        vm.recursion_limit.set(MAX_RECURSION_DEPTH);
    })
}

/// Create the sandbox native module used by the setup code
fn make_sandbox_module(vm: &VirtualMachine) -> PyRef<PyModule> {
    let module = PyModule::new();
    let module_ref = module.into_ref(&vm.ctx);
    let dict = module_ref.dict();

    let _ = dict.set_item(
        "caller_is_untrusted",
        vm.new_function("caller_is_untrusted", caller_is_untrusted_impl).into(),
        vm,
    );
    let _ = dict.set_item(
        "is_withheld",
        vm.new_function("is_withheld", is_withheld_impl).into(),
        vm,
    );
    let _ = dict.set_item(
        "register_view_builder",
        vm.new_function("register_view_builder", register_view_builder_impl).into(),
        vm,
    );

    module_ref
}

/// Mark a namespace (the setup scope) as trusted for the rest of the run
pub fn trust_namespace(globals: &PyDictRef) {
    TRUSTED_NAMESPACES.with(|t| {
        t.borrow_mut().insert(globals.get_id(), globals.clone());
    });
}

/// Replace `__import__`, `getattr`, `hasattr`, `print` and the gated builtins
/// with caller-aware versions, keeping the originals reachable only from Rust.
pub fn install_builtin_gates(vm: &VirtualMachine) -> PyResult<()> {
    let builtins = vm.builtins.dict();

    let mut originals = HashMap::new();
    for name in GATED_BUILTINS.iter().chain(&["__import__", "getattr", "hasattr"]) {
        if let Some(original) = builtins.get_item_opt(*name, vm)? {
            originals.insert((*name).to_owned(), original);
        }
    }
    ORIGINAL_BUILTINS.with(|o| *o.borrow_mut() = originals.clone());

    let mut gates: Vec<(&str, PyObjectRef)> = vec![
        ("__import__", vm.new_function("__import__", import_gate_impl).into()),
        ("getattr", vm.new_function("getattr", getattr_gate_impl).into()),
        ("hasattr", vm.new_function("hasattr", hasattr_gate_impl).into()),
    ];
    for name in GATED_BUILTINS {
        if originals.contains_key(*name) {
            let bound = BUILTIN_GATE.build_bound_function(&vm.ctx, vm.ctx.new_str(*name).into());
            gates.push((*name, bound.into()));
        }
    }

    for (name, gate) in &gates {
        builtins.set_item(*name, gate.clone(), vm)?;
    }
    builtins.set_item("print", vm.new_function("print", sandbox_print_impl).into(), vm)?;
    GATES.with(|g| *g.borrow_mut() = gates.into_iter().map(|(_, gate)| gate).collect());
    Ok(())
}

/// Populate the tool's module namespace and remember it as untrusted.
///
/// Every builtin outside [`TOOL_BUILTINS`] is shadowed by a stub that raises
/// `NameError`; getattr/hasattr/__import__ are bound to their strict forms.
pub fn install_tool_namespace(globals: &PyDictRef, vm: &VirtualMachine) -> PyResult<()> {
    let builtins = vm.builtins.dict();
    let strict_import: PyObjectRef = vm.new_function("__import__", tool_import).into();

    for (key, value) in &builtins {
        let Some(name) = key.downcast_ref::<PyStr>() else {
            continue;
        };
        let name = name.as_str();
        if TOOL_BUILTINS.contains(&name) || is_exception_class(&value, vm) {
            continue;
        }
        let replacement: PyObjectRef = match name {
            "__import__" => strict_import.clone(),
            "getattr" => vm.new_function("getattr", strict_getattr_impl).into(),
            "hasattr" => vm.new_function("hasattr", strict_hasattr_impl).into(),
            _ => UNAVAILABLE_BUILTIN
                .build_bound_function(&vm.ctx, vm.ctx.new_str(name).into())
                .into(),
        };
        globals.set_item(name, replacement, vm)?;
    }

    globals.set_item("__name__", vm.ctx.new_str(TOOL_MODULE_NAME).into(), vm)?;
    globals.set_item(
        "http_request",
        vm.new_function("http_request", http_request_impl).into(),
        vm,
    )?;
    globals.set_item("http_get", vm.new_function("http_get", http_get_impl).into(), vm)?;
    globals.set_item("http_post", vm.new_function("http_post", http_post_impl).into(), vm)?;
    globals.set_item("get_secret", vm.new_function("get_secret", get_secret_impl).into(), vm)?;

    STRICT_IMPORT.with(|s| *s.borrow_mut() = Some(strict_import));
    TOOL_GLOBALS.with(|g| *g.borrow_mut() = Some(globals.clone()));
    Ok(())
}

fn is_exception_class(value: &PyObjectRef, vm: &VirtualMachine) -> bool {
    value
        .downcast_ref::<PyType>()
        .is_some_and(|cls| cls.fast_issubclass(vm.ctx.exceptions.base_exception_type))
}

// ===== Caller trust =====

fn caller_frame(vm: &VirtualMachine, depth: usize) -> Option<FrameRef> {
    vm.frames.borrow().iter().rev().nth(depth).cloned()
}

fn is_tool_namespace(globals: &PyDictRef) -> bool {
    TOOL_GLOBALS.with(|g| g.borrow().as_ref().is_some_and(|tool| tool.is(globals)))
}

/// Module namespaces are trusted; anything else (the tool, code compiled at
/// runtime against a fresh dict) is not.
fn namespace_is_trusted(globals: &PyDictRef, vm: &VirtualMachine) -> bool {
    if is_tool_namespace(globals) {
        return false;
    }
    let id = globals.get_id();
    if TRUSTED_NAMESPACES.with(|t| t.borrow().contains_key(&id)) {
        return true;
    }
    refresh_trusted_namespaces(vm);
    TRUSTED_NAMESPACES.with(|t| t.borrow().contains_key(&id))
}

/// Record the namespace of every module currently in `sys.modules`
fn refresh_trusted_namespaces(vm: &VirtualMachine) {
    let Ok(modules) = vm.sys_module.get_attr("modules", vm) else {
        return;
    };
    let Some(modules) = modules.downcast_ref::<PyDict>() else {
        return;
    };
    // Iterating the storage directly skips any __getitem__ override
    let namespaces: Vec<PyDictRef> = modules
        .into_iter()
        .filter_map(|(_, module)| module.dict())
        .filter(|namespace| !is_tool_namespace(namespace))
        .collect();
    TRUSTED_NAMESPACES.with(|t| {
        let mut trusted = t.borrow_mut();
        for namespace in namespaces {
            trusted.entry(namespace.get_id()).or_insert(namespace);
        }
    });
}

/// True when the frame `depth` levels below the innermost one is untrusted.
/// Native functions push no frame, so depth 0 is their caller.
fn caller_is_untrusted(vm: &VirtualMachine, depth: usize) -> bool {
    match caller_frame(vm, depth) {
        Some(frame) => !namespace_is_trusted(&frame.globals, vm),
        None => false,
    }
}

/// `caller_is_untrusted()` for Python helpers: skips the helper's own frame
fn caller_is_untrusted_impl(vm: &VirtualMachine) -> bool {
    caller_is_untrusted(vm, 1)
}

/// True while the frame executes an `import` statement
fn frame_is_importing(frame: &Frame) -> bool {
    (frame.lasti() as usize)
        .checked_sub(1)
        .and_then(|index| frame.code.code.instructions.get(index))
        .is_some_and(|unit| {
            matches!(unit.op, Instruction::ImportName { .. } | Instruction::ImportNameless)
        })
}

/// The tool still resolves `__import__` to its strict form
fn tool_import_intact(vm: &VirtualMachine) -> bool {
    let bound = TOOL_GLOBALS
        .with(|g| g.borrow().clone())
        .and_then(|globals| globals.get_item_opt("__import__", vm).ok().flatten());
    match bound {
        Some(bound) => STRICT_IMPORT.with(|s| s.borrow().as_ref().is_some_and(|strict| strict.is(&bound))),
        None => false,
    }
}

fn is_withheld_impl(value: PyObjectRef) -> bool {
    let is_gate = GATES.with(|g| g.borrow().iter().any(|gate| gate.is(&value)));
    is_gate || ORIGINAL_BUILTINS.with(|o| o.borrow().values().any(|original| original.is(&value)))
}

fn register_view_builder_impl(builder: PyObjectRef, vm: &VirtualMachine) -> PyResult<()> {
    if !builder.is_callable() {
        return Err(vm.new_type_error("view builder must be callable".to_owned()));
    }
    VIEW_BUILDER.with(|v| *v.borrow_mut() = Some(builder));
    Ok(())
}

fn call_original(name: &str, args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let original = ORIGINAL_BUILTINS
        .with(|o| o.borrow().get(name).cloned())
        .ok_or_else(|| vm.new_runtime_error(format!("sandbox builtin '{}' is not initialised", name)))?;
    original.call(args, vm)
}

fn name_not_defined(name: &str, vm: &VirtualMachine) -> PyBaseExceptionRef {
    vm.new_name_error(
        format!("name '{}' is not defined", name),
        vm.ctx.new_str(name),
    )
}

/// Strip the bound builtin name that precedes the caller's arguments
fn take_bound_name(args: &mut FuncArgs, vm: &VirtualMachine) -> PyResult<String> {
    if args.args.is_empty() {
        return Err(vm.new_type_error("missing bound builtin name".to_owned()));
    }
    args.args.remove(0).try_to_value(vm)
}

/// Shadow for a builtin the tool may not use
fn unavailable_builtin_impl(mut args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = take_bound_name(&mut args, vm)?;
    Err(name_not_defined(&name, vm))
}

/// Gate for dangerous builtins: untrusted callers get `NameError`
fn builtin_gate_impl(mut args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = take_bound_name(&mut args, vm)?;
    if caller_is_untrusted(vm, 0) {
        return Err(name_not_defined(&name, vm));
    }
    if matches!(name.as_str(), "setattr" | "delattr") {
        if let Some(attribute) = args.args.get(1).and_then(|a| a.downcast_ref::<PyStr>()) {
            if SENSITIVE_ATTRIBUTES.contains(&attribute.as_str()) {
                return Err(attribute_refused(attribute.as_str(), vm));
            }
        }
    }
    call_original(&name, args, vm)
}

// ===== Imports =====

fn is_module_allowed(top_level: &str) -> bool {
    if top_level == "__future__" {
        return true;
    }
    !top_level.starts_with('_') && ALLOWED_MODULES.with(|m| m.borrow().contains(top_level))
}

fn deny_import(message: String, vm: &VirtualMachine) -> PyBaseExceptionRef {
    IMPORT_DENIAL.with(|d| {
        let mut denial = d.borrow_mut();
        if denial.is_none() {
            *denial = Some(message.clone());
        }
    });
    vm.new_exception_msg(vm.ctx.exceptions.import_error.to_owned(), message)
}

fn import_name_arg(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<String> {
    args.args
        .first()
        .or_else(|| args.kwargs.get("name"))
        .ok_or_else(|| vm.new_type_error("__import__() missing required argument 'name'".to_owned()))?
        .try_to_value(vm)
}

/// Import on behalf of tool code (also the tool's own `__import__`):
/// allowlist check, then a public view
fn tool_import(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = import_name_arg(&args, vm)?;
    let level: i32 = match args.args.get(4).or_else(|| args.kwargs.get("level")) {
        Some(obj) => obj.try_to_value(vm)?,
        None => 0,
    };
    if level != 0 {
        return Err(deny_import(
            "Relative imports are not allowed in the sandbox".to_owned(),
            vm,
        ));
    }
    let top_level = name.split('.').next().unwrap_or_default();
    if !is_module_allowed(top_level) {
        return Err(deny_import(
            format!("Import '{}' is not allowed in the sandbox", name),
            vm,
        ));
    }

    let module = call_original("__import__", args, vm)?;
    let builder = VIEW_BUILDER
        .with(|v| v.borrow().clone())
        .ok_or_else(|| vm.new_runtime_error("sandbox module views are not initialised".to_owned()))?;
    builder.call((module,), vm)
}

/// `builtins.__import__`: import statements and explicit calls from untrusted
/// frames go through [`tool_import`]; native runtime imports pass.
fn import_gate_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    if let Some(frame) = caller_frame(vm, 0) {
        if !namespace_is_trusted(&frame.globals, vm) {
            let name = import_name_arg(&args, vm)?;
            let runtime_import = RUNTIME_IMPORTS.contains(&name.as_str())
                && (!is_tool_namespace(&frame.globals) || tool_import_intact(vm));
            if frame_is_importing(&frame) || !runtime_import {
                return tool_import(args, vm);
            }
        }
    }
    call_original("__import__", args, vm)
}

// ===== Attribute access =====

fn attribute_refused(name: &str, vm: &VirtualMachine) -> PyBaseExceptionRef {
    vm.new_attribute_error(format!(
        "access to attribute '{}' is not allowed in the sandbox",
        name
    ))
}

/// Tool-side rule: no dunder names, no frame internals
fn check_attribute_name(name: &str, vm: &VirtualMachine) -> PyResult<()> {
    if name.starts_with("__") || SENSITIVE_ATTRIBUTES.contains(&name) {
        return Err(attribute_refused(name, vm));
    }
    Ok(())
}

fn attribute_name_arg(args: &FuncArgs, vm: &VirtualMachine) -> PyResult<String> {
    args.args
        .get(1)
        .ok_or_else(|| vm.new_type_error("attribute name must be given".to_owned()))?
        .try_to_value(vm)
}

/// getattr(obj, name[, default]) as the tool sees it
fn strict_getattr_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = attribute_name_arg(&args, vm)?;
    check_attribute_name(&name, vm)?;
    call_original("getattr", args, vm)
}

/// hasattr(obj, name) as the tool sees it
fn strict_hasattr_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = attribute_name_arg(&args, vm)?;
    check_attribute_name(&name, vm)?;
    call_original("hasattr", args, vm)
}

/// `builtins.getattr`: strict for untrusted callers. Trusted callers see
/// sensitive attributes as missing, so a stdlib helper handed an attribute
/// name by the tool cannot fetch them on its behalf.
fn getattr_gate_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let name = attribute_name_arg(&args, vm)?;
    if caller_is_untrusted(vm, 0) {
        check_attribute_name(&name, vm)?;
    } else if SENSITIVE_ATTRIBUTES.contains(&name.as_str()) {
        return match args.args.get(2) {
            Some(default) => Ok(default.clone()),
            None => Err(attribute_refused(&name, vm)),
        };
    }
    call_original("getattr", args, vm)
}

/// `builtins.hasattr`: strict for untrusted callers only
fn hasattr_gate_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    if caller_is_untrusted(vm, 0) {
        let name = attribute_name_arg(&args, vm)?;
        check_attribute_name(&name, vm)?;
    }
    call_original("hasattr", args, vm)
}

/// Sandbox print that captures to buffer
fn sandbox_print_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult<()> {
    let sep = optional_str_kwarg(&args, "sep", vm)?.unwrap_or_else(|| " ".to_owned());
    let end = optional_str_kwarg(&args, "end", vm)?.unwrap_or_else(|| "\n".to_owned());

    let mut output = String::new();
    for (i, arg) in args.args.iter().enumerate() {
        if i > 0 {
            output.push_str(&sep);
        }
        let s: String = arg.str(vm)?.to_string();
        output.push_str(&s);
    }
    output.push_str(&end);
    append_stdout(&output);
    Ok(())
}

fn optional_str_kwarg(args: &FuncArgs, key: &str, vm: &VirtualMachine) -> PyResult<Option<String>> {
    match args.kwargs.get(key) {
        Some(obj) if !vm.is_none(obj) => Ok(Some(obj.str(vm)?.to_string())),
        _ => Ok(None),
    }
}

/// get_secret(name[, default]) -> str
fn get_secret_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let key: String = args
        .args
        .first()
        .ok_or_else(|| vm.new_type_error("get_secret requires a secret name".to_owned()))?
        .try_to_value(vm)?;
    let default = args
        .args
        .get(1)
        .cloned()
        .or_else(|| args.kwargs.get("default").cloned());

    match SECRETS.with(|s| s.borrow().get(&key).cloned()) {
        Some(value) => Ok(vm.ctx.new_str(value).into()),
        None => default.ok_or_else(|| vm.new_key_error(vm.ctx.new_str(key).into())),
    }
}

/// http_request(method, url, headers=None, body=None, json=None, timeout=None)
fn http_request_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let method = positional_or_kw(&args, 0, "method", vm)?;
    let url = positional_or_kw(&args, 1, "url", vm)?;
    perform_http(method, url, &args, vm)
}

/// http_get(url, headers=None, timeout=None)
fn http_get_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let url = positional_or_kw(&args, 0, "url", vm)?;
    perform_http("GET".to_owned(), url, &args, vm)
}

/// http_post(url, headers=None, body=None, json=None, timeout=None)
fn http_post_impl(args: FuncArgs, vm: &VirtualMachine) -> PyResult {
    let url = positional_or_kw(&args, 0, "url", vm)?;
    perform_http("POST".to_owned(), url, &args, vm)
}

fn positional_or_kw(args: &FuncArgs, index: usize, key: &str, vm: &VirtualMachine) -> PyResult<String> {
    args.args
        .get(index)
        .or_else(|| args.kwargs.get(key))
        .ok_or_else(|| vm.new_type_error(format!("missing required argument '{}'", key)))?
        .try_to_value(vm)
}

fn perform_http(method: String, url: String, args: &FuncArgs, vm: &VirtualMachine) -> PyResult {
    let mut headers = BTreeMap::new();
    if let Some(obj) = args.kwargs.get("headers").filter(|o| !vm.is_none(o)) {
        match pyobject_to_json(obj, vm)? {
            Value::Object(map) => {
                for (key, value) in map {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    headers.insert(key, value);
                }
            }
            _ => return Err(vm.new_type_error("headers must be a dict".to_owned())),
        }
    }

    let mut body = optional_str_kwarg(args, "body", vm)?;
    if let Some(obj) = args.kwargs.get("json").filter(|o| !vm.is_none(o)) {
        let payload = pyobject_to_json(obj, vm)?;
        body = Some(payload.to_string());
        if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
            headers.insert("Content-Type".to_owned(), "application/json".to_owned());
        }
    }

    let timeout_secs = match args.kwargs.get("timeout").filter(|o| !vm.is_none(o)) {
        Some(obj) => Some(f64::from(ArgIntoFloat::try_from_object(vm, obj.clone())?)),
        None => None,
    };

    let bridge = HOST_BRIDGE
        .with(|b| b.borrow().clone())
        .ok_or_else(|| {
            vm.new_exception_msg(
                vm.ctx.exceptions.permission_error.to_owned(),
                "network access is not available".to_owned(),
            )
        })?;

    let request = HttpRequest {
        method: method.to_ascii_uppercase(),
        url,
        headers,
        body,
        timeout_secs,
    };

    match bridge.http_request(request) {
        Ok(response) => {
            let dict = PyDict::new_ref(&vm.ctx);
            dict.set_item("status", vm.ctx.new_int(response.status).into(), vm)?;
            dict.set_item(
                "ok",
                vm.ctx.new_bool((200..300).contains(&response.status)).into(),
                vm,
            )?;
            let header_dict = PyDict::new_ref(&vm.ctx);
            for (key, value) in &response.headers {
                header_dict.set_item(key.as_str(), vm.ctx.new_str(value.clone()).into(), vm)?;
            }
            dict.set_item("headers", header_dict.into(), vm)?;
            let parsed = match serde_json::from_str::<Value>(&response.body) {
                Ok(value) => json_to_pyobject(&value, vm)?,
                Err(_) => vm.ctx.none(),
            };
            dict.set_item("json", parsed, vm)?;
            dict.set_item("text", vm.ctx.new_str(response.body).into(), vm)?;
            Ok(dict.into())
        }
        Err(err) => {
            let exc_type = match err.kind {
                BridgeErrorKind::Denied => vm.ctx.exceptions.permission_error,
                BridgeErrorKind::TimedOut => vm.ctx.exceptions.timeout_error,
                BridgeErrorKind::Failed => vm.ctx.exceptions.connection_error,
            };
            Err(vm.new_exception_msg(exc_type.to_owned(), err.message))
        }
    }
}

/// Convert a Python object to JSON Value
pub fn pyobject_to_json(obj: &PyObjectRef, vm: &VirtualMachine) -> PyResult<Value> {
    // Check for None
    if obj.is(&vm.ctx.none) {
        return Ok(Value::Null);
    }

    // bool is a subclass of int, so it must be checked first
    if obj.class().is(vm.ctx.types.bool_type) {
        if let Ok(b) = obj.try_to_value::<bool>(vm) {
            return Ok(Value::Bool(b));
        }
    }

    // Try as int
    if let Some(i) = obj.downcast_ref::<PyInt>() {
        if let Ok(n) = i.try_to_primitive::<i64>(vm) {
            return Ok(Value::Number(n.into()));
        }
        // Beyond i64: keep the digits rather than losing precision
        return Ok(Value::String(obj.str(vm)?.to_string()));
    }

    // Try as float
    if let Some(f) = obj.downcast_ref::<PyFloat>() {
        if let Some(n) = serde_json::Number::from_f64(f.to_f64()) {
            return Ok(Value::Number(n));
        }
        return Ok(Value::Null);
    }

    // Try as string
    if let Some(s) = obj.downcast_ref::<PyStr>() {
        return Ok(Value::String(s.as_str().to_string()));
    }

    // Try as list
    if let Some(list) = obj.downcast_ref::<PyList>() {
        let items: Result<Vec<Value>, _> = list
            .borrow_vec()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }

    // Tuples serialise like lists
    if let Some(tuple) = obj.downcast_ref::<PyTuple>() {
        let items: Result<Vec<Value>, _> = tuple
            .as_slice()
            .iter()
            .map(|item| pyobject_to_json(item, vm))
            .collect();
        return Ok(Value::Array(items?));
    }

    // Try as dict
    if let Some(dict) = obj.downcast_ref::<PyDict>() {
        let mut map = serde_json::Map::new();
        for (k, v) in dict {
            let key_str: String = k.str(vm)?.to_string();
            let json_value = pyobject_to_json(&v, vm)?;
            map.insert(key_str, json_value);
        }
        return Ok(Value::Object(map));
    }

    // Fallback: convert to string representation
    let s: String = obj.str(vm)?.to_string();
    Ok(Value::String(s))
}

/// Convert a JSON Value to Python object
pub fn json_to_pyobject(value: &Value, vm: &VirtualMachine) -> PyResult {
    match value {
        Value::Null => Ok(vm.ctx.none()),
        Value::Bool(b) => Ok(vm.ctx.new_bool(*b).into()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(vm.ctx.new_int(i).into())
            } else if let Some(f) = n.as_f64() {
                Ok(vm.ctx.new_float(f).into())
            } else {
                Ok(vm.ctx.none())
            }
        }
        Value::String(s) => Ok(vm.ctx.new_str(s.clone()).into()),
        Value::Array(arr) => {
            let items: Result<Vec<_>, _> = arr.iter().map(|v| json_to_pyobject(v, vm)).collect();
            Ok(vm.ctx.new_list(items?).into())
        }
        Value::Object(obj) => {
            let dict = PyDict::new_ref(&vm.ctx);
            for (k, v) in obj {
                let py_value = json_to_pyobject(v, vm)?;
                dict.set_item(k.as_str(), py_value, vm)?;
            }
            Ok(dict.into())
        }
    }
}

/// Setup code run in the trusted setup scope before the builtin gates are
/// installed.
///
/// Replaces `sys.modules` with a table that hides its entries from untrusted
/// callers, so a cached module can only reach tool code through an import
/// (and thus the allowlist). Registers the builder of the module views handed
/// to tool imports.
pub const SANDBOX_SETUP_CODE: &str = r#"
import sys
import _sandbox

_module_type = type(sys)
_dict_getitem = dict.__getitem__
_caller_is_untrusted = _sandbox.caller_is_untrusted
_is_withheld = _sandbox.is_withheld


class _ModuleTable(dict):
    __slots__ = ()

    def __getitem__(self, name):
        if _caller_is_untrusted():
            raise KeyError(name)
        return _dict_getitem(self, name)


sys.modules = _ModuleTable(sys.modules)

# Public helpers that evaluate strings or look attributes up by a
# caller-supplied name inside stdlib frames.
_WITHHELD_ATTRIBUTES = {
    'functools': frozenset({'singledispatch', 'singledispatchmethod'}),
    'operator': frozenset({'attrgetter', 'methodcaller'}),
    'string': frozenset({'Formatter'}),
    'typing': frozenset({'get_type_hints', 'ForwardRef'}),
    'uuid': frozenset({'getnode', 'uuid1'}),
}
_KEPT_DUNDERS = frozenset({'__all__', '__version__'})


def _public_view(module, package, built):
    name = module.__name__
    view = built.get(name)
    if view is not None:
        return view
    view = _module_type(name, module.__doc__)
    built[name] = view
    withheld = _WITHHELD_ATTRIBUTES.get(name, frozenset())
    public = {}
    for key, value in list(module.__dict__.items()):
        if key.startswith('_'):
            if key in _KEPT_DUNDERS:
                public[key] = value
            continue
        if key in withheld or _is_withheld(value):
            continue
        if isinstance(value, _module_type):
            owner = getattr(value, '__name__', '')
            if not isinstance(owner, str) or owner.partition('.')[0] != package:
                continue
            value = _public_view(value, package, built)
        public[key] = value
    view.__dict__.update(public)
    return view


def _module_view(module):
    return _public_view(module, module.__name__.partition('.')[0], {})


_sandbox.register_view_builder(_module_view)
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state() {
        append_stdout("left over");
        IMPORT_DENIAL.with(|d| *d.borrow_mut() = Some("x".to_string()));
        ALLOWED_MODULES.with(|m| m.borrow_mut().insert("json".to_string()));

        reset_execution_state();

        assert!(get_stdout().is_empty());
        assert!(take_import_denial().is_none());
        assert!(!is_module_allowed("json"));
    }

    #[test]
    fn test_stdout_capture() {
        reset_execution_state();
        append_stdout("Hello ");
        append_stdout("World\n");
        assert_eq!(get_stdout(), "Hello World\n");
        assert!(!stdout_truncated());
    }

    #[test]
    fn test_stdout_limit_truncates_on_char_boundary() {
        reset_execution_state();
        STDOUT_LIMIT.with(|l| l.set(5));
        append_stdout("abcé-tail");
        assert_eq!(get_stdout(), "abcé");
        assert!(stdout_truncated());
        append_stdout("more");
        assert_eq!(get_stdout(), "abcé");
        reset_execution_state();
    }

    #[test]
    fn test_private_modules_never_allowed() {
        reset_execution_state();
        ALLOWED_MODULES.with(|m| {
            let mut allowed = m.borrow_mut();
            allowed.insert("_thread".to_string());
            allowed.insert("json".to_string());
        });

        assert!(is_module_allowed("json"));
        assert!(is_module_allowed("__future__"));
        assert!(!is_module_allowed("_thread"));
        assert!(!is_module_allowed("os"));
        reset_execution_state();
    }

    #[test]
    fn test_attribute_name_rules() {
        let interpreter = Interpreter::without_stdlib(Default::default());
        interpreter.enter(|vm| {
            assert!(check_attribute_name("upper", vm).is_ok());
            assert!(check_attribute_name("__globals__", vm).is_err());
            assert!(check_attribute_name("__class__", vm).is_err());
            assert!(check_attribute_name("f_back", vm).is_err());
        });
    }
}
