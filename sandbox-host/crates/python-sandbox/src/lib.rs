//! Python Sandbox - Secure Python execution via RustPython
//!
//! This crate provides the sandboxed Python execution environment used to run
//! registered tools:
//! - Uses RustPython for embedded Python execution with a frozen stdlib
//! - Restricts builtins, imports and introspection for tool code while the
//!   stdlib runs unrestricted
//! - Provides http_request()/get_secret() backed by the host
//! - Captures stdout into a bounded buffer
//! - Can be interrupted by the host when a deadline passes

pub mod bridge;
pub mod interrupt;
pub mod protocol;
pub mod sandbox;

use bridge::HostBridge;
use interrupt::InterruptHandle;
use protocol::{ExecutionRequest, ExecutionResult, ExecutionStatus};
use rustpython_compiler::Mode;
use rustpython_vm::builtins::PyBaseExceptionRef;
use rustpython_vm::function::FuncArgs;
use rustpython_vm::scope::Scope;
use rustpython_vm::{AsObject, PyObjectRef, PyResult, VirtualMachine};
use sandbox::{
    configure_execution, create_sandboxed_interpreter, get_stdout, install_builtin_gates,
    install_tool_namespace, json_to_pyobject, pyobject_to_json, reset_execution_state,
    stdout_truncated, take_import_denial, trust_namespace, SANDBOX_SETUP_CODE,
};
use serde_json::Value;
use std::sync::Arc;

enum RunFailure {
    /// The sandbox itself could not be prepared
    Setup(String),
    /// Tool code raised or did not compile
    Raised(String),
}

/// Execute a tool in a fresh sandbox
///
/// Blocks the calling thread until the entry point returns, raises, or the
/// interrupt handle fires. Each call builds a new interpreter so no state
/// survives between executions.
pub fn execute(
    request: &ExecutionRequest,
    bridge: Arc<dyn HostBridge>,
    interrupt: &InterruptHandle,
) -> ExecutionResult {
    // Reset state for fresh execution
    reset_execution_state();
    configure_execution(
        bridge,
        &request.secrets,
        &request.allowed_modules,
        request.max_output_bytes,
    );

    let (signal_tx, signal_rx) = rustpython_vm::signal::user_signal_channel();
    if !interrupt.attach(signal_tx) {
        reset_execution_state();
        return ExecutionResult::interrupted();
    }

    let interpreter = create_sandboxed_interpreter(&request.module_paths, signal_rx);
    let outcome = interpreter.enter(|vm| run_tool(request, vm));
    interrupt.detach();

    let result = if interrupt.is_cancelled() {
        // Partial output of an interrupted run is discarded
        ExecutionResult::interrupted()
    } else if let Some(denial) = take_import_denial() {
        ExecutionResult {
            status: ExecutionStatus::ImportDenied(denial),
            stdout: get_stdout(),
            stdout_truncated: stdout_truncated(),
            result: None,
        }
    } else {
        match outcome {
            Ok(value) => ExecutionResult {
                status: ExecutionStatus::Complete,
                stdout: get_stdout(),
                stdout_truncated: stdout_truncated(),
                result: Some(value),
            },
            Err(RunFailure::Raised(message)) => ExecutionResult {
                status: ExecutionStatus::Error(message),
                stdout: get_stdout(),
                stdout_truncated: stdout_truncated(),
                result: None,
            },
            Err(RunFailure::Setup(message)) => ExecutionResult::setup_failed(message),
        }
    };

    reset_execution_state();
    result
}

fn run_tool(request: &ExecutionRequest, vm: &VirtualMachine) -> Result<Value, RunFailure> {
    // Restrictions are applied from a scope that stays trusted for the run
    let setup_scope = vm.new_scope_with_builtins();
    trust_namespace(&setup_scope.globals);
    let setup_code = vm
        .compile(SANDBOX_SETUP_CODE, Mode::Exec, "<sandbox_setup>".to_string())
        .map_err(|e| RunFailure::Setup(format!("sandbox setup did not compile: {}", e)))?;
    vm.run_code_obj(setup_code, setup_scope)
        .map_err(|exc| RunFailure::Setup(format!("sandbox setup failed: {}", describe_exception(&exc, vm))))?;
    install_builtin_gates(vm)
        .map_err(|exc| RunFailure::Setup(format!("sandbox setup failed: {}", describe_exception(&exc, vm))))?;

    // No __builtins__ entry: the tool resolves builtins through its overlay
    let scope = Scope::new(None, vm.ctx.new_dict());
    install_tool_namespace(&scope.globals, vm)
        .map_err(|exc| RunFailure::Setup(describe_exception(&exc, vm)))?;

    let code = vm
        .compile(&request.source, Mode::Exec, request.source_name.clone())
        .map_err(|e| RunFailure::Raised(format!("SyntaxError: {}", e)))?;
    vm.run_code_obj(code, scope.clone())
        .map_err(|exc| RunFailure::Raised(describe_exception(&exc, vm)))?;

    let entry = find_entry_point(&scope.globals, &request.entry_points, vm)?;

    let mut args = FuncArgs::default();
    for (name, value) in &request.arguments {
        let py_value = json_to_pyobject(value, vm)
            .map_err(|exc| RunFailure::Setup(describe_exception(&exc, vm)))?;
        args.kwargs.insert(name.clone(), py_value);
    }

    let returned = entry
        .call(args, vm)
        .and_then(|obj| drive_coroutine(obj, vm))
        .map_err(|exc| RunFailure::Raised(describe_exception(&exc, vm)))?;

    pyobject_to_json(&returned, vm).map_err(|exc| RunFailure::Raised(describe_exception(&exc, vm)))
}

fn find_entry_point(
    globals: &rustpython_vm::builtins::PyDictRef,
    candidates: &[String],
    vm: &VirtualMachine,
) -> Result<PyObjectRef, RunFailure> {
    for name in candidates {
        let found = globals
            .get_item_opt(name.as_str(), vm)
            .map_err(|exc| RunFailure::Raised(describe_exception(&exc, vm)))?;
        if let Some(obj) = found {
            if obj.is_callable() {
                return Ok(obj);
            }
        }
    }
    Err(RunFailure::Raised(format!(
        "NameError: no callable entry point found (tried {})",
        candidates.join(", ")
    )))
}

/// Run an `async def` entry point to completion on the current thread
fn drive_coroutine(obj: PyObjectRef, vm: &VirtualMachine) -> PyResult {
    if !obj.class().is(vm.ctx.types.coroutine_type) {
        return Ok(obj);
    }
    loop {
        match vm.call_method(&obj, "send", (vm.ctx.none(),)) {
            Ok(_) => continue,
            Err(exc) if exc.fast_isinstance(vm.ctx.exceptions.stop_iteration) => {
                return Ok(exc.get_arg(0).unwrap_or_else(|| vm.ctx.none()));
            }
            Err(exc) => return Err(exc),
        }
    }
}

/// Format an exception as `Type: message` without a traceback
fn describe_exception(exc: &PyBaseExceptionRef, vm: &VirtualMachine) -> String {
    let type_name = exc.class().name().to_string();
    match exc.as_object().str(vm) {
        Ok(message) if !message.as_str().is_empty() => {
            format!("{}: {}", type_name, message.as_str())
        }
        _ => type_name,
    }
}
