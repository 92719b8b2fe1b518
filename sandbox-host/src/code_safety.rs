//! Pre-execution safety checks for tool source.
//!
//! This validator is defense in depth: the restricted interpreter namespace is
//! the real boundary inside the process and an outer container is assumed
//! around it. The scan catches reflective escape patterns early so a
//! registration fails with a precise reason instead of reaching the runtime.

use regex::Regex;
use rustpython_parser::{ast, Parse};
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum tool source size in bytes (256 KB).
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 256 * 1024;

/// Dunder attributes that walk the type hierarchy or reach loader internals.
const DUNDER_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__bases__",
    "__base__",
    "__mro__",
    "__subclasses__",
    "__globals__",
    "__code__",
    "__closure__",
    "__builtins__",
    "__import__",
    "__loader__",
    "__spec__",
];

/// Frame and generator attributes that expose the interpreter stack.
const FRAME_ATTRIBUTES: &[&str] = &[
    "f_globals",
    "f_locals",
    "f_back",
    "f_builtins",
    "gi_frame",
    "cr_frame",
    "ag_frame",
    "tb_frame",
];

/// Introspection calls that enumerate namespaces.
const INTROSPECTION_CALLS: &[&str] = &["vars", "dir", "globals", "locals"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeSafetyError {
    #[error("{source_name}: source is empty")]
    Empty { source_name: String },

    #[error("{source_name}: source exceeds maximum size of {max} bytes (got {actual})")]
    TooLarge {
        source_name: String,
        max: usize,
        actual: usize,
    },

    #[error("{source_name}:{line}: forbidden pattern `{pattern}`")]
    ForbiddenPattern {
        pattern: String,
        source_name: String,
        line: usize,
    },

    #[error("{source_name}: syntax error: {message}")]
    Syntax { source_name: String, message: String },
}

struct ForbiddenPattern {
    label: String,
    regex: Regex,
}

static FORBIDDEN_PATTERNS: LazyLock<Vec<ForbiddenPattern>> = LazyLock::new(build_patterns);

fn build_patterns() -> Vec<ForbiddenPattern> {
    let mut patterns = Vec::new();

    // Attribute forms need the leading dot; bare reserved names are neutralised
    // by the interpreter namespace instead.
    for name in DUNDER_ATTRIBUTES.iter().chain(FRAME_ATTRIBUTES) {
        patterns.push(ForbiddenPattern {
            label: format!(".{}", name),
            regex: Regex::new(&format!(r"\.\s*{}\b", regex::escape(name))).unwrap(),
        });
    }

    for name in INTROSPECTION_CALLS {
        patterns.push(ForbiddenPattern {
            label: format!("{}(", name),
            regex: Regex::new(&format!(r"(?:^|[^\w.]){}\s*\(", name)).unwrap(),
        });
    }

    let attribute_names = DUNDER_ATTRIBUTES
        .iter()
        .chain(FRAME_ATTRIBUTES)
        .map(|n| regex::escape(n))
        .collect::<Vec<_>>()
        .join("|");
    for func in ["getattr", "setattr", "delattr", "hasattr"] {
        patterns.push(ForbiddenPattern {
            label: format!("{}(..., '<reserved attribute>')", func),
            regex: Regex::new(&format!(
                r#"\b{}\s*\([^)]*?['"](?:{})['"]"#,
                func, attribute_names
            ))
            .unwrap(),
        });
    }

    patterns
}

/// Static validator applied to every `code` tool at registration time.
#[derive(Debug, Clone)]
pub struct CodeSafetyValidator {
    max_source_bytes: usize,
}

impl Default for CodeSafetyValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SOURCE_BYTES)
    }
}

impl CodeSafetyValidator {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    /// Validate tool source before it becomes active.
    ///
    /// Checks size, emptiness, the forbidden pattern set (reporting the
    /// earliest match with its 1-based line) and finally that the text parses.
    pub fn validate(&self, source: &str, source_name: &str) -> Result<(), CodeSafetyError> {
        if source.len() > self.max_source_bytes {
            return Err(CodeSafetyError::TooLarge {
                source_name: source_name.to_string(),
                max: self.max_source_bytes,
                actual: source.len(),
            });
        }

        if source.trim().is_empty() {
            return Err(CodeSafetyError::Empty {
                source_name: source_name.to_string(),
            });
        }

        let earliest = FORBIDDEN_PATTERNS
            .iter()
            .filter_map(|p| p.regex.find(source).map(|m| (m.start(), &p.label)))
            .min_by_key(|(offset, _)| *offset);
        if let Some((offset, label)) = earliest {
            return Err(CodeSafetyError::ForbiddenPattern {
                pattern: label.clone(),
                source_name: source_name.to_string(),
                line: line_of(source, offset),
            });
        }

        parse_suite(source, source_name)?;
        Ok(())
    }
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn parse_suite(source: &str, source_name: &str) -> Result<ast::Suite, CodeSafetyError> {
    ast::Suite::parse(source, source_name).map_err(|err| CodeSafetyError::Syntax {
        source_name: source_name.to_string(),
        message: err.to_string(),
    })
}

/// Top-level modules named by every import statement in the source.
///
/// Walks nested bodies (functions, classes, conditionals, loops, `try`,
/// `with`, `match`). Relative imports are reported as `"."`. The result is
/// deduplicated and keeps first-seen order.
pub fn collect_imports(source: &str, source_name: &str) -> Result<Vec<String>, CodeSafetyError> {
    let suite = parse_suite(source, source_name)?;
    let mut modules = Vec::new();
    collect_from_body(&suite, &mut modules);
    Ok(modules)
}

fn push_unique(modules: &mut Vec<String>, name: &str) {
    if !modules.iter().any(|m| m == name) {
        modules.push(name.to_string());
    }
}

fn top_level(dotted: &str) -> &str {
    dotted.split('.').next().unwrap_or(dotted)
}

fn collect_from_body(body: &[ast::Stmt], modules: &mut Vec<String>) {
    for stmt in body {
        match stmt {
            ast::Stmt::Import(ast::StmtImport { names, .. }) => {
                for alias in names {
                    push_unique(modules, top_level(alias.name.as_str()));
                }
            }
            ast::Stmt::ImportFrom(ast::StmtImportFrom { module, level, .. }) => {
                let level = level.as_ref().map_or(0, |l| l.to_u32());
                match module {
                    Some(module) if level == 0 => push_unique(modules, top_level(module.as_str())),
                    _ => push_unique(modules, "."),
                }
            }
            ast::Stmt::FunctionDef(ast::StmtFunctionDef { body, .. })
            | ast::Stmt::AsyncFunctionDef(ast::StmtAsyncFunctionDef { body, .. })
            | ast::Stmt::ClassDef(ast::StmtClassDef { body, .. })
            | ast::Stmt::With(ast::StmtWith { body, .. })
            | ast::Stmt::AsyncWith(ast::StmtAsyncWith { body, .. }) => {
                collect_from_body(body, modules);
            }
            ast::Stmt::If(ast::StmtIf { body, orelse, .. })
            | ast::Stmt::For(ast::StmtFor { body, orelse, .. })
            | ast::Stmt::AsyncFor(ast::StmtAsyncFor { body, orelse, .. })
            | ast::Stmt::While(ast::StmtWhile { body, orelse, .. }) => {
                collect_from_body(body, modules);
                collect_from_body(orelse, modules);
            }
            ast::Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            })
            | ast::Stmt::TryStar(ast::StmtTryStar {
                body,
                handlers,
                orelse,
                finalbody,
                ..
            }) => {
                collect_from_body(body, modules);
                for handler in handlers {
                    let ast::ExceptHandler::ExceptHandler(handler) = handler;
                    collect_from_body(&handler.body, modules);
                }
                collect_from_body(orelse, modules);
                collect_from_body(finalbody, modules);
            }
            ast::Stmt::Match(ast::StmtMatch { cases, .. }) => {
                for case in cases {
                    collect_from_body(&case.body, modules);
                }
            }
            _ => {}
        }
    }
}
