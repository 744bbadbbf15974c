//! SD-005: Target compilation, dispatching descriptors to operation handlers.
//!
//! Compilation is pure: expressions are expanded and relative paths are
//! normalized lexically, but nothing touches the network or the filesystem.

use super::error::CompileError;
use super::expression::{Expression, Params};
use super::types::{Operation, Step, Target};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Everything an operation may consult while compiling.
#[derive(Debug, Clone)]
pub struct CompileContext<'a> {
    params: &'a Params,
    base_path: &'a Path,
    instance: String,
}

impl<'a> CompileContext<'a> {
    pub fn new(params: &'a Params, base_path: &'a Path) -> Self {
        Self {
            params,
            base_path,
            instance: String::new(),
        }
    }

    /// The same context rebound to another instance.
    pub fn with_instance(&self, instance: impl Into<String>) -> Self {
        Self {
            params: self.params,
            base_path: self.base_path,
            instance: instance.into(),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn params(&self) -> &Params {
        self.params
    }

    pub fn base_path(&self) -> &Path {
        self.base_path
    }

    pub fn expand(&self, expr: &Expression) -> Result<String, CompileError> {
        expr.expand(self.params)
    }

    /// Expand an optional field; absent stays absent.
    pub fn expand_opt(&self, expr: &Option<Expression>) -> Result<Option<String>, CompileError> {
        expr.as_ref().map(|e| self.expand(e)).transpose()
    }

    pub fn expand_typed<T: FromStr>(&self, expr: &Expression) -> Result<T, CompileError> {
        expr.expand_typed(self.params)
    }

    pub fn expand_typed_opt<T: FromStr>(
        &self,
        expr: &Option<Expression>,
    ) -> Result<Option<T>, CompileError> {
        expr.as_ref().map(|e| self.expand_typed(e)).transpose()
    }

    pub fn expand_all(&self, exprs: &[Expression]) -> Result<Vec<String>, CompileError> {
        exprs.iter().map(|e| self.expand(e)).collect()
    }

    /// Resolve a file reference against the base path.
    ///
    /// Rooted paths (Unix absolute, `C:\`, `\\server\share`) are kept as
    /// written, since they usually name locations on the database server.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        if is_rooted(raw) {
            return PathBuf::from(raw);
        }
        normalize(&self.base_path.join(raw))
    }
}

fn is_rooted(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    Path::new(raw).is_absolute()
        || raw.starts_with("\\\\")
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'\\' || bytes[2] == b'/'))
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last = out.components().next_back();
                let after_name = matches!(last, Some(Component::Normal(_)));
                // `..` at the root stays at the root
                let at_root = matches!(last, Some(Component::RootDir | Component::Prefix(_)));
                if after_name {
                    out.pop();
                } else if !at_root {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Compile one operation descriptor in the given context.
pub fn compile_operation(op: &Operation, ctx: &CompileContext) -> Result<Vec<Step>, CompileError> {
    match op {
        Operation::Login(op) => op.compile(ctx),
        Operation::Database(op) => op.compile(ctx),
        Operation::Distributor(op) => op.compile(ctx),
        Operation::Publication(op) => op.compile(ctx),
        Operation::Subscription(op) => op.compile(ctx),
        Operation::Backup(op) => op.compile(ctx),
        Operation::Restore(op) => op.compile(ctx),
        Operation::Mirroring(op) => op.compile(ctx),
    }
}

/// Compile a target's instance blocks into its ordered step list.
pub fn compile_target(
    target: &Target,
    params: &Params,
    base_path: &Path,
) -> Result<Vec<Step>, CompileError> {
    let root = CompileContext::new(params, base_path);
    let mut steps = Vec::new();
    for block in &target.instances {
        let ctx = root.with_instance(root.expand(&block.name)?);
        for op in &block.operations {
            steps.extend(compile_operation(op, &ctx)?);
        }
    }
    Ok(steps)
}
