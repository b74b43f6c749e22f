use cranelift_module::ModuleError;
use thiserror::Error;

use crate::codegen::CodegenError;
use crate::parser::ParseError;

/// Anything that can go wrong turning one top-level form into running code.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Syntax(#[from] ParseError),
    #[error(transparent)]
    Codegen(#[from] CodegenError),
    #[error("failed to link: {0}")]
    Backend(#[from] ModuleError),
}

impl CompileError {
    /// Fatal errors mean the parser and code generator disagree about which
    /// operators exist; the session cannot be trusted afterwards.
    pub fn is_fatal(&self) -> bool {
        match self {
            CompileError::Codegen(err) => err.is_fatal(),
            CompileError::Syntax(_) | CompileError::Backend(_) => false,
        }
    }
}
