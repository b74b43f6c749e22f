use cranelift_codegen::ir::Block;
use cranelift_module::ModuleError;
use thiserror::Error;

/// A top-level unit that parsed but cannot be lowered.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("Unknown variable name '{0}'")]
    UnknownVariable(String),
    #[error("destination of '=' must be a variable")]
    InvalidAssignment,
    #[error("Unknown unary operator '{0}'")]
    UnknownUnaryOperator(char),
    #[error("Unknown function referenced '{0}'")]
    UnknownFunction(String),
    #[error("Incorrect # arguments passed to '{callee}': expected {expected}, got {found}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[error("Unresolved external symbol '{0}'")]
    UnresolvedSymbol(String),
    /// The parser accepted an operator that has a precedence entry but no
    /// function behind it.
    #[error("binary operator '{0}' has a precedence but no definition")]
    MissingBinaryOperator(char),
    /// A branch handed its value to a merge from a block control had
    /// already left.
    #[error("branch value from {0} merged outside the block it was produced in")]
    BranchOutOfPlace(Block),
    #[error("IR verification failed: {0}")]
    Verifier(String),
    #[error(transparent)]
    Module(#[from] ModuleError),
}

impl CodegenError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CodegenError::MissingBinaryOperator(_) | CodegenError::BranchOutOfPlace(_)
        )
    }
}

pub type CodegenResult<T> = Result<T, CodegenError>;
