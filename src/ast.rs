//! Syntax tree produced by the parser and consumed by code generation.
//!
//! Every node owns its children outright; a tree lives until its top-level
//! unit has been compiled and is then dropped.

use std::fmt;

/// Name the parser gives to the wrapper function around a bare top-level
/// expression.
pub const ANONYMOUS_FUNCTION: &str = "__anon_expr";

#[derive(Debug, PartialEq, Clone)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Unary {
        op: char,
        operand: Box<Expr>,
    },
    /// `=` is assignment; every other operator is arithmetic or a call to a
    /// user-defined operator function.
    Binary {
        op: char,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    If {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
    Var {
        bindings: Vec<(String, Option<Expr>)>,
        body: Box<Expr>,
    },
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum PrototypeKind {
    Function,
    Unary(char),
    Binary { op: char, precedence: u32 },
}

impl PrototypeKind {
    /// Number of operands an operator prototype must declare.
    pub fn operator_arity(&self) -> Option<usize> {
        match self {
            PrototypeKind::Function => None,
            PrototypeKind::Unary(_) => Some(1),
            PrototypeKind::Binary { .. } => Some(2),
        }
    }
}

/// Identity of a callable as the compiler tracks it.
///
/// Operator functions are keyed by their symbol directly instead of by a
/// spliced-together name; [`Callee::symbol`] produces the linker name only
/// at the backend boundary.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Callee {
    Named(String),
    Unary(char),
    Binary(char),
}

impl Callee {
    pub fn symbol(&self) -> String {
        match self {
            Callee::Named(name) => name.clone(),
            Callee::Unary(op) => format!("unary{op}"),
            Callee::Binary(op) => format!("binary{op}"),
        }
    }
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol())
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<String>,
    pub kind: PrototypeKind,
}

impl Prototype {
    pub fn function(name: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            name: name.into(),
            params,
            kind: PrototypeKind::Function,
        }
    }

    pub fn anonymous() -> Self {
        Self::function(ANONYMOUS_FUNCTION, Vec::new())
    }

    pub fn callee(&self) -> Callee {
        match self.kind {
            PrototypeKind::Function => Callee::Named(self.name.clone()),
            PrototypeKind::Unary(op) => Callee::Unary(op),
            PrototypeKind::Binary { op, .. } => Callee::Binary(op),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_operator(&self) -> bool {
        !matches!(self.kind, PrototypeKind::Function)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.kind, PrototypeKind::Function) && self.name == ANONYMOUS_FUNCTION
    }

    /// Operator symbol and precedence when this declares a binary operator.
    pub fn binary_operator(&self) -> Option<(char, u32)> {
        match self.kind {
            PrototypeKind::Binary { op, precedence } => Some((op, precedence)),
            _ => None,
        }
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PrototypeKind::Function => write!(f, "{}", self.name)?,
            PrototypeKind::Unary(op) => write!(f, "unary{op}")?,
            PrototypeKind::Binary { op, precedence } => write!(f, "binary{op} {precedence} ")?,
        }
        write!(f, "({})", self.params.join(" "))
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Function {
    pub prototype: Prototype,
    pub body: Expr,
}

/// One top-level form.
#[derive(Debug, PartialEq, Clone)]
pub enum Item {
    Definition(Function),
    Extern(Prototype),
    Expression(Function),
}

// S-expression rendering, used by tests and debug logging.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(value) => write!(f, "{value}"),
            Expr::Variable(name) => write!(f, "{name}"),
            Expr::Unary { op, operand } => write!(f, "({op} {operand})"),
            Expr::Binary { op, left, right } => write!(f, "({op} {left} {right})"),
            Expr::Call { callee, args } => {
                write!(f, "(call {callee}")?;
                for arg in args {
                    write!(f, " {arg}")?;
                }
                write!(f, ")")
            }
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => write!(f, "(if {condition} {then_branch} {else_branch})"),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                write!(f, "(for {var} {start} {end}")?;
                if let Some(step) = step {
                    write!(f, " {step}")?;
                }
                write!(f, " {body})")
            }
            Expr::Var { bindings, body } => {
                write!(f, "(var")?;
                for (name, init) in bindings {
                    match init {
                        Some(init) => write!(f, " ({name} {init})")?,
                        None => write!(f, " {name}")?,
                    }
                }
                write!(f, " {body})")
            }
        }
    }
}
