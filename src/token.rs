use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,

    // Commands
    Def,
    Extern,

    // Primary
    Identifier(String),
    Number(f64),

    // Control
    If,
    Then,
    Else,
    For,
    In,

    // Operator declarations
    Binary,
    Unary,

    Var,

    /// Any other single character: punctuation and operator symbols.
    Char(char),
}

impl TokenKind {
    pub fn keyword(ident: &str) -> Option<Self> {
        let kind = match ident {
            "def" => TokenKind::Def,
            "extern" => TokenKind::Extern,
            "if" => TokenKind::If,
            "then" => TokenKind::Then,
            "else" => TokenKind::Else,
            "for" => TokenKind::For,
            "in" => TokenKind::In,
            "binary" => TokenKind::Binary,
            "unary" => TokenKind::Unary,
            "var" => TokenKind::Var,
            _ => return None,
        };
        Some(kind)
    }

    pub fn is_char(&self, expected: char) -> bool {
        matches!(self, TokenKind::Char(c) if *c == expected)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Eof => write!(f, "end of input"),
            TokenKind::Def => write!(f, "'def'"),
            TokenKind::Extern => write!(f, "'extern'"),
            TokenKind::Identifier(name) => write!(f, "identifier '{name}'"),
            TokenKind::Number(value) => write!(f, "number {value}"),
            TokenKind::If => write!(f, "'if'"),
            TokenKind::Then => write!(f, "'then'"),
            TokenKind::Else => write!(f, "'else'"),
            TokenKind::For => write!(f, "'for'"),
            TokenKind::In => write!(f, "'in'"),
            TokenKind::Binary => write!(f, "'binary'"),
            TokenKind::Unary => write!(f, "'unary'"),
            TokenKind::Var => write!(f, "'var'"),
            TokenKind::Char(c) => write!(f, "'{c}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}
