pub mod ast;
pub mod codegen;
pub mod error;
pub mod jit;
pub mod lexer;
pub mod operators;
pub mod parser;
pub mod repl;
pub mod session;
pub mod token;
