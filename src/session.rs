//! The compiler session: operator table, prototype registry and JIT, owned
//! together and threaded through parsing and code generation.

use log::info;

use crate::ast::{Function, Item, Prototype};
use crate::codegen::{self, CodegenError, PrototypeRegistry};
use crate::error::CompileError;
use crate::jit::{Jit, OptLevel};
use crate::operators::OperatorTable;
use crate::parser::{ParseResult, Parser, TokenStream};
use crate::token::TokenKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub opt_level: OptLevel,
    /// Report the IR of every definition.
    pub dump_ir: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::default(),
            dump_ir: true,
        }
    }
}

/// What handling one top-level form produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Defined { prototype: Prototype, ir: String },
    Declared(Prototype),
    Evaluated(f64),
}

pub struct Session {
    operators: OperatorTable,
    registry: PrototypeRegistry,
    jit: Jit,
    options: SessionOptions,
}

impl Session {
    pub fn new(options: SessionOptions) -> anyhow::Result<Self> {
        Ok(Self {
            operators: OperatorTable::with_builtins(),
            registry: PrototypeRegistry::new(),
            jit: Jit::new(options.opt_level)?,
            options,
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn operators(&self) -> &OperatorTable {
        &self.operators
    }

    pub fn registry(&self) -> &PrototypeRegistry {
        &self.registry
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    /// Parses the top-level form at the current token against the operators
    /// declared so far.
    pub fn parse_item<I: Iterator<Item = char>>(
        &self,
        tokens: &mut TokenStream<I>,
    ) -> ParseResult<Item> {
        Parser::new(tokens, &self.operators).parse_item()
    }

    pub fn handle_item(&mut self, item: Item) -> Result<Outcome, CompileError> {
        match item {
            Item::Definition(function) => self.define(function),
            Item::Extern(prototype) => Ok(self.declare(prototype)),
            Item::Expression(function) => self.evaluate(function).map(Outcome::Evaluated),
        }
    }

    /// Compiles and links a definition. On failure nothing of it survives:
    /// its unit is released and any operator or prototype it installed is
    /// rolled back.
    pub fn define(&mut self, function: Function) -> Result<Outcome, CompileError> {
        let mut unit = self.jit.new_unit();
        let compiled = match codegen::compile_function(
            &mut unit,
            &mut self.registry,
            &mut self.operators,
            &function,
        ) {
            Ok(compiled) => compiled,
            Err(err) => {
                self.jit.discard(unit);
                return Err(err.into());
            }
        };
        self.jit.link(unit)?;

        info!("defined {}", function.prototype);
        Ok(Outcome::Defined {
            prototype: function.prototype,
            ir: compiled.ir,
        })
    }

    /// Records an extern. It may be called at once even if its code only
    /// arrives with a later definition.
    pub fn declare(&mut self, prototype: Prototype) -> Outcome {
        info!("declared extern {prototype}");
        self.jit.reserve(&prototype.callee().symbol());
        self.registry.insert(prototype.clone());
        Outcome::Declared(prototype)
    }

    /// Runs the body of `function` once as a zero-argument expression and
    /// frees its code afterwards. Nothing runs if any function it could
    /// reach is still only declared.
    pub fn evaluate(&mut self, function: Function) -> Result<f64, CompileError> {
        let function = Function {
            prototype: Prototype::anonymous(),
            ..function
        };

        let mut unit = self.jit.new_unit();
        let compiled = match codegen::compile_function(
            &mut unit,
            &mut self.registry,
            &mut self.operators,
            &function,
        ) {
            Ok(compiled) => compiled,
            Err(err) => {
                self.jit.discard(unit);
                return Err(err.into());
            }
        };
        if let Some(symbol) = self.jit.unresolved_reference(&unit) {
            self.jit.discard(unit);
            return Err(CodegenError::UnresolvedSymbol(symbol).into());
        }
        let value = self.jit.run_anonymous(unit, compiled.id)?;

        info!("evaluated to {value}");
        Ok(value)
    }

    /// Compiles every form in `source` in order and stops at the first
    /// error. Operators defined early in `source` are usable later in it.
    pub fn run_source(&mut self, source: &str) -> Result<Vec<Outcome>, CompileError> {
        let mut tokens = TokenStream::from_source(source);
        let mut outcomes = Vec::new();
        loop {
            match tokens.current().kind {
                TokenKind::Eof => return Ok(outcomes),
                TokenKind::Char(';') => {
                    tokens.advance();
                }
                _ => {
                    let item = self.parse_item(&mut tokens)?;
                    outcomes.push(self.handle_item(item)?);
                }
            }
        }
    }
}
