#![allow(dead_code)]
use std::path::Path;

use kaleido::ast::Item;
use kaleido::operators::OperatorTable;
use kaleido::parser::{Parser, TokenStream};
use kaleido::session::{Session, SessionOptions};
use kaleido::token::TokenKind;
use test_support::bench_cases;

/// `(label, source)` for every program case with benchmarking enabled.
pub fn workloads() -> Vec<(String, String)> {
    bench_cases(Path::new("tests/programs"))
        .unwrap_or_else(|err| panic!("load bench cases: {err:#}"))
        .into_iter()
        .map(|case| {
            let source = case
                .source()
                .unwrap_or_else(|err| panic!("read {}: {err:#}", case.name));
            (case.name, source)
        })
        .collect()
}

/// Parses a whole program the way a session does, installing each binary
/// operator as soon as its definition has been read, but without compiling
/// anything.
pub fn parse_items(source: &str) -> Vec<Item> {
    let mut operators = OperatorTable::with_builtins();
    let mut tokens = TokenStream::from_source(source);
    let mut items = Vec::new();
    loop {
        match tokens.current().kind {
            TokenKind::Eof => return items,
            TokenKind::Char(';') => {
                tokens.advance();
            }
            _ => {
                let item = Parser::new(&mut tokens, &operators)
                    .parse_item()
                    .unwrap_or_else(|err| panic!("parse: {err}"));
                if let Item::Definition(function) = &item {
                    if let Some((op, precedence)) = function.prototype.binary_operator() {
                        operators.install(op, precedence);
                    }
                }
                items.push(item);
            }
        }
    }
}

pub fn new_session() -> Session {
    Session::new(SessionOptions {
        dump_ir: false,
        ..SessionOptions::default()
    })
    .unwrap_or_else(|err| panic!("create session: {err:#}"))
}
