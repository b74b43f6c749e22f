use std::str::Chars;

use log::debug;

use crate::ast::{Expr, Function, Item, Prototype, PrototypeKind};
use crate::lexer::Lexer;
use crate::operators::{
    DEFAULT_BINARY_PRECEDENCE, MAX_USER_PRECEDENCE, MIN_USER_PRECEDENCE, OperatorTable,
};
use crate::token::{Token, TokenKind};

mod error;

pub use error::{ParseError, ParseResult};

/// One-token buffer over the lexer.
///
/// It outlives any single [`Parser`]: the driver peeks at the current token
/// to pick the next top-level form, and after a parse error it discards one
/// token to resynchronize.
pub struct TokenStream<I: Iterator<Item = char>> {
    lexer: Lexer<I>,
    current: Token,
}

impl<'a> TokenStream<Chars<'a>> {
    pub fn from_source(source: &'a str) -> Self {
        Self::new(Lexer::from_source(source))
    }
}

impl<I: Iterator<Item = char>> TokenStream<I> {
    pub fn new(mut lexer: Lexer<I>) -> Self {
        let current = lexer.next_token();
        Self { lexer, current }
    }

    pub fn current(&self) -> &Token {
        &self.current
    }

    /// Moves to the next token and returns the one just consumed.
    pub fn advance(&mut self) -> Token {
        let next = self.lexer.next_token();
        debug!("next_token: {:?}", next.kind);
        std::mem::replace(&mut self.current, next)
    }
}

/// Recursive-descent parser with precedence climbing for binary operators.
///
/// Binary operators come from the [`OperatorTable`] at parse time, so
/// operators declared by earlier top-level units take part in parsing the
/// ones after them.
pub struct Parser<'a, I: Iterator<Item = char>> {
    tokens: &'a mut TokenStream<I>,
    operators: &'a OperatorTable,
}

impl<'a, I: Iterator<Item = char>> Parser<'a, I> {
    pub fn new(tokens: &'a mut TokenStream<I>, operators: &'a OperatorTable) -> Self {
        Self { tokens, operators }
    }

    /// Parses whichever top-level form starts at the current token.
    pub fn parse_item(&mut self) -> ParseResult<Item> {
        match self.current() {
            TokenKind::Def => self.parse_definition().map(Item::Definition),
            TokenKind::Extern => self.parse_extern().map(Item::Extern),
            _ => self.parse_top_level_expr().map(Item::Expression),
        }
    }

    /// definition ::= 'def' prototype expression
    pub fn parse_definition(&mut self) -> ParseResult<Function> {
        self.advance(); // def
        let prototype = self.parse_prototype()?;
        let body = self.parse_expression()?;
        Ok(Function { prototype, body })
    }

    /// external ::= 'extern' prototype
    pub fn parse_extern(&mut self) -> ParseResult<Prototype> {
        self.advance(); // extern
        self.parse_prototype()
    }

    /// toplevelexpr ::= expression
    pub fn parse_top_level_expr(&mut self) -> ParseResult<Function> {
        let body = self.parse_expression()?;
        Ok(Function {
            prototype: Prototype::anonymous(),
            body,
        })
    }

    /// expression ::= unary binoprhs
    pub fn parse_expression(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_unary()?;
        self.parse_binop_rhs(0, lhs)
    }

    /// prototype
    ///   ::= id '(' id* ')'
    ///   ::= 'binary' LETTER number? '(' id id ')'
    ///   ::= 'unary' LETTER '(' id ')'
    fn parse_prototype(&mut self) -> ParseResult<Prototype> {
        let (name, kind) = match self.current() {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                (name, PrototypeKind::Function)
            }
            TokenKind::Unary => {
                self.advance();
                let TokenKind::Char(op) = *self.current() else {
                    return Err(self.error("Expected unary operator"));
                };
                self.advance();
                (format!("unary{op}"), PrototypeKind::Unary(op))
            }
            TokenKind::Binary => {
                self.advance();
                let TokenKind::Char(op) = *self.current() else {
                    return Err(self.error("Expected binary operator"));
                };
                self.advance();

                let mut precedence = DEFAULT_BINARY_PRECEDENCE;
                if let TokenKind::Number(value) = *self.current() {
                    if value < MIN_USER_PRECEDENCE as f64 || value > MAX_USER_PRECEDENCE as f64 {
                        return Err(self.error("Invalid precedence: must be 1..100"));
                    }
                    precedence = value as u32;
                    self.advance();
                }
                (format!("binary{op}"), PrototypeKind::Binary { op, precedence })
            }
            _ => return Err(self.error("Expected function name in prototype")),
        };

        self.expect_char('(', "Expected '(' in prototype")?;

        // Parameters are bare identifiers with no separator.
        let mut params = Vec::new();
        while let TokenKind::Identifier(param) = self.current() {
            params.push(param.clone());
            self.advance();
        }
        self.expect_char(')', "Expected ')' in prototype")?;

        if let Some(arity) = kind.operator_arity() {
            if params.len() != arity {
                return Err(self.error("Invalid number of operands for operator"));
            }
        }

        debug!("parsed prototype {name} with {} params", params.len());
        Ok(Prototype { name, params, kind })
    }

    /// unary
    ///   ::= primary
    ///   ::= OP unary
    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.current() {
            TokenKind::Char(c) if *c != '(' && *c != ',' => *c,
            _ => return self.parse_primary(),
        };
        self.advance();
        let operand = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    /// binoprhs ::= (OP unary)*
    ///
    /// Operators at or above `min_precedence` are folded into `lhs` left to
    /// right; a strictly tighter operator after the right operand claims that
    /// operand first through a recursive call.
    fn parse_binop_rhs(&mut self, min_precedence: i32, mut lhs: Expr) -> ParseResult<Expr> {
        loop {
            let Some((op, precedence)) = self
                .current_operator()
                .filter(|(_, precedence)| *precedence >= min_precedence)
            else {
                return Ok(lhs);
            };
            self.advance(); // operator

            let mut rhs = self.parse_unary()?;

            let next_precedence = self.token_precedence();
            if precedence < next_precedence {
                debug!("operator '{op}' ({precedence}) yields to tighter ({next_precedence})");
                rhs = self.parse_binop_rhs(precedence + 1, rhs)?;
            }

            lhs = Expr::Binary {
                op,
                left: Box::new(lhs),
                right: Box::new(rhs),
            };
        }
    }

    /// primary
    ///   ::= identifierexpr
    ///   ::= numberexpr
    ///   ::= parenexpr
    ///   ::= ifexpr
    ///   ::= forexpr
    ///   ::= varexpr
    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.current() {
            TokenKind::Identifier(_) => self.parse_identifier_expr(),
            TokenKind::Number(value) => {
                let value = *value;
                self.advance();
                Ok(Expr::Number(value))
            }
            TokenKind::Char('(') => self.parse_paren_expr(),
            TokenKind::If => self.parse_if_expr(),
            TokenKind::For => self.parse_for_expr(),
            TokenKind::Var => self.parse_var_expr(),
            _ => Err(self.error("unknown token when expecting an expression")),
        }
    }

    /// parenexpr ::= '(' expression ')'
    fn parse_paren_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // (
        let expr = self.parse_expression()?;
        self.expect_char(')', "expected ')'")?;
        Ok(expr)
    }

    /// identifierexpr
    ///   ::= identifier
    ///   ::= identifier '(' (expression (',' expression)*)? ')'
    fn parse_identifier_expr(&mut self) -> ParseResult<Expr> {
        let name = self.expect_identifier("expected identifier")?;

        if !self.current().is_char('(') {
            return Ok(Expr::Variable(name));
        }
        self.advance(); // (

        let mut args = Vec::new();
        if !self.current().is_char(')') {
            loop {
                args.push(self.parse_expression()?);

                if self.current().is_char(')') {
                    break;
                }
                if !self.current().is_char(',') {
                    return Err(self.error("Expected ')' or ',' in argument list"));
                }
                self.advance(); // ,
            }
        }
        self.advance(); // )

        Ok(Expr::Call { callee: name, args })
    }

    /// ifexpr ::= 'if' expression 'then' expression 'else' expression
    fn parse_if_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // if
        let condition = self.parse_expression()?;

        if !matches!(self.current(), TokenKind::Then) {
            return Err(self.error("expected then"));
        }
        self.advance();
        let then_branch = self.parse_expression()?;

        if !matches!(self.current(), TokenKind::Else) {
            return Err(self.error("expected else"));
        }
        self.advance();
        let else_branch = self.parse_expression()?;

        Ok(Expr::If {
            condition: Box::new(condition),
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        })
    }

    /// forexpr ::= 'for' identifier '=' expr ',' expr (',' expr)? 'in' expression
    fn parse_for_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // for
        let var = self.expect_identifier("expected identifier after for")?;

        self.expect_char('=', "expected '=' after for")?;
        let start = self.parse_expression()?;

        self.expect_char(',', "expected ',' after for start value")?;
        let end = self.parse_expression()?;

        let step = if self.current().is_char(',') {
            self.advance();
            Some(Box::new(self.parse_expression()?))
        } else {
            None
        };

        if !matches!(self.current(), TokenKind::In) {
            return Err(self.error("expected 'in' after for"));
        }
        self.advance();
        let body = self.parse_expression()?;

        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    /// varexpr ::= 'var' identifier ('=' expression)?
    ///                   (',' identifier ('=' expression)?)* 'in' expression
    fn parse_var_expr(&mut self) -> ParseResult<Expr> {
        self.advance(); // var

        if !matches!(self.current(), TokenKind::Identifier(_)) {
            return Err(self.error("expected identifier after var"));
        }

        let mut bindings = Vec::new();
        loop {
            let name = self.expect_identifier("expected identifier list after var")?;

            let init = if self.current().is_char('=') {
                self.advance();
                Some(self.parse_expression()?)
            } else {
                None
            };
            bindings.push((name, init));

            if !self.current().is_char(',') {
                break;
            }
            self.advance(); // ,

            if !matches!(self.current(), TokenKind::Identifier(_)) {
                return Err(self.error("expected identifier list after var"));
            }
        }

        if !matches!(self.current(), TokenKind::In) {
            return Err(self.error("expected 'in' keyword after 'var'"));
        }
        self.advance();
        let body = self.parse_expression()?;

        Ok(Expr::Var {
            bindings,
            body: Box::new(body),
        })
    }

    /// The current token as a declared binary operator with its precedence.
    fn current_operator(&self) -> Option<(char, i32)> {
        match self.current() {
            TokenKind::Char(op) => self
                .operators
                .precedence(*op)
                .map(|precedence| (*op, precedence)),
            _ => None,
        }
    }

    /// Precedence of the pending operator, or -1 when the current token is
    /// not a declared binary operator.
    fn token_precedence(&self) -> i32 {
        self.current_operator()
            .map_or(-1, |(_, precedence)| precedence)
    }

    fn expect_identifier(&mut self, message: &str) -> ParseResult<String> {
        if let TokenKind::Identifier(name) = self.current() {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.error(message))
        }
    }

    fn expect_char(&mut self, expected: char, message: &str) -> ParseResult<()> {
        if self.current().is_char(expected) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn current(&self) -> &TokenKind {
        &self.tokens.current().kind
    }

    fn advance(&mut self) -> Token {
        self.tokens.advance()
    }

    fn error(&self, message: &str) -> ParseError {
        debug!("parse error: {message}, got {}", self.current());
        ParseError::new(message, self.tokens.current().span)
    }
}

/// Parses a single expression from `source`.
pub fn parse_expression(source: &str, operators: &OperatorTable) -> ParseResult<Expr> {
    let mut tokens = TokenStream::from_source(source);
    Parser::new(&mut tokens, operators).parse_expression()
}

/// Parses every top-level form in `source` against a fixed operator table,
/// skipping `;` separators. Operators declared inside `source` are not
/// installed; that happens only when a definition is compiled.
pub fn parse_program(source: &str, operators: &OperatorTable) -> ParseResult<Vec<Item>> {
    let mut tokens = TokenStream::from_source(source);
    let mut items = Vec::new();
    loop {
        match tokens.current().kind {
            TokenKind::Eof => return Ok(items),
            TokenKind::Char(';') => {
                tokens.advance();
            }
            _ => items.push(Parser::new(&mut tokens, operators).parse_item()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn parse(source: &str) -> Expr {
        parse_expression(source, &OperatorTable::with_builtins()).expect("parse failed")
    }

    fn parse_err(source: &str) -> ParseError {
        parse_expression(source, &OperatorTable::with_builtins()).expect_err("expected failure")
    }

    fn num(value: f64) -> Box<Expr> {
        Box::new(Expr::Number(value))
    }

    #[test]
    fn higher_precedence_binds_tighter() {
        assert_eq!(
            parse("1+2*3"),
            Expr::Binary {
                op: '+',
                left: num(1.0),
                right: Box::new(Expr::Binary {
                    op: '*',
                    left: num(2.0),
                    right: num(3.0),
                }),
            }
        );
        assert_eq!(
            parse("1*2+3"),
            Expr::Binary {
                op: '+',
                left: Box::new(Expr::Binary {
                    op: '*',
                    left: num(1.0),
                    right: num(2.0),
                }),
                right: num(3.0),
            }
        );
    }

    #[test]
    fn equal_precedence_associates_left() {
        assert_eq!(parse("1-2+3").to_string(), "(+ (- 1 2) 3)");
        assert_eq!(parse("a = b = 1").to_string(), "(= (= a b) 1)");
    }

    #[test]
    fn mixed_precedences_climb_correctly() {
        assert_eq!(
            parse("x = a < b + c * d - e").to_string(),
            "(= x (< a (- (+ b (* c d)) e)))"
        );
        assert_eq!(parse("a*b*c+d").to_string(), "(+ (* (* a b) c) d)");
    }

    #[test]
    fn user_operator_participates_once_installed() {
        let mut operators = OperatorTable::with_builtins();
        assert_eq!(
            parse_expression("1 | 2", &operators).unwrap().to_string(),
            "1"
        );

        operators.install('|', 5);
        let expr = parse_expression("1 | 2 | 3", &operators).unwrap();
        assert_eq!(expr.to_string(), "(| (| 1 2) 3)");

        let expr = parse_expression("a < b | c", &operators).unwrap();
        assert_eq!(expr.to_string(), "(| (< a b) c)");
    }

    #[test]
    fn prefix_operators_chain() {
        assert_eq!(parse("!-x").to_string(), "(! (- x))");
        assert_eq!(parse("-a*b").to_string(), "(* (- a) b)");
    }

    #[test]
    fn parses_calls_and_variables() {
        assert_eq!(parse("foo").to_string(), "foo");
        assert_eq!(parse("foo()").to_string(), "(call foo)");
        assert_eq!(
            parse("foo(1, a+b, bar(2))").to_string(),
            "(call foo 1 (+ a b) (call bar 2))"
        );
    }

    #[test]
    fn parses_control_flow() {
        assert_eq!(
            parse("if x < 3 then 1 else 2").to_string(),
            "(if (< x 3) 1 2)"
        );
        assert_eq!(
            parse("for i = 1, i < n in putchard(42)").to_string(),
            "(for i 1 (< i n) (call putchard 42))"
        );
        assert_eq!(
            parse("for i = 0, i < 10, 2 in i").to_string(),
            "(for i 0 (< i 10) 2 i)"
        );
    }

    #[test]
    fn parses_var_bindings() {
        assert_eq!(
            parse("var a = 1, b, c = a in a + c").to_string(),
            "(var (a 1) b (c a) (+ a c))"
        );
    }

    #[test]
    fn reports_syntax_errors() {
        assert!(parse_err("(1 + 2").message.contains("expected ')'"));
        assert!(parse_err("if 1 2").message.contains("expected then"));
        assert!(parse_err("if 1 then 2").message.contains("expected else"));
        assert!(parse_err("for 1").message.contains("expected identifier after for"));
        assert!(parse_err("for i 1").message.contains("expected '=' after for"));
        assert!(parse_err("for i = 1 in 2").message.contains("expected ',' after for"));
        assert!(parse_err("for i = 1, 2 3").message.contains("expected 'in' after for"));
        assert!(parse_err("var in 1").message.contains("expected identifier after var"));
        assert!(parse_err("var a, in 1").message.contains("expected identifier list after var"));
        assert!(parse_err("var a 1").message.contains("expected 'in' keyword after 'var'"));
        assert!(parse_err("f(1 2)").message.contains("Expected ')' or ','"));
        assert!(parse_err(")").message.contains("unknown token"));
    }

    #[test]
    fn error_carries_position() {
        let err = parse_err("1 +\n  then");
        assert_eq!(err.span.line, 2);
        assert_eq!(err.span.column, 2);
        assert!(err.to_string().ends_with("at line 2, column 2"));
    }

    #[test]
    fn parses_top_level_items() {
        let source = indoc! {"
            extern sin(x);
            def binary| 5 (LHS RHS)
              if LHS then 1 else if RHS then 1 else 0;
            def unary!(v) if v then 0 else 1;
            1 + 2;
        "};
        let items = parse_program(source, &OperatorTable::with_builtins()).expect("parse");
        assert_eq!(items.len(), 4);

        let Item::Extern(sin) = &items[0] else {
            panic!("expected extern, got {:?}", items[0]);
        };
        assert_eq!(sin, &Prototype::function("sin", vec!["x".to_string()]));

        let Item::Definition(binary) = &items[1] else {
            panic!("expected definition, got {:?}", items[1]);
        };
        assert_eq!(binary.prototype.name, "binary|");
        assert_eq!(
            binary.prototype.kind,
            PrototypeKind::Binary {
                op: '|',
                precedence: 5
            }
        );
        assert_eq!(binary.prototype.params, vec!["LHS", "RHS"]);

        let Item::Definition(unary) = &items[2] else {
            panic!("expected definition, got {:?}", items[2]);
        };
        assert_eq!(unary.prototype.kind, PrototypeKind::Unary('!'));

        let Item::Expression(anon) = &items[3] else {
            panic!("expected expression, got {:?}", items[3]);
        };
        assert!(anon.prototype.is_anonymous());
        assert_eq!(anon.body.to_string(), "(+ 1 2)");
    }

    #[test]
    fn binary_precedence_defaults_and_bounds() {
        let operators = OperatorTable::with_builtins();
        let items = parse_program("def binary& (a b) a", &operators).unwrap();
        let Item::Definition(function) = &items[0] else {
            panic!("expected definition");
        };
        assert_eq!(
            function.prototype.binary_operator(),
            Some(('&', DEFAULT_BINARY_PRECEDENCE))
        );

        let err = parse_program("def binary& 0 (a b) a", &operators).unwrap_err();
        assert!(err.message.contains("Invalid precedence"));
        let err = parse_program("def binary& 101 (a b) a", &operators).unwrap_err();
        assert!(err.message.contains("Invalid precedence"));
        assert!(parse_program("def binary& 100 (a b) a", &operators).is_ok());
    }

    #[test]
    fn prototype_errors() {
        let operators = OperatorTable::with_builtins();
        let message = |source: &str| parse_program(source, &operators).unwrap_err().message;

        assert!(message("def 1(x) x").contains("Expected function name in prototype"));
        assert!(message("def unary 1 (x) x").contains("Expected unary operator"));
        assert!(message("def binary 1 (x y) x").contains("Expected binary operator"));
        assert!(message("def foo x").contains("Expected '(' in prototype"));
        assert!(message("def foo(a, b) a").contains("Expected ')' in prototype"));
        assert!(message("def unary-(a b) a").contains("Invalid number of operands"));
        assert!(message("def binary% (a) a").contains("Invalid number of operands"));
    }
}
