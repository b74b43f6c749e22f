use std::iter::Peekable;
use std::str::Chars;

use crate::token::{Span, Token, TokenKind};

/// Turns a character stream into tokens, one at a time.
///
/// The lexer never fails: characters it does not recognize come back as
/// [`TokenKind::Char`] and the parser decides whether they make sense.
pub struct Lexer<I: Iterator<Item = char>> {
    chars: Peekable<I>,
    offset: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<Chars<'a>> {
    pub fn from_source(source: &'a str) -> Self {
        Self::new(source.chars())
    }
}

impl<I: Iterator<Item = char>> Lexer<I> {
    pub fn new(chars: I) -> Self {
        Self {
            chars: chars.peekable(),
            offset: 0,
            line: 1,
            column: 0,
        }
    }

    pub fn next_token(&mut self) -> Token {
        loop {
            self.skip_whitespace();

            let start = self.offset;
            let line = self.line;
            let column = self.column;

            let Some(&ch) = self.chars.peek() else {
                return Token::new(
                    TokenKind::Eof,
                    Span {
                        start,
                        end: start,
                        line,
                        column,
                    },
                );
            };

            let kind = match ch {
                c if c.is_ascii_alphabetic() => self.read_identifier(),
                c if c.is_ascii_digit() || c == '.' => self.read_number(),
                '#' => {
                    self.skip_comment();
                    continue;
                }
                c => {
                    self.advance_char();
                    TokenKind::Char(c)
                }
            };

            return Token::new(
                kind,
                Span {
                    start,
                    end: self.offset,
                    line,
                    column,
                },
            );
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.advance_char();
            } else {
                break;
            }
        }
    }

    // Consumes through end of line; the line terminator itself is left for
    // the whitespace skipper.
    fn skip_comment(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' || c == '\r' {
                break;
            }
            self.advance_char();
        }
    }

    fn read_identifier(&mut self) -> TokenKind {
        let mut ident = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_alphanumeric() {
                ident.push(c);
                self.advance_char();
            } else {
                break;
            }
        }
        TokenKind::keyword(&ident).unwrap_or(TokenKind::Identifier(ident))
    }

    fn read_number(&mut self) -> TokenKind {
        let mut literal = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                literal.push(c);
                self.advance_char();
            } else {
                break;
            }
        }
        TokenKind::Number(parse_number_prefix(&literal))
    }

    fn advance_char(&mut self) -> Option<char> {
        let next = self.chars.next();
        if let Some(c) = next {
            self.offset += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
        }
        next
    }
}

impl<I: Iterator<Item = char>> Iterator for Lexer<I> {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        if matches!(token.kind, TokenKind::Eof) {
            None
        } else {
            Some(token)
        }
    }
}

/// Converts a run of digits and dots the way `strtod` does: the longest
/// well-formed prefix wins and anything after it is ignored, so `1.2.3`
/// reads as `1.2` and a lone `.` reads as `0`.
fn parse_number_prefix(literal: &str) -> f64 {
    (1..=literal.len())
        .rev()
        .find_map(|len| literal[..len].parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Tokenizes a whole string, including the trailing `Eof` token.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut lexer = Lexer::from_source(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token();
        let is_eof = matches!(token.kind, TokenKind::Eof);
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    tokens
}
