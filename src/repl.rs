//! Read-eval loop over a character stream.

use std::io::{self, BufRead, Write};
use std::iter;

use anyhow::Result;
use log::{debug, warn};

use crate::error::CompileError;
use crate::jit::runtime::{capture_output, format_number};
use crate::lexer::Lexer;
use crate::parser::TokenStream;
use crate::session::{Outcome, Session};
use crate::token::TokenKind;

pub const PROMPT: &str = "ready> ";

/// Drives a [`Session`] one top-level form at a time.
///
/// Syntax errors are reported and one token is skipped before carrying on;
/// code generation errors are reported without skipping. Only a fatal
/// compiler error ends the loop early.
pub struct Repl<'s, W: Write> {
    session: &'s mut Session,
    out: W,
    interactive: bool,
    capture_runtime: bool,
}

impl<'s, W: Write> Repl<'s, W> {
    pub fn new(session: &'s mut Session, out: W) -> Self {
        Self {
            session,
            out,
            interactive: false,
            capture_runtime: false,
        }
    }

    /// Print a prompt whenever the loop is ready for more input.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Route `putchard`/`printd` output into the same writer as the
    /// session's own messages instead of stderr.
    pub fn capture_runtime(mut self, capture: bool) -> Self {
        self.capture_runtime = capture;
        self
    }

    pub fn into_output(self) -> W {
        self.out
    }

    pub fn run<I: Iterator<Item = char>>(&mut self, chars: I) -> Result<()> {
        self.prompt()?;
        let mut tokens = TokenStream::new(Lexer::new(chars));
        loop {
            match tokens.current().kind {
                TokenKind::Eof => return Ok(()),
                // Top-level separators are ignored.
                TokenKind::Char(';') => {
                    tokens.advance();
                }
                _ => self.handle_next(&mut tokens)?,
            }
            self.prompt()?;
        }
    }

    fn handle_next<I: Iterator<Item = char>>(
        &mut self,
        tokens: &mut TokenStream<I>,
    ) -> Result<()> {
        let item = match self.session.parse_item(tokens) {
            Ok(item) => item,
            Err(err) => {
                writeln!(self.out, "Error: {err}")?;
                let skipped = tokens.advance();
                debug!("skipped {} to recover", skipped.kind);
                return Ok(());
            }
        };

        let result = if self.capture_runtime {
            let (result, output) = capture_output(|| self.session.handle_item(item));
            self.out.write_all(output.as_bytes())?;
            result
        } else {
            self.session.handle_item(item)
        };

        match result {
            Ok(outcome) => self.report(outcome)?,
            Err(err) if err.is_fatal() => return Err(fatal(err)),
            Err(err) => writeln!(self.out, "Error: {err}")?,
        }
        Ok(())
    }

    fn report(&mut self, outcome: Outcome) -> io::Result<()> {
        match outcome {
            Outcome::Defined { prototype, ir } => {
                if self.session.options().dump_ir {
                    writeln!(self.out, "Read function definition:")?;
                    writeln!(self.out, "{}", ir.trim_end())
                } else {
                    writeln!(self.out, "Read function definition: {prototype}")
                }
            }
            Outcome::Declared(prototype) => writeln!(self.out, "Read extern: {prototype}"),
            Outcome::Evaluated(value) => {
                writeln!(self.out, "Evaluated to {}", format_number(value))
            }
        }
    }

    fn prompt(&mut self) -> io::Result<()> {
        if self.interactive {
            write!(self.out, "{PROMPT}")?;
            self.out.flush()?;
        }
        Ok(())
    }
}

/// The characters of `reader`, one line at a time so that the loop can
/// answer each line as soon as it is complete. Input ends at the first line
/// that is not valid UTF-8.
pub fn line_chars<R: BufRead>(reader: R) -> impl Iterator<Item = char> {
    reader
        .lines()
        .map_while(|line| match line {
            Ok(line) => Some(line),
            Err(err) => {
                warn!("stopping at unreadable input line: {err}");
                None
            }
        })
        .flat_map(|line| line.chars().chain(iter::once('\n')).collect::<Vec<_>>())
}

fn fatal(err: CompileError) -> anyhow::Error {
    warn!("stopping after fatal error: {err}");
    anyhow::Error::new(err).context("internal compiler error")
}
