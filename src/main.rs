use std::fs;
use std::io;

use anyhow::{Context, Result, anyhow, bail};
use env_logger::Env;

use kaleido::repl::{Repl, line_chars};
use kaleido::session::{Session, SessionOptions};

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();

    let mut args = std::env::args().skip(1);
    let mut options = SessionOptions::default();
    let mut input_path: Option<String> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--opt-level" | "-O" => {
                let level = args
                    .next()
                    .ok_or_else(|| anyhow!("Missing optimization level after {arg}"))?;
                options.opt_level = level.parse()?;
            }
            "--dump-ir" => options.dump_ir = true,
            "--no-dump-ir" => options.dump_ir = false,
            flag if flag.starts_with('-') => bail!("Unknown option '{flag}'"),
            _ => {
                input_path = Some(arg);
                if args.next().is_some() {
                    bail!("Only one input file is supported");
                }
                break;
            }
        }
    }

    let mut session = Session::new(options).context("Starting the JIT")?;

    if let Some(path) = input_path {
        let source = fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        let stdout = io::stdout().lock();
        let mut repl = Repl::new(&mut session, stdout).capture_runtime(true);
        return repl.run(source.chars());
    }

    // Interactive: messages share stderr with the runtime library's output.
    let mut repl = Repl::new(&mut session, io::stderr()).interactive(true);
    repl.run(line_chars(io::stdin().lock()))
}
