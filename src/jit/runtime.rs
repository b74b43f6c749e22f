//! Functions generated code may call by name.
//!
//! Every compilation unit gets these registered with its `JITBuilder`, so an
//! `extern putchard(x)` or `extern sin(x)` resolves to the addresses below
//! instead of whatever the host process happens to export.

use std::cell::RefCell;

use cranelift_jit::JITBuilder;

#[derive(Clone, Copy, Debug)]
pub(super) struct RuntimeFunctionSpec {
    pub(super) symbol: &'static str,
    pub(super) function: *const u8,
}

thread_local! {
    static CAPTURED: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Runs `f` with runtime output redirected into a buffer and returns both.
///
/// Generated code runs on the calling thread, so anything `putchard` or
/// `printd` write while `f` executes ends up in the returned string, in
/// order, instead of on stderr.
pub fn capture_output<R>(f: impl FnOnce() -> R) -> (R, String) {
    let previous = CAPTURED.with(|cell| cell.replace(Some(String::new())));
    let result = f();
    let captured = CAPTURED.with(|cell| cell.replace(previous));
    (result, captured.unwrap_or_default())
}

fn emit(text: &str) {
    let captured = CAPTURED.with(|cell| match cell.borrow_mut().as_mut() {
        Some(buffer) => {
            buffer.push_str(text);
            true
        }
        None => false,
    });
    if !captured {
        eprint!("{text}");
    }
}

/// Renders a number the way C's `%f` does.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.6}")
    }
}

extern "C" fn putchard(value: f64) -> f64 {
    let ch = char::from_u32(value as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
    emit(ch.encode_utf8(&mut [0; 4]));
    0.0
}

extern "C" fn printd(value: f64) -> f64 {
    emit(&format!("{}\n", format_number(value)));
    0.0
}

extern "C" fn runtime_sin(value: f64) -> f64 {
    value.sin()
}

extern "C" fn runtime_cos(value: f64) -> f64 {
    value.cos()
}

extern "C" fn runtime_sqrt(value: f64) -> f64 {
    value.sqrt()
}

extern "C" fn runtime_exp(value: f64) -> f64 {
    value.exp()
}

extern "C" fn runtime_log(value: f64) -> f64 {
    value.ln()
}

extern "C" fn runtime_fabs(value: f64) -> f64 {
    value.abs()
}

pub(super) fn runtime_function_specs() -> [RuntimeFunctionSpec; 8] {
    [
        RuntimeFunctionSpec {
            symbol: "putchard",
            function: putchard as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "printd",
            function: printd as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "sin",
            function: runtime_sin as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "cos",
            function: runtime_cos as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "sqrt",
            function: runtime_sqrt as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "exp",
            function: runtime_exp as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "log",
            function: runtime_log as *const u8,
        },
        RuntimeFunctionSpec {
            symbol: "fabs",
            function: runtime_fabs as *const u8,
        },
    ]
}

pub(super) fn register_runtime_symbols(builder: &mut JITBuilder) {
    for spec in runtime_function_specs() {
        builder.symbol(spec.symbol, spec.function);
    }
}

pub(super) fn is_runtime_symbol(symbol: &str) -> bool {
    runtime_function_specs()
        .iter()
        .any(|spec| spec.symbol == symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_printd_and_putchard_in_order() {
        let ((), output) = capture_output(|| {
            putchard(72.0);
            putchard(105.0);
            putchard(10.0);
            printd(2.5);
        });
        assert_eq!(output, "Hi\n2.500000\n");
    }

    #[test]
    fn nested_capture_restores_outer_buffer() {
        let (inner, outer) = capture_output(|| {
            printd(1.0);
            let ((), inner) = capture_output(|| {
                printd(2.0);
            });
            printd(3.0);
            inner
        });
        assert_eq!(inner, "2.000000\n");
        assert_eq!(outer, "1.000000\n3.000000\n");
    }

    #[test]
    fn formats_like_percent_f() {
        assert_eq!(format_number(0.0), "0.000000");
        assert_eq!(format_number(-1.5), "-1.500000");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NAN), "nan");
    }

    #[test]
    fn recognizes_runtime_symbols() {
        assert!(is_runtime_symbol("printd"));
        assert!(!is_runtime_symbol("printf"));
    }
}
