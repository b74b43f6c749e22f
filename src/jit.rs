//! Cranelift-backed compilation units and the session-wide symbol table.
//!
//! Every top-level form is compiled into its own [`Unit`], a fresh
//! `JITModule`. Units holding definitions stay alive for the rest of the
//! session and publish their symbols; later units import those symbols by
//! name. Units for bare expressions are run once and then freed.
//!
//! A function known only from an `extern` has no address yet. Calls to it go
//! through a per-symbol cell owned by the [`Jit`], which is filled in when a
//! unit defining that symbol is linked.

use std::fmt;
use std::ptr;
use std::str::FromStr;
use std::sync::atomic::{AtomicPtr, Ordering};

use anyhow::{Context, Result, anyhow};
use cranelift_codegen::ir::{AbiParam, Signature, Type, types};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module, ModuleError};
use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ast::{Callee, Prototype};

pub mod runtime;

/// Cranelift optimization level for generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    fn setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

impl FromStr for OptLevel {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "none" => Ok(OptLevel::None),
            "speed" => Ok(OptLevel::Speed),
            "speed_and_size" => Ok(OptLevel::SpeedAndSize),
            other => Err(anyhow!(
                "unknown optimization level '{other}' (expected none, speed or speed_and_size)"
            )),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.setting())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DeclaredFunction {
    pub id: FuncId,
    pub arity: usize,
}

/// Address of the slot a late-bound call loads its target from.
pub type SymbolCell = *const AtomicPtr<u8>;

/// One compilation unit under construction.
pub struct Unit {
    module: JITModule,
    functions: FxHashMap<Callee, DeclaredFunction>,
    exports: Vec<(String, FuncId)>,
    linkable: FxHashSet<String>,
    cells: FxHashMap<String, SymbolCell>,
    references: FxHashSet<String>,
}

impl Unit {
    pub fn module_mut(&mut self) -> &mut JITModule {
        &mut self.module
    }

    pub fn pointer_type(&self) -> Type {
        self.module.target_config().pointer_type()
    }

    /// All parameters and the result are `f64`.
    pub fn signature(&self, arity: usize) -> Signature {
        let mut sig = self.module.make_signature();
        for _ in 0..arity {
            sig.params.push(AbiParam::new(types::F64));
        }
        sig.returns.push(AbiParam::new(types::F64));
        sig
    }

    /// A function already declared or defined in this unit.
    pub fn declared(&self, callee: &Callee) -> Option<DeclaredFunction> {
        self.functions.get(callee).copied()
    }

    /// Declares the function this unit is about to define. Named functions
    /// are exported once the unit is linked; the anonymous wrapper stays
    /// local.
    pub fn declare_definition(
        &mut self,
        prototype: &Prototype,
    ) -> Result<DeclaredFunction, ModuleError> {
        let symbol = prototype.callee().symbol();
        let exported = !prototype.is_anonymous();
        let linkage = if exported {
            Linkage::Export
        } else {
            Linkage::Local
        };
        let sig = self.signature(prototype.arity());
        let id = self.module.declare_function(&symbol, linkage, &sig)?;
        debug!("unit: declared {symbol} ({linkage:?})");

        if exported {
            self.exports.push((symbol, id));
        }
        let declared = DeclaredFunction {
            id,
            arity: prototype.arity(),
        };
        self.functions.insert(prototype.callee(), declared);
        Ok(declared)
    }

    /// Declares a function that lives outside this unit.
    pub fn declare_import(
        &mut self,
        prototype: &Prototype,
    ) -> Result<DeclaredFunction, ModuleError> {
        let symbol = prototype.callee().symbol();
        let sig = self.signature(prototype.arity());
        let id = self.module.declare_function(&symbol, Linkage::Import, &sig)?;
        debug!("unit: imported {symbol}");
        self.references.insert(symbol);

        let declared = DeclaredFunction {
            id,
            arity: prototype.arity(),
        };
        self.functions.insert(prototype.callee(), declared);
        Ok(declared)
    }

    /// Whether an import of `symbol` would resolve when this unit links.
    pub fn can_import(&self, symbol: &str) -> bool {
        self.linkable.contains(symbol)
    }

    /// The cell holding `symbol`'s address once it is defined. Using it
    /// records `symbol` as something this unit needs at run time.
    pub fn late_bound(&mut self, symbol: &str) -> Option<SymbolCell> {
        let cell = self.cells.get(symbol).copied()?;
        debug!("unit: late-bound call to {symbol}");
        self.references.insert(symbol.to_string());
        Some(cell)
    }
}

/// The JIT for one session.
pub struct Jit {
    isa: OwnedTargetIsa,
    symbols: FxHashMap<String, *const u8>,
    cells: FxHashMap<String, Box<AtomicPtr<u8>>>,
    /// Symbols each linked function calls outside its own unit.
    dependencies: FxHashMap<String, FxHashSet<String>>,
    modules: Vec<JITModule>,
}

impl Jit {
    pub fn new(opt_level: OptLevel) -> Result<Self> {
        let mut flag_builder = settings::builder();
        flag_builder.set("use_colocated_libcalls", "false")?;
        flag_builder.set("is_pic", "false")?;
        flag_builder.set("opt_level", opt_level.setting())?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| anyhow!("host machine is not supported: {msg}"))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .context("failed to build target ISA")?;

        debug!("jit: target {} at opt level {opt_level}", isa.triple());
        Ok(Self {
            isa,
            symbols: FxHashMap::default(),
            cells: FxHashMap::default(),
            dependencies: FxHashMap::default(),
            modules: Vec::new(),
        })
    }

    /// Gives `symbol` a cell so later units can call it before it is
    /// defined. Symbols that already have an address need none.
    pub fn reserve(&mut self, symbol: &str) {
        if self.is_linked(symbol) || self.cells.contains_key(symbol) {
            return;
        }
        debug!("jit: reserved cell for {symbol}");
        self.cells.insert(symbol.to_string(), Box::new(AtomicPtr::new(ptr::null_mut())));
    }

    /// Starts a unit that can see the runtime library and every symbol
    /// linked so far.
    pub fn new_unit(&self) -> Unit {
        let mut builder =
            JITBuilder::with_isa(self.isa.clone(), cranelift_module::default_libcall_names());
        runtime::register_runtime_symbols(&mut builder);

        let mut linkable: FxHashSet<String> = runtime::runtime_function_specs()
            .iter()
            .map(|spec| spec.symbol.to_string())
            .collect();
        for (name, address) in &self.symbols {
            builder.symbol(name.as_str(), *address);
            linkable.insert(name.clone());
        }

        let cells = self
            .cells
            .iter()
            .map(|(name, cell)| (name.clone(), &**cell as SymbolCell))
            .collect();

        Unit {
            module: JITModule::new(builder),
            functions: FxHashMap::default(),
            exports: Vec::new(),
            linkable,
            cells,
            references: FxHashSet::default(),
        }
    }

    /// Finalizes `unit`, publishes its exported symbols and keeps its code
    /// alive for the rest of the session.
    pub fn link(&mut self, mut unit: Unit) -> Result<(), ModuleError> {
        if let Err(err) = unit.module.finalize_definitions() {
            self.discard(unit);
            return Err(err);
        }
        for (symbol, id) in &unit.exports {
            let address = unit.module.get_finalized_function(*id);
            debug!("jit: linked {symbol} at {address:p}");
            if let Some(cell) = self.cells.get(symbol) {
                cell.store(address.cast_mut(), Ordering::Release);
            }
            self.symbols.insert(symbol.clone(), address);
            self.dependencies.insert(symbol.clone(), unit.references.clone());
        }
        self.modules.push(unit.module);
        Ok(())
    }

    /// Finalizes `unit`, calls its zero-argument function `id` once and
    /// releases the unit.
    pub fn run_anonymous(&mut self, mut unit: Unit, id: FuncId) -> Result<f64, ModuleError> {
        if let Err(err) = unit.module.finalize_definitions() {
            self.discard(unit);
            return Err(err);
        }
        let code = unit.module.get_finalized_function(id);
        // SAFETY: `id` was declared with an empty parameter list and an f64
        // result, and the module has just been finalized.
        let entry: extern "C" fn() -> f64 = unsafe { std::mem::transmute(code) };
        let value = entry();
        self.discard(unit);
        Ok(value)
    }

    /// The first symbol `unit` would reach at run time, directly or through
    /// the functions it calls, that still has no address.
    pub fn unresolved_reference(&self, unit: &Unit) -> Option<String> {
        let mut pending: Vec<&str> = unit.references.iter().map(String::as_str).collect();
        let mut seen = FxHashSet::default();
        while let Some(symbol) = pending.pop() {
            if !seen.insert(symbol) {
                continue;
            }
            if !self.is_linked(symbol) {
                return Some(symbol.to_string());
            }
            if let Some(callees) = self.dependencies.get(symbol) {
                pending.extend(callees.iter().map(String::as_str));
            }
        }
        None
    }

    /// Drops a unit without linking it. Nothing it declared becomes callable.
    pub fn discard(&mut self, unit: Unit) {
        debug!("jit: releasing unit with {} functions", unit.functions.len());
        // SAFETY: no symbol from this unit was published and no pointer into
        // its code escapes this call.
        unsafe { unit.module.free_memory() };
    }

    pub fn lookup(&self, symbol: &str) -> Option<*const u8> {
        self.symbols.get(symbol).copied()
    }

    pub fn is_linked(&self, symbol: &str) -> bool {
        self.symbols.contains_key(symbol) || runtime::is_runtime_symbol(symbol)
    }

    pub fn live_units(&self) -> usize {
        self.modules.len()
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        for module in self.modules.drain(..) {
            // SAFETY: the symbol table dies with the session, so no caller
            // can reach these functions afterwards.
            unsafe { module.free_memory() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opt_level_round_trips_through_its_flag_name() {
        for level in [OptLevel::None, OptLevel::Speed, OptLevel::SpeedAndSize] {
            assert_eq!(level.to_string().parse::<OptLevel>().unwrap(), level);
        }
        assert!("fast".parse::<OptLevel>().is_err());
    }

    #[test]
    fn failed_units_publish_nothing() {
        let mut jit = Jit::new(OptLevel::None).expect("jit");
        let mut unit = jit.new_unit();
        let ghost = Prototype::function("ghost", vec![]);
        unit.declare_definition(&ghost).expect("declare");
        jit.discard(unit);
        assert!(!jit.is_linked("ghost"));
        assert!(jit.is_linked("printd"));
        assert_eq!(jit.live_units(), 0);
    }

    #[test]
    fn reserved_symbols_are_late_bound_until_linked() {
        let mut jit = Jit::new(OptLevel::None).expect("jit");
        jit.reserve("later");
        jit.reserve("printd");

        let mut unit = jit.new_unit();
        assert!(unit.late_bound("printd").is_none());
        assert!(unit.late_bound("later").is_some());
        assert_eq!(jit.unresolved_reference(&unit).as_deref(), Some("later"));
        jit.discard(unit);
    }

    #[test]
    fn new_units_can_import_runtime_symbols() {
        let jit = Jit::new(OptLevel::None).expect("jit");
        let unit = jit.new_unit();
        assert!(unit.can_import("sin"));
        assert!(!unit.can_import("fib"));
    }
}
