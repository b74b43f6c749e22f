//! Lowering of one top-level function into Cranelift IR.
//!
//! Every value in the language is an `f64`. Parameters and local variables
//! live in explicit stack slots so that `=` can mutate them; Cranelift's
//! optimizer promotes them back into registers.

use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::{
    Block, FuncRef, InstBuilder, MemFlags, SigRef, StackSlot, StackSlotData, StackSlotKind,
    UserFuncName, Value, types,
};
use cranelift_codegen::verify_function;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{FuncId, Module};
use log::debug;
use rustc_hash::FxHashMap;

use crate::ast::{Callee, Expr, Function, Prototype};
use crate::jit::{DeclaredFunction, SymbolCell, Unit};
use crate::operators::OperatorTable;

mod error;
mod registry;
mod scope;

pub use error::{CodegenError, CodegenResult};
pub use registry::PrototypeRegistry;
pub use scope::{Scope, Shadowed};

const SLOT_SIZE: u32 = 8;
const SLOT_ALIGN_SHIFT: u8 = 3;

/// A function body that made it through verification and into its unit.
#[derive(Debug)]
pub struct CompiledFunction {
    pub id: FuncId,
    /// Textual IR as emitted, before Cranelift's optimizer runs.
    pub ir: String,
}

/// Compiles `function` into `unit`.
///
/// The prototype goes into the registry first so the body can call itself.
/// A binary operator's precedence is installed before lowering. If lowering
/// fails, both the registry entry and the operator entry are put back the
/// way they were, and the caller must discard `unit`.
pub fn compile_function(
    unit: &mut Unit,
    registry: &mut PrototypeRegistry,
    operators: &mut OperatorTable,
    function: &Function,
) -> CodegenResult<CompiledFunction> {
    let prototype = &function.prototype;
    let callee = prototype.callee();

    let previous_prototype = if prototype.is_anonymous() {
        None
    } else {
        Some(registry.insert(prototype.clone()))
    };
    let previous_precedence = prototype.binary_operator().map(|(op, precedence)| {
        debug!("installing binary operator '{op}' at precedence {precedence}");
        (op, operators.install(op, precedence))
    });

    let result = lower_function(unit, registry, prototype, &function.body);

    if let Err(err) = &result {
        debug!("lowering {callee} failed: {err}");
        if let Some((op, previous)) = previous_precedence {
            debug!("rolling back binary operator '{op}'");
            operators.restore(op, previous);
        }
        if let Some(previous) = previous_prototype {
            registry.restore(&callee, previous);
        }
    }
    result
}

fn lower_function(
    unit: &mut Unit,
    registry: &PrototypeRegistry,
    prototype: &Prototype,
    body: &Expr,
) -> CodegenResult<CompiledFunction> {
    let DeclaredFunction { id, .. } = unit.declare_definition(prototype)?;

    let mut ctx = unit.module_mut().make_context();
    ctx.func.signature = unit.signature(prototype.arity());
    ctx.func.name = UserFuncName::testcase(prototype.callee().symbol());

    let mut builder_context = FunctionBuilderContext::new();
    {
        let builder = FunctionBuilder::new(&mut ctx.func, &mut builder_context);
        let mut lowering = FunctionLowering::new(builder, unit, registry);
        lowering.lower_body(prototype, body)?;
        lowering.finish();
    }

    let module = unit.module_mut();
    verify_function(&ctx.func, module.isa())
        .map_err(|errors| CodegenError::Verifier(errors.to_string()))?;
    let ir = ctx.func.display().to_string();

    module.define_function(id, &mut ctx)?;
    module.clear_context(&mut ctx);
    debug!("defined {}", prototype.callee());

    Ok(CompiledFunction { id, ir })
}

/// A lowered expression together with the block control is in once its
/// code has been emitted.
#[derive(Debug, Clone, Copy)]
struct Lowered {
    value: Value,
    block: Block,
}

/// How a call reaches its callee.
#[derive(Debug, Clone, Copy)]
enum CallTarget {
    Direct(FuncRef),
    /// Load the callee's address from its cell and call through it.
    Indirect { cell: SymbolCell, signature: SigRef },
}

/// Per-function lowering state.
struct FunctionLowering<'a> {
    builder: FunctionBuilder<'a>,
    unit: &'a mut Unit,
    registry: &'a PrototypeRegistry,
    targets: FxHashMap<Callee, CallTarget>,
    scope: Scope<StackSlot>,
    current: Block,
}

impl<'a> FunctionLowering<'a> {
    fn new(
        mut builder: FunctionBuilder<'a>,
        unit: &'a mut Unit,
        registry: &'a PrototypeRegistry,
    ) -> Self {
        let entry = builder.create_block();
        Self {
            builder,
            unit,
            registry,
            targets: FxHashMap::default(),
            scope: Scope::new(),
            current: entry,
        }
    }

    fn lower_body(&mut self, prototype: &Prototype, body: &Expr) -> CodegenResult<()> {
        let entry = self.current;
        self.builder.append_block_params_for_function_params(entry);
        self.switch_to(entry);

        // Parameters get their own slots so they can be reassigned.
        for (index, param) in prototype.params.iter().enumerate() {
            let value = self.builder.block_params(entry)[index];
            let slot = self.create_slot();
            self.builder.ins().stack_store(value, slot, 0);
            let _ = self.scope.bind(param, slot);
        }

        let lowered = self.lower_expr(body)?;
        self.builder.ins().return_(&[lowered.value]);
        Ok(())
    }

    fn finish(mut self) {
        self.builder.seal_all_blocks();
        self.builder.finalize();
    }

    fn lower_expr(&mut self, expr: &Expr) -> CodegenResult<Lowered> {
        match expr {
            Expr::Number(value) => {
                let value = self.builder.ins().f64const(*value);
                Ok(self.here(value))
            }
            Expr::Variable(name) => {
                let slot = self
                    .scope
                    .lookup(name)
                    .ok_or_else(|| CodegenError::UnknownVariable(name.clone()))?;
                let value = self.builder.ins().stack_load(types::F64, slot, 0);
                Ok(self.here(value))
            }
            Expr::Unary { op, operand } => self.lower_unary(*op, operand),
            Expr::Binary { op: '=', left, right } => self.lower_assignment(left, right),
            Expr::Binary { op, left, right } => self.lower_binary(*op, left, right),
            Expr::Call { callee, args } => self.lower_call(callee, args),
            Expr::If {
                condition,
                then_branch,
                else_branch,
            } => self.lower_if(condition, then_branch, else_branch),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => self.lower_for(var, start, end, step.as_deref(), body),
            Expr::Var { bindings, body } => self.lower_var(bindings, body),
        }
    }

    fn lower_unary(&mut self, op: char, operand: &Expr) -> CodegenResult<Lowered> {
        let operand = self.lower_expr(operand)?;
        let target = self
            .call_target(&Callee::Unary(op))?
            .ok_or(CodegenError::UnknownUnaryOperator(op))?;
        Ok(self.call(target, &[operand.value]))
    }

    fn lower_assignment(&mut self, left: &Expr, right: &Expr) -> CodegenResult<Lowered> {
        let Expr::Variable(name) = left else {
            return Err(CodegenError::InvalidAssignment);
        };
        let value = self.lower_expr(right)?;
        let slot = self
            .scope
            .lookup(name)
            .ok_or_else(|| CodegenError::UnknownVariable(name.clone()))?;
        self.builder.ins().stack_store(value.value, slot, 0);
        Ok(value)
    }

    fn lower_binary(&mut self, op: char, left: &Expr, right: &Expr) -> CodegenResult<Lowered> {
        let lhs = self.lower_expr(left)?.value;
        let rhs = self.lower_expr(right)?.value;

        let value = match op {
            '+' => self.builder.ins().fadd(lhs, rhs),
            '-' => self.builder.ins().fsub(lhs, rhs),
            '*' => self.builder.ins().fmul(lhs, rhs),
            '<' => {
                let less = self.builder.ins().fcmp(FloatCC::UnorderedOrLessThan, lhs, rhs);
                self.bool_to_number(less)
            }
            _ => {
                let target = self
                    .call_target(&Callee::Binary(op))?
                    .ok_or(CodegenError::MissingBinaryOperator(op))?;
                return Ok(self.call(target, &[lhs, rhs]));
            }
        };
        Ok(self.here(value))
    }

    fn lower_call(&mut self, name: &str, args: &[Expr]) -> CodegenResult<Lowered> {
        let callee = Callee::Named(name.to_string());
        let arity = self
            .arity(&callee)
            .ok_or_else(|| CodegenError::UnknownFunction(name.to_string()))?;
        if arity != args.len() {
            return Err(CodegenError::ArityMismatch {
                callee: name.to_string(),
                expected: arity,
                found: args.len(),
            });
        }

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.lower_expr(arg)?.value);
        }
        let target = self
            .call_target(&callee)?
            .ok_or_else(|| CodegenError::UnknownFunction(name.to_string()))?;
        Ok(self.call(target, &values))
    }

    fn lower_if(
        &mut self,
        condition: &Expr,
        then_branch: &Expr,
        else_branch: &Expr,
    ) -> CodegenResult<Lowered> {
        let condition = self.lower_expr(condition)?.value;
        let truth = self.is_true(condition);

        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        let merge_block = self.builder.create_block();
        self.builder.append_block_param(merge_block, types::F64);

        self.builder.ins().brif(truth, then_block, &[], else_block, &[]);

        self.switch_to(then_block);
        let then_value = self.lower_expr(then_branch)?;
        self.jump_from(then_value, merge_block)?;

        self.switch_to(else_block);
        let else_value = self.lower_expr(else_branch)?;
        self.jump_from(else_value, merge_block)?;

        self.switch_to(merge_block);
        let value = self.builder.block_params(merge_block)[0];
        Ok(self.here(value))
    }

    /// The condition is tested after the body, so the body always runs at
    /// least once.
    fn lower_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> CodegenResult<Lowered> {
        let slot = self.create_slot();
        let start = self.lower_expr(start)?.value;
        self.builder.ins().stack_store(start, slot, 0);

        let loop_block = self.builder.create_block();
        self.builder.ins().jump(loop_block, &[]);
        self.switch_to(loop_block);

        let shadowed = self.scope.bind(var, slot);
        let result = self.lower_loop_iteration(slot, loop_block, end, step, body);
        self.scope.restore(shadowed);
        result?;

        let zero = self.builder.ins().f64const(0.0);
        Ok(self.here(zero))
    }

    fn lower_loop_iteration(
        &mut self,
        slot: StackSlot,
        loop_block: Block,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> CodegenResult<()> {
        self.lower_expr(body)?;

        let step = match step {
            Some(step) => self.lower_expr(step)?.value,
            None => self.builder.ins().f64const(1.0),
        };
        let end = self.lower_expr(end)?.value;

        // Reload: the body may have assigned to the loop variable.
        let current = self.builder.ins().stack_load(types::F64, slot, 0);
        let next = self.builder.ins().fadd(current, step);
        self.builder.ins().stack_store(next, slot, 0);

        let keep_going = self.is_true(end);
        let after_block = self.builder.create_block();
        self.builder.ins().brif(keep_going, loop_block, &[], after_block, &[]);
        self.switch_to(after_block);
        Ok(())
    }

    fn lower_var(
        &mut self,
        bindings: &[(String, Option<Expr>)],
        body: &Expr,
    ) -> CodegenResult<Lowered> {
        let mut shadowed = Vec::with_capacity(bindings.len());
        let result = self.lower_bindings(bindings, body, &mut shadowed);
        for binding in shadowed.into_iter().rev() {
            self.scope.restore(binding);
        }
        result
    }

    fn lower_bindings(
        &mut self,
        bindings: &[(String, Option<Expr>)],
        body: &Expr,
        shadowed: &mut Vec<Shadowed<StackSlot>>,
    ) -> CodegenResult<Lowered> {
        for (name, init) in bindings {
            // Evaluated before `name` is bound, so it still sees any outer
            // binding of the same name.
            let value = match init {
                Some(init) => self.lower_expr(init)?.value,
                None => self.builder.ins().f64const(0.0),
            };
            let slot = self.create_slot();
            self.builder.ins().stack_store(value, slot, 0);
            shadowed.push(self.scope.bind(name, slot));
        }
        self.lower_expr(body)
    }

    /// Parameter count of a callee visible from this unit.
    fn arity(&self, callee: &Callee) -> Option<usize> {
        match self.unit.declared(callee) {
            Some(declared) => Some(declared.arity),
            None => self.registry.get(callee).map(Prototype::arity),
        }
    }

    /// Resolves a callee against this unit first, then the registry. A
    /// registry entry with an address is imported into the unit on first
    /// use; one still waiting for its definition is called through its
    /// cell.
    fn call_target(&mut self, callee: &Callee) -> CodegenResult<Option<CallTarget>> {
        if let Some(target) = self.targets.get(callee) {
            return Ok(Some(*target));
        }

        let registry = self.registry;
        let target = match self.unit.declared(callee) {
            Some(declared) => self.direct(declared),
            None => {
                let Some(prototype) = registry.get(callee) else {
                    return Ok(None);
                };
                let symbol = callee.symbol();
                if self.unit.can_import(&symbol) {
                    let declared = self.unit.declare_import(prototype)?;
                    self.direct(declared)
                } else if let Some(cell) = self.unit.late_bound(&symbol) {
                    let signature = self.unit.signature(prototype.arity());
                    CallTarget::Indirect {
                        cell,
                        signature: self.builder.import_signature(signature),
                    }
                } else {
                    return Err(CodegenError::UnresolvedSymbol(symbol));
                }
            }
        };

        self.targets.insert(callee.clone(), target);
        Ok(Some(target))
    }

    fn direct(&mut self, declared: DeclaredFunction) -> CallTarget {
        let func_ref = self
            .unit
            .module_mut()
            .declare_func_in_func(declared.id, self.builder.func);
        CallTarget::Direct(func_ref)
    }

    fn call(&mut self, target: CallTarget, args: &[Value]) -> Lowered {
        let inst = match target {
            CallTarget::Direct(func_ref) => self.builder.ins().call(func_ref, args),
            CallTarget::Indirect { cell, signature } => {
                let pointer = self.unit.pointer_type();
                let cell = self.builder.ins().iconst(pointer, cell as i64);
                let code = self.builder.ins().load(pointer, MemFlags::new(), cell, 0);
                self.builder.ins().call_indirect(signature, code, args)
            }
        };
        let value = self.builder.inst_results(inst)[0];
        self.here(value)
    }

    fn is_true(&mut self, value: Value) -> Value {
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().fcmp(FloatCC::OrderedNotEqual, value, zero)
    }

    fn bool_to_number(&mut self, flag: Value) -> Value {
        let wide = self.builder.ins().uextend(types::I64, flag);
        self.builder.ins().fcvt_from_uint(types::F64, wide)
    }

    fn create_slot(&mut self) -> StackSlot {
        self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            SLOT_SIZE,
            SLOT_ALIGN_SHIFT,
        ))
    }

    /// Ends the block `from` finished in with a jump that hands its value to
    /// `target`'s parameter. The builder must still be emitting into that
    /// block.
    fn jump_from(&mut self, from: Lowered, target: Block) -> CodegenResult<()> {
        if self.builder.current_block() != Some(from.block) {
            return Err(CodegenError::BranchOutOfPlace(from.block));
        }
        self.builder.ins().jump(target, &[from.value]);
        Ok(())
    }

    fn switch_to(&mut self, block: Block) {
        self.builder.switch_to_block(block);
        self.current = block;
    }

    fn here(&self, value: Value) -> Lowered {
        Lowered {
            value,
            block: self.current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Item;
    use crate::jit::{Jit, OptLevel};
    use crate::parser::parse_program;

    struct Fixture {
        jit: Jit,
        registry: PrototypeRegistry,
        operators: OperatorTable,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jit: Jit::new(OptLevel::None).expect("host ISA"),
                registry: PrototypeRegistry::new(),
                operators: OperatorTable::with_builtins(),
            }
        }

        fn function(&self, source: &str) -> Function {
            let mut items = parse_program(source, &self.operators).expect("parse");
            match items.pop() {
                Some(Item::Definition(function) | Item::Expression(function)) => function,
                other => panic!("expected a function, got {other:?}"),
            }
        }

        fn compile(&mut self, source: &str) -> CodegenResult<CompiledFunction> {
            let function = self.function(source);
            let mut unit = self.jit.new_unit();
            let result = compile_function(
                &mut unit,
                &mut self.registry,
                &mut self.operators,
                &function,
            );
            match &result {
                Ok(_) if !function.prototype.is_anonymous() => {
                    self.jit.link(unit).expect("link");
                }
                _ => self.jit.discard(unit),
            }
            result
        }
    }

    #[test]
    fn emits_verified_ir_for_recursive_function() {
        let mut fixture = Fixture::new();
        let compiled = fixture
            .compile("def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)")
            .expect("compile");
        assert!(compiled.ir.contains("function %fib(f64) -> f64"));
        assert!(compiled.ir.contains("fcmp"));
        assert!(compiled.ir.contains("call"));
        assert!(fixture.jit.lookup("fib").is_some());
    }

    #[test]
    fn unknown_variable_is_reported() {
        let mut fixture = Fixture::new();
        let err = fixture.compile("def f(x) y").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownVariable(name) if name == "y"));
        assert!(!fixture.registry.contains(&Callee::Named("f".to_string())));
    }

    #[test]
    fn assignment_needs_a_variable_on_the_left() {
        let mut fixture = Fixture::new();
        let err = fixture.compile("def f(x) (x+1) = 2").unwrap_err();
        assert!(matches!(err, CodegenError::InvalidAssignment));
        assert_eq!(err.to_string(), "destination of '=' must be a variable");

        let err = fixture.compile("def g(x) y = 2").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownVariable(name) if name == "y"));
    }

    #[test]
    fn unknown_callees_are_reported() {
        let mut fixture = Fixture::new();
        let err = fixture.compile("def f(x) g(x)").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownFunction(name) if name == "g"));

        let err = fixture.compile("def f(x) !x").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownUnaryOperator('!')));
    }

    #[test]
    fn call_arity_is_checked() {
        let mut fixture = Fixture::new();
        fixture
            .registry
            .insert(Prototype::function("putchard", vec!["c".to_string()]));
        let err = fixture.compile("def f(x) putchard(x, x)").unwrap_err();
        assert!(err.to_string().starts_with("Incorrect # arguments passed"));
    }

    #[test]
    fn declared_but_undefined_callee_is_called_through_its_cell() {
        let mut fixture = Fixture::new();
        fixture.jit.reserve("later");
        fixture
            .registry
            .insert(Prototype::function("later", vec!["x".to_string()]));

        let err = fixture.compile("def f(x) later(x, x)").unwrap_err();
        assert!(matches!(
            err,
            CodegenError::ArityMismatch { expected: 1, found: 2, .. }
        ));

        let compiled = fixture.compile("def g(x) later(x) + 1").expect("compile");
        assert!(compiled.ir.contains("call_indirect"));
        assert!(fixture.jit.is_linked("g"));
    }

    #[test]
    fn merge_rejects_a_value_from_a_block_control_has_left() {
        let mut jit = Jit::new(OptLevel::None).expect("host ISA");
        let mut unit = jit.new_unit();
        let registry = PrototypeRegistry::new();
        let mut func = cranelift_codegen::ir::Function::new();
        let mut builder_context = FunctionBuilderContext::new();
        let builder = FunctionBuilder::new(&mut func, &mut builder_context);
        let mut lowering = FunctionLowering::new(builder, &mut unit, &registry);

        let entry = lowering.current;
        lowering.switch_to(entry);
        let one = lowering.builder.ins().f64const(1.0);
        let stale = lowering.here(one);

        let next = lowering.builder.create_block();
        let merge = lowering.builder.create_block();
        lowering.builder.append_block_param(merge, types::F64);
        lowering.builder.ins().jump(next, &[]);
        lowering.switch_to(next);

        let err = lowering.jump_from(stale, merge).unwrap_err();
        assert!(matches!(err, CodegenError::BranchOutOfPlace(block) if block == entry));
        assert!(err.is_fatal());

        drop(lowering);
        jit.discard(unit);
    }

    #[test]
    fn prototypes_without_code_are_unresolved() {
        let mut fixture = Fixture::new();
        fixture
            .registry
            .insert(Prototype::function("nowhere", vec!["x".to_string()]));
        let err = fixture.compile("def f(x) nowhere(x)").unwrap_err();
        assert!(matches!(err, CodegenError::UnresolvedSymbol(name) if name == "nowhere"));
    }

    #[test]
    fn failed_operator_definition_rolls_back() {
        let mut fixture = Fixture::new();
        let err = fixture.compile("def binary§ 30 (a b) a + c").unwrap_err();
        assert!(matches!(err, CodegenError::UnknownVariable(_)));
        assert_eq!(fixture.operators.precedence('§'), None);
        assert!(!fixture.registry.contains(&Callee::Binary('§')));
    }

    #[test]
    fn failed_redefinition_keeps_previous_operator() {
        let mut fixture = Fixture::new();
        fixture
            .compile("def binary| 5 (a b) if a then 1 else if b then 1 else 0")
            .expect("first definition");
        fixture
            .compile("def binary| 50 (a b) zzz")
            .expect_err("second definition");
        assert_eq!(fixture.operators.precedence('|'), Some(5));
        let prototype = fixture.registry.get(&Callee::Binary('|')).unwrap();
        assert_eq!(prototype.binary_operator(), Some(('|', 5)));
    }

    #[test]
    fn operator_without_function_is_fatal() {
        let mut fixture = Fixture::new();
        fixture.operators.install('|', 5);
        let err = fixture.compile("1 | 2").unwrap_err();
        assert!(matches!(err, CodegenError::MissingBinaryOperator('|')));
        assert!(err.is_fatal());
    }

    #[test]
    fn anonymous_functions_are_not_registered() {
        let mut fixture = Fixture::new();
        fixture.compile("1 + 2").expect("compile");
        assert!(fixture.registry.is_empty());
    }
}
