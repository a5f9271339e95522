//! AST → [`Image`] code generation.
//!
//! Functions are emitted callees-first (include modules, then main-file
//! helpers, then `Main`), so every `CALL` operand is a known address at the
//! moment it is written. Forward jumps inside a function are emitted with a
//! placeholder operand and backpatched once their target exists.

use std::collections::HashMap;

use crate::bytecode::*;
use crate::parser::ast::*;

/// One parsed translation unit, ready for code generation.
#[derive(Debug, Clone)]
pub struct Unit {
    /// Source file stem; prefixes function names from include modules.
    pub module: String,
    pub is_main: bool,
    pub ast: Vec<Stmt>,
}

struct LocalVar {
    slot: u32,
    mutable: bool,
}

/// Scope frame. Function bodies push one; each nested block pushes another
/// that continues the same flat slot numbering, so slots are never reused
/// across sibling blocks.
struct FunctionContext {
    vars: HashMap<String, LocalVar>,
    next_local: u32,
}

#[derive(Default)]
struct LoopContext {
    break_patches: Vec<u32>,
    continue_patches: Vec<u32>,
}

pub struct Compiler {
    image: Image,
    contexts: Vec<FunctionContext>,
    loops: Vec<LoopContext>,
    globals: HashMap<String, u32>,
    function_addrs: HashMap<String, u32>,
}

/// Compile a set of units in the load-bearing order: include-module helpers
/// first (registered under module-qualified and bare names), then main-file
/// helpers, then exactly one `Main`.
pub fn compile_units(units: &[Unit]) -> Result<Image, String> {
    let mut c = Compiler::new();

    for unit in units.iter().filter(|u| !u.is_main) {
        for stmt in &unit.ast {
            if let Stmt::Function(func) = stmt {
                if func.name != "Main" {
                    c.compile_function(func, Some(&unit.module))?;
                }
            }
        }
    }

    for unit in units.iter().filter(|u| u.is_main) {
        for stmt in &unit.ast {
            if let Stmt::Function(func) = stmt {
                if func.name != "Main" {
                    c.compile_function(func, None)?;
                }
            }
        }
    }

    let mut has_main = false;
    for unit in units {
        for stmt in &unit.ast {
            if let Stmt::Function(func) = stmt {
                if func.name == "Main" && !has_main {
                    c.compile_function(func, None)?;
                    has_main = true;
                }
            }
        }
    }

    if !has_main {
        return Err("Main function not found".to_string());
    }

    if c.image.code.last().map(|i| i.opcode) != Some(OP_HALT) {
        c.emit0(OP_HALT);
    }

    Ok(c.image)
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            image: Image::new(),
            contexts: Vec::new(),
            loops: Vec::new(),
            globals: HashMap::new(),
            function_addrs: HashMap::new(),
        }
    }

    /// Compile a single-unit program.
    pub fn compile(program: &[Stmt]) -> Result<Image, String> {
        compile_units(&[Unit { module: "main".to_string(), is_main: true, ast: program.to_vec() }])
    }

    // ── Emission helpers ───────────────────────────

    fn here(&self) -> u32 {
        self.image.code.len() as u32
    }

    fn emit(&mut self, opcode: u8, operand: u32) {
        self.image.code.push(Instr::new(opcode, operand));
    }

    fn emit0(&mut self, opcode: u8) {
        self.emit(opcode, 0);
    }

    fn emit_jump(&mut self, opcode: u8) -> u32 {
        self.emit(opcode, JUMP_PLACEHOLDER);
        self.here() - 1
    }

    fn patch_jump(&mut self, at: u32) {
        let target = self.here();
        self.image.code[at as usize].operand = target;
    }

    fn patch_jumps(&mut self, patches: &[u32], target: u32) {
        for &at in patches {
            self.image.code[at as usize].operand = target;
        }
    }

    // ── Constant pool ──────────────────────────────

    fn add_constant_int(&mut self, value: i64) -> u32 {
        for (i, c) in self.image.constants.iter().enumerate() {
            if matches!(c, Value::Int(v) if *v == value) {
                return i as u32;
            }
        }
        self.image.constants.push(Value::Int(value));
        self.image.constants.len() as u32 - 1
    }

    fn add_constant_float(&mut self, value: f64) -> u32 {
        for (i, c) in self.image.constants.iter().enumerate() {
            if matches!(c, Value::Float(v) if v.to_bits() == value.to_bits()) {
                return i as u32;
            }
        }
        self.image.constants.push(Value::Float(value));
        self.image.constants.len() as u32 - 1
    }

    fn add_constant_bool(&mut self, value: bool) -> u32 {
        for (i, c) in self.image.constants.iter().enumerate() {
            if matches!(c, Value::Bool(v) if *v == value) {
                return i as u32;
            }
        }
        self.image.constants.push(Value::Bool(value));
        self.image.constants.len() as u32 - 1
    }

    fn add_constant_string(&mut self, value: &str) -> u32 {
        let str_idx = match self.image.strings.iter().position(|s| s == value) {
            Some(i) => i as u32,
            None => {
                self.image.strings.push(value.to_string());
                self.image.strings.len() as u32 - 1
            }
        };
        for (i, c) in self.image.constants.iter().enumerate() {
            if matches!(c, Value::Str(idx) if *idx == str_idx) {
                return i as u32;
            }
        }
        self.image.constants.push(Value::Str(str_idx));
        self.image.constants.len() as u32 - 1
    }

    /// Array-kind constant whose payload selects the `NEW_ARRAY` mode:
    /// 0 = size on stack, default-filled; 1 = element count on stack,
    /// elements collected from the stack.
    fn add_constant_array(&mut self, kind: ArrayKind, mode: u32) -> u32 {
        let value = match kind {
            ArrayKind::Int => Value::ArrayInt(mode),
            ArrayKind::Float => Value::ArrayFloat(mode),
            ArrayKind::Str => Value::ArrayStr(mode),
        };
        for (i, c) in self.image.constants.iter().enumerate() {
            if *c == value {
                return i as u32;
            }
        }
        self.image.constants.push(value);
        self.image.constants.len() as u32 - 1
    }

    fn emit_push_int(&mut self, value: i64) {
        let idx = self.add_constant_int(value);
        self.emit(OP_PUSH, idx);
    }

    fn emit_push_float(&mut self, value: f64) {
        let idx = self.add_constant_float(value);
        self.emit(OP_PUSH, idx);
    }

    fn emit_push_bool(&mut self, value: bool) {
        let idx = self.add_constant_bool(value);
        self.emit(OP_PUSH, idx);
    }

    fn emit_push_string(&mut self, value: &str) {
        let idx = self.add_constant_string(value);
        self.emit(OP_PUSH, idx);
    }

    fn emit_push_nil(&mut self) {
        self.image.constants.push(Value::Nil);
        let idx = self.image.constants.len() as u32 - 1;
        self.emit(OP_PUSH, idx);
    }

    fn add_native_import(&mut self, name: &str) -> u32 {
        if let Some(i) = self.image.native_imports.iter().position(|n| n == name) {
            return i as u32;
        }
        self.image.native_imports.push(name.to_string());
        self.image.native_imports.len() as u32 - 1
    }

    // ── Scopes and variables ───────────────────────

    fn begin_scope(&mut self) {
        let next = self.contexts.last().map(|c| c.next_local).unwrap_or(0);
        self.contexts
            .push(FunctionContext { vars: HashMap::new(), next_local: next });
    }

    fn end_scope(&mut self) {
        let done = self.contexts.pop().expect("scope stack underflow");
        if let Some(parent) = self.contexts.last_mut() {
            parent.next_local = done.next_local;
        }
    }

    fn declare_local(&mut self, name: &str, mutable: bool) -> u32 {
        let ctx = self.contexts.last_mut().expect("no function context");
        let slot = ctx.next_local;
        ctx.next_local += 1;
        ctx.vars.insert(name.to_string(), LocalVar { slot, mutable });
        slot
    }

    fn resolve_local(&self, name: &str) -> Option<(u32, bool)> {
        for ctx in self.contexts.iter().rev() {
            if let Some(var) = ctx.vars.get(name) {
                return Some((var.slot, var.mutable));
            }
        }
        None
    }

    fn resolve_global(&self, name: &str) -> Option<u32> {
        self.globals.get(name).copied()
    }

    // ── Functions ──────────────────────────────────

    pub fn compile_function(
        &mut self,
        func: &FunctionStmt,
        module: Option<&str>,
    ) -> Result<(), String> {
        let address = self.here();

        let function_name = match module {
            Some(m) if func.name != "Main" => format!("{}_{}", m, func.name),
            _ => func.name.clone(),
        };

        // Later registrations override earlier ones under the bare name, so
        // main-file definitions shadow include-file ones.
        self.function_addrs.insert(function_name.clone(), address);
        if func.name != "Main" {
            self.function_addrs.insert(func.name.clone(), address);
        }

        if func.params.len() > u8::MAX as usize {
            return Err(format!("Too many parameters in function {}", func.name));
        }
        let locals = func.params.len() as u32 + count_locals(&func.body);
        if locals > u8::MAX as u32 {
            return Err(format!("Too many locals in function {}", func.name));
        }

        self.begin_scope();
        for (_, pname) in &func.params {
            self.declare_local(pname, true);
        }

        let result: Result<(), String> = func
            .body
            .iter()
            .try_for_each(|stmt| self.compile_stmt(stmt));

        if result.is_ok() {
            let needs_ret = self.here() == address
                || !matches!(
                    self.image.code.last().map(|i| i.opcode),
                    Some(OP_RET) | Some(OP_HALT)
                );
            if needs_ret {
                self.emit_push_nil();
                self.emit0(OP_RET);
            }
        }

        self.end_scope();
        result?;

        self.image.functions.push(FunctionInfo {
            name: function_name,
            address,
            arity: func.params.len() as u8,
            locals: locals as u8,
        });
        Ok(())
    }

    // ── Statements ─────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), String> {
        match stmt {
            Stmt::VarDecl { mutable, ty, name, init } => {
                match init {
                    Some(expr) => self.compile_expr(expr)?,
                    None => match ty {
                        TypeName::Int | TypeName::Byte => self.emit_push_int(0),
                        TypeName::Float => self.emit_push_float(0.0),
                        TypeName::Bool => self.emit_push_bool(false),
                        TypeName::Str => self.emit_push_string(""),
                    },
                }
                let slot = self.declare_local(name, *mutable);
                self.emit(OP_STORE, slot);
                Ok(())
            }

            Stmt::Assign { name, value } => {
                self.compile_expr(value)?;
                if let Some((slot, mutable)) = self.resolve_local(name) {
                    if !mutable {
                        return Err(format!("Cannot assign to immutable variable '{}'", name));
                    }
                    self.emit(OP_STORE, slot);
                } else if let Some(idx) = self.resolve_global(name) {
                    self.emit(OP_STORE_GLOBAL, idx);
                } else {
                    return Err(format!("Undefined variable: {}", name));
                }
                Ok(())
            }

            Stmt::IndexAssign { name, index, value } => {
                self.compile_variable(name)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit0(OP_STORE_INDEX);
                self.emit0(OP_POP);
                Ok(())
            }

            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                // PRINT/PRINTLN consume their operand themselves.
                if !is_console_print(expr) {
                    self.emit0(OP_POP);
                }
                Ok(())
            }

            Stmt::Block(statements) => {
                self.begin_scope();
                let result = statements.iter().try_for_each(|s| self.compile_stmt(s));
                self.end_scope();
                result
            }

            Stmt::If { condition, then_branch, else_branch } => {
                self.compile_expr(condition)?;
                let then_jump = self.emit_jump(OP_JMP_IFNOT);
                self.compile_stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let else_jump = self.emit_jump(OP_JMP);
                    self.patch_jump(then_jump);
                    self.compile_stmt(else_branch)?;
                    self.patch_jump(else_jump);
                } else {
                    self.patch_jump(then_jump);
                }
                Ok(())
            }

            Stmt::While { condition, body } => self.compile_while(condition, body),

            Stmt::For { init, condition, increment, body } => {
                self.compile_for(init.as_deref(), condition.as_ref(), increment.as_deref(), body)
            }

            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_push_nil(),
                }
                self.emit0(OP_RET);
                Ok(())
            }

            Stmt::Break => {
                if self.loops.is_empty() {
                    return Err("Break outside loop".to_string());
                }
                let jump = self.emit_jump(OP_JMP);
                self.loops.last_mut().expect("loop").break_patches.push(jump);
                Ok(())
            }

            Stmt::Continue => {
                if self.loops.is_empty() {
                    return Err("Continue outside loop".to_string());
                }
                let jump = self.emit_jump(OP_JMP);
                self.loops
                    .last_mut()
                    .expect("loop")
                    .continue_patches
                    .push(jump);
                Ok(())
            }

            Stmt::Function(func) => {
                Err(format!("Nested function definitions are not supported: {}", func.name))
            }

            Stmt::ArrayDecl { elem_ty, name, size, init } => {
                let kind = array_kind(*elem_ty)?;
                if let Some(size) = size {
                    self.compile_expr(size)?;
                    let idx = self.add_constant_array(kind, 0);
                    self.emit(OP_NEW_ARRAY, idx);
                } else if let Some(init) = init {
                    match init {
                        Expr::Array(elements) => self.compile_array_literal(elements, Some(kind))?,
                        other => self.compile_expr(other)?,
                    }
                } else {
                    self.emit_push_int(0);
                    let idx = self.add_constant_array(kind, 0);
                    self.emit(OP_NEW_ARRAY, idx);
                }
                let slot = self.declare_local(name, true);
                self.emit(OP_STORE, slot);
                Ok(())
            }
        }
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt) -> Result<(), String> {
        let loop_start = self.here();
        self.compile_expr(condition)?;
        let exit = self.emit_jump(OP_JMP_IFNOT);

        self.loops.push(LoopContext::default());
        let result = self.compile_stmt(body);
        let loop_ctx = self.loops.pop().expect("loop context");
        result?;

        let continue_target = self.here();
        self.patch_jumps(&loop_ctx.continue_patches, continue_target);
        self.emit(OP_JMP, loop_start);
        self.patch_jump(exit);
        let after = self.here();
        self.patch_jumps(&loop_ctx.break_patches, after);
        Ok(())
    }

    fn compile_for(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        increment: Option<&Stmt>,
        body: &Stmt,
    ) -> Result<(), String> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }

        let loop_start = self.here();
        self.loops.push(LoopContext::default());

        let mut result = Ok(());
        if let Some(condition) = condition {
            result = self.compile_expr(condition);
            if result.is_ok() {
                // the condition's exit jump is just another break
                let exit = self.emit_jump(OP_JMP_IFNOT);
                self.loops.last_mut().expect("loop").break_patches.push(exit);
            }
        }
        if result.is_ok() {
            result = self.compile_stmt(body);
        }
        let loop_ctx = self.loops.pop().expect("loop context");
        result?;

        let continue_target = self.here();
        self.patch_jumps(&loop_ctx.continue_patches, continue_target);

        if let Some(increment) = increment {
            match increment {
                Stmt::Expr(expr) => {
                    self.compile_expr(expr)?;
                    if !is_console_print(expr) {
                        self.emit0(OP_POP);
                    }
                }
                other => self.compile_stmt(other)?,
            }
        }

        self.emit(OP_JMP, loop_start);
        let after = self.here();
        self.patch_jumps(&loop_ctx.break_patches, after);
        Ok(())
    }

    // ── Expressions ────────────────────────────────

    fn compile_expr(&mut self, expr: &Expr) -> Result<(), String> {
        match expr {
            Expr::Literal(lit) => {
                match lit {
                    Literal::Nil => self.emit_push_nil(),
                    Literal::Int(v) => self.emit_push_int(*v),
                    Literal::Float(v) => self.emit_push_float(*v),
                    Literal::Bool(v) => self.emit_push_bool(*v),
                    Literal::Str(v) => self.emit_push_string(v),
                }
                Ok(())
            }

            Expr::Variable(name) => self.compile_variable(name),

            Expr::Binary { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op {
                    BinaryOp::Add => OP_ADD,
                    BinaryOp::Sub => OP_SUB,
                    BinaryOp::Mul => OP_MUL,
                    BinaryOp::Div => OP_DIV,
                    BinaryOp::Mod => OP_MOD,
                };
                self.emit0(opcode);
                Ok(())
            }

            Expr::Compare { left, op, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let opcode = match op {
                    CompareOp::Eq => OP_EQ,
                    CompareOp::Ne => OP_NEQ,
                    CompareOp::Lt => OP_LT,
                    CompareOp::Le => OP_LTE,
                    CompareOp::Gt => OP_GT,
                    CompareOp::Ge => OP_GTE,
                };
                self.emit0(opcode);
                Ok(())
            }

            Expr::Logical { left, op, right } => match op {
                LogicalOp::Not => {
                    self.compile_expr(right)?;
                    self.emit0(OP_NOT);
                    Ok(())
                }
                LogicalOp::Neg => {
                    self.compile_expr(right)?;
                    self.emit0(OP_NEG);
                    Ok(())
                }
                LogicalOp::And | LogicalOp::Or => {
                    let left = left
                        .as_ref()
                        .ok_or_else(|| "Malformed logical expression".to_string())?;
                    self.compile_expr(left)?;
                    // duplicate before the consuming test so the short-circuit
                    // path still leaves the operand on the stack
                    self.emit0(OP_DUP);
                    let jump_op = if *op == LogicalOp::And { OP_JMP_IFNOT } else { OP_JMP_IF };
                    let end = self.emit_jump(jump_op);
                    self.emit0(OP_POP);
                    self.compile_expr(right)?;
                    self.patch_jump(end);
                    Ok(())
                }
            },

            Expr::Call { class_name, method_name, args, is_native } => {
                self.compile_call(class_name, method_name, args, *is_native)
            }

            Expr::Get { name, .. } => {
                Err(format!("Property '{}' access is only valid as a call receiver", name))
            }

            Expr::Array(elements) => self.compile_array_literal(elements, None),

            Expr::Index { array, index } => {
                self.compile_expr(array)?;
                self.compile_expr(index)?;
                self.emit0(OP_LOAD_INDEX);
                Ok(())
            }
        }
    }

    fn compile_variable(&mut self, name: &str) -> Result<(), String> {
        if let Some((slot, _)) = self.resolve_local(name) {
            self.emit(OP_LOAD, slot);
        } else if let Some(idx) = self.resolve_global(name) {
            self.emit(OP_LOAD_GLOBAL, idx);
        } else {
            return Err(format!("Undefined variable: {}", name));
        }
        Ok(())
    }

    fn compile_call(
        &mut self,
        class_name: &str,
        method_name: &str,
        args: &[Expr],
        is_native: bool,
    ) -> Result<(), String> {
        for arg in args {
            self.compile_expr(arg)?;
        }

        if is_native {
            let full_name = format!("{}.{}", class_name, method_name);
            match full_name.as_str() {
                "Console.println" => self.emit0(OP_PRINTLN),
                "Console.print" => self.emit0(OP_PRINT),
                "Console.read" => self.emit0(OP_READ),
                "Array.length" => self.emit0(OP_ARRAY_LEN),
                _ => {
                    let idx = self.add_native_import(&full_name);
                    self.emit(OP_CALL_NATIVE, idx);
                }
            }
            return Ok(());
        }

        let lookup_name = if class_name.is_empty() {
            method_name.to_string()
        } else {
            format!("{}_{}", class_name, method_name)
        };

        let address = self
            .function_addrs
            .get(&lookup_name)
            .or_else(|| self.function_addrs.get(method_name))
            .copied()
            .or_else(|| {
                // module stems are lowercased file names, calls often are not
                let folded = lookup_name.to_lowercase();
                self.function_addrs
                    .iter()
                    .find(|(name, _)| name.to_lowercase() == folded)
                    .map(|(_, addr)| *addr)
            });

        match address {
            Some(addr) => {
                self.emit(OP_CALL, addr);
                Ok(())
            }
            None => Err(format!("Function {}.{} not found", class_name, method_name)),
        }
    }

    fn compile_array_literal(
        &mut self,
        elements: &[Expr],
        expected: Option<ArrayKind>,
    ) -> Result<(), String> {
        if elements.is_empty() && expected.is_none() {
            return Err("Empty array needs type specification".to_string());
        }

        let kind = match expected.or_else(|| infer_element_kind(elements)) {
            Some(kind) => kind,
            None => return Err("Cannot infer array literal element type".to_string()),
        };

        for element in elements {
            self.compile_expr(element)?;
        }
        self.emit_push_int(elements.len() as i64);
        let idx = self.add_constant_array(kind, 1);
        self.emit(OP_NEW_ARRAY, idx);
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArrayKind {
    Int,
    Float,
    Str,
}

fn array_kind(ty: TypeName) -> Result<ArrayKind, String> {
    match ty {
        TypeName::Int | TypeName::Byte => Ok(ArrayKind::Int),
        TypeName::Float => Ok(ArrayKind::Float),
        TypeName::Str => Ok(ArrayKind::Str),
        TypeName::Bool => Err("Unsupported array type: bool".to_string()),
    }
}

fn infer_element_kind(elements: &[Expr]) -> Option<ArrayKind> {
    let mut kind = None;
    for element in elements {
        let this = match element {
            Expr::Literal(Literal::Int(_)) => ArrayKind::Int,
            Expr::Literal(Literal::Float(_)) => ArrayKind::Float,
            Expr::Literal(Literal::Str(_)) => ArrayKind::Str,
            _ => return None,
        };
        match kind {
            None => kind = Some(this),
            Some(k) if k == this => {}
            Some(_) => return None,
        }
    }
    kind
}

fn is_console_print(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Call { is_native: true, class_name, method_name, .. }
            if class_name == "Console" && (method_name == "println" || method_name == "print")
    )
}

/// Pre-pass: number of local slots a function body will declare, not
/// counting parameters. Must visit exactly the statements the real pass
/// allocates slots for.
fn count_locals(statements: &[Stmt]) -> u32 {
    statements.iter().map(count_locals_stmt).sum()
}

fn count_locals_stmt(stmt: &Stmt) -> u32 {
    match stmt {
        Stmt::VarDecl { .. } | Stmt::ArrayDecl { .. } => 1,
        Stmt::Block(inner) => count_locals(inner),
        Stmt::If { then_branch, else_branch, .. } => {
            count_locals_stmt(then_branch)
                + else_branch.as_deref().map(count_locals_stmt).unwrap_or(0)
        }
        Stmt::While { body, .. } => count_locals_stmt(body),
        Stmt::For { init, body, .. } => {
            let init_count = match init.as_deref() {
                Some(Stmt::VarDecl { .. }) | Some(Stmt::ArrayDecl { .. }) => 1,
                _ => 0,
            };
            init_count + count_locals_stmt(body)
        }
        _ => 0,
    }
}
