//! The stack virtual machine.
//!
//! State is four vectors: the operand stack, the call stack, a flat locals
//! vector partitioned into per-frame windows by `local_start`, and an
//! auto-extending globals vector. `LOAD`/`STORE` address the current frame's
//! window. Execution runs one instruction per loop iteration until `HALT`, a
//! return from the bootstrap frame, the end of the code stream, or a runtime
//! error.

pub mod natives;

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use crate::bytecode::*;

use self::natives::{default_natives, NativeFn};

/// `return_addr` of the bootstrap frame; returning through it stops the VM.
const RETURN_SENTINEL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    return_addr: u32,
    local_start: usize,
    arg_count: u8,
    func: usize,
}

pub struct Vm {
    image: Image,
    pc: u32,
    running: bool,
    trace: bool,
    stack: Vec<Value>,
    globals: Vec<Value>,
    locals: Vec<Value>,
    call_stack: Vec<CallFrame>,
    /// code address -> index into `image.functions`, built at load time
    addr_index: HashMap<u32, usize>,
    natives: HashMap<String, NativeFn>,
    int_arrays: Vec<Vec<i64>>,
    float_arrays: Vec<Vec<f64>>,
    string_arrays: Vec<Vec<String>>,
    output: Rc<RefCell<dyn Write>>,
}

impl Vm {
    pub fn new(image: Image) -> Self {
        Self::with_output(image, Rc::new(RefCell::new(io::stdout())))
    }

    /// Program output (`PRINT`/`PRINTLN` and the `Console` natives) goes to
    /// `output` instead of stdout. Tests hand in a shared buffer.
    pub fn with_output(image: Image, output: Rc<RefCell<dyn Write>>) -> Self {
        let addr_index = image
            .functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.address, i))
            .collect();
        let int_arrays = image.int_arrays.clone();
        let float_arrays = image.float_arrays.clone();
        let string_arrays = image.string_arrays.clone();
        Self {
            image,
            pc: 0,
            running: false,
            trace: false,
            stack: Vec::new(),
            globals: Vec::new(),
            locals: Vec::new(),
            call_stack: Vec::new(),
            addr_index,
            natives: default_natives(),
            int_arrays,
            float_arrays,
            string_arrays,
            output,
        }
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn run(&mut self) -> Result<(), String> {
        self.stack.clear();
        self.globals.clear();
        self.locals.clear();
        self.call_stack.clear();

        let main_idx = self
            .image
            .functions
            .iter()
            .position(|f| f.name == "Main")
            .ok_or_else(|| "Main function not found".to_string())?;
        let (main_locals, main_address) = {
            let main = &self.image.functions[main_idx];
            (main.locals as usize, main.address)
        };

        self.call_stack.push(CallFrame {
            return_addr: RETURN_SENTINEL,
            local_start: 0,
            arg_count: 0,
            func: main_idx,
        });
        self.locals.resize(main_locals, Value::Nil);
        self.pc = main_address;
        self.running = true;

        while self.running && (self.pc as usize) < self.image.code.len() {
            let instr = self.image.code[self.pc as usize];

            if self.trace {
                self.trace_instruction(&instr);
            }

            self.execute(instr)
                .map_err(|msg| format!("Runtime error at PC={}: {}", self.pc, msg))?;

            match instr.opcode {
                OP_JMP | OP_JMP_IF | OP_JMP_IFNOT | OP_CALL | OP_RET => {}
                _ => self.pc += 1,
            }
        }

        Ok(())
    }

    fn execute(&mut self, instr: Instr) -> Result<(), String> {
        match instr.opcode {
            // ── Stack ──
            OP_PUSH => {
                let value = self.constant(instr.operand)?;
                self.push(value);
            }
            OP_POP => {
                self.pop()?;
            }
            OP_DUP => {
                let top = *self.stack.last().ok_or("Stack underflow")?;
                self.push(top);
            }
            OP_SWAP => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a);
                self.push(b);
            }

            // ── Arithmetic ──
            OP_ADD => {
                let b = self.pop()?;
                let a = self.pop()?;
                let result = match (a, b) {
                    (Value::Int(x), Value::Int(y)) => Value::Int(x + y),
                    (Value::Float(x), Value::Float(y)) => Value::Float(x + y),
                    (Value::Int(x), Value::Float(y)) => Value::Float(x as f64 + y),
                    (Value::Float(x), Value::Int(y)) => Value::Float(x + y as f64),
                    _ if a.type_tag() == TYPE_STRING || b.type_tag() == TYPE_STRING => {
                        let joined = format!("{}{}", self.render(a), self.render(b));
                        self.intern_string(joined)
                    }
                    _ => Value::Nil,
                };
                self.push(result);
            }
            OP_SUB => {
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Int(x), Value::Int(y)) => self.push(Value::Int(x - y)),
                    (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x - y)),
                    _ => return Err("Invalid types for subtraction".to_string()),
                }
            }
            OP_MUL => {
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Int(x), Value::Int(y)) => self.push(Value::Int(x * y)),
                    (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x * y)),
                    _ => return Err("Invalid types for multiplication".to_string()),
                }
            }
            OP_DIV => {
                let b = self.pop()?;
                let a = self.pop()?;
                if matches!(b, Value::Int(0)) || matches!(b, Value::Float(v) if v == 0.0) {
                    return Err("Division by zero".to_string());
                }
                match (a, b) {
                    (Value::Int(x), Value::Int(y)) => self.push(Value::Int(x / y)),
                    (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x / y)),
                    _ => return Err("Invalid types for division".to_string()),
                }
            }
            OP_MOD => {
                let b = self.pop()?;
                let a = self.pop()?;
                match (a, b) {
                    (Value::Int(_), Value::Int(0)) => return Err("Modulo by zero".to_string()),
                    (Value::Int(x), Value::Int(y)) => self.push(Value::Int(x % y)),
                    _ => return Err("Invalid types for modulo".to_string()),
                }
            }
            OP_NEG => {
                let a = self.pop()?;
                match a {
                    Value::Int(v) => self.push(Value::Int(-v)),
                    Value::Float(v) => self.push(Value::Float(-v)),
                    _ => return Err("Invalid type for negation".to_string()),
                }
            }
            OP_INC => match self.stack.last_mut() {
                Some(Value::Int(v)) => *v += 1,
                Some(Value::Float(v)) => *v += 1.0,
                _ => return Err("Invalid type for increment".to_string()),
            },
            OP_DEC => match self.stack.last_mut() {
                Some(Value::Int(v)) => *v -= 1,
                Some(Value::Float(v)) => *v -= 1.0,
                _ => return Err("Invalid type for decrement".to_string()),
            },

            // ── Comparisons ──
            // Equality compares the stringified forms of both operands.
            OP_EQ => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = self.render(a) == self.render(b);
                self.push(Value::Bool(eq));
            }
            OP_NEQ => {
                let b = self.pop()?;
                let a = self.pop()?;
                let eq = self.render(a) == self.render(b);
                self.push(Value::Bool(!eq));
            }
            OP_LT => self.compare(instr.opcode)?,
            OP_LTE => self.compare(instr.opcode)?,
            OP_GT => self.compare(instr.opcode)?,
            OP_GTE => self.compare(instr.opcode)?,

            // ── Logic ──
            OP_AND => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() && b.is_truthy()));
            }
            OP_OR => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.is_truthy() || b.is_truthy()));
            }
            OP_NOT => {
                let a = self.pop()?;
                self.push(Value::Bool(!a.is_truthy()));
            }

            // ── Variables ──
            OP_LOAD => {
                let frame = self.call_stack.last().ok_or("No active call frame")?;
                let pos = frame.local_start + instr.operand as usize;
                let value = *self
                    .locals
                    .get(pos)
                    .ok_or("Local variable index out of bounds")?;
                self.push(value);
            }
            OP_STORE => {
                let value = self.pop()?;
                let frame = self.call_stack.last().ok_or("No active call frame")?;
                let pos = frame.local_start + instr.operand as usize;
                let slot = self
                    .locals
                    .get_mut(pos)
                    .ok_or("Local variable index out of bounds")?;
                *slot = value;
            }
            OP_LOAD_GLOBAL => {
                let idx = instr.operand as usize;
                if idx >= self.globals.len() {
                    self.globals.resize(idx + 1, Value::Nil);
                }
                let value = self.globals[idx];
                self.push(value);
            }
            OP_STORE_GLOBAL => {
                let value = self.pop()?;
                let idx = instr.operand as usize;
                if idx >= self.globals.len() {
                    self.globals.resize(idx + 1, Value::Nil);
                }
                self.globals[idx] = value;
            }

            // ── Control flow ──
            OP_JMP => {
                self.jump(instr.operand)?;
            }
            OP_JMP_IF => {
                let cond = self.pop()?;
                if cond.is_truthy() {
                    self.jump(instr.operand)?;
                } else {
                    self.pc += 1;
                }
            }
            OP_JMP_IFNOT => {
                let cond = self.pop()?;
                if !cond.is_truthy() {
                    self.jump(instr.operand)?;
                } else {
                    self.pc += 1;
                }
            }
            OP_CALL => self.call_function(instr.operand)?,
            OP_RET => self.return_from_function()?,
            OP_CALL_NATIVE => {
                let name = self
                    .image
                    .native_imports
                    .get(instr.operand as usize)
                    .ok_or("Native import index out of bounds")?
                    .clone();
                let native = *self
                    .natives
                    .get(&name)
                    .ok_or_else(|| format!("Native function not implemented: {}", name))?;
                native(self)?;
            }

            // ── Arrays ──
            OP_NEW_ARRAY => self.new_array(instr.operand)?,
            OP_LOAD_INDEX => self.load_index()?,
            OP_STORE_INDEX => self.store_index()?,
            OP_ARRAY_LEN => {
                let array = self.pop()?;
                let len = match array {
                    Value::ArrayInt(id) => self.int_array(id)?.len(),
                    Value::ArrayFloat(id) => self.float_array(id)?.len(),
                    Value::ArrayStr(id) => self.string_array(id)?.len(),
                    _ => return Err("Cannot take length of non-array value".to_string()),
                };
                self.push(Value::Int(len as i64));
            }

            // ── I/O ──
            OP_PRINT => {
                let value = self.pop()?;
                let text = self.render(value);
                self.write_str(&text);
            }
            OP_PRINTLN => {
                let value = self.pop()?;
                let text = self.render(value);
                self.write_line(&text);
            }
            OP_READ => {
                let line = self.read_line()?;
                let value = self.intern_string(line);
                self.push(value);
            }

            OP_HALT => self.running = false,

            other => return Err(format!("Unknown opcode: {}", other)),
        }
        Ok(())
    }

    // ── Dispatch helpers ───────────────────────────

    fn compare(&mut self, opcode: u8) -> Result<(), String> {
        let b = self.pop()?;
        let a = self.pop()?;
        let result = match (a, b) {
            (Value::Int(x), Value::Int(y)) => match opcode {
                OP_LT => x < y,
                OP_LTE => x <= y,
                OP_GT => x > y,
                _ => x >= y,
            },
            (Value::Float(x), Value::Float(y)) => match opcode {
                OP_LT => x < y,
                OP_LTE => x <= y,
                OP_GT => x > y,
                _ => x >= y,
            },
            _ => return Err("Invalid types for comparison".to_string()),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn jump(&mut self, target: u32) -> Result<(), String> {
        // one-past-end is the legal exit sentinel
        if target as usize > self.image.code.len() {
            return Err("Jump address out of bounds".to_string());
        }
        self.pc = target;
        Ok(())
    }

    fn call_function(&mut self, address: u32) -> Result<(), String> {
        let func_idx = *self
            .addr_index
            .get(&address)
            .ok_or_else(|| format!("Function not found at address: {}", address))?;
        let func = &self.image.functions[func_idx];
        let (arity, locals_count, entry, name) =
            (func.arity as usize, func.locals as usize, func.address, func.name.clone());

        if self.stack.len() < arity {
            return Err(format!("Not enough arguments for function {}", name));
        }

        let frame = CallFrame {
            return_addr: self.pc + 1,
            local_start: self.locals.len(),
            arg_count: arity as u8,
            func: func_idx,
        };
        self.locals
            .resize(frame.local_start + locals_count, Value::Nil);
        for i in (0..arity).rev() {
            let value = self.pop()?;
            self.locals[frame.local_start + i] = value;
        }
        self.call_stack.push(frame);
        self.pc = entry;
        Ok(())
    }

    fn return_from_function(&mut self) -> Result<(), String> {
        let value = self.stack.pop().unwrap_or(Value::Nil);
        let frame = self.call_stack.pop().ok_or("Call stack underflow")?;

        if frame.return_addr == RETURN_SENTINEL {
            self.running = false;
            return Ok(());
        }

        self.locals.truncate(frame.local_start);
        self.push(value);
        self.pc = frame.return_addr;
        Ok(())
    }

    // ── Arrays ─────────────────────────────────────

    fn new_array(&mut self, const_idx: u32) -> Result<(), String> {
        let descriptor = self.constant(const_idx)?;
        let (tag, mode) = match descriptor {
            Value::ArrayInt(mode) => (TYPE_ARRAY_INT, mode),
            Value::ArrayFloat(mode) => (TYPE_ARRAY_FLOAT, mode),
            Value::ArrayStr(mode) => (TYPE_ARRAY_STRING, mode),
            _ => return Err("NEW_ARRAY operand must be an array type constant".to_string()),
        };

        match mode {
            // size on the stack, default-filled
            0 => {
                let size = self.pop_int("Array size must be integer")?;
                if size < 0 {
                    return Err("Invalid array size".to_string());
                }
                let size = size as usize;
                let value = match tag {
                    TYPE_ARRAY_INT => {
                        self.int_arrays.push(vec![0; size]);
                        Value::ArrayInt(self.int_arrays.len() as u32 - 1)
                    }
                    TYPE_ARRAY_FLOAT => {
                        self.float_arrays.push(vec![0.0; size]);
                        Value::ArrayFloat(self.float_arrays.len() as u32 - 1)
                    }
                    _ => {
                        self.string_arrays.push(vec![String::new(); size]);
                        Value::ArrayStr(self.string_arrays.len() as u32 - 1)
                    }
                };
                self.push(value);
            }
            // element count on the stack, elements below it
            1 => {
                let count = self.pop_int("Array element count must be integer")?;
                if count < 0 {
                    return Err("Invalid array size".to_string());
                }
                let count = count as usize;
                let value = match tag {
                    TYPE_ARRAY_INT => {
                        let mut elems = vec![0i64; count];
                        for i in (0..count).rev() {
                            match self.pop()? {
                                Value::Int(v) => elems[i] = v,
                                _ => return Err("Array element type mismatch".to_string()),
                            }
                        }
                        self.int_arrays.push(elems);
                        Value::ArrayInt(self.int_arrays.len() as u32 - 1)
                    }
                    TYPE_ARRAY_FLOAT => {
                        let mut elems = vec![0.0f64; count];
                        for i in (0..count).rev() {
                            match self.pop()? {
                                Value::Float(v) => elems[i] = v,
                                _ => return Err("Array element type mismatch".to_string()),
                            }
                        }
                        self.float_arrays.push(elems);
                        Value::ArrayFloat(self.float_arrays.len() as u32 - 1)
                    }
                    _ => {
                        let mut elems = vec![String::new(); count];
                        for i in (0..count).rev() {
                            match self.pop()? {
                                Value::Str(idx) => elems[i] = self.string_at(idx)?.to_string(),
                                _ => return Err("Array element type mismatch".to_string()),
                            }
                        }
                        self.string_arrays.push(elems);
                        Value::ArrayStr(self.string_arrays.len() as u32 - 1)
                    }
                };
                self.push(value);
            }
            _ => return Err("Invalid NEW_ARRAY mode".to_string()),
        }
        Ok(())
    }

    fn load_index(&mut self) -> Result<(), String> {
        let index = self.pop_int("Array index must be integer")?;
        let array = self.pop()?;
        let value = match array {
            Value::ArrayInt(id) => Value::Int(*element(self.int_array(id)?, index)?),
            Value::ArrayFloat(id) => Value::Float(*element(self.float_array(id)?, index)?),
            Value::ArrayStr(id) => {
                let text = element(self.string_array(id)?, index)?.clone();
                self.intern_string(text)
            }
            _ => return Err("Cannot index non-array value".to_string()),
        };
        self.push(value);
        Ok(())
    }

    fn store_index(&mut self) -> Result<(), String> {
        let value = self.pop()?;
        let index = self.pop_int("Array index must be integer")?;
        let array = self.pop()?;
        match (array, value) {
            (Value::ArrayInt(id), Value::Int(v)) => {
                *element_mut(self.int_array_mut(id)?, index)? = v;
            }
            (Value::ArrayFloat(id), Value::Float(v)) => {
                *element_mut(self.float_array_mut(id)?, index)? = v;
            }
            (Value::ArrayStr(id), Value::Str(si)) => {
                let text = self.string_at(si)?.to_string();
                *element_mut(self.string_array_mut(id)?, index)? = text;
            }
            (Value::ArrayInt(_) | Value::ArrayFloat(_) | Value::ArrayStr(_), _) => {
                return Err("Array element type mismatch".to_string());
            }
            _ => return Err("Cannot index non-array value".to_string()),
        }
        self.push(value);
        Ok(())
    }

    fn int_array(&self, id: u32) -> Result<&Vec<i64>, String> {
        self.int_arrays
            .get(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    fn float_array(&self, id: u32) -> Result<&Vec<f64>, String> {
        self.float_arrays
            .get(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    fn string_array(&self, id: u32) -> Result<&Vec<String>, String> {
        self.string_arrays
            .get(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    fn int_array_mut(&mut self, id: u32) -> Result<&mut Vec<i64>, String> {
        self.int_arrays
            .get_mut(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    fn float_array_mut(&mut self, id: u32) -> Result<&mut Vec<f64>, String> {
        self.float_arrays
            .get_mut(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    fn string_array_mut(&mut self, id: u32) -> Result<&mut Vec<String>, String> {
        self.string_arrays
            .get_mut(id as usize)
            .ok_or_else(|| "Invalid array reference".to_string())
    }

    // ── Values and I/O plumbing ────────────────────

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Result<Value, String> {
        self.stack.pop().ok_or_else(|| "Stack underflow".to_string())
    }

    fn pop_int(&mut self, message: &str) -> Result<i64, String> {
        match self.pop()? {
            Value::Int(v) => Ok(v),
            _ => Err(message.to_string()),
        }
    }

    fn constant(&self, idx: u32) -> Result<Value, String> {
        self.image
            .constants
            .get(idx as usize)
            .copied()
            .ok_or_else(|| "Constant index out of bounds".to_string())
    }

    pub(crate) fn string_at(&self, idx: u32) -> Result<&str, String> {
        self.image
            .strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| "String index out of bounds".to_string())
    }

    /// New strings append to the image's string table; the table only grows.
    pub(crate) fn intern_string(&mut self, text: String) -> Value {
        self.image.strings.push(text);
        Value::Str(self.image.strings.len() as u32 - 1)
    }

    /// Full rendering, including array elements.
    pub(crate) fn render(&self, value: Value) -> String {
        match value {
            Value::ArrayInt(id) => match self.int_arrays.get(id as usize) {
                Some(arr) => render_elements(arr.iter().map(|v| v.to_string())),
                None => value.display(&self.image.strings),
            },
            Value::ArrayFloat(id) => match self.float_arrays.get(id as usize) {
                Some(arr) => render_elements(arr.iter().map(|v| v.to_string())),
                None => value.display(&self.image.strings),
            },
            Value::ArrayStr(id) => match self.string_arrays.get(id as usize) {
                Some(arr) => render_elements(arr.iter().cloned()),
                None => value.display(&self.image.strings),
            },
            _ => value.display(&self.image.strings),
        }
    }

    pub(crate) fn write_str(&self, text: &str) {
        let mut out = self.output.borrow_mut();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    pub(crate) fn write_line(&self, text: &str) {
        let mut out = self.output.borrow_mut();
        let _ = out.write_all(text.as_bytes());
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    }

    pub(crate) fn read_line(&self) -> Result<String, String> {
        let mut line = String::new();
        io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| format!("Failed to read input: {}", e))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    // ── Diagnostics ────────────────────────────────

    fn trace_instruction(&self, instr: &Instr) {
        println!("PC={:4}: {}", self.pc, mnemonic(instr));
        let rendered: Vec<String> = self.stack.iter().map(|&v| self.render(v)).collect();
        println!("  Stack [{}]: {}", self.stack.len(), rendered.join(" "));
    }

    /// State dump printed to stderr when a runtime error unwinds the loop.
    pub fn dump_state(&self) {
        eprintln!("=== VM State Dump ===");
        eprintln!("PC: {}", self.pc);
        eprintln!("Running: {}", if self.running { "yes" } else { "no" });
        eprintln!("Call stack depth: {}", self.call_stack.len());
        for frame in self.call_stack.iter().rev() {
            let name = self
                .image
                .functions
                .get(frame.func)
                .map(|f| f.name.as_str())
                .unwrap_or("?");
            eprintln!(
                "  {} (args={}, locals at {})",
                name, frame.arg_count, frame.local_start
            );
        }
        eprintln!("Locals: {}", self.locals.len());
        eprintln!("Globals: {}", self.globals.len());
        eprintln!("Stack ({} items):", self.stack.len());
        for (i, &value) in self.stack.iter().enumerate().rev() {
            eprintln!("  [{}] {}", i, self.render(value));
        }
    }
}

fn element<T>(arr: &[T], index: i64) -> Result<&T, String> {
    if index < 0 {
        return Err("Array index out of bounds".to_string());
    }
    arr.get(index as usize)
        .ok_or_else(|| "Array index out of bounds".to_string())
}

fn element_mut<T>(arr: &mut [T], index: i64) -> Result<&mut T, String> {
    if index < 0 {
        return Err("Array index out of bounds".to_string());
    }
    arr.get_mut(index as usize)
        .ok_or_else(|| "Array index out of bounds".to_string())
}

fn render_elements(items: impl Iterator<Item = String>) -> String {
    let parts: Vec<String> = items.collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::Vm;
    use crate::bytecode::*;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn compile(source: &str) -> Image {
        let tokens = Lexer::new(source).tokenize();
        let mut parser = Parser::new(tokens);
        let ast = parser.parse();
        assert!(parser.errors().is_empty(), "parse errors: {:?}", parser.errors());
        Compiler::compile(&ast).expect("compile")
    }

    fn run_capture(image: Image) -> Result<String, String> {
        let buffer = Rc::new(RefCell::new(Vec::<u8>::new()));
        let sink: Rc<RefCell<dyn std::io::Write>> = buffer.clone();
        let mut vm = Vm::with_output(image, sink);
        let result = vm.run();
        let output = String::from_utf8(buffer.borrow().clone()).expect("utf8 output");
        result.map(|_| output)
    }

    fn run_source(source: &str) -> Result<String, String> {
        run_capture(compile(source))
    }

    #[test]
    fn arithmetic_prints_five() {
        let out = run_source("fn Main(){ int x = 2+3; Console.println(x); }").unwrap();
        assert_eq!(out, "5\n");
    }

    #[test]
    fn while_loop_prints_digits() {
        let out =
            run_source("fn Main(){ int i = 0; while(i<3){ Console.print(i); i = i+1; } }").unwrap();
        assert_eq!(out, "012");
    }

    #[test]
    fn division_by_zero_reports_pc() {
        let err = run_source("fn Main(){ int x = 1/0; }").unwrap_err();
        assert!(err.contains("Division by zero"), "got: {}", err);
        assert!(err.contains("Runtime error at PC="), "got: {}", err);
    }

    #[test]
    fn modulo_by_zero_fails() {
        let err = run_source("fn Main(){ int x = 1%0; }").unwrap_err();
        assert!(err.contains("Modulo by zero"));
    }

    #[test]
    fn mixed_add_promotes_to_float() {
        let out = run_source("fn Main(){ Console.println(1 + 0.5); }").unwrap();
        assert_eq!(out, "1.5\n");
    }

    #[test]
    fn mixed_sub_is_a_type_error() {
        let err = run_source("fn Main(){ Console.println(1 - 0.5); }").unwrap_err();
        assert!(err.contains("Invalid types for subtraction"));
    }

    #[test]
    fn string_concat_appends_to_the_string_table() {
        let image = compile(r#"fn Main(){ Console.println("a" + 1); Console.println(2 + "b"); }"#);
        let before = image.strings.len();
        let buffer = Rc::new(RefCell::new(Vec::<u8>::new()));
        let sink: Rc<RefCell<dyn std::io::Write>> = buffer.clone();
        let mut vm = Vm::with_output(image, sink);
        vm.run().unwrap();
        assert_eq!(String::from_utf8(buffer.borrow().clone()).unwrap(), "a1\n2b\n");
        assert_eq!(vm.image().strings.len(), before + 2);
    }

    // Equality goes through stringification on purpose: 1 == "1" holds.
    #[test]
    fn equality_is_stringly() {
        let out = run_source(r#"fn Main(){ Console.println(1 == "1"); Console.println(1 != 2); }"#)
            .unwrap();
        assert_eq!(out, "true\ntrue\n");
    }

    #[test]
    fn short_circuit_skips_the_right_operand_and_keeps_a_value() {
        let out = run_source(
            "fn boom() { return 1/0; }
             fn Main() {
               bool b = false and boom();
               Console.println(b);
               bool c = true or boom();
               Console.println(c);
             }",
        )
        .unwrap();
        assert_eq!(out, "false\ntrue\n");
    }

    #[test]
    fn logical_operators_evaluate_both_sides_when_needed() {
        let out = run_source(
            "fn Main(){ Console.println(true and false); Console.println(false or true);
               Console.println(!true); Console.println(not false); }",
        )
        .unwrap();
        assert_eq!(out, "false\ntrue\nfalse\ntrue\n");
    }

    #[test]
    fn unary_minus_negates() {
        let out = run_source("fn Main(){ Console.println(-3); Console.println(-(2.5)); }").unwrap();
        assert_eq!(out, "-3\n-2.5\n");
    }

    #[test]
    fn recursion_uses_fresh_local_windows() {
        let out = run_source(
            "fn fact(int n) { if (n <= 1) { return 1; } return n * fact(n - 1); }
             fn Main() { Console.println(fact(10)); }",
        )
        .unwrap();
        assert_eq!(out, "3628800\n");
    }

    #[test]
    fn call_pushes_exactly_one_return_value() {
        let out = run_source(
            "fn two() { return 2; }
             fn Main() { Console.println(two() + two() + two()); }",
        )
        .unwrap();
        assert_eq!(out, "6\n");
    }

    #[test]
    fn implicit_return_yields_nil() {
        let out = run_source(
            "fn nothing() { }
             fn Main() { Console.println(nothing()); }",
        )
        .unwrap();
        assert_eq!(out, "nil\n");
    }

    #[test]
    fn if_else_branches() {
        let out = run_source(
            r#"fn pick(int n) {
                 if (n < 0) { return "neg"; } else if (n == 0) { return "zero"; }
                 return "pos";
               }
               fn Main() { Console.print(pick(-1)); Console.print(pick(0)); Console.println(pick(5)); }"#,
        )
        .unwrap();
        assert_eq!(out, "negzeropos\n");
    }

    #[test]
    fn for_loop_with_break_and_continue() {
        let out = run_source(
            "fn Main(){ for (int i = 0; i < 10; i = i + 1) {
                 if (i == 2) { continue; }
                 if (i == 5) { break; }
                 Console.print(i);
               } }",
        )
        .unwrap();
        assert_eq!(out, "0134");
    }

    #[test]
    fn loop_body_declaration_keeps_its_slot_after_the_loop() {
        let out = run_source(
            "fn Main(){
               int last = 0;
               for (int i = 0; i < 3; i = i + 1) { int x = i * 10; last = x; }
               Console.println(last);
             }",
        )
        .unwrap();
        assert_eq!(out, "20\n");
    }

    #[test]
    fn arrays_roundtrip_store_load_and_len() {
        let out = run_source(
            r#"fn Main() {
                 int a[] = [1,2,3];
                 a[1] = 5;
                 Console.print(a[0]);
                 Console.print(a[1]);
                 Console.println(Array.length(a));
                 str s[2];
                 s[0] = "x";
                 Console.println(s[0] + s[1]);
                 float f[3];
                 f[2] = 0.5;
                 Console.println(f[2]);
               }"#,
        )
        .unwrap();
        assert_eq!(out, "153\nx\n0.5\n");
    }

    #[test]
    fn array_out_of_bounds_fails() {
        let err = run_source("fn Main(){ int a[2]; Console.println(a[2]); }").unwrap_err();
        assert!(err.contains("Array index out of bounds"));
    }

    #[test]
    fn array_element_type_mismatch_fails() {
        let err = run_source(r#"fn Main(){ int a[2]; a[0] = "nope"; }"#).unwrap_err();
        assert!(err.contains("Array element type mismatch"));
    }

    #[test]
    fn arrays_render_with_elements() {
        let out = run_source("fn Main(){ int a[] = [1,2,3]; Console.println(a); }").unwrap();
        assert_eq!(out, "[1, 2, 3]\n");
    }

    #[test]
    fn unknown_native_is_a_runtime_error() {
        let err = run_source("fn Main(){ File.frobnicate(1); }").unwrap_err();
        assert!(err.contains("Native function not implemented: File.frobnicate"));
    }

    #[test]
    fn halt_stops_before_later_instructions() {
        let image = Image {
            code: vec![
                Instr::new(OP_HALT, 0),
                Instr::new(0xAB, 0), // never reached
            ],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).is_ok());
    }

    #[test]
    fn jump_one_past_end_terminates_normally() {
        let image = Image {
            code: vec![Instr::new(OP_JMP, 1)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).is_ok());
    }

    #[test]
    fn jump_beyond_end_is_an_error() {
        let image = Image {
            code: vec![Instr::new(OP_JMP, 7)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).unwrap_err().contains("Jump address out of bounds"));
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let image = Image {
            code: vec![Instr::new(0xAB, 0)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).unwrap_err().contains("Unknown opcode"));
    }

    #[test]
    fn missing_main_fails_at_load() {
        let image = Image {
            code: vec![Instr::new(OP_HALT, 0)],
            functions: vec![FunctionInfo { name: "other".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).unwrap_err().contains("Main function not found"));
    }

    #[test]
    fn stack_underflow_is_an_error() {
        let image = Image {
            code: vec![Instr::new(OP_POP, 0)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image).unwrap_err().contains("Stack underflow"));
    }

    #[test]
    fn globals_auto_extend() {
        let image = Image {
            code: vec![
                Instr::new(OP_PUSH, 0),
                Instr::new(OP_STORE_GLOBAL, 3),
                Instr::new(OP_LOAD_GLOBAL, 3),
                Instr::new(OP_PRINTLN, 0),
                Instr::new(OP_LOAD_GLOBAL, 9),
                Instr::new(OP_PRINTLN, 0),
                Instr::new(OP_HALT, 0),
            ],
            constants: vec![Value::Int(42)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert_eq!(run_capture(image).unwrap(), "42\nnil\n");
    }

    #[test]
    fn call_with_too_few_arguments_fails() {
        // CALL targeting a 1-ary function with an empty stack
        let image = Image {
            code: vec![
                Instr::new(OP_CALL, 3),
                Instr::new(OP_POP, 0),
                Instr::new(OP_HALT, 0),
                Instr::new(OP_PUSH, 0),
                Instr::new(OP_RET, 0),
            ],
            constants: vec![Value::Nil],
            functions: vec![
                FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 },
                FunctionInfo { name: "f".into(), address: 3, arity: 1, locals: 1 },
            ],
            ..Image::new()
        };
        assert!(run_capture(image).unwrap_err().contains("Not enough arguments"));
    }

    #[test]
    fn call_to_unknown_address_fails() {
        let image = Image {
            code: vec![Instr::new(OP_CALL, 99), Instr::new(OP_HALT, 0)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert!(run_capture(image)
            .unwrap_err()
            .contains("Function not found at address: 99"));
    }

    // INC/DEC/SWAP/AND/OR are part of the wire opcode set even though this
    // compiler never emits them.
    #[test]
    fn auxiliary_opcodes_work_on_hand_built_images() {
        let image = Image {
            code: vec![
                Instr::new(OP_PUSH, 0),  // 5
                Instr::new(OP_INC, 0),   // 6
                Instr::new(OP_PUSH, 1),  // 6, 9
                Instr::new(OP_DEC, 0),   // 6, 8
                Instr::new(OP_SWAP, 0),  // 8, 6
                Instr::new(OP_PRINT, 0), // prints 6
                Instr::new(OP_PRINT, 0), // prints 8
                Instr::new(OP_PUSH, 0),
                Instr::new(OP_PUSH, 2),
                Instr::new(OP_AND, 0), // truthy(5) && truthy(0) = false
                Instr::new(OP_PRINTLN, 0),
                Instr::new(OP_PUSH, 0),
                Instr::new(OP_PUSH, 2),
                Instr::new(OP_OR, 0), // truthy(5) || truthy(0) = true
                Instr::new(OP_PRINTLN, 0),
                Instr::new(OP_HALT, 0),
            ],
            constants: vec![Value::Int(5), Value::Int(9), Value::Int(0)],
            functions: vec![FunctionInfo { name: "Main".into(), address: 0, arity: 0, locals: 0 }],
            ..Image::new()
        };
        assert_eq!(run_capture(image).unwrap(), "68false\ntrue\n");
    }

    #[test]
    fn byte_behaves_as_int() {
        let out = run_source("fn Main(){ byte b = 7; b = b + 1; Console.println(b); }").unwrap();
        assert_eq!(out, "8\n");
    }

    #[test]
    fn uninitialized_defaults() {
        let out = run_source(
            r#"fn Main(){ int i; float f; bool b; str s;
               Console.print(i); Console.print(f); Console.print(b); Console.println(s); }"#,
        )
        .unwrap();
        assert_eq!(out, "00false\n");
    }
}
