//! The host bridge: fully qualified names mapped to callbacks that operate
//! directly on the VM's operand stack. Every callback pops its arguments and
//! pushes exactly one value (nil when it has nothing to say).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use super::Vm;
use crate::bytecode::Value;

pub type NativeFn = fn(&mut Vm) -> Result<(), String>;

pub fn default_natives() -> HashMap<String, NativeFn> {
    let mut map: HashMap<String, NativeFn> = HashMap::new();

    // Console
    map.insert("Console.println".into(), console_println);
    map.insert("Console.print".into(), console_print);
    map.insert("Console.read".into(), console_read);

    // System
    map.insert("System.command".into(), system_command);
    map.insert("System.clear".into(), system_clear);
    map.insert("System.pause".into(), system_pause);
    map.insert("System.platform".into(), system_platform);
    map.insert("System.env".into(), system_env);

    // IO
    map.insert("IO.input".into(), io_input);
    map.insert("IO.toInt".into(), io_to_int);
    map.insert("IO.toFloat".into(), io_to_float);

    // Math
    map.insert("Math.sqrt".into(), math_sqrt);
    map.insert("Math.abs".into(), math_abs);
    map.insert("Math.min".into(), math_min);
    map.insert("Math.max".into(), math_max);

    // String
    map.insert("String.length".into(), string_length);

    // File
    map.insert("File.read".into(), file_read);
    map.insert("File.write".into(), file_write);
    map.insert("File.append".into(), file_append);
    map.insert("File.exists".into(), file_exists);

    map
}

// ── Console ─────────────────────────────────────

fn console_println(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let text = vm.render(value);
    vm.write_line(&text);
    vm.push(Value::Nil);
    Ok(())
}

fn console_print(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let text = vm.render(value);
    vm.write_str(&text);
    vm.push(Value::Nil);
    Ok(())
}

fn console_read(vm: &mut Vm) -> Result<(), String> {
    let line = vm.read_line()?;
    let value = vm.intern_string(line);
    vm.push(value);
    Ok(())
}

// ── System ──────────────────────────────────────

fn shell(command: &str) -> i64 {
    let status = if cfg!(windows) {
        Command::new("cmd").arg("/C").arg(command).status()
    } else {
        Command::new("sh").arg("-c").arg(command).status()
    };
    status.ok().and_then(|s| s.code()).unwrap_or(-1) as i64
}

fn system_command(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let command = vm.render(value);
    vm.push(Value::Int(shell(&command)));
    Ok(())
}

fn system_clear(vm: &mut Vm) -> Result<(), String> {
    shell(if cfg!(windows) { "cls" } else { "clear" });
    vm.push(Value::Nil);
    Ok(())
}

fn system_pause(vm: &mut Vm) -> Result<(), String> {
    let message = vm.pop()?;
    if message == Value::Nil {
        vm.write_str("Press Enter to continue...");
    } else {
        let text = vm.render(message);
        vm.write_str(&text);
    }
    vm.read_line()?;
    vm.push(Value::Nil);
    Ok(())
}

fn system_platform(vm: &mut Vm) -> Result<(), String> {
    let platform = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else {
        "unknown"
    };
    let value = vm.intern_string(platform.to_string());
    vm.push(value);
    Ok(())
}

fn system_env(vm: &mut Vm) -> Result<(), String> {
    let name = vm.pop()?;
    let name = vm.render(name);
    match std::env::var(&name) {
        Ok(text) => {
            let value = vm.intern_string(text);
            vm.push(value);
        }
        Err(_) => vm.push(Value::Nil),
    }
    Ok(())
}

// ── IO ──────────────────────────────────────────

fn io_input(vm: &mut Vm) -> Result<(), String> {
    let prompt = vm.pop()?;
    if prompt != Value::Nil {
        let text = vm.render(prompt);
        vm.write_str(&text);
    }
    let line = vm.read_line()?;
    let value = vm.intern_string(line);
    vm.push(value);
    Ok(())
}

fn io_to_int(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let text = vm.render(value);
    match text.trim().parse::<i64>() {
        Ok(v) => {
            vm.push(Value::Int(v));
            Ok(())
        }
        Err(_) => Err("Failed to convert string to int".to_string()),
    }
}

fn io_to_float(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let text = vm.render(value);
    match text.trim().parse::<f64>() {
        Ok(v) => {
            vm.push(Value::Float(v));
            Ok(())
        }
        Err(_) => Err("Failed to convert string to float".to_string()),
    }
}

// ── Math ────────────────────────────────────────

fn math_sqrt(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    let n = match value {
        Value::Int(v) => v as f64,
        Value::Float(v) => v,
        _ => return Err("Math.sqrt expects a number".to_string()),
    };
    vm.push(Value::Float(n.sqrt()));
    Ok(())
}

fn math_abs(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    match value {
        Value::Int(v) => vm.push(Value::Int(v.abs())),
        Value::Float(v) => vm.push(Value::Float(v.abs())),
        _ => return Err("Math.abs expects a number".to_string()),
    }
    Ok(())
}

fn math_min(vm: &mut Vm) -> Result<(), String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => vm.push(Value::Int(x.min(y))),
        (Value::Float(x), Value::Float(y)) => vm.push(Value::Float(x.min(y))),
        _ => return Err("Invalid types for Math.min".to_string()),
    }
    Ok(())
}

fn math_max(vm: &mut Vm) -> Result<(), String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => vm.push(Value::Int(x.max(y))),
        (Value::Float(x), Value::Float(y)) => vm.push(Value::Float(x.max(y))),
        _ => return Err("Invalid types for Math.max".to_string()),
    }
    Ok(())
}

// ── String ──────────────────────────────────────

fn string_length(vm: &mut Vm) -> Result<(), String> {
    let value = vm.pop()?;
    match value {
        Value::Str(idx) => {
            let len = vm.string_at(idx)?.len() as i64;
            vm.push(Value::Int(len));
            Ok(())
        }
        _ => Err("String.length expects a string".to_string()),
    }
}

// ── File ────────────────────────────────────────

fn file_read(vm: &mut Vm) -> Result<(), String> {
    let path = vm.pop()?;
    let path = vm.render(path);
    let text = fs::read_to_string(&path).map_err(|_| format!("Cannot read file '{}'", path))?;
    let value = vm.intern_string(text);
    vm.push(value);
    Ok(())
}

fn file_write(vm: &mut Vm) -> Result<(), String> {
    let content = vm.pop()?;
    let path = vm.pop()?;
    let content = vm.render(content);
    let path = vm.render(path);
    fs::write(&path, content).map_err(|_| format!("Cannot write file '{}'", path))?;
    vm.push(Value::Nil);
    Ok(())
}

fn file_append(vm: &mut Vm) -> Result<(), String> {
    use std::io::Write;

    let content = vm.pop()?;
    let path = vm.pop()?;
    let content = vm.render(content);
    let path = vm.render(path);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|_| format!("Cannot write file '{}'", path))?;
    file.write_all(content.as_bytes())
        .map_err(|_| format!("Cannot write file '{}'", path))?;
    vm.push(Value::Nil);
    Ok(())
}

fn file_exists(vm: &mut Vm) -> Result<(), String> {
    let path = vm.pop()?;
    let path = vm.render(path);
    vm.push(Value::Bool(Path::new(&path).exists()));
    Ok(())
}
