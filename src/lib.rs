//! # Tail — a small statically-typed imperative language
//!
//! Tail compiles ahead of time to a serialized bytecode image (`.tailc`) and
//! executes it on a stack virtual machine:
//!
//! - `tailc file.tail` lowers source to an [`bytecode::Image`] and writes it
//!   byte-exactly to disk.
//! - `tail file.tailc` re-hydrates the image and runs it.
//!
//! ## Compile and Run
//!
//! ```rust,no_run
//! use tail::run;
//! run("fn Main() { Console.println(\"Hello from Tail!\"); }").unwrap();
//! ```
//!
//! ## Separately
//!
//! ```rust,no_run
//! use tail::{compile, Vm};
//! let image = compile("fn Main() { Console.println(2 + 3); }").unwrap();
//! let mut vm = Vm::new(image);
//! vm.run().unwrap();
//! ```

pub mod bytecode;
pub mod compiler;
pub mod lexer;
pub mod parser;
pub mod vm;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use bytecode::Image;
pub use compiler::{compile_units, Compiler, Unit};
pub use lexer::Lexer;
pub use parser::Parser;
pub use vm::Vm;

/// One file in the ordered compilation list produced by include resolution.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub is_main: bool,
}

/// Discover the full compilation list for a set of main files.
///
/// Main files come first, then their includes in discovery order, each file
/// visited at most once. Discovery is a textual pre-parse scan for
/// `include <name>;` lines; a missing include only warns, the unresolved
/// symbol surfaces later as a compile error.
pub fn resolve_includes(inputs: &[PathBuf]) -> Vec<SourceFile> {
    let mut files = Vec::new();
    let mut loaded = HashSet::new();

    for input in inputs {
        files.push(SourceFile { path: input.clone(), is_main: true });
        if let Some(name) = input.file_name() {
            loaded.insert(name.to_string_lossy().into_owned());
        }
    }

    for input in inputs {
        let current_dir = parent_dir(input);
        if let Ok(source) = fs::read_to_string(input) {
            for name in scan_includes(&source) {
                load_include_recursive(&name, &current_dir, &mut files, &mut loaded);
            }
        }
    }

    files
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn scan_includes(source: &str) -> Vec<String> {
    let mut names = Vec::new();
    for line in source.lines() {
        if let Some(at) = line.find("include ") {
            let rest = &line[at + "include ".len()..];
            if let Some(end) = rest.find(';') {
                let name: String = rest[..end].chars().filter(|c| !c.is_whitespace()).collect();
                if !name.is_empty() {
                    names.push(name);
                }
            }
        }
    }
    names
}

fn find_include_file(name: &str, current_dir: &Path) -> Option<PathBuf> {
    let candidates = [
        PathBuf::from(format!("{}.tail", name)),
        current_dir.join(format!("{}.tail", name)),
        PathBuf::from(format!("../include/{}.tail", name)),
        PathBuf::from(format!("include/{}.tail", name)),
        PathBuf::from(format!("./include/{}.tail", name)),
    ];
    candidates.into_iter().find(|p| p.exists())
}

fn load_include_recursive(
    name: &str,
    current_dir: &Path,
    files: &mut Vec<SourceFile>,
    loaded: &mut HashSet<String>,
) {
    if loaded.contains(name) {
        return;
    }
    loaded.insert(name.to_string());

    let Some(path) = find_include_file(name, current_dir) else {
        eprintln!("Warning: Could not find include: {}", name);
        return;
    };

    files.push(SourceFile { path: path.clone(), is_main: false });

    if let Ok(source) = fs::read_to_string(&path) {
        let next_dir = parent_dir(&path);
        for sub in scan_includes(&source) {
            load_include_recursive(&sub, &next_dir, files, loaded);
        }
    }
}

fn parse_source(source: &str, origin: &str) -> Result<Vec<parser::ast::Stmt>, String> {
    let mut lexer = Lexer::new(source);
    let tokens = lexer.tokenize();
    if !lexer.errors().is_empty() {
        return Err(format!(
            "Lexer errors in {}:\n{}",
            origin,
            lexer.errors().join("\n")
        ));
    }

    let mut parser = Parser::new(tokens);
    let ast = parser.parse();
    if !parser.errors().is_empty() {
        return Err(format!(
            "Parser errors in {}:\n{}",
            origin,
            parser.errors().join("\n")
        ));
    }

    Ok(ast)
}

/// Parse every file of a resolved compilation list and compile the whole
/// program into one image.
pub fn compile_files(files: &[SourceFile]) -> Result<Image, String> {
    let mut units = Vec::new();
    for file in files {
        let source = fs::read_to_string(&file.path)
            .map_err(|e| format!("Cannot open file '{}': {}", file.path.display(), e))?;
        let ast = parse_source(&source, &file.path.display().to_string())?;
        let module = file
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "main".to_string());
        units.push(Unit { module, is_main: file.is_main, ast });
    }
    compile_units(&units)
}

/// Compile a single source string into an image.
pub fn compile(source: &str) -> Result<Image, String> {
    let ast = parse_source(source, "<source>")?;
    Compiler::compile(&ast)
}

/// Compile and run in one step.
pub fn run(source: &str) -> Result<(), String> {
    let image = compile(source)?;
    let mut machine = Vm::new(image);
    machine.run()
}

/// Compile and run a file, resolving its includes.
pub fn run_file(path: &str) -> Result<(), String> {
    let files = resolve_includes(&[PathBuf::from(path)]);
    let image = compile_files(&files)?;
    let mut machine = Vm::new(image);
    machine.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("tail_lib_{}_{}", tag, std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            TempDir(dir)
        }

        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.0.join(name);
            fs::write(&path, content).unwrap();
            path
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn includes_are_discovered_in_order_once() {
        let dir = TempDir::new("order");
        let main = dir.write(
            "main.tail",
            "include util;\ninclude extra;\nfn Main() { util_helper(); }\n",
        );
        dir.write("util.tail", "include extra;\nfn helper() { }\n");
        dir.write("extra.tail", "fn more() { }\n");

        let files = resolve_includes(&[main.clone()]);
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["main.tail", "util.tail", "extra.tail"]);
        assert!(files[0].is_main);
        assert!(!files[1].is_main);
        assert!(!files[2].is_main);
    }

    #[test]
    fn missing_include_is_skipped_with_a_warning() {
        let dir = TempDir::new("missing");
        let main = dir.write("main.tail", "include nowhere;\nfn Main() { }\n");
        let files = resolve_includes(&[main]);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn missing_include_surfaces_as_function_not_found() {
        let dir = TempDir::new("unresolved");
        let main = dir.write("main.tail", "include nowhere;\nfn Main() { nowhere_f(); }\n");
        let files = resolve_includes(&[main]);
        let err = compile_files(&files).unwrap_err();
        assert!(err.contains("not found"), "got: {}", err);
    }

    #[test]
    fn compile_rejects_sources_with_parse_errors() {
        let err = compile("fn Main() { int = ; }").unwrap_err();
        assert!(err.contains("Parse error at line 1"));
    }

    #[test]
    fn compile_rejects_sources_with_lexer_errors() {
        let err = compile("fn Main() { int x = 1; } \u{1F980}").unwrap_err();
        assert!(err.contains("Lexer error"));
    }

    #[test]
    fn scan_is_textual() {
        assert_eq!(
            scan_includes("include a;\n  include b ;\nint x = 1; // include c;\n"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
