//! `tailc`: compile Tail source files to a `.tailc` bytecode image.
//!
//! ```text
//! tailc <file1.tail> [file2.tail ...] [-o output.tailc]
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use tail::bytecode::codec;
use tail::{compile_files, resolve_includes};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        eprintln!("Usage: tailc <file1.tail> [file2.tail ...] [-o output.tailc]");
        eprintln!("Compiles Tail source code to Tail bytecode.");
        bail!("no input files");
    }

    let mut inputs: Vec<PathBuf> = Vec::new();
    let mut output: Option<PathBuf> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            match iter.next() {
                Some(path) => output = Some(PathBuf::from(path)),
                None => bail!("-o flag requires output filename"),
            }
        } else if arg.ends_with(".tail") {
            inputs.push(PathBuf::from(arg));
        } else {
            bail!("Unknown argument or not a .tail file: {}", arg);
        }
    }

    if inputs.is_empty() {
        bail!("No .tail files specified");
    }

    let output = output.unwrap_or_else(|| {
        let stem = inputs[0]
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "out".to_string());
        PathBuf::from(format!("{}.tailc", stem))
    });

    let files = resolve_includes(&inputs);

    let image = match compile_files(&files) {
        Ok(image) => image,
        Err(diagnostics) => {
            for line in diagnostics.lines() {
                eprintln!("{}", line);
            }
            bail!("compilation failed");
        }
    };

    let data = codec::serialize(&image);
    fs::write(&output, &data)
        .with_context(|| format!("Cannot write to '{}'", output.display()))?;

    eprintln!("  tailc | {} file(s) -> {}", files.len(), output.display());
    eprintln!(
        "  {} instructions, {} constants, {} functions, {} bytes",
        image.code.len(),
        image.constants.len(),
        image.functions.len(),
        data.len()
    );

    Ok(())
}
