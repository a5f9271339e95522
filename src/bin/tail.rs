//! `tail`: execute a compiled `.tailc` bytecode image.
//!
//! ```text
//! tail <file.tailc>
//! ```
//!
//! Set `TAIL_TRACE=1` to print every instruction as it executes.

use std::env;
use std::fs;
use std::process;

use anyhow::{anyhow, bail, Context, Result};

use tail::bytecode::codec;
use tail::Vm;

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: tail <file.tailc>");
        eprintln!("Executes Tail bytecode in the Tail virtual machine.");
        eprintln!();
        eprintln!("First compile your Tail source code:");
        eprintln!("  tailc program.tail");
        eprintln!("Then execute it:");
        eprintln!("  tail program.tailc");
        bail!("expected exactly one bytecode file");
    }

    let input = &args[1];
    if !input.ends_with(".tailc") {
        eprintln!("Warning: Expected .tailc file extension");
    }

    let data = fs::read(input).with_context(|| format!("Cannot open file '{}'", input))?;
    let image = codec::deserialize(&data).map_err(|e| anyhow!("Invalid bytecode file: {}", e))?;

    let mut vm = Vm::new(image);
    if env::var("TAIL_TRACE").as_deref() == Ok("1") {
        vm.set_trace(true);
        println!("[Tracing enabled]");
    }

    if let Err(err) = vm.run() {
        eprintln!("{}", err);
        vm.dump_state();
        process::exit(1);
    }

    Ok(())
}
