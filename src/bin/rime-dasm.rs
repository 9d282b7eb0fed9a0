use anyhow::{Context, Result};
use clap::Parser;
use rime::{Bytefile, Instruction};

#[derive(Parser)]
#[command(name = "rime-dasm")]
#[command(about = "Disassembles a bytecode image")]
struct Cli {
    /// Path to a bytecode image
    file: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut bytefile = Bytefile::load(&cli.file)?;
    println!(
        "; {} code bytes, {} global words, {} public symbols",
        bytefile.code_len(),
        bytefile.global_area_size(),
        bytefile.public_symbols().len() / 2
    );

    while bytefile.enough(1) {
        let at = bytefile.position();
        let instruction = Instruction::decode(&mut bytefile)
            .with_context(|| format!("at 0x{:04x}", at))?;
        println!("0x{:04x}:\t{}", at, instruction);
    }

    Ok(())
}
