use anyhow::{Context, Result};
use clap::Parser;
use rime::{Bytefile, Machine};

#[derive(Parser)]
#[command(name = "rime")]
#[command(about = "A stack-machine bytecode interpreter")]
struct Cli {
    /// Path to a bytecode image
    file: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let bytefile = Bytefile::load(&cli.file)?;
    let mut machine = Machine::new(bytefile)?;
    machine.run().context("Runtime error")?;

    Ok(())
}
