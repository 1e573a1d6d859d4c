use std::fs;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use colored::*;

use nesquik::compiler::compile;
use nesquik::parser::parse;

/// The NESQuik compiler: translates NQ source into a flat 6502 image.
#[derive(Parser)]
#[command(name = "nq")]
struct Args {
    /// NQ source file
    file: PathBuf,

    /// Output binary file name
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Program start address, decimal or 0x-prefixed hexadecimal
    #[arg(long, default_value = "0xc000", value_parser = parse_addr)]
    org: u16,
}

fn parse_addr(value: &str) -> Result<u16, String> {
    let result = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    result.map_err(|_| {
        format!(
            "expected an address in decimal or hexadecimal format, got {}",
            value
        )
    })
}

fn main() {
    let args = Args::parse();

    let source = match fs::read_to_string(&args.file) {
        Ok(source) => source,
        Err(err) => {
            eprintln!(
                "{} cannot read {}: {}",
                "error:".bright_red(),
                args.file.display(),
                err
            );
            exit(1);
        }
    };

    let ast = match parse(&source) {
        Ok(ast) => ast,
        Err(err) => {
            eprintln!("{}", err.nice_message);
            exit(1);
        }
    };

    let prg = match compile(ast, args.org) {
        Ok(prg) => prg,
        Err(err) => {
            eprintln!("{} {}", "error:".bright_red(), err);
            exit(1);
        }
    };

    for line in &prg.asm {
        println!("{}", line);
    }

    println!();
    for byte in &prg.obj {
        print!("{:x} ", byte);
    }
    println!();
    println!("size: {} bytes", prg.obj.len());

    if let Some(out) = &args.out {
        if let Err(err) = fs::write(out, &prg.obj) {
            eprintln!(
                "{} cannot write {}: {}",
                "error:".bright_red(),
                out.display(),
                err
            );
            exit(1);
        }
    }
}
