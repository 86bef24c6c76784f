//! Lapidary CLI — trace simplifier.

use anyhow::{Context, Result};
use clap::Parser;
use lapidary::expr::{Expr, Trace};
use lapidary::trace::simplify_trace;
use std::io::{IsTerminal, Read};

#[derive(Parser, Debug)]
#[command(
    name = "lapidary",
    version,
    about = "Symbolic simplifier for decompiled EVM execution traces"
)]
struct Cli {
    /// Trace as a JSON expression list.
    #[arg(value_name = "TRACE")]
    trace: Option<String>,

    /// Read the trace from a file instead.
    #[arg(short = 'f', long)]
    file: Option<String>,

    /// Emit the simplified trace as JSON instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let input = if let Some(ref path) = cli.file {
        let mut buf = String::new();
        std::fs::File::open(path)
            .with_context(|| format!("opening {path}"))?
            .read_to_string(&mut buf)?;
        buf
    } else if let Some(ref t) = cli.trace {
        t.clone()
    } else if std::io::stdin().is_terminal() {
        anyhow::bail!("no trace provided — pass it as an argument, via -f, or pipe to stdin");
    } else {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    };

    let trace: Trace = serde_json::from_str(&input).context("parsing trace JSON")?;
    let simplified = simplify_trace(&trace)?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&simplified)?);
    } else {
        for line in &simplified {
            print_line(line, 0);
        }
    }

    Ok(())
}

fn print_line(line: &Expr, depth: usize) {
    let pad = "  ".repeat(depth);
    match line.opcode() {
        Some("if") => {
            if let Some(ch) = line.children() {
                println!("{pad}if {} :", ch[0]);
                for l in sub_lines(&ch[1]) {
                    print_line(&l, depth + 1);
                }
                let else_lines = sub_lines(&ch[2]);
                if !else_lines.is_empty() {
                    println!("{pad}else:");
                    for l in else_lines {
                        print_line(&l, depth + 1);
                    }
                }
            }
        }
        Some("while") => {
            if let Some(ch) = line.children() {
                for sv in ch.iter().skip(3) {
                    print_line(sv, depth);
                }
                println!("{pad}while {} :", ch[0]);
                for l in sub_lines(&ch[1]) {
                    print_line(&l, depth + 1);
                }
            }
        }
        _ => println!("{pad}{line}"),
    }
}

fn sub_lines(e: &Expr) -> Vec<Expr> {
    lapidary::utils::helpers::extract_seq(e)
}
