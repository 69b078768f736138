//! CLI tool for checking how listing filenames are decomposed
//!
//! Usage:
//!   pipproxy-parse <filename>... [--package <name>] [--json]

use anyhow::Result;
use clap::Parser;
use pipproxy::parse_filename;

/// Show the package, version and heuristic recovered from filenames
#[derive(Parser, Debug)]
#[command(name = "pipproxy-parse")]
#[command(author = "PipProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Decompose package index filenames")]
struct Args {
    /// Filenames as they appear in an index listing
    #[arg(required = true)]
    filenames: Vec<String>,

    /// Package name the files are known to belong to
    #[arg(short = 'p', long)]
    package: Option<String>,

    /// Print one JSON object per line
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut failures = 0;

    for filename in &args.filenames {
        match parse_filename(filename, args.package.as_deref()) {
            Ok(record) if args.json => println!("{}", serde_json::to_string(&record)?),
            Ok(record) => {
                println!("{}", record.filename);
                println!("  package:   {}", record.package);
                println!("  version:   {}", record.version);
                if let Some(build) = &record.build_tag {
                    println!("  build:     {}", build);
                }
                if record.is_wheel {
                    println!(
                        "  tags:      {}-{}-{}",
                        record.python_tag.as_deref().unwrap_or("?"),
                        record.abi_tag.as_deref().unwrap_or("?"),
                        record.platform_tag.as_deref().unwrap_or("?")
                    );
                }
                println!("  heuristic: {}", record.heuristic);
            }
            Err(e) => {
                eprintln!("{}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}
