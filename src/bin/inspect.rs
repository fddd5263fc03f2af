//! `keyspan-inspect`: a read-only diagnostic CLI over a database file,
//! scoped to this crate's own invariants -- not a query engine (spec §1,
//! §6). Mirrors the teacher's `sombra-inspect`/`sombra` admin binaries:
//! clap-derive subcommands, plain `println!` tables, non-zero exit on
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use keyspan_core::{DatabaseConfig, Group, Result};

#[derive(Parser, Debug)]
#[command(name = "keyspan-inspect", version, about = "Read-only inspector for keyspan-core database files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print header/top-ref/free-list/table summary.
    Open {
        path: PathBuf,
    },
    /// Walk every table's cluster tree and recheck stored subtree sizes.
    Verify {
        path: PathBuf,
    },
}

fn cmd_open(path: &PathBuf) -> Result<()> {
    let group = Group::open_read_only(path, DatabaseConfig::default())?;

    println!("keyspan-core database: {}", path.display());
    println!("  file length:      {} bytes", group.file_len());
    println!("  top ref:          {}", group.top_ref());

    let (free_entries, free_bytes) = group.free_list_summary()?;
    println!("  free-list:        {free_entries} entries, {free_bytes} bytes");

    let names = group.table_names()?;
    println!("  tables ({}):", names.len());
    for name in &names {
        let key = group.find_table(name).expect("just listed by table_names()");
        let schema = group.schema(key)?;
        let tree = group.cluster_tree(key)?;
        let size = tree.size(group.alloc())?;
        println!("    - {name} ({} columns, {size} rows)", schema.len());
    }
    Ok(())
}

fn cmd_verify(path: &PathBuf) -> Result<()> {
    let group = Group::open_read_only(path, DatabaseConfig::default())?;
    let names = group.table_names()?;

    let mut failures = Vec::new();
    for name in &names {
        let key = group.find_table(name).expect("just listed by table_names()");
        let tree = group.cluster_tree(key)?;
        if !tree.verify_subtree_sizes(group.alloc())? {
            failures.push(name.clone());
        }
    }

    println!("verified {} table(s)", names.len());
    if failures.is_empty() {
        println!("OK: all stored subtree sizes match their recomputed totals");
        Ok(())
    } else {
        println!("FAILED: subtree size mismatch in: {}", failures.join(", "));
        Err(keyspan_core::Error::InvalidDatabase(format!(
            "subtree size mismatch in tables: {}",
            failures.join(", ")
        )))
    }
}

fn main() -> ExitCode {
    keyspan_core::logging::init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Open { path } => cmd_open(path),
        Command::Verify { path } => cmd_verify(path),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
