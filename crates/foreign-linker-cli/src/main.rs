use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Value as Json, json};
use std::sync::Arc;
use tracing::debug;

use foreign_linker::calling_sequence::{ArgumentRole, CallingSequence};
use foreign_linker::recipe::CompactRecipe;
use foreign_linker::shuffle::ShuffledStub;
use foreign_linker::specialize::specialize;
use foreign_linker::storage::Side;
use foreign_linker::{Abi, CallingSequenceBuilder, Direction, FunctionType};

#[derive(Parser)]
#[command(name = "foreign-linker")]
#[command(about = "Inspect native calling sequences and call stubs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the calling sequence of a signature
    Classify {
        #[arg(help = "Signature, e.g. \"(i32, {f64, f64}) -> ptr\"")]
        signature: String,

        #[arg(long, default_value = "sysv", help = "sysv, win64, aarch64-linux or aarch64-macos")]
        abi: String,

        #[arg(long, help = "Classify as an upcall instead of a downcall")]
        upcall: bool,

        #[arg(long, help = "Print JSON instead of text")]
        json: bool,
    },
    /// Print the compiled stub forms of a signature
    Stub {
        #[arg(help = "Signature, e.g. \"(i32, f64) -> i64\"")]
        signature: String,

        #[arg(long, default_value = "sysv", help = "sysv, win64, aarch64-linux or aarch64-macos")]
        abi: String,

        #[arg(long, help = "Build upcall stubs instead of downcall stubs")]
        upcall: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify {
            signature,
            abi,
            upcall,
            json,
        } => {
            let sequence = build_sequence(&signature, &abi, upcall)?;
            if json {
                let dump = serde_json::to_string_pretty(&sequence_json(&sequence))
                    .context("Failed to encode calling sequence")?;
                println!("{dump}");
            } else {
                println!("{sequence}");
            }
        }
        Commands::Stub {
            signature,
            abi,
            upcall,
        } => {
            let sequence = Arc::new(build_sequence(&signature, &abi, upcall)?);
            match specialize(Arc::clone(&sequence)) {
                Ok(stub) => print!("{}", stub.dump()),
                Err(e) => println!("specialized stub unavailable: {e}"),
            }
            match ShuffledStub::new(Arc::clone(&sequence)) {
                Ok(shuffle) => println!("{shuffle}"),
                Err(e) => println!("register shuffle unavailable: {e}"),
            }
            match CompactRecipe::new(sequence) {
                Ok(recipe) => println!("{recipe}"),
                Err(e) => println!("compact recipe unavailable: {e}"),
            }
        }
    }

    Ok(())
}

fn build_sequence(signature: &str, abi: &str, upcall: bool) -> Result<CallingSequence> {
    let abi: Abi = abi.parse().with_context(|| format!("Invalid ABI '{abi}'"))?;
    let signature: FunctionType = signature
        .parse()
        .with_context(|| format!("Failed to parse signature '{signature}'"))?;
    let direction = if upcall {
        Direction::Upcall
    } else {
        Direction::Downcall
    };
    debug!(%abi, %signature, ?direction, "classifying");
    CallingSequenceBuilder::new(abi, direction)
        .build(&signature)
        .with_context(|| format!("Failed to classify {signature} for {abi}"))
}

fn sequence_json(sequence: &CallingSequence) -> Json {
    let arguments: Vec<Json> = sequence
        .arguments()
        .iter()
        .map(|arg| {
            let role = match arg.role {
                ArgumentRole::Parameter(i) => json!({ "parameter": i }),
                ArgumentRole::ReturnBuffer => json!("return_buffer"),
                ArgumentRole::VectorRegisterCount(n) => json!({ "vector_count": n }),
            };
            json!({
                "role": role,
                "carrier": arg.carrier.to_string(),
                "program": arg.program.iter().map(ToString::to_string).collect::<Vec<_>>(),
            })
        })
        .collect();
    let classification: Vec<Json> = sequence
        .classification()
        .iter()
        .map(|(class, side, bindings)| {
            json!({
                "class": class.name(),
                "side": match side {
                    Side::Argument => "argument",
                    Side::Return => "return",
                },
                "storages": bindings
                    .iter()
                    .map(|b| json!({ "storage": b.storage.to_string(), "offset": b.offset }))
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "abi": sequence.abi().name(),
        "direction": sequence.direction().to_string(),
        "signature": sequence.signature().to_string(),
        "arguments": arguments,
        "return": sequence.return_program().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "return_buffer": sequence.needs_return_buffer().then(|| json!({
            "size": sequence.return_buffer_size(),
            "align": sequence.return_buffer_align(),
        })),
        "scratch_size": sequence.scratch_allocation_size(),
        "classification": classification,
    })
}
