use std::ffi::OsString;
use std::io;

use clap::{Parser, Subcommand};
use log::info;
use rayon::prelude::*;

use legion_profiling::backend::dump;
use legion_profiling::config::ProfilerConfig;
use legion_profiling::serialize::deserialize;
use legion_profiling::sim::simulate;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Profile a synthetic multi-node run and write one log per node
    Simulate {
        #[command(flatten)]
        profiler: ProfilerConfig,

        #[arg(long, default_value_t = 2, help = "number of simulated nodes")]
        nodes: u32,

        #[arg(
            long,
            default_value_t = 100,
            help = "number of leaf tasks launched per processor"
        )]
        tasks: usize,
    },

    /// Print binary profiling logs as JSON lines
    Dump {
        #[arg(required = true, help = "input Legion Prof log filenames")]
        filenames: Vec<OsString>,
    },
}

fn main() -> io::Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            profiler,
            nodes,
            tasks,
        } => {
            simulate(&profiler, nodes, tasks)?;
        }
        Command::Dump { filenames } => {
            let records: Result<Vec<_>, _> = filenames
                .par_iter()
                .map(|filename| {
                    info!("Reading log file {:?}...", filename);
                    deserialize(filename)
                })
                .collect();
            let stdout = io::stdout().lock();
            let mut output = io::BufWriter::new(stdout);
            for records in records? {
                dump::dump_record(&records, &mut output)?;
            }
        }
    }

    Ok(())
}
