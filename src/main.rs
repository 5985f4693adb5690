use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mnist_prep::costs::read_costs;
use mnist_prep::data::model::DEFAULT_ARCHIVE_PATH;
use mnist_prep::{
    load_archive, load_binary, load_multiclass, plot_training, save_json_gz, TaskData,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load an archive and print the shapes of the task matrices
    Inspect {
        /// The archive to load (.pkl.gz or .json.gz)
        #[arg(short, long, default_value = DEFAULT_ARCHIVE_PATH)]
        path: PathBuf,

        /// Which reshaping to apply
        #[arg(short, long, value_enum, default_value_t = Task::Binary)]
        task: Task,
    },

    /// Re-encode an archive as gzip-compressed JSON
    Convert {
        /// The archive to read
        #[arg(short, long, default_value = DEFAULT_ARCHIVE_PATH)]
        input: PathBuf,

        /// Where to write the .json.gz copy
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show training and validation costs from an `epoch,train,val` CSV
    Plot {
        /// The cost file written during training
        #[arg(short, long)]
        costs: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Task {
    /// Digits 0 and 1, labels as a single row
    Binary,
    /// All ten digits, one-hot targets
    Multiclass,
}

fn shape_summary(name: &str, data: &TaskData) -> String {
    format!(
        "{name}: X {:?}, Y {:?}, {} samples",
        data.x.dim(),
        data.y.dim(),
        data.samples()
    )
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Inspect { path, task } => {
            let (train, val) = match task {
                Task::Binary => load_binary(&path),
                Task::Multiclass => load_multiclass(&path),
            }
            .with_context(|| format!("loading {}", path.display()))?;

            for (name, data) in [("train", &train), ("val", &val)] {
                let summary = shape_summary(name, data);
                log::info!("{summary}");
                println!("{summary}");
            }
        }
        Command::Convert { input, output } => {
            let archive =
                load_archive(&input).with_context(|| format!("loading {}", input.display()))?;
            save_json_gz(&archive, &output)
                .with_context(|| format!("writing {}", output.display()))?;
        }
        Command::Plot { costs } => {
            let (train, val) =
                read_costs(&costs).with_context(|| format!("reading {}", costs.display()))?;
            plot_training(&train, &val)?;
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    #[test]
    fn summary_lists_both_shapes() {
        let data = TaskData {
            x: Array2::zeros((784, 3)),
            y: Array2::zeros((10, 3)),
        };
        assert_eq!(
            shape_summary("val", &data),
            "val: X (784, 3), Y (10, 3), 3 samples"
        );
    }

    #[test]
    fn inspect_defaults_to_binary_task() {
        let args = Args::parse_from(["mnist-prep", "inspect"]);
        match args.command {
            Command::Inspect { path, task } => {
                assert_eq!(path, PathBuf::from(DEFAULT_ARCHIVE_PATH));
                assert!(matches!(task, Task::Binary));
            }
            other => panic!("parsed {other:?}"),
        }
    }
}
