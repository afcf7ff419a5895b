use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use git_lineage::{
    BlameError, FullBlameSource, GitBlameSource, GitLog, MergeDiffs, NoFullBlame, Options,
    Orchestrator, Pipeline, load_checkpoint, save_checkpoint,
};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "git-lineage")]
#[command(about = "Incremental per-line blame for every commit of a git history")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Blame every commit of a repository, oldest first
    Run {
        /// Repository to read history from
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Blame the commits of a saved `git log -p` text
    Replay {
        /// Log file, or "-" for stdin
        #[arg(long)]
        log: String,
        /// Repository used to reseed binary files with git blame
        #[arg(long)]
        repo: Option<PathBuf>,
        #[command(flatten)]
        pipeline: PipelineArgs,
    },
    /// Print one file's blame from a checkpoint
    Show {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        commit: String,
        #[arg(long)]
        path: String,
    },
    /// Generate shell completions
    Completions { shell: Shell },
    /// Generate a man page
    Man,
}

#[derive(Args)]
struct PipelineArgs {
    /// Where to save the state after the run
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// Start from the saved checkpoint, skipping commits it already holds
    #[arg(long, requires = "checkpoint")]
    resume: bool,
    /// Read merges as one diff per parent (git log -m) instead of combined diffs
    #[arg(long)]
    per_parent_merges: bool,
    /// Commits in flight between parsing and blaming
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
}

impl PipelineArgs {
    fn options(&self) -> Options {
        Options {
            queue_capacity: self.queue_capacity,
            merge_diffs: if self.per_parent_merges {
                MergeDiffs::PerParent
            } else {
                MergeDiffs::Combined
            },
        }
    }

    fn orchestrator(&self, source: Box<dyn FullBlameSource>) -> Result<Orchestrator, BlameError> {
        match &self.checkpoint {
            Some(path) if self.resume && path.exists() => {
                Ok(load_checkpoint(path)?.into_orchestrator(source))
            }
            _ => Ok(Orchestrator::new(source)),
        }
    }

    /// Run the pipeline over `reader`, printing `<commit> <changed files>`
    /// per commit. The checkpoint is saved even when the run fails, holding
    /// every commit that completed.
    fn execute<R>(&self, reader: R, source: Box<dyn FullBlameSource>) -> Result<(), Box<dyn std::error::Error>>
    where
        R: BufRead + Send + 'static,
    {
        let pipeline = Pipeline::spawn(self.orchestrator(source)?, reader, &self.options());

        let mut out = io::stdout().lock();
        let mut failure = None;
        for result in pipeline.results() {
            match result {
                Ok(result) => writeln!(out, "{} {}", result.commit, result.files.len())?,
                Err(err) => failure = Some(err),
            }
        }
        out.flush()?;

        let orchestrator = pipeline.join()?;
        if let Some(path) = &self.checkpoint {
            save_checkpoint(path, &orchestrator)?;
        }
        if let Some(err) = failure {
            return Err(err.into());
        }
        info!(commits = orchestrator.store().len(), "done");
        Ok(())
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run { repo, pipeline } => {
            let mut log = GitLog::spawn(&repo, pipeline.options().merge_diffs)?;
            let stdout = log.take_stdout()?;
            let outcome = pipeline.execute(stdout, Box::new(GitBlameSource::new(repo)));
            let exited = log.wait();
            outcome?;
            exited?;
        }
        Commands::Replay {
            log,
            repo,
            pipeline,
        } => {
            let reader: Box<dyn BufRead + Send> = if log == "-" {
                Box::new(BufReader::new(io::stdin()))
            } else {
                Box::new(BufReader::new(File::open(&log)?))
            };
            let source: Box<dyn FullBlameSource> = match repo {
                Some(repo) => Box::new(GitBlameSource::new(repo)),
                None => Box::new(NoFullBlame),
            };
            pipeline.execute(reader, source)?;
        }
        Commands::Show {
            checkpoint,
            commit,
            path,
        } => {
            let checkpoint = load_checkpoint(&checkpoint)?;
            let blame = checkpoint
                .store
                .get(&commit, &path)
                .ok_or_else(|| format!("No snapshot of {path} at {commit}"))?;
            write!(io::stdout().lock(), "{blame}")?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "git-lineage", &mut io::stdout());
        }
        Commands::Man => {
            clap_mangen::Man::new(Cli::command()).render(&mut io::stdout())?;
        }
    }

    Ok(())
}
