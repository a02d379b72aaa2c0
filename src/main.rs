use std::path::{Path, PathBuf};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use uqsweep::{
    harvest, BatchState, Config, DirStore, Host, Mode, RunOptions, StoreOptions, SweepError,
    SweepFile, TestProgram,
};

/// Job table file inside the store directory.
const JOB_TABLE: &str = "jobs.yaml";

fn init_logging(verbose: u8) {
    let default = if verbose > 0 {
        "uqsweep=debug"
    } else {
        "uqsweep=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A token cancelled by the first Ctrl-C.
fn interrupt_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });
    token
}

fn job_table(cli: &Config) -> PathBuf {
    cli.store.join(JOB_TABLE)
}

/// Reattaches the test program if the sweep file is still around. Collection
/// needs it for declared output files and job directories.
fn attach_program(cli: &Config, host: Host) -> Result<Host, SweepError> {
    if !cli.sweep_file.exists() {
        warn!(
            "{} not found; collecting stdout and stderr only",
            cli.sweep_file.display()
        );
        return Ok(host);
    }
    let sweep = SweepFile::load(&cli.sweep_file)?;
    Ok(host.with_program(TestProgram::new(sweep.program)?))
}

fn collect_results(cli: &Config, host: &mut Host) -> Result<(), SweepError> {
    let mut store = DirStore::new(
        &cli.store,
        StoreOptions {
            keep_files: cli.keep,
            verbosity: cli.verbose,
        },
    );
    let collected = host.collect(&mut store)?;
    let outputs = harvest(&mut store)?;
    info!(
        jobs = collected.len(),
        outputs = ?outputs,
        "results stored in {}",
        cli.store.display()
    );
    Ok(())
}

async fn execute(cli: &Config, mut host: Host, table: &Path) -> Result<(), SweepError> {
    let interrupt = interrupt_on_ctrl_c();
    let options = RunOptions {
        dry_run: cli.dry_run,
        verbosity: cli.verbose,
    };
    let report = host.run(&interrupt, options).await?;
    host.save(table).await?;
    if report.state == BatchState::Complete {
        collect_results(cli, &mut host)?;
        host.save(table).await?;
    }
    host.status(false);
    Ok(())
}

async fn run_sweep(cli: &Config) -> Result<(), SweepError> {
    let sweep = SweepFile::load(&cli.sweep_file)?;
    let design = sweep.design()?;
    std::fs::create_dir_all(&cli.store)?;
    let mut host = Host::new(cli.cpus, cli.cpus_per_node)
        .with_base_dir(std::env::current_dir()?)
        .with_program(TestProgram::new(sweep.program.clone())?);
    host.add_jobs(&sweep.name, design.realizations())?;
    eprintln!(
        "[uqsweep] {} jobs, {} CPUs each, {} CPUs total",
        host.jobs().len(),
        host.cpus(),
        host.cpus_per_node()
    );
    let table = job_table(cli);
    host.save(&table).await?;
    execute(cli, host, &table).await
}

async fn resume(cli: &Config) -> Result<(), SweepError> {
    let table = job_table(cli);
    let mut host = attach_program(cli, Host::load(&table).await?)?;
    host.status(false);
    execute(cli, host, &table).await
}

async fn status(cli: &Config) -> Result<(), SweepError> {
    let table = job_table(cli);
    let mut host = Host::load(&table).await?;
    host.status(false);
    host.save(&table).await
}

async fn collect(cli: &Config) -> Result<(), SweepError> {
    let table = job_table(cli);
    let mut host = attach_program(cli, Host::load(&table).await?)?;
    collect_results(cli, &mut host)?;
    host.save(&table).await
}

#[tokio::main]
async fn main() -> Result<(), SweepError> {
    let cli = Config::parse();
    init_logging(cli.verbose);

    match cli.mode {
        Mode::Run => run_sweep(&cli).await?,
        Mode::Resume => resume(&cli).await?,
        Mode::Status => status(&cli).await?,
        Mode::Collect => collect(&cli).await?,
    };

    Ok(())
}
