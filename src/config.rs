//! Configuration for uqsweep.
//!
//! Holds the clap structs for command line arguments and flags, and the
//! sweep file that names the test program, its parameters and the
//! realizations to run.

use std::fs::File;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};
use serde::Deserialize;

use crate::design::{ListDesign, ParamInfo};
use crate::error::{ConfigError, SweepError};
use crate::program::ProgramSpec;
use crate::serde::string_or_mapping;

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Run a new sweep, resume an interrupted one, report status or collect results
    #[arg(value_enum)]
    pub mode: Mode,

    /// Sweep file to use. Defaults to `sweep.yaml`
    #[arg(long, short = 'f', default_value = "sweep.yaml")]
    pub sweep_file: PathBuf,

    /// Directory for the job table and collected results
    #[arg(long, short, default_value = "sweep_out")]
    pub store: PathBuf,

    /// CPUs each job uses
    #[arg(long, short, default_value = "1")]
    pub cpus: usize,

    /// CPUs available to the whole sweep. Giving 0 uses every CPU on this machine.
    #[arg(long, default_value = "0")]
    pub cpus_per_node: usize,

    /// Keep job output files and directories after collecting them
    #[arg(long, short)]
    pub keep: bool,

    /// Replace every job with one that only reports its number
    #[arg(long)]
    pub dry_run: bool,

    /// More output. Twice prints a banner for every job.
    #[arg(long, short, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(PartialEq, Clone, Debug, ValueEnum)]
pub enum Mode {
    Run,
    Resume,
    Status,
    Collect,
}

/// A sweep described in YAML.
///
/// ```yaml
/// name: rosen
/// program: ./rosen --x={{x}} --y={{y}}
/// params:
///   - x
///   - {name: y, desc: second coordinate}
/// realizations:
///   - [1.0, 2.0]
///   - [0.5, 1.5]
/// ```
#[derive(Debug, Deserialize)]
pub struct SweepFile {
    pub name: String,
    #[serde(deserialize_with = "string_or_mapping")]
    pub program: ProgramSpec,
    #[serde(default)]
    params: Vec<ParamSpec>,
    #[serde(default)]
    pub realizations: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct ParamSpec(#[serde(deserialize_with = "string_or_mapping")] ParamInfo);

impl SweepFile {
    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn params(&self) -> Vec<ParamInfo> {
        self.params.iter().map(|ParamSpec(info)| info.clone()).collect()
    }

    pub fn design(&self) -> Result<ListDesign, ConfigError> {
        ListDesign::new(self.params(), self.realizations.clone())
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli() {
        Config::command().debug_assert();
        let cli = Config::parse_from(["uqsweep", "resume", "-c", "2", "--cpus-per-node", "8", "-vv"]);
        assert_eq!(cli.mode, Mode::Resume);
        assert_eq!(cli.cpus, 2);
        assert_eq!(cli.cpus_per_node, 8);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.sweep_file, PathBuf::from("sweep.yaml"));
        assert!(!cli.keep);
    }

    #[test]
    fn test_sweep_file_short_forms() {
        let sweep: SweepFile = serde_yaml::from_str(
            "name: rosen\n\
             program: ./rosen --x={{x}} --y={{y}}\n\
             params:\n  - x\n  - {name: y, desc: second coordinate}\n\
             realizations:\n  - [1.0, 2.0]\n  - [0.5, 1.5]\n",
        )
        .unwrap();
        assert_eq!(sweep.program.exe, "./rosen --x={{x}} --y={{y}}");
        let params = sweep.params();
        assert_eq!(params[0].name, "x");
        assert_eq!(params[1].desc, "second coordinate");
        assert_eq!(sweep.design().unwrap().len(), 2);
    }

    #[test]
    fn test_sweep_file_program_mapping() {
        let sweep: SweepFile = serde_yaml::from_str(
            "name: heat\n\
             program:\n  exe: python ../heat.py --paramsFile=input.txt\n  newdir: true\n  \
             params_by_file: true\n  infiles: [heat.py]\n  outfiles: [T.dat]\n\
             params: [k]\n\
             realizations: [[0.1], [0.2, 0.3]]\n",
        )
        .unwrap();
        assert!(sweep.program.newdir);
        assert!(sweep.program.params_by_file);
        assert_eq!(sweep.program.outfiles, vec!["T.dat".to_string()]);
        assert_eq!(
            sweep.design().unwrap_err(),
            ConfigError::RealizationLength {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn test_sweep_file_single_outfile() {
        let sweep: SweepFile = serde_yaml::from_str(
            "name: heat\n\
             program:\n  exe: ./heat {{k}}\n  newdir: true\n  infiles: heat.cfg\n  outfiles: T.dat\n\
             params: [k]\n",
        )
        .unwrap();
        assert_eq!(sweep.program.infiles, vec![PathBuf::from("heat.cfg")]);
        assert_eq!(sweep.program.outfiles, vec!["T.dat".to_string()]);
        assert!(sweep.realizations.is_empty());
    }
}
