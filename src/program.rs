//! The simulation a sweep runs once per realization.
//!
//! A program is either an executable invoked through a command template, or an
//! in-process [`JobFunction`] handed a rendered argument string. Templates are
//! Handlebars templates, e.g. `./model --x={{x}} --y={{y}}`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use handlebars::Handlebars;
use serde::Deserialize;
use tracing::debug;
use void::Void;

use crate::design::Realization;
use crate::error::{ConfigError, SweepError};
use crate::job::Work;
use crate::pool::JobFunction;
use crate::sentinel::Value;
use crate::serde::one_or_many;

/// Argument naming the parameter file in `params_by_file` mode.
pub const PARAMS_FILE_ARG: &str = "--paramsFile";

const EXE_TEMPLATE: &str = "exe";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProgramSpec {
    /// Executable name. Used with `--name=value` arguments when `exe` is empty.
    pub name: String,
    /// Command template.
    pub exe: String,
    pub desc: String,
    /// Run each job in its own directory.
    pub newdir: bool,
    /// Files copied into each job directory.
    #[serde(deserialize_with = "one_or_many")]
    pub infiles: Vec<PathBuf>,
    /// Files saved into the store after a job finishes.
    #[serde(deserialize_with = "one_or_many")]
    pub outfiles: Vec<String>,
    /// Pass parameters through a file instead of the command line.
    pub params_by_file: bool,
}

impl FromStr for ProgramSpec {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            exe: s.to_string(),
            ..Default::default()
        })
    }
}

pub struct TestProgram {
    spec: ProgramSpec,
    function: Option<JobFunction>,
    registry: Handlebars<'static>,
}

impl TestProgram {
    pub fn new(spec: ProgramSpec) -> Result<Self, SweepError> {
        Self::build(spec, None)
    }

    /// A program that calls `function` in-process. `func_args` takes the place
    /// of the exe template and is rendered the same way.
    pub fn with_function(
        function: JobFunction,
        func_args: impl Into<String>,
        mut spec: ProgramSpec,
    ) -> Result<Self, SweepError> {
        spec.exe = func_args.into();
        if spec.exe.is_empty() {
            return Err(ConfigError::FunctionWithoutArgs.into());
        }
        Self::build(spec, Some(function))
    }

    fn build(spec: ProgramSpec, function: Option<JobFunction>) -> Result<Self, SweepError> {
        if spec.name.is_empty() && spec.exe.is_empty() && function.is_none() {
            return Err(ConfigError::EmptyProgram.into());
        }
        if spec.params_by_file {
            if !spec.newdir {
                return Err(ConfigError::ParamsByFileWithoutNewdir.into());
            }
            params_file_name(&spec.exe)?;
        }
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        handlebars_misc_helpers::register(&mut registry);
        if !spec.exe.is_empty() {
            registry.register_template_string(EXE_TEMPLATE, &spec.exe)?;
        }
        Ok(Self {
            spec,
            function,
            registry,
        })
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    pub fn function(&self) -> Option<&JobFunction> {
        self.function.as_ref()
    }

    pub fn newdir(&self) -> bool {
        self.spec.newdir
    }

    pub fn outfiles(&self) -> &[String] {
        &self.spec.outfiles
    }

    /// Prepares the directory a job runs in. Returns `None` when jobs share
    /// the base directory.
    pub fn setup(&self, base_dir: &Path, output: &str) -> Result<Option<PathBuf>, SweepError> {
        if !self.spec.newdir {
            return Ok(None);
        }
        let dir = base_dir.join(output);
        fs::create_dir_all(&dir)?;
        for src in &self.spec.infiles {
            if let Some(file_name) = src.file_name() {
                fs::copy(src, dir.join(file_name))?;
            }
        }
        Ok(Some(dir))
    }

    /// Builds the command line (or function arguments) for one realization.
    pub fn cmd(&self, realization: &Realization) -> Result<String, SweepError> {
        if self.spec.exe.is_empty() {
            let args: Vec<String> = realization
                .iter()
                .map(|a| format!("--{}={}", a.name, Value::Float(a.value)))
                .collect();
            return Ok(format!("{} {}", self.spec.name, args.join(" ")));
        }
        let params: BTreeMap<&str, String> = realization
            .iter()
            .map(|a| (a.name.as_str(), Value::Float(a.value).to_string()))
            .collect();
        let cmd = self.registry.render(EXE_TEMPLATE, &params)?;
        debug!(cmd = %cmd, "rendered command");
        Ok(cmd)
    }

    /// Writes the realization to the parameter file inside `dir` and returns
    /// the exe unchanged. Each row is `name<TAB x3>value<TAB x3>description`.
    pub fn cmd_by_file(&self, realization: &Realization, dir: &Path) -> Result<String, SweepError> {
        let file_name = params_file_name(&self.spec.exe)?;
        let mut rows = String::new();
        for a in realization.iter() {
            rows.push_str(&format!(
                "{}\t\t\t{}\t\t\t{}\n",
                a.name,
                scientific(a.value),
                a.desc
            ));
        }
        fs::write(dir.join(file_name), rows)?;
        Ok(self.spec.exe.clone())
    }

    /// The work item for one realization.
    pub fn work(&self, realization: &Realization, dir: Option<&Path>) -> Result<Work, SweepError> {
        let rendered = match (self.spec.params_by_file, dir) {
            (true, Some(dir)) => self.cmd_by_file(realization, dir)?,
            (true, None) => return Err(ConfigError::ParamsByFileWithoutNewdir.into()),
            (false, _) => self.cmd(realization)?,
        };
        Ok(match &self.function {
            Some(function) => Work::Function {
                function: function.name().to_string(),
                args: rendered,
            },
            None => Work::Command(rendered),
        })
    }
}

/// Finds the parameter file named by `--paramsFile=name` or `--paramsFile name`.
fn params_file_name(exe: &str) -> Result<String, ConfigError> {
    let mut tokens = exe.split_whitespace();
    while let Some(token) = tokens.next() {
        if let Some(name) = token.strip_prefix(PARAMS_FILE_ARG) {
            let name = match name.strip_prefix('=') {
                Some(name) => Some(name),
                None if name.is_empty() => tokens.next(),
                None => continue,
            };
            return match name {
                Some(name) if !name.is_empty() => Ok(name.to_string()),
                _ => Err(ConfigError::MissingParamsFile),
            };
        }
    }
    Err(ConfigError::MissingParamsFile)
}

/// Nine-digit scientific notation with a signed two-digit exponent (`1.500000000e+00`).
fn scientific(x: f64) -> String {
    let formatted = format!("{:.9e}", x);
    match formatted.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exp.abs())
        }
        None => formatted,
    }
}
