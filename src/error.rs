use thiserror::Error;

use crate::sentinel::SentinelError;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to execute local command or access job files: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to read or write YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse command template: {0}")]
    TemplateParse(#[from] handlebars::TemplateError),
    #[error("Failed to render command template: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
    #[error("Malformed sentinel record: {0}")]
    Sentinel(#[from] SentinelError),
    #[error("The worker pool is closed")]
    PoolClosed,
}

/// Fatal configuration problems. Reported before any job starts.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Job {job} calls function '{found}' but this host runs '{expected}'")]
    FunctionMismatch {
        job: usize,
        expected: String,
        found: String,
    },
    #[error("Job {0} is a shell command; the pooled host only runs functions")]
    CommandOnPool(usize),
    #[error("Job {0} is a function call; use the pooled host to run it")]
    FunctionOnProcess(usize),
    #[error("{0} must be greater than zero")]
    ZeroCapacity(&'static str),
    #[error("Another pooled host still has jobs outstanding")]
    PoolInUse,
    #[error("No test program attached to this host")]
    NoProgram,
    #[error("A test program needs a name, an exe or a function")]
    EmptyProgram,
    #[error("A function program also needs function arguments")]
    FunctionWithoutArgs,
    #[error("newdir must be set if params_by_file is used")]
    ParamsByFileWithoutNewdir,
    #[error("params_by_file is set but the exe has no '--paramsFile' argument")]
    MissingParamsFile,
    #[error("Realization has {found} values but {expected} parameters were declared")]
    RealizationLength { expected: usize, found: usize },
    #[error("Invalid walltime '{0}'")]
    Walltime(String),
}
