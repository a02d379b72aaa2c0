//! Structured result store.
//!
//! Results are addressed by slash-separated paths such as
//! `output/jobs/3/stdout`. Two stores ship with the crate: an in-memory map and
//! a directory tree on disk that mirrors the paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use itertools::Itertools;

use crate::error::SweepError;
use crate::sentinel::Value;

/// Group holding one subgroup per collected job.
pub const JOBS_GROUP: &str = "output/jobs";
/// Group holding one subgroup per harvested output variable.
pub const DATA_GROUP: &str = "output/data";

/// Options declared on the store that change how results are gathered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Leave per-job files and job directories behind after collection.
    pub keep_files: bool,
    pub verbosity: u8,
}

pub trait ResultStore {
    fn options(&self) -> StoreOptions;

    /// Reads the entry at `path`, or `None` if nothing is stored there.
    fn read(&self, path: &str) -> Result<Option<String>, SweepError>;

    /// Creates or replaces the entry at `path`.
    fn write(&mut self, path: &str, data: &str) -> Result<(), SweepError>;

    /// Names directly under `group`, sorted.
    fn children(&self, group: &str) -> Result<Vec<String>, SweepError>;

    /// Job numbers that already have a group under [`JOBS_GROUP`].
    fn job_numbers(&self) -> Result<BTreeSet<usize>, SweepError> {
        Ok(self
            .children(JOBS_GROUP)?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect())
    }

    /// Writes the values of one output variable with its description.
    fn set_result(&mut self, var: &str, values: &[Value], desc: &str) -> Result<(), SweepError> {
        let data = serde_yaml::to_string(values)?;
        self.write(&format!("{}/{}/values", DATA_GROUP, var), &data)?;
        self.write(&format!("{}/{}/description", DATA_GROUP, var), desc)
    }

    /// Names of every output variable written with [`ResultStore::set_result`].
    fn output_names(&self) -> Result<Vec<String>, SweepError> {
        self.children(DATA_GROUP)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    options: StoreOptions,
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

impl ResultStore for MemoryStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    fn read(&self, path: &str) -> Result<Option<String>, SweepError> {
        Ok(self.entries.get(path).cloned())
    }

    fn write(&mut self, path: &str, data: &str) -> Result<(), SweepError> {
        self.entries.insert(path.to_string(), data.to_string());
        Ok(())
    }

    fn children(&self, group: &str) -> Result<Vec<String>, SweepError> {
        let prefix = format!("{}/", group.trim_end_matches('/'));
        Ok(self
            .entries
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| key[prefix.len()..].split('/').next())
            .map(str::to_string)
            .sorted()
            .dedup()
            .collect())
    }
}

/// A store laid out as a directory tree: each path is a file under `root`.
#[derive(Debug)]
pub struct DirStore {
    root: PathBuf,
    options: StoreOptions,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .fold(self.root.clone(), |acc, part| acc.join(part))
    }
}

impl ResultStore for DirStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    fn read(&self, path: &str) -> Result<Option<String>, SweepError> {
        match fs::read_to_string(self.resolve(path)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&mut self, path: &str, data: &str) -> Result<(), SweepError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(target, data)?;
        Ok(())
    }

    fn children(&self, group: &str) -> Result<Vec<String>, SweepError> {
        let entries = match fs::read_dir(self.resolve(group)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut names = vec![];
        for entry in entries {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
