//! Moves finished jobs' files into the result store.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::error::SweepError;
use crate::job::{Job, JobStatus};
use crate::sentinel::{self, Value};
use crate::store::{ResultStore, JOBS_GROUP};

/// Key under each stored job that records its status when it was collected.
const STATUS_KEY: &str = "status";

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectOptions<'a> {
    /// Files each job leaves in its directory that should be kept.
    pub outfiles: &'a [String],
    /// Jobs ran in their own directories, which go once collected.
    pub newdir: bool,
}

/// Stores the stdout/stderr (and declared output files) of every job in
/// `finished` that the store does not hold yet. Returns the newly stored jobs.
///
/// Per-job failures are logged and skipped, so a second call after fixing the
/// cause picks the job up again. A job stored while in error is stored again
/// once a retry has finished it.
pub fn collect(
    jobs: &[Job],
    finished: &[usize],
    base_dir: &Path,
    options: CollectOptions,
    store: &mut dyn ResultStore,
) -> Result<Vec<usize>, SweepError> {
    let keep = store.options().keep_files;
    let known = store.job_numbers()?;
    let mut collected = vec![];

    for &n in finished {
        let Some(job) = jobs.get(n) else {
            warn!(job = n, "finished job is not in the job table");
            continue;
        };
        if known.contains(&n) {
            if !retried_since_stored(store, n, job)? {
                continue;
            }
            debug!(job = n, "collecting retried job again");
        }

        let mut stored = false;
        for (path, key) in [
            (job.stdout_path(base_dir), "stdout"),
            (job.stderr_path(base_dir), "stderr"),
        ] {
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    warn!(job = n, path = %path.display(), error = %e, "cannot read job output");
                    continue;
                }
            };
            store.write(&format!("{}/{}/{}", JOBS_GROUP, n, key), &text)?;
            stored = true;
            if !keep {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(job = n, path = %path.display(), error = %e, "cannot remove job output");
                }
            }
        }
        if !stored {
            continue;
        }
        store.write(
            &format!("{}/{}/{}", JOBS_GROUP, n, STATUS_KEY),
            &serde_yaml::to_string(&job.status)?,
        )?;

        let dir = job.dir.as_deref().unwrap_or(base_dir);
        for name in options.outfiles {
            match fs::read_to_string(dir.join(name)) {
                Ok(text) => store.write(&format!("{}/{}/{}", JOBS_GROUP, n, name), &text)?,
                Err(e) => debug!(job = n, file = %name, error = %e, "output file skipped"),
            }
        }

        if options.newdir && !keep {
            if let Some(dir) = &job.dir {
                if let Err(e) = fs::remove_dir_all(dir) {
                    warn!(job = n, dir = %dir.display(), error = %e, "cannot remove job directory");
                }
            }
        }
        collected.push(n);
    }

    if !collected.is_empty() {
        info!("Collected {} jobs", collected.len());
    }
    Ok(collected)
}

fn retried_since_stored(
    store: &dyn ResultStore,
    n: usize,
    job: &Job,
) -> Result<bool, SweepError> {
    if job.status != JobStatus::Finished {
        return Ok(false);
    }
    let stored = match store.read(&format!("{}/{}/{}", JOBS_GROUP, n, STATUS_KEY))? {
        Some(text) => serde_yaml::from_str::<JobStatus>(&text)?,
        None => return Ok(false),
    };
    Ok(stored == JobStatus::Error)
}

/// Gathers the sentinel records of every stored job into output variables,
/// plus the elapsed times under `output/jobs/time`. Returns the variable names.
///
/// Every variable holds one value per stored job in job order. A job that did
/// not report the variable contributes `None`, so positions line up with job
/// numbers across variables. A job reporting a name twice keeps the last value.
pub fn harvest(store: &mut dyn ResultStore) -> Result<Vec<String>, SweepError> {
    let numbers: Vec<usize> = store.job_numbers()?.into_iter().collect();
    let mut outputs: BTreeMap<String, (BTreeMap<usize, Value>, String)> = BTreeMap::new();
    let mut times = Vec::with_capacity(numbers.len());

    for &n in &numbers {
        if let Some(stdout) = store.read(&format!("{}/{}/stdout", JOBS_GROUP, n))? {
            for record in sentinel::records(&stdout) {
                let (values, desc) = outputs.entry(record.name).or_default();
                values.insert(n, record.value);
                if desc.is_empty() {
                    *desc = record.desc;
                }
            }
        }
        let time = match store.read(&format!("{}/{}/stderr", JOBS_GROUP, n))? {
            Some(stderr) => sentinel::records(&stderr)
                .into_iter()
                .filter(|record| record.name == "time")
                .filter_map(|record| record.value.as_f64())
                .last(),
            None => None,
        };
        times.push(time);
    }

    store.write(
        &format!("{}/time", JOBS_GROUP),
        &serde_yaml::to_string(&times)?,
    )?;
    for (name, (by_job, desc)) in &outputs {
        let values: Vec<Value> = numbers
            .iter()
            .map(|n| by_job.get(n).cloned().unwrap_or(Value::None))
            .collect();
        store.set_result(name, &values, desc)?;
    }
    Ok(outputs.into_keys().collect())
}
