//! Realizations of the input parameters.
//!
//! Sampling schemes live outside this crate; all the runner needs is a finite
//! sequence of realizations that can restart from an offset when a design is
//! extended.

use std::str::FromStr;

use serde::Deserialize;
use void::Void;

use crate::error::ConfigError;

/// One parameter's value within a realization.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub name: String,
    pub value: f64,
    pub desc: String,
}

/// One sampled assignment of values to every input parameter, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Realization(pub Vec<Assignment>);

impl Realization {
    pub fn iter(&self) -> impl Iterator<Item = &Assignment> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A declared input parameter.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    #[serde(default)]
    pub desc: String,
}

impl FromStr for ParamInfo {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            name: s.to_string(),
            desc: String::new(),
        })
    }
}

/// A design backed by explicit rows of values.
#[derive(Debug, Clone)]
pub struct ListDesign {
    params: Vec<ParamInfo>,
    rows: Vec<Vec<f64>>,
    start_at: usize,
}

impl ListDesign {
    pub fn new(params: Vec<ParamInfo>, rows: Vec<Vec<f64>>) -> Result<Self, ConfigError> {
        let design = Self {
            params,
            rows: vec![],
            start_at: 0,
        };
        design.check(&rows)?;
        Ok(Self { rows, ..design })
    }

    fn check(&self, rows: &[Vec<f64>]) -> Result<(), ConfigError> {
        match rows.iter().find(|row| row.len() != self.params.len()) {
            Some(row) => Err(ConfigError::RealizationLength {
                expected: self.params.len(),
                found: row.len(),
            }),
            None => Ok(()),
        }
    }

    pub fn params(&self) -> &[ParamInfo] {
        &self.params
    }

    /// Total number of rows, including ones already handed out.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends rows. Subsequent calls to [`ListDesign::realizations`] yield only the new ones.
    pub fn extend(&mut self, rows: Vec<Vec<f64>>) -> Result<(), ConfigError> {
        self.check(&rows)?;
        self.start_at = self.rows.len();
        self.rows.extend(rows);
        Ok(())
    }

    /// Lazily yields realizations from the current offset.
    pub fn realizations(&self) -> impl Iterator<Item = Realization> + '_ {
        self.rows[self.start_at..].iter().map(move |row| {
            Realization(
                self.params
                    .iter()
                    .zip(row)
                    .map(|(param, &value)| Assignment {
                        name: param.name.clone(),
                        value,
                        desc: param.desc.clone(),
                    })
                    .collect(),
            )
        })
    }
}
