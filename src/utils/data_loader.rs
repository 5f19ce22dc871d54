//! Data loading utilities
//!
//! Reads the tab-separated `.dat` splits used by the search: one sample per
//! line, comma-separated features, a tab, then an integer class label.

use std::path::Path;

use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{KolosalError, Result};

/// Input/output sizes a network builder needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetShape {
    pub num_features: usize,
    pub num_classes: usize,
}

/// Train/validation splits with integer labels
#[derive(Debug, Clone)]
pub struct Dataset {
    pub x_train: Array2<f64>,
    pub y_train: Array1<usize>,
    pub x_val: Array2<f64>,
    pub y_val: Array1<usize>,
    pub num_classes: usize,
}

impl Dataset {
    /// Build a dataset; the class count is the largest label over both splits plus one
    pub fn new(
        x_train: Array2<f64>,
        y_train: Array1<usize>,
        x_val: Array2<f64>,
        y_val: Array1<usize>,
    ) -> Result<Self> {
        let num_classes = y_train.iter().chain(y_val.iter()).copied().max().unwrap_or(0) + 1;
        let dataset = Self { x_train, y_train, x_val, y_val, num_classes };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Shape handed to model builders
    pub fn shape(&self) -> DatasetShape {
        DatasetShape {
            num_features: self.x_train.ncols(),
            num_classes: self.num_classes,
        }
    }

    /// Check split sizes and label ranges
    pub fn validate(&self) -> Result<()> {
        if self.x_train.nrows() == 0 || self.x_val.nrows() == 0 {
            return Err(KolosalError::DataError("Both splits need at least one sample".into()));
        }
        if self.x_train.nrows() != self.y_train.len() || self.x_val.nrows() != self.y_val.len() {
            return Err(KolosalError::ShapeError {
                expected: "one label per sample".to_string(),
                actual: format!(
                    "train {}/{}, val {}/{}",
                    self.x_train.nrows(),
                    self.y_train.len(),
                    self.x_val.nrows(),
                    self.y_val.len()
                ),
            });
        }
        if self.x_train.ncols() != self.x_val.ncols() || self.x_train.ncols() == 0 {
            return Err(KolosalError::ShapeError {
                expected: format!("{} features in both splits", self.x_train.ncols()),
                actual: format!("{} validation features", self.x_val.ncols()),
            });
        }
        if self.y_train.iter().chain(self.y_val.iter()).any(|&y| y >= self.num_classes) {
            return Err(KolosalError::DataError("Label outside class range".into()));
        }
        Ok(())
    }

    /// Learnable toy data: each class is a sine wave of its own frequency plus noise
    pub fn synthetic(
        n_train: usize,
        n_val: usize,
        num_features: usize,
        num_classes: usize,
        seed: u64,
    ) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut generate = |n: usize| {
            let labels: Array1<usize> = (0..n).map(|i| i % num_classes.max(1)).collect();
            let x = Array2::from_shape_fn((n, num_features), |(i, t)| {
                let freq = (labels[i] + 1) as f64;
                let phase = t as f64 * std::f64::consts::PI / num_features as f64;
                (freq * phase).sin() + 0.3 * (rng.gen::<f64>() - 0.5)
            });
            (x, labels)
        };
        let (x_train, y_train) = generate(n_train);
        let (x_val, y_val) = generate(n_val);

        Self {
            x_train,
            y_train,
            x_val,
            y_val,
            num_classes: num_classes.max(1),
        }
    }
}

/// Loader for `.dat` splits
#[derive(Debug, Clone)]
pub struct DatasetLoader {
    /// Separator between features and label
    delimiter: u8,
    /// Separator between features
    feature_delimiter: char,
}

impl Default for DatasetLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl DatasetLoader {
    pub fn new() -> Self {
        Self {
            delimiter: b'\t',
            feature_delimiter: ',',
        }
    }

    /// Set the feature/label separator
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the separator between features
    pub fn with_feature_delimiter(mut self, delimiter: char) -> Self {
        self.feature_delimiter = delimiter;
        self
    }

    /// Load one split
    pub fn load_split(&self, path: impl AsRef<Path>) -> Result<(Array2<f64>, Array1<usize>)> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut values = Vec::new();
        let mut labels = Vec::new();
        let mut width = None;

        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let (features, label) = match (record.get(0), record.get(1)) {
                (Some(f), Some(l)) => (f, l),
                _ => {
                    return Err(KolosalError::DataError(format!(
                        "{}:{}: expected '<features>\\t<label>'",
                        path.display(),
                        line + 1
                    )))
                }
            };

            let row = features
                .split(self.feature_delimiter)
                .map(|v| v.trim().parse::<f64>())
                .collect::<std::result::Result<Vec<f64>, _>>()
                .map_err(|e| {
                    KolosalError::DataError(format!("{}:{}: {}", path.display(), line + 1, e))
                })?;
            let label: usize = label.trim().parse().map_err(|e| {
                KolosalError::DataError(format!("{}:{}: bad label: {}", path.display(), line + 1, e))
            })?;

            match width {
                None => width = Some(row.len()),
                Some(w) if w != row.len() => {
                    return Err(KolosalError::ShapeError {
                        expected: format!("{} features", w),
                        actual: format!("{} features on line {}", row.len(), line + 1),
                    })
                }
                Some(_) => {}
            }

            values.extend(row);
            labels.push(label);
        }

        let width = width.ok_or_else(|| {
            KolosalError::DataError(format!("{} contains no samples", path.display()))
        })?;
        let x = Array2::from_shape_vec((labels.len(), width), values)?;
        Ok((x, Array1::from_vec(labels)))
    }

    /// Load the training and validation splits
    pub fn load(&self, train: impl AsRef<Path>, val: impl AsRef<Path>) -> Result<Dataset> {
        let (x_train, y_train) = self.load_split(train)?;
        let (x_val, y_val) = self.load_split(val)?;
        let dataset = Dataset::new(x_train, y_train, x_val, y_val)?;
        info!(
            train = dataset.x_train.nrows(),
            val = dataset.x_val.nrows(),
            features = dataset.x_train.ncols(),
            classes = dataset.num_classes,
            "Loaded dataset"
        );
        Ok(dataset)
    }
}
