use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Ordered list of class labels. Row `i` of the model's output corresponds to
/// `labels[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelCatalog {
    labels: Vec<String>,
}

impl LabelCatalog {
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            bail!("label catalog must contain at least one label");
        }
        Ok(Self { labels })
    }

    /// Loads a catalog from a text file with one label per line. Blank lines
    /// are skipped; surrounding whitespace is trimmed.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read label file: {}", path.display()))?;

        let labels: Vec<String> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        Self::new(labels).with_context(|| format!("invalid label file: {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn label(&self, index: usize) -> Result<&str> {
        self.labels
            .get(index)
            .map(String::as_str)
            .with_context(|| {
                format!(
                    "class index {index} out of range for catalog of {} labels",
                    self.labels.len()
                )
            })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Fails when the model's class axis does not line up with this catalog.
    pub fn expect_len(&self, class_count: usize) -> Result<()> {
        if self.labels.len() != class_count {
            bail!(
                "label catalog size mismatch: model produces {class_count} classes, catalog has {} labels",
                self.labels.len()
            );
        }
        Ok(())
    }
}
