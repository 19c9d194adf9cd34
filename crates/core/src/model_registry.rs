use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

pub const LABELS_FILENAME: &str = "kinetics_600_labels.txt";
const LABELS_URL: &str = "https://raw.githubusercontent.com/tensorflow/models/master/official/projects/movinet/files/kinetics_600_labels.txt";

/// How the classifier consumes a clip: one shot over the whole tensor, or one
/// call per frame with recurrent state threaded between calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelMode {
    Base,
    Stream,
}

impl std::fmt::Display for ModelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Stream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for ModelMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "base" => Ok(Self::Base),
            "stream" => Ok(Self::Stream),
            other => bail!("unknown model mode '{other}': expected 'base' or 'stream'"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub mode: ModelMode,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Square side length the model expects frames at (A0 trains on 172px,
    /// A2 on 224px).
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    pub description: String,
}

fn default_input_size() -> u32 {
    crate::decode::MODEL_INPUT_SIZE
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "movinet_a0_stream".into(),
            mode: ModelMode::Stream,
            filename: "movinet_a0_stream.onnx".into(),
            url: Some(
                "https://huggingface.co/onnx-community/movinet-a0-stream/resolve/main/movinet_a0_stream.onnx"
                    .into(),
            ),
            sha256: None,
            input_size: 172,
            description: "MoViNet-A0 streaming variant, smallest and fastest".into(),
        },
        ModelEntry {
            name: "movinet_a2_stream".into(),
            mode: ModelMode::Stream,
            filename: "movinet_a2_stream.onnx".into(),
            url: Some(
                "https://huggingface.co/onnx-community/movinet-a2-stream/resolve/main/movinet_a2_stream.onnx"
                    .into(),
            ),
            sha256: None,
            input_size: 224,
            description: "MoViNet-A2 streaming variant, per-frame recurrent inference".into(),
        },
        ModelEntry {
            name: "movinet_a2_base".into(),
            mode: ModelMode::Base,
            filename: "movinet_a2_base.onnx".into(),
            url: Some(
                "https://huggingface.co/onnx-community/movinet-a2-base/resolve/main/movinet_a2_base.onnx"
                    .into(),
            ),
            sha256: None,
            input_size: 224,
            description: "MoViNet-A2 base variant, classifies the whole clip in one call".into(),
        },
    ]
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    /// Folds locally present .onnx files that are not in the built-in catalog
    /// into the registry so user-converted models can be selected by name.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);

            if !is_onnx {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };

            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, "discovered unknown ONNX model");

            let mode = if name.to_lowercase().contains("base") {
                ModelMode::Base
            } else {
                ModelMode::Stream
            };

            self.entries.push(ModelEntry {
                name,
                mode,
                filename,
                url: None,
                sha256: None,
                input_size: default_input_size(),
                description: "discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn list_by_mode(&self, mode: ModelMode) -> Vec<&ModelEntry> {
        self.entries.iter().filter(|e| e.mode == mode).collect()
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    pub fn labels_path(&self) -> PathBuf {
        self.models_dir.join(LABELS_FILENAME)
    }

    pub fn has_labels(&self) -> bool {
        self.labels_path().is_file()
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("no download URL for model: {name}"))?;

        info!(model = %name, url = %url, "downloading model");
        self.download_file(url, &entry.filename, entry.sha256.as_deref(), name)
    }

    pub fn download_labels(&self) -> Result<PathBuf> {
        info!(url = %LABELS_URL, "downloading label catalog");
        self.download_file(LABELS_URL, LABELS_FILENAME, None, "labels")
    }

    fn download_file(
        &self,
        url: &str,
        filename: &str,
        expected_sha256: Option<&str>,
        what: &str,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(filename);
        let tmp_path = self.models_dir.join(format!("{filename}.part"));

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("failed to build HTTP client for download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("failed to start download for {what}"))?;

        if !response.status().is_success() {
            let _ = fs::remove_file(&tmp_path);
            bail!(
                "download request for {what} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;

        if let Err(err) = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("failed while downloading {what} from {url}"))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = tmp_file
            .sync_all()
            .with_context(|| format!("failed to flush temp file: {}", tmp_path.display()))
        {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = expected_sha256 {
            info!(what = %what, "verifying SHA256 hash");
            let actual_hash = sha256_file(&tmp_path)?;
            if actual_hash != expected_hash {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {what}: expected {expected_hash}, got {actual_hash}");
            }
            info!(what = %what, "hash verified OK");
        } else {
            warn!(what = %what, "no SHA256 hash configured, skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to move {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(what = %what, path = %final_path.display(), "download complete");
        Ok(final_path)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.entries).context("failed to serialize model catalog")
    }

    pub fn load_json(&mut self, json: &str) -> Result<()> {
        let loaded: Vec<ModelEntry> =
            serde_json::from_str(json).context("failed to parse model catalog JSON")?;
        for entry in loaded {
            if !self.entries.iter().any(|e| e.name == entry.name) {
                self.entries.push(entry);
            }
        }
        Ok(())
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}
