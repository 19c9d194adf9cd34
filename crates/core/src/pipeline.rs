//! End-to-end analysis: decode, classify, pick the classes to track, and
//! (in streaming mode) render the visualization video.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array4;
use tracing::info;

use crate::catalog::LabelCatalog;
use crate::decode::{decode_video, DecodedVideo};
use crate::infer::{run_streaming, run_whole_video, FrameClassifier, WholeVideoClassifier};
use crate::model_registry::{ModelMode, ModelRegistry};
use crate::predictor::Predictor;
use crate::render::{render_video, RenderConfig};
use crate::topk::{select_streaming, top_k_labels, StreamingSelection};

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub model_id: String,
    pub mode: ModelMode,
    pub top_k: usize,
    /// Square side frames are decoded at, from the model's registry entry.
    pub input_size: u32,
    /// Overrides the probed source frame rate when set.
    pub video_fps_override: Option<f64>,
    pub output_path: PathBuf,
    pub render: RenderConfig,
}

#[derive(Debug, Clone)]
pub struct AnalysisReport {
    /// Best labels with probabilities, best first.
    pub top: Vec<(String, f32)>,
    /// Written visualization, absent in base mode.
    pub output_path: Option<PathBuf>,
    pub frames: usize,
    pub duration_seconds: f64,
}

/// The probed rate can be missing for containers without timing metadata;
/// an explicit override always wins.
pub fn resolve_frame_rate(override_fps: Option<f64>, probed_fps: Option<f64>) -> Result<f64> {
    let fps = override_fps.or(probed_fps).context(
        "source frame rate unknown; set analysis.video_fps in the config to supply one",
    )?;
    if !fps.is_finite() || fps <= 0.0 {
        bail!("frame rate must be positive and finite, got {}", fps);
    }
    Ok(fps)
}

/// Streaming classification without any rendering: one model call per frame,
/// then the tracked-class selection and the final frame's best labels.
pub fn classify_streaming<M: FrameClassifier>(
    model: &mut M,
    video: &Array4<f32>,
    catalog: &LabelCatalog,
    top_k: usize,
) -> Result<(StreamingSelection, Vec<(String, f32)>)> {
    let probs = run_streaming(model, video)?;
    if probs.class_count() != catalog.len() {
        bail!(
            "model produced {} classes, catalog has {} labels",
            probs.class_count(),
            catalog.len()
        );
    }

    let selection = select_streaming(&probs, top_k, catalog)?;
    let top = top_k_labels(&probs.last_row(), top_k, catalog)?;
    Ok((selection, top))
}

pub fn classify_whole<M: WholeVideoClassifier>(
    model: &mut M,
    video: &Array4<f32>,
    catalog: &LabelCatalog,
    top_k: usize,
) -> Result<Vec<(String, f32)>> {
    let probs = run_whole_video(model, video, catalog)?;
    top_k_labels(&probs, top_k, catalog)
}

/// One analysis of one clip. Owns the decoded frames, the label catalog, and
/// the predictor holding the loaded session.
pub struct AnalysisRun {
    predictor: Predictor,
    catalog: LabelCatalog,
    video: DecodedVideo,
    options: AnalysisOptions,
}

impl AnalysisRun {
    /// Decodes the clip up front so unreadable input fails before any model
    /// is loaded.
    pub fn prepare(
        video_path: &Path,
        catalog: LabelCatalog,
        options: AnalysisOptions,
    ) -> Result<Self> {
        if options.top_k == 0 {
            bail!("top_k must be at least 1");
        }

        let video = decode_video(video_path, options.input_size)
            .with_context(|| format!("failed to decode {}", video_path.display()))?;

        Ok(Self {
            predictor: Predictor::new(),
            catalog,
            video,
            options,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.video.frame_count()
    }

    pub fn run(&mut self, registry: &ModelRegistry) -> Result<AnalysisReport> {
        let frames = self.video.frame_count();
        let fps = resolve_frame_rate(self.options.video_fps_override, self.video.fps)?;
        let duration_seconds = frames as f64 / fps;
        let tensor = self.video.to_model_tensor()?;

        info!(
            model = %self.options.model_id,
            mode = %self.options.mode,
            frames,
            fps,
            "starting analysis"
        );

        let model = self.predictor.acquire(
            registry,
            &self.options.model_id,
            self.options.mode,
            &self.catalog,
        )?;

        let (top, output_path) = match self.options.mode {
            ModelMode::Stream => {
                let (selection, top) =
                    classify_streaming(model, &tensor, &self.catalog, self.options.top_k)?;

                render_video(
                    &self.video,
                    &selection,
                    fps,
                    &self.options.render,
                    &self.options.output_path,
                )?;
                (top, Some(self.options.output_path.clone()))
            }
            ModelMode::Base => {
                let top = classify_whole(model, &tensor, &self.catalog, self.options.top_k)?;
                (top, None)
            }
        };

        if let Some((label, prob)) = top.first() {
            info!(label = %label, probability = prob, "best prediction");
        }

        Ok(AnalysisReport {
            top,
            output_path,
            frames,
            duration_seconds,
        })
    }
}
