//! Session construction and the streaming classifier's I/O plan.
//!
//! A streaming model carries opaque recurrent state between calls: one image
//! input plus N named state inputs, and one logits output plus one state
//! output per state input with the same name. The plan is validated once at
//! load so the per-frame loop never re-checks names.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, ArrayD, ArrayView3, ArrayView4, IxDyn};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session, SessionInputValue},
    value::{Tensor, ValueType},
};
use tracing::{debug, info, warn};

use crate::catalog::LabelCatalog;
use crate::infer::{FrameClassifier, WholeVideoClassifier};
use crate::model_registry::{ModelMode, ModelRegistry};

pub const IMAGE_INPUT_NAME: &str = "image";
pub const LOGITS_OUTPUT_NAME: &str = "logits";

/// Shape used to sanity-check state resolution at load time, before the real
/// clip dimensions are known.
const PLACEHOLDER_VIDEO_SHAPE: [usize; 5] = [1, 1, 224, 224, 3];

/// Build an `ort::Session` with CUDA EP; ORT falls back to CPU when CUDA is
/// unavailable.
pub fn build_session(model_path: &Path) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let cuda = CUDAExecutionProvider::default();
    if !cuda.is_available().unwrap_or(false) {
        warn!("CUDA EP is not available — inference will fall back to CPU");
    }

    debug!(model = %model_path.display(), "building session with CUDA EP");

    builder
        .with_execution_providers([CUDAExecutionProvider::default().build()])?
        .commit_from_file(model_path)
        .with_context(|| format!("failed to load ONNX model: {}", model_path.display()))
}

/// Declared shape of one recurrent state slot. Dims <= 0 are dynamic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl StateSpec {
    /// Resolves the declared shape against a concrete `[1, F, H, W, 3]` video
    /// shape. Only the batch axis of a state is expected to be dynamic; any
    /// other dynamic dim resolves to 1.
    fn resolve(&self, video_shape: &[usize; 5]) -> Vec<usize> {
        self.shape
            .iter()
            .enumerate()
            .map(|(axis, &dim)| {
                if dim > 0 {
                    dim as usize
                } else if axis == 0 {
                    video_shape[0]
                } else {
                    1
                }
            })
            .collect()
    }
}

/// Ordered slot name -> f32 buffer map threaded through the streaming loop.
/// Slot order is fixed at init; buffers are replaced wholesale each frame.
#[derive(Debug, Clone)]
pub struct StateMap {
    slots: Vec<(String, ArrayD<f32>)>,
}

impl StateMap {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.slots
            .iter()
            .map(|(name, buffer)| (name.as_str(), buffer))
    }

    pub fn replace(&mut self, name: &str, buffer: ArrayD<f32>) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|(slot_name, _)| slot_name == name)
            .with_context(|| format!("no state slot named '{name}'"))?;
        slot.1 = buffer;
        Ok(())
    }
}

/// Builds zero-filled state buffers for a concrete video shape. Constructed
/// once at model load from the session's input metadata.
#[derive(Debug, Clone)]
pub struct StateInitializer {
    specs: Vec<StateSpec>,
}

impl StateInitializer {
    pub fn new(specs: Vec<StateSpec>) -> Self {
        Self { specs }
    }

    pub fn slot_count(&self) -> usize {
        self.specs.len()
    }

    pub fn init_states(&self, video_shape: &[usize; 5]) -> StateMap {
        let slots = self
            .specs
            .iter()
            .map(|spec| {
                let shape = spec.resolve(video_shape);
                (spec.name.clone(), ArrayD::zeros(IxDyn(&shape)))
            })
            .collect();
        StateMap { slots }
    }
}

fn tensor_shape(value_type: &ValueType) -> Result<Vec<i64>> {
    match value_type {
        ValueType::Tensor { shape, .. } => Ok(shape.iter().copied().collect()),
        other => bail!("expected a tensor, got {other:?}"),
    }
}

/// A loaded classifier session plus its validated I/O plan.
pub struct ActionModel {
    session: Session,
    mode: ModelMode,
    image_input: String,
    logits_output: String,
    initializer: StateInitializer,
    /// `None` when the class axis is dynamic in the model metadata; validated
    /// against the catalog at first run instead.
    class_count: Option<usize>,
    states: Option<StateMap>,
}

impl ActionModel {
    pub fn load(model_path: &Path, mode: ModelMode) -> Result<Self> {
        let session = build_session(model_path)?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();

        let (image_input, state_specs) = match mode {
            ModelMode::Base => {
                if input_names.len() != 1 {
                    bail!(
                        "whole-video model must have exactly 1 input, found {}: {input_names:?}",
                        input_names.len()
                    );
                }
                (input_names[0].clone(), Vec::new())
            }
            ModelMode::Stream => {
                if !input_names.iter().any(|name| name == IMAGE_INPUT_NAME) {
                    bail!(
                        "streaming model has no '{IMAGE_INPUT_NAME}' input; inputs: {input_names:?}"
                    );
                }

                let mut specs = Vec::new();
                for input in session.inputs() {
                    if input.name() == IMAGE_INPUT_NAME {
                        continue;
                    }
                    let shape = tensor_shape(input.dtype()).with_context(|| {
                        format!("state input '{}' has unsupported type", input.name())
                    })?;
                    specs.push(StateSpec {
                        name: input.name().to_string(),
                        shape,
                    });
                }
                (IMAGE_INPUT_NAME.to_string(), specs)
            }
        };

        let logits_output = if output_names.iter().any(|name| name == LOGITS_OUTPUT_NAME) {
            LOGITS_OUTPUT_NAME.to_string()
        } else if output_names.len() == 1 {
            output_names[0].clone()
        } else {
            bail!("model has no '{LOGITS_OUTPUT_NAME}' output; outputs: {output_names:?}");
        };

        if mode == ModelMode::Stream {
            validate_state_wiring(&state_specs, &output_names, &logits_output)?;
        }

        let class_count = session
            .outputs()
            .iter()
            .find(|output| output.name() == logits_output)
            .map(|output| tensor_shape(output.dtype()))
            .transpose()?
            .and_then(|shape| shape.last().copied())
            .filter(|&c| c > 0)
            .map(|c| c as usize);

        let initializer = StateInitializer::new(state_specs);
        let placeholder = initializer.init_states(&PLACEHOLDER_VIDEO_SHAPE);

        info!(
            mode = %mode,
            state_slots = placeholder.len(),
            class_count = ?class_count,
            "model loaded"
        );

        Ok(Self {
            session,
            mode,
            image_input,
            logits_output,
            initializer,
            class_count,
            states: None,
        })
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }

    pub fn class_count(&self) -> Option<usize> {
        self.class_count
    }

    pub fn state_slot_count(&self) -> usize {
        self.initializer.slot_count()
    }
}

fn validate_state_wiring(
    state_specs: &[StateSpec],
    output_names: &[String],
    logits_output: &str,
) -> Result<()> {
    for spec in state_specs {
        if !output_names.iter().any(|name| name == &spec.name) {
            bail!(
                "state input '{}' has no matching state output; outputs: {output_names:?}",
                spec.name
            );
        }
    }
    for name in output_names {
        if name == logits_output {
            continue;
        }
        if !state_specs.iter().any(|spec| &spec.name == name) {
            bail!("state output '{name}' has no matching state input");
        }
    }
    Ok(())
}

impl FrameClassifier for ActionModel {
    fn begin(&mut self, video_shape: [usize; 5]) -> Result<()> {
        if self.mode != ModelMode::Stream {
            bail!("model was loaded in {} mode, streaming requires 'stream'", self.mode);
        }
        self.states = Some(self.initializer.init_states(&video_shape));
        Ok(())
    }

    fn step(&mut self, frame: ArrayView3<'_, f32>) -> Result<Array1<f32>> {
        let states = self
            .states
            .as_ref()
            .context("streaming state not initialized: call begin() first")?;

        let (height, width, channels) = frame.dim();
        if channels != 3 {
            bail!("frame must have 3 channels, got {channels}");
        }

        let image = frame
            .to_owned()
            .into_shape_with_order((1, 1, height, width, 3))
            .context("failed to reshape frame for the image input")?;

        let mut feeds: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            Vec::with_capacity(1 + states.len());
        feeds.push((
            Cow::Owned(self.image_input.clone()),
            Tensor::from_array(image)?.into(),
        ));
        for (name, buffer) in states.iter() {
            feeds.push((
                Cow::Owned(name.to_string()),
                Tensor::from_array(buffer.clone())?.into(),
            ));
        }

        let outputs = self.session.run(feeds)?;
        let logits_view = outputs[self.logits_output.as_str()]
            .try_extract_array::<f32>()
            .with_context(|| format!("output '{}' is not an f32 tensor", self.logits_output))?;
        let logits = Array1::from_iter(logits_view.iter().copied());

        // Replacement, not accumulation: each call's state outputs become the
        // next call's state inputs wholesale.
        let slot_names: Vec<String> = states.iter().map(|(name, _)| name.to_string()).collect();
        let states = self
            .states
            .as_mut()
            .ok_or_else(|| anyhow!("streaming state vanished mid-step"))?;
        for name in &slot_names {
            let replacement = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .with_context(|| format!("state output '{name}' is not an f32 tensor"))?
                .to_owned();
            states.replace(name, replacement)?;
        }

        Ok(logits)
    }
}

impl WholeVideoClassifier for ActionModel {
    fn classify(&mut self, video: ArrayView4<'_, f32>) -> Result<Array1<f32>> {
        if self.mode != ModelMode::Base {
            bail!("model was loaded in {} mode, whole-video requires 'base'", self.mode);
        }

        let (frames, height, width, channels) = video.dim();
        if channels != 3 {
            bail!("video must have 3 channels, got {channels}");
        }

        let batched = video
            .to_owned()
            .into_shape_with_order((1, frames, height, width, 3))
            .context("failed to reshape clip for the image input")?;

        let tensor = Tensor::from_array(batched)?;
        let input_name = self.image_input.clone();
        let outputs = self
            .session
            .run(ort::inputs![input_name.as_str() => &tensor])?;
        let view = outputs[self.logits_output.as_str()]
            .try_extract_array::<f32>()
            .with_context(|| format!("output '{}' is not an f32 tensor", self.logits_output))?;
        Ok(Array1::from_iter(view.iter().copied()))
    }
}

/// Caches the live model keyed by `(name, mode)`. Re-requesting the same pair
/// is a no-op; a different pair replaces the previous model, so at most one
/// session is resident.
pub struct Predictor {
    loaded: Option<((String, ModelMode), ActionModel)>,
}

impl Predictor {
    pub fn new() -> Self {
        Self { loaded: None }
    }

    pub fn loaded_key(&self) -> Option<(&str, ModelMode)> {
        self.loaded
            .as_ref()
            .map(|((name, mode), _)| (name.as_str(), *mode))
    }

    pub fn acquire(
        &mut self,
        registry: &ModelRegistry,
        name: &str,
        mode: ModelMode,
        catalog: &LabelCatalog,
    ) -> Result<&mut ActionModel> {
        let key = (name.to_string(), mode);
        let cached = matches!(&self.loaded, Some((loaded_key, _)) if *loaded_key == key);

        if !cached {
            let model_path = registry
                .model_path(name)
                .with_context(|| format!("unknown model: {name}"))?;
            if !model_path.is_file() {
                bail!(
                    "model '{name}' is not downloaded (expected at {})",
                    model_path.display()
                );
            }

            let model = ActionModel::load(&model_path, mode)?;
            if let Some(class_count) = model.class_count() {
                catalog.expect_len(class_count)?;
            }

            if self.loaded.is_some() {
                debug!(model = %name, "replacing previously loaded model");
            }
            self.loaded = Some((key, model));
        }

        self.loaded
            .as_mut()
            .map(|(_, model)| model)
            .context("model cache empty after load")
    }
}

impl Default for Predictor {
    fn default() -> Self {
        Self::new()
    }
}
