//! Recurrent inference over a decoded clip.
//!
//! The streaming loop is inherently sequential: each frame's call consumes the
//! state produced by the previous call, so frame order is part of the result.

use anyhow::{bail, Context, Result};
use ndarray::{Array1, Array2, ArrayView3, ArrayView4, Axis};
use tracing::debug;

use crate::catalog::LabelCatalog;

/// One model call per frame with recurrent state threaded between calls.
pub trait FrameClassifier {
    /// Resets the recurrent state for a clip of the given `[1, F, H, W, 3]`
    /// shape. Must be called before the first [`FrameClassifier::step`].
    fn begin(&mut self, video_shape: [usize; 5]) -> Result<()>;

    /// Runs one frame through the model and returns the raw logits row.
    fn step(&mut self, frame: ArrayView3<'_, f32>) -> Result<Array1<f32>>;
}

/// Single call over the entire clip tensor.
pub trait WholeVideoClassifier {
    fn classify(&mut self, video: ArrayView4<'_, f32>) -> Result<Array1<f32>>;
}

/// Row-wise probability matrix `[F, C]`: one softmaxed distribution per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMatrix(Array2<f32>);

impl ProbabilityMatrix {
    pub fn from_logits(logits: Array2<f32>) -> Self {
        let mut probs = logits;
        for mut row in probs.rows_mut() {
            softmax_in_place(row.as_slice_mut().expect("row is contiguous"));
        }
        Self(probs)
    }

    pub fn frame_count(&self) -> usize {
        self.0.nrows()
    }

    pub fn class_count(&self) -> usize {
        self.0.ncols()
    }

    /// Distribution after the final frame: the model's current best guess.
    pub fn last_row(&self) -> Array1<f32> {
        self.0.row(self.0.nrows() - 1).to_owned()
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.0
    }

    /// Confidence trajectory of one class across all frames.
    pub fn class_curve(&self, class_index: usize) -> Array1<f32> {
        self.0.index_axis(Axis(1), class_index).to_owned()
    }
}

/// Numerically stable softmax: shift by the max before exponentiating.
pub fn softmax_in_place(values: &mut [f32]) {
    if values.is_empty() {
        return;
    }
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for value in values.iter_mut() {
        *value = (*value - max).exp();
        sum += *value;
    }
    for value in values.iter_mut() {
        *value /= sum;
    }
}

pub fn softmax(values: &Array1<f32>) -> Array1<f32> {
    let mut out = values.clone();
    if let Some(slice) = out.as_slice_mut() {
        softmax_in_place(slice);
    }
    out
}

/// Runs the streaming model over every frame strictly in order and stacks the
/// per-frame distributions into `[F, C]`.
pub fn run_streaming<M: FrameClassifier>(
    model: &mut M,
    video: &ndarray::Array4<f32>,
) -> Result<ProbabilityMatrix> {
    let (frame_count, height, width, channels) = video.dim();
    if frame_count == 0 {
        bail!("cannot run streaming inference on an empty clip");
    }

    model.begin([1, frame_count, height, width, channels])?;

    let mut rows: Vec<Array1<f32>> = Vec::with_capacity(frame_count);
    let mut class_count: Option<usize> = None;

    for (frame_index, frame) in video.axis_iter(Axis(0)).enumerate() {
        let logits = model
            .step(frame)
            .with_context(|| format!("inference failed at frame {frame_index}"))?;

        match class_count {
            None => class_count = Some(logits.len()),
            Some(expected) if logits.len() != expected => {
                bail!(
                    "frame {frame_index} produced {} logits, expected {expected}",
                    logits.len()
                );
            }
            _ => {}
        }
        rows.push(logits);
    }

    let class_count = class_count.context("no logits produced")?;
    let mut logits = Array2::zeros((frame_count, class_count));
    for (frame_index, row) in rows.into_iter().enumerate() {
        logits.row_mut(frame_index).assign(&row);
    }

    debug!(frames = frame_count, classes = class_count, "streaming inference complete");
    Ok(ProbabilityMatrix::from_logits(logits))
}

/// Classifies the entire clip in one call, for the non-streaming baseline.
/// The returned vector length must match the catalog exactly.
pub fn run_whole_video<M: WholeVideoClassifier>(
    model: &mut M,
    video: &ndarray::Array4<f32>,
    catalog: &LabelCatalog,
) -> Result<Array1<f32>> {
    if video.dim().0 == 0 {
        bail!("cannot classify an empty clip");
    }

    let logits = model.classify(video.view())?;
    if logits.len() != catalog.len() {
        bail!(
            "model produced {} scores, catalog has {} labels",
            logits.len(),
            catalog.len()
        );
    }

    Ok(softmax(&logits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, Array4};

    /// Deterministic stand-in whose output depends on everything it has seen,
    /// mimicking recurrent state.
    struct RunningSumModel {
        accumulated: f32,
        begun: bool,
    }

    impl RunningSumModel {
        fn new() -> Self {
            Self {
                accumulated: 0.0,
                begun: false,
            }
        }
    }

    impl FrameClassifier for RunningSumModel {
        fn begin(&mut self, _video_shape: [usize; 5]) -> Result<()> {
            self.accumulated = 0.0;
            self.begun = true;
            Ok(())
        }

        fn step(&mut self, frame: ArrayView3<'_, f32>) -> Result<Array1<f32>> {
            assert!(self.begun, "begin() must run before step()");
            self.accumulated = self.accumulated * 0.5 + frame.sum();
            Ok(arr1(&[self.accumulated, -self.accumulated, 0.0]))
        }
    }

    struct FixedVectorModel {
        scores: Vec<f32>,
    }

    impl WholeVideoClassifier for FixedVectorModel {
        fn classify(&mut self, _video: ArrayView4<'_, f32>) -> Result<Array1<f32>> {
            Ok(Array1::from_vec(self.scores.clone()))
        }
    }

    fn ramp_video(frames: usize) -> Array4<f32> {
        Array4::from_shape_fn((frames, 2, 2, 3), |(f, h, w, c)| {
            (f * 100 + h * 10 + w * 3 + c) as f32 / 100.0
        })
    }

    fn reversed(video: &Array4<f32>) -> Array4<f32> {
        let mut frames: Vec<_> = video.axis_iter(Axis(0)).map(|f| f.to_owned()).collect();
        frames.reverse();
        let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
        ndarray::stack(Axis(0), &views).expect("stack reversed frames")
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let probs = ProbabilityMatrix::from_logits(arr2(&[
            [1.0, 2.0, 3.0],
            [0.0, 0.0, 0.0],
            [-5.0, 10.0, 2.5],
        ]));

        for row in probs.matrix().rows() {
            let sum: f32 = row.sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn softmax_is_stable_for_large_logits() {
        let out = softmax(&arr1(&[1000.0, 1001.0, 999.0]));
        assert!(out.iter().all(|p| p.is_finite()));
        assert!((out.sum() - 1.0).abs() < 1e-5);
        assert!(out[1] > out[0] && out[0] > out[2]);
    }

    #[test]
    fn streaming_produces_one_row_per_frame() {
        let video = ramp_video(4);
        let mut model = RunningSumModel::new();
        let probs = run_streaming(&mut model, &video).unwrap();

        assert_eq!(probs.frame_count(), 4);
        assert_eq!(probs.class_count(), 3);
        assert_eq!(probs.last_row().len(), 3);
    }

    #[test]
    fn streaming_is_order_sensitive() {
        let video = ramp_video(3);
        let flipped = reversed(&video);

        let forward = run_streaming(&mut RunningSumModel::new(), &video).unwrap();
        let backward = run_streaming(&mut RunningSumModel::new(), &flipped).unwrap();

        assert_ne!(
            forward.last_row(),
            backward.last_row(),
            "frame order must affect the result"
        );
    }

    #[test]
    fn streaming_is_deterministic() {
        let video = ramp_video(3);
        let first = run_streaming(&mut RunningSumModel::new(), &video).unwrap();
        let second = run_streaming(&mut RunningSumModel::new(), &video).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn streaming_single_frame_clip() {
        let video = ramp_video(1);
        let probs = run_streaming(&mut RunningSumModel::new(), &video).unwrap();
        assert_eq!(probs.frame_count(), 1);
        assert_eq!(probs.last_row(), probs.matrix().row(0).to_owned());
    }

    #[test]
    fn streaming_empty_clip_is_error() {
        let video = Array4::<f32>::zeros((0, 2, 2, 3));
        assert!(run_streaming(&mut RunningSumModel::new(), &video).is_err());
    }

    #[test]
    fn class_curve_tracks_one_column() {
        let probs = ProbabilityMatrix::from_logits(arr2(&[[5.0, 0.0], [0.0, 5.0]]));
        let curve = probs.class_curve(0);
        assert_eq!(curve.len(), 2);
        assert!(curve[0] > 0.9 && curve[1] < 0.1);
    }

    #[test]
    fn whole_video_length_mismatch_is_error() {
        let catalog = LabelCatalog::new(vec!["run".into(), "jump".into()]).unwrap();
        let video = ramp_video(2);

        let mut wrong = FixedVectorModel {
            scores: vec![1.0, 2.0, 3.0],
        };
        let err = run_whole_video(&mut wrong, &video, &catalog).expect_err("length mismatch");
        assert!(err.to_string().contains("catalog has 2 labels"));

        let mut right = FixedVectorModel {
            scores: vec![1.0, 2.0],
        };
        let probs = run_whole_video(&mut right, &video, &catalog).unwrap();
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        assert!(probs[1] > probs[0]);
    }
}
