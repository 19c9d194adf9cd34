//! Composes the visualization frames: source frame on top, probability
//! chart below, rasterized with plotters into an RGB canvas and scaled to
//! the configured output height.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::Array3;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters_bitmap::BitMapBackendError;
use tracing::{debug, info};

use crate::config::{DEFAULT_FIGURE_HEIGHT, DEFAULT_OUTPUT_FPS, DEFAULT_PLAYHEAD_SCALE};
use crate::decode::DecodedVideo;
use crate::encode::{EncoderConfig, VideoEncoder};
use crate::topk::StreamingSelection;

/// Working canvas width before output scaling.
const CANVAS_WIDTH: usize = 640;
/// Height of the source-frame band at the top of the canvas.
const TOP_HEIGHT: usize = 360;
/// Height of the chart band below it.
const CHART_HEIGHT: usize = 300;
/// Probabilities below this are clamped before log-scale plotting.
const PROBABILITY_FLOOR: f64 = 1e-6;
const OUTPUT_CRF: i64 = 18;

type PlotResult = Result<(), DrawingAreaErrorKind<BitMapBackendError>>;

#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Final frame height in pixels; width follows from the canvas aspect.
    pub figure_height: u32,
    /// The playhead line starts at `min(curves) * playhead_scale`.
    pub playhead_scale: f64,
    pub output_fps: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            figure_height: DEFAULT_FIGURE_HEIGHT,
            playhead_scale: DEFAULT_PLAYHEAD_SCALE as f64,
            output_fps: DEFAULT_OUTPUT_FPS,
        }
    }
}

/// Pixel geometry shared by every frame of one render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FigureLayout {
    pub canvas_width: usize,
    pub canvas_height: usize,
    pub top_height: usize,
    pub out_width: usize,
    pub out_height: usize,
}

impl FigureLayout {
    pub fn from_config(config: &RenderConfig) -> Self {
        let canvas_height = TOP_HEIGHT + CHART_HEIGHT;
        let out_height = sanitize_dimension(config.figure_height);
        let scaled_width =
            (CANVAS_WIDTH as f64 * out_height as f64 / canvas_height as f64).round() as u32;
        let out_width = sanitize_dimension(scaled_width);

        Self {
            canvas_width: CANVAS_WIDTH,
            canvas_height,
            top_height: TOP_HEIGHT,
            out_width,
            out_height,
        }
    }
}

/// Region of an image in pixel coordinates, `x1`/`y1` exclusive.
#[derive(Debug, Clone, Copy)]
pub struct Rect {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl Rect {
    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }
}

/// Clamps a dimension to at least 2 and rounds down to an even value, which
/// yuv420p output requires.
pub fn sanitize_dimension(dim: u32) -> usize {
    let s = dim.max(2);
    (s - s % 2) as usize
}

/// Rasterizes a plotters scene into a rectangular region of `image`.
///
/// The closure draws onto a temporary buffer-backed drawing area sized to
/// `rect`; the buffer is then copied back into the image.
pub fn paint_plot<F>(image: &mut Array3<u8>, rect: Rect, mut draw: F) -> Result<()>
where
    F: FnMut(DrawingArea<BitMapBackend<'_>, Shift>) -> PlotResult,
{
    let (img_h, img_w, _) = image.dim();
    if rect.x1 > img_w || rect.y1 > img_h || rect.x0 >= rect.x1 || rect.y0 >= rect.y1 {
        bail!(
            "plot region ({},{})..({},{}) outside {}x{} image",
            rect.x0,
            rect.y0,
            rect.x1,
            rect.y1,
            img_w,
            img_h
        );
    }

    let w = rect.width();
    let h = rect.height();
    let mut buffer = vec![0u8; w * h * 3];

    {
        let area = BitMapBackend::with_buffer(&mut buffer, (w as u32, h as u32))
            .into_drawing_area();
        area.fill(&WHITE)
            .map_err(|e| anyhow::anyhow!("failed to clear plot region: {}", e))?;
        draw(area).map_err(|e| anyhow::anyhow!("failed to draw plot: {}", e))?;
    }

    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            for c in 0..3 {
                image[[rect.y0 + y, rect.x0 + x, c]] = buffer[src + c];
            }
        }
    }

    Ok(())
}

/// Nearest-neighbor resize of a packed RGB buffer, pixel-center sampling.
pub fn resize_nearest(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dy in 0..dst_h {
        let sy = (((dy as f64 + 0.5) * src_h as f64 / dst_h as f64) as usize).min(src_h - 1);
        for dx in 0..dst_w {
            let sx = (((dx as f64 + 0.5) * src_w as f64 / dst_w as f64) as usize).min(src_w - 1);
            let s = (sy * src_w + sx) * 3;
            let d = (dy * dst_w + dx) * 3;
            dst[d..d + 3].copy_from_slice(&src[s..s + 3]);
        }
    }

    dst
}

/// Bilinear resize of a packed RGB buffer.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * 3];

    for dy in 0..dst_h {
        let sy = ((dy as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5)
            .clamp(0.0, (src_h - 1) as f64);
        let y0 = sy as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = sy - y0 as f64;

        for dx in 0..dst_w {
            let sx = ((dx as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5)
                .clamp(0.0, (src_w - 1) as f64);
            let x0 = sx as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = sx - x0 as f64;

            let d = (dy * dst_w + dx) * 3;
            for c in 0..3 {
                let p00 = src[(y0 * src_w + x0) * 3 + c] as f64;
                let p01 = src[(y0 * src_w + x1) * 3 + c] as f64;
                let p10 = src[(y1 * src_w + x0) * 3 + c] as f64;
                let p11 = src[(y1 * src_w + x1) * 3 + c] as f64;

                let top = p00 + (p01 - p00) * fx;
                let bot = p10 + (p11 - p10) * fx;
                let v = top + (bot - top) * fy;
                dst[d + c] = v.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}

/// Chart bounds derived from the tracked curves. The lower bound leaves room
/// for the playhead line, which dips to `min * playhead_scale`.
fn value_bounds(selection: &StreamingSelection, playhead_scale: f64) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in selection.curves.iter() {
        let v = (v as f64).max(PROBABILITY_FLOOR);
        min = min.min(v);
        max = max.max(v);
    }

    let min = (min * playhead_scale).max(PROBABILITY_FLOOR);
    let max = if max > min { max } else { min * 10.0 };
    (min, max)
}

/// Copies `frame` into the top band of the canvas, aspect-preserved and
/// centered on white.
fn blit_source_frame(canvas: &mut Array3<u8>, frame: &Array3<u8>, layout: &FigureLayout) -> Result<()> {
    let (fh, fw, fc) = frame.dim();
    if fc != 3 || fh == 0 || fw == 0 {
        bail!("expected a non-empty HxWx3 frame, got {}x{}x{}", fh, fw, fc);
    }

    let scale = (layout.canvas_width as f64 / fw as f64)
        .min(layout.top_height as f64 / fh as f64);
    let tw = ((fw as f64 * scale) as usize).max(1);
    let th = ((fh as f64 * scale) as usize).max(1);

    let src: Cow<'_, [u8]> = match frame.as_slice() {
        Some(s) => Cow::Borrowed(s),
        None => Cow::Owned(frame.iter().copied().collect()),
    };
    let scaled = resize_nearest(&src, fw, fh, tw, th);

    let ox = (layout.canvas_width - tw) / 2;
    let oy = (layout.top_height - th) / 2;
    for y in 0..th {
        for x in 0..tw {
            let s = (y * tw + x) * 3;
            for c in 0..3 {
                canvas[[oy + y, ox + x, c]] = scaled[s + c];
            }
        }
    }

    Ok(())
}

/// Timestamp of frame `s` with the clip's frames spaced linearly over
/// `[0, duration]`, so the final frame lands exactly at `duration`.
fn frame_time(s: usize, frames: usize, duration: f64) -> f64 {
    if frames < 2 {
        return 0.0;
    }
    s as f64 * duration / (frames - 1) as f64
}

fn draw_chart(
    canvas: &mut Array3<u8>,
    selection: &StreamingSelection,
    step: usize,
    duration: f64,
    layout: &FigureLayout,
    playhead_scale: f64,
) -> Result<()> {
    let frames = selection.frame_count();
    let (y_min, y_max) = value_bounds(selection, playhead_scale);
    let x_max = if duration > 0.0 { duration } else { 1.0 };
    let t_at = |s: usize| frame_time(s, frames, x_max);

    let rect = Rect {
        x0: 0,
        y0: layout.top_height,
        x1: layout.canvas_width,
        y1: layout.canvas_height,
    };

    paint_plot(canvas, rect, |area| {
        let mut chart = ChartBuilder::on(&area)
            .margin(8)
            .x_label_area_size(28)
            .y_label_area_size(48)
            .build_cartesian_2d(0f64..x_max, (y_min..y_max).log_scale())?;

        chart
            .configure_mesh()
            .x_desc("time (s)")
            .y_desc("probability")
            .label_style(("sans-serif", 13))
            .light_line_style(&WHITE)
            .draw()?;

        for (row, _label) in selection.labels.iter().enumerate() {
            let color = Palette99::pick(row);
            let full: Vec<(f64, f64)> = (0..frames)
                .map(|s| {
                    (
                        t_at(s),
                        (selection.curves[[row, s]] as f64).max(PROBABILITY_FLOOR),
                    )
                })
                .collect();

            // Faint reference over the whole clip, no legend entry.
            chart.draw_series(std::iter::once(PathElement::new(
                full.clone(),
                ShapeStyle::from(&color.mix(0.25)).stroke_width(1),
            )))?;
        }

        for (row, label) in selection.labels.iter().enumerate() {
            let color = Palette99::pick(row);
            let partial: Vec<(f64, f64)> = (0..=step.min(frames - 1))
                .map(|s| {
                    (
                        t_at(s),
                        (selection.curves[[row, s]] as f64).max(PROBABILITY_FLOOR),
                    )
                })
                .collect();

            chart
                .draw_series(std::iter::once(PathElement::new(
                    partial,
                    ShapeStyle::from(&color).stroke_width(2),
                )))?
                .label(label.clone())
                .legend(move |(x, y)| {
                    PathElement::new(
                        vec![(x, y), (x + 16, y)],
                        ShapeStyle::from(&color).stroke_width(2),
                    )
                });
        }

        let t = t_at(step.min(frames - 1));
        chart.draw_series(std::iter::once(PathElement::new(
            vec![(t, y_min), (t, y_max)],
            ShapeStyle::from(&RED).stroke_width(2),
        )))?;
        chart.draw_series(std::iter::once(Circle::new((t, y_max), 3, RED.filled())))?;

        chart
            .configure_series_labels()
            .position(SeriesLabelPosition::UpperRight)
            .background_style(&WHITE.mix(0.85))
            .border_style(&BLACK)
            .draw()?;

        Ok(())
    })
}

/// Renders the composed frame for one playhead position as packed RGB bytes
/// at the layout's output dimensions.
pub fn render_step(
    frame: &Array3<u8>,
    selection: &StreamingSelection,
    step: usize,
    duration: f64,
    layout: &FigureLayout,
    playhead_scale: f64,
) -> Result<Vec<u8>> {
    if selection.frame_count() == 0 {
        bail!("cannot render with empty probability curves");
    }

    let mut canvas =
        Array3::<u8>::from_elem((layout.canvas_height, layout.canvas_width, 3), 255u8);

    blit_source_frame(&mut canvas, frame, layout)?;
    draw_chart(&mut canvas, selection, step, duration, layout, playhead_scale)?;

    let flat = canvas
        .as_slice()
        .context("canvas buffer is not contiguous")?;
    Ok(resize_bilinear(
        flat,
        layout.canvas_width,
        layout.canvas_height,
        layout.out_width,
        layout.out_height,
    ))
}

/// Renders one visualization frame per decoded source frame and encodes the
/// result. On any failure the partial output file is removed.
pub fn render_video(
    video: &DecodedVideo,
    selection: &StreamingSelection,
    video_fps: f64,
    config: &RenderConfig,
    output_path: &Path,
) -> Result<()> {
    let frames = video.frame_count();
    if frames != selection.frame_count() {
        bail!(
            "curve length {} does not match frame count {}",
            selection.frame_count(),
            frames
        );
    }
    if video_fps <= 0.0 {
        bail!("source frame rate must be positive, got {}", video_fps);
    }

    let layout = FigureLayout::from_config(config);
    let duration = frames as f64 / video_fps;

    let mut encoder = VideoEncoder::new(&EncoderConfig {
        output_path: output_path.to_path_buf(),
        width: layout.out_width as u32,
        height: layout.out_height as u32,
        fps: config.output_fps,
        crf: OUTPUT_CRF,
    })?;

    info!(
        frames,
        width = layout.out_width,
        height = layout.out_height,
        output = %output_path.display(),
        "rendering visualization"
    );

    for (step, frame) in video.frames.iter().enumerate() {
        let rgb = match render_step(frame, selection, step, duration, &layout, config.playhead_scale)
        {
            Ok(rgb) => rgb,
            Err(e) => {
                encoder.abort();
                return Err(e.context(format!("failed to render frame {}", step)));
            }
        };
        if let Err(e) = encoder.write_frame(&rgb) {
            encoder.abort();
            return Err(e.context(format!("failed to encode frame {}", step)));
        }
    }

    encoder.finish()?;
    debug!(frames, "visualization render complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn sample_selection() -> StreamingSelection {
        let curves = Array2::from_shape_vec(
            (2, 4),
            vec![0.6, 0.5, 0.4, 0.3, 0.1, 0.2, 0.3, 0.4],
        )
        .unwrap();
        StreamingSelection {
            indices: vec![0, 1],
            curves,
            labels: vec!["run".to_string(), "jump".to_string()],
        }
    }

    #[test]
    fn test_sanitize_dimension() {
        assert_eq!(sanitize_dimension(0), 2);
        assert_eq!(sanitize_dimension(1), 2);
        assert_eq!(sanitize_dimension(2), 2);
        assert_eq!(sanitize_dimension(499), 498);
        assert_eq!(sanitize_dimension(500), 500);
    }

    #[test]
    fn test_layout_dimensions_even() {
        let layout = FigureLayout::from_config(&RenderConfig::default());
        assert_eq!(layout.out_height % 2, 0);
        assert_eq!(layout.out_width % 2, 0);
        assert_eq!(layout.out_height, 500);
    }

    #[test]
    fn test_layout_preserves_canvas_aspect() {
        let layout = FigureLayout::from_config(&RenderConfig::default());
        let canvas_aspect = layout.canvas_width as f64 / layout.canvas_height as f64;
        let out_aspect = layout.out_width as f64 / layout.out_height as f64;
        assert!((canvas_aspect - out_aspect).abs() < 0.02);
    }

    #[test]
    fn test_resize_nearest_identity() {
        let src: Vec<u8> = (0..2 * 2 * 3).map(|v| v as u8).collect();
        assert_eq!(resize_nearest(&src, 2, 2, 2, 2), src);
    }

    #[test]
    fn test_resize_nearest_upscale_solid() {
        let src = vec![7u8; 2 * 2 * 3];
        let dst = resize_nearest(&src, 2, 2, 5, 5);
        assert_eq!(dst.len(), 5 * 5 * 3);
        assert!(dst.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_resize_bilinear_solid_color_preserved() {
        let src = vec![200u8; 4 * 4 * 3];
        let dst = resize_bilinear(&src, 4, 4, 7, 3);
        assert_eq!(dst.len(), 7 * 3 * 3);
        assert!(dst.iter().all(|&v| v == 200));
    }

    #[test]
    fn test_resize_bilinear_interpolates() {
        // Two-pixel gradient: midpoint samples land between the endpoints.
        let src = vec![0, 0, 0, 100, 100, 100];
        let dst = resize_bilinear(&src, 2, 1, 4, 1);
        assert_eq!(dst.len(), 4 * 3);
        assert!(dst[3] > 0 && dst[3] < 100);
        assert!(dst[6] > dst[3]);
    }

    #[test]
    fn test_value_bounds_leaves_playhead_room() {
        let selection = sample_selection();
        let (min, max) = value_bounds(&selection, 0.8);
        assert!((min - (0.1f32 as f64) * 0.8).abs() < 1e-9);
        assert!((max - 0.6f32 as f64).abs() < 1e-9);
    }

    #[test]
    fn test_frame_time_linspace_endpoints() {
        assert_eq!(frame_time(0, 8, 0.5), 0.0);
        assert!((frame_time(7, 8, 0.5) - 0.5).abs() < 1e-12);
        assert!((frame_time(3, 8, 0.5) - 3.0 * 0.5 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_frame_time_single_frame_clip() {
        assert_eq!(frame_time(0, 1, 2.0), 0.0);
        assert_eq!(frame_time(0, 0, 2.0), 0.0);
    }

    #[test]
    fn test_value_bounds_degenerate_curves() {
        let curves = Array2::from_elem((1, 3), 0.5f32);
        let selection = StreamingSelection {
            indices: vec![0],
            curves,
            labels: vec!["run".to_string()],
        };
        let (min, max) = value_bounds(&selection, 1.0);
        assert!(max > min);
    }

    #[test]
    #[ignore = "chart text needs a system sans-serif font"]
    fn test_render_step_output_size() {
        let selection = sample_selection();
        let layout = FigureLayout::from_config(&RenderConfig::default());
        let frame = Array3::<u8>::from_elem((8, 8, 3), 120u8);

        let rgb = render_step(&frame, &selection, 1, 0.5, &layout, 0.8).unwrap();
        assert_eq!(rgb.len(), layout.out_width * layout.out_height * 3);
    }

    #[test]
    #[ignore = "chart text needs a system sans-serif font"]
    fn test_render_step_clamps_step_past_end() {
        let selection = sample_selection();
        let layout = FigureLayout::from_config(&RenderConfig::default());
        let frame = Array3::<u8>::from_elem((8, 8, 3), 120u8);

        // Out-of-range playhead positions clamp to the final frame.
        assert!(render_step(&frame, &selection, 99, 0.5, &layout, 0.8).is_ok());
    }

    #[test]
    fn test_paint_plot_rejects_out_of_bounds_rect() {
        let mut image = Array3::<u8>::zeros((10, 10, 3));
        let rect = Rect {
            x0: 0,
            y0: 0,
            x1: 20,
            y1: 10,
        };
        assert!(paint_plot(&mut image, rect, |_| Ok(())).is_err());
    }

    #[test]
    fn test_paint_plot_fills_region_white() {
        let mut image = Array3::<u8>::zeros((10, 10, 3));
        let rect = Rect {
            x0: 2,
            y0: 2,
            x1: 8,
            y1: 8,
        };
        paint_plot(&mut image, rect, |_| Ok(())).unwrap();
        assert_eq!(image[[4, 4, 0]], 255);
        assert_eq!(image[[0, 0, 0]], 0);
    }
}
