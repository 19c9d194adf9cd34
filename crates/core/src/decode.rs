use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array3, Array4};
use tracing::{debug, warn};

/// Default square side frames are stretched to during decode. Model entries
/// can override this when the classifier was trained at another resolution.
pub const MODEL_INPUT_SIZE: u32 = 224;

const SUPPORTED_EXTENSIONS: [&str; 2] = ["mp4", "gif"];

// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
pub struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(serde::Deserialize, Debug)]
#[allow(dead_code)]
struct FfprobeStream {
    index: usize,
    codec_name: Option<String>,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    format_name: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() == 2 {
        let num: f64 = parts[0].parse().ok()?;
        let den: f64 = parts[1].parse().ok()?;
        if den > 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }
    s.parse().ok().filter(|fps| *fps > 0.0)
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| {
            value
                .as_bool()
                .or_else(|| value.as_i64().map(|n| n != 0))
                .or_else(|| value.as_str().map(|s| s != "0"))
        })
        .unwrap_or(false)
}

fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| {
            let is_attached_picture = disposition_flag(stream, "attached_pic");
            let is_default = disposition_flag(stream, "default");
            (is_attached_picture, !is_default, stream.index)
        })
}

/// Rejects anything that is not an .mp4 or .gif before ffprobe ever runs.
pub fn ensure_supported_container(path: &Path) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        bail!(
            "unsupported input format '{}': expected one of {:?}",
            if extension.is_empty() {
                "<none>"
            } else {
                extension.as_str()
            },
            SUPPORTED_EXTENSIONS
        );
    }
    Ok(())
}

pub fn run_ffprobe(path: &Path) -> Result<FfprobeOutput> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe — is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_ffprobe_json(&output.stdout)
}

pub fn parse_ffprobe_json(json: &[u8]) -> Result<FfprobeOutput> {
    serde_json::from_slice(json).context("failed to parse ffprobe JSON")
}

#[derive(Debug, Clone)]
pub struct VideoProbe {
    pub stream_index: usize,
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    pub codec_name: String,
    pub container_format: String,
}

pub fn extract_probe(probe: &FfprobeOutput, source_path: &Path) -> Result<VideoProbe> {
    let video_stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found in {}", source_path.display()))?;

    let width = video_stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video_stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let fps_str = video_stream
        .r_frame_rate
        .as_deref()
        .or(video_stream.avg_frame_rate.as_deref())
        .unwrap_or("0/0");
    let fps = parse_frame_rate(fps_str);
    if fps.is_none() {
        warn!("could not determine source frame rate (got {fps_str})");
    }

    Ok(VideoProbe {
        stream_index: video_stream.index,
        width,
        height,
        fps,
        codec_name: video_stream
            .codec_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        container_format: probe
            .format
            .format_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    })
}

/// All frames of one clip, decoded to square RGB at the model's input size,
/// in source order.
#[derive(Debug, Clone)]
pub struct DecodedVideo {
    pub frames: Vec<Array3<u8>>,
    pub fps: Option<f64>,
    pub side: u32,
}

impl DecodedVideo {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Stacks the frames into a [F, H, W, 3] f32 tensor with values in [0, 1].
    pub fn to_model_tensor(&self) -> Result<Array4<f32>> {
        let side = self.side as usize;
        let frame_count = self.frames.len();

        let mut tensor = Array4::<f32>::zeros((frame_count, side, side, 3));
        for (frame_index, frame) in self.frames.iter().enumerate() {
            if frame.dim() != (side, side, 3) {
                bail!(
                    "frame {frame_index} has shape {:?}, expected ({side}, {side}, 3)",
                    frame.dim()
                );
            }
            let mut slot = tensor.index_axis_mut(ndarray::Axis(0), frame_index);
            slot.zip_mut_with(frame, |out, &byte| {
                *out = byte as f32 / 255.0;
            });
        }
        Ok(tensor)
    }
}

fn build_decoder_args(path: &Path, stream_index: usize, side: u32) -> Vec<String> {
    vec![
        "-nostdin".to_string(),
        "-i".to_string(),
        path.to_string_lossy().into_owned(),
        "-map".to_string(),
        format!("0:{stream_index}"),
        "-vf".to_string(),
        format!("scale={side}:{side}"),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "rgb24".to_string(),
        "-vsync".to_string(),
        "cfr".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "pipe:1".to_string(),
    ]
}

/// Decodes a clip to raw RGB frames via an FFmpeg subprocess, yielding one
/// frame at a time. Drains stderr in a background thread to prevent pipe
/// deadlock. Kills FFmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    side: u32,
    frame_size: usize,
    _stderr_thread: Option<thread::JoinHandle<()>>,
    buf: Vec<u8>,
    done: bool,
}

impl VideoDecoder {
    pub fn new(path: &Path, stream_index: usize, side: u32) -> Result<Self> {
        let frame_size = side as usize * side as usize * 3;
        let decode_args = build_decoder_args(path, stream_index, side);

        debug!(path = %path.display(), side, "launching ffmpeg decoder");

        let mut child = Command::new("ffmpeg")
            .args(&decode_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg — is it installed?")?;

        let stderr = child.stderr.take().expect("stderr should be piped");
        let stderr_thread = thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: "ffmpeg_stderr", "{}", line);
                    }
                    Err(e) => {
                        debug!(target: "ffmpeg_stderr", "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            side,
            frame_size,
            _stderr_thread: Some(stderr_thread),
            buf: vec![0u8; frame_size],
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<Array3<u8>>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut self.buf[total_read..self.frame_size]) {
                Ok(0) => {
                    if total_read == 0 {
                        return Ok(None);
                    }
                    warn!(
                        "partial frame at EOF ({total_read}/{} bytes), discarding",
                        self.frame_size
                    );
                    return Ok(None);
                }
                Ok(n) => {
                    total_read += n;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    continue;
                }
                Err(e) => {
                    return Err(e).context("failed to read frame from ffmpeg stdout");
                }
            }
        }

        let side = self.side as usize;
        let frame = Array3::from_shape_vec((side, side, 3), self.buf[..self.frame_size].to_vec())
            .context("decoded frame does not match expected shape")?;
        Ok(Some(frame))
    }

    pub fn finish(&mut self) -> Result<()> {
        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if !status.success() {
            bail!("ffmpeg exited with status {}", status);
        }
        Ok(())
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<Array3<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self._stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Probes and fully decodes a clip, stretching every frame to `side` square.
pub fn decode_video(path: &Path, side: u32) -> Result<DecodedVideo> {
    ensure_supported_container(path)?;

    if !path.exists() {
        bail!("input file does not exist: {}", path.display());
    }
    if side == 0 {
        bail!("model input size must be positive");
    }

    let probe = run_ffprobe(path)?;
    let info = extract_probe(&probe, path)?;

    debug!(
        stream_index = info.stream_index,
        width = info.width,
        height = info.height,
        fps = ?info.fps,
        codec = %info.codec_name,
        container = %info.container_format,
        "video input probed"
    );

    let mut decoder = VideoDecoder::new(path, info.stream_index, side)?;
    let mut frames = Vec::new();
    for frame in decoder.by_ref() {
        frames.push(frame?);
    }
    decoder.finish()?;

    if frames.is_empty() {
        bail!("no frames decoded from {}", path.display());
    }

    debug!(frames = frames.len(), "decode complete");

    Ok(DecodedVideo {
        frames,
        fps: info.fps,
        side,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE_FFPROBE_JSON: &str = r#"{
        "streams": [
            {
                "index": 0,
                "codec_name": "h264",
                "codec_type": "video",
                "width": 640,
                "height": 360,
                "pix_fmt": "yuv420p",
                "r_frame_rate": "30000/1001",
                "avg_frame_rate": "30000/1001",
                "disposition": {}
            },
            {
                "index": 1,
                "codec_name": "aac",
                "codec_type": "audio",
                "disposition": {}
            }
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2"
        }
    }"#;

    #[test]
    fn test_parse_ffprobe_json() {
        let probe = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        assert_eq!(probe.streams.len(), 2);
        assert_eq!(
            probe.format.format_name.as_deref(),
            Some("mov,mp4,m4a,3gp,3g2,mj2")
        );
    }

    #[test]
    fn test_extract_probe_basic() {
        let probe = parse_ffprobe_json(SAMPLE_FFPROBE_JSON.as_bytes()).unwrap();
        let path = test_mp4_path();
        let info = extract_probe(&probe, &path).unwrap();

        assert_eq!(info.stream_index, 0);
        assert_eq!(info.width, 640);
        assert_eq!(info.height, 360);
        assert!((info.fps.unwrap() - 29.97).abs() < 0.01);
        assert_eq!(info.codec_name, "h264");
        assert_eq!(info.container_format, "mov,mp4,m4a,3gp,3g2,mj2");
    }

    #[test]
    fn test_missing_frame_rate_is_none() {
        let json = r#"{
            "streams": [{
                "index": 0,
                "codec_name": "gif",
                "codec_type": "video",
                "width": 224, "height": 224,
                "r_frame_rate": "0/0",
                "disposition": {}
            }],
            "format": { "format_name": "gif" }
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let info = extract_probe(&probe, Path::new("/tmp/clip.gif")).unwrap();
        assert_eq!(info.fps, None);
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{
            "streams": [{
                "index": 0,
                "codec_name": "aac",
                "codec_type": "audio",
                "disposition": {}
            }],
            "format": { "format_name": "mp3" }
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let result = extract_probe(&probe, Path::new("/tmp/audio.mp3"));
        assert!(result
            .err()
            .expect("should be Err")
            .to_string()
            .contains("no video stream"));
    }

    #[test]
    fn test_extract_probe_prefers_non_attached_picture_stream() {
        let json = r#"{
            "streams": [
                {
                    "index": 0,
                    "codec_name": "mjpeg",
                    "codec_type": "video",
                    "width": 720, "height": 576,
                    "r_frame_rate": "0/0",
                    "disposition": {"attached_pic": 1}
                },
                {
                    "index": 2,
                    "codec_name": "h264",
                    "codec_type": "video",
                    "width": 1280, "height": 720,
                    "r_frame_rate": "25/1",
                    "disposition": {"attached_pic": 0, "default": 1}
                }
            ],
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"}
        }"#;

        let probe = parse_ffprobe_json(json.as_bytes()).unwrap();
        let info = extract_probe(&probe, test_mp4_path().as_path()).unwrap();
        assert_eq!(info.stream_index, 2);
        assert_eq!(info.width, 1280);
    }

    #[test]
    fn test_parse_frame_rate() {
        let fps = parse_frame_rate("30000/1001").unwrap();
        assert!((fps - 29.97).abs() < 0.01);

        let fps = parse_frame_rate("25/1").unwrap();
        assert!((fps - 25.0).abs() < 0.001);

        assert!(parse_frame_rate("0/0").is_none());
        assert!(parse_frame_rate("garbage").is_none());
    }

    #[test]
    fn test_supported_containers() {
        assert!(ensure_supported_container(Path::new("clip.mp4")).is_ok());
        assert!(ensure_supported_container(Path::new("clip.MP4")).is_ok());
        assert!(ensure_supported_container(Path::new("clip.gif")).is_ok());

        let err = ensure_supported_container(Path::new("clip.mkv")).expect_err("mkv rejected");
        assert!(err.to_string().contains("unsupported input format"));
        assert!(ensure_supported_container(Path::new("clip")).is_err());
    }

    #[test]
    fn test_decoder_args() {
        let path = test_mp4_path();
        let args = build_decoder_args(path.as_path(), 2, 224);

        let i_idx = args.iter().position(|a| a == "-i").unwrap();
        let map_idx = args.iter().position(|a| a == "-map").unwrap();
        let vf_idx = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[i_idx + 1], path.to_string_lossy());
        assert_eq!(args[map_idx + 1], "0:2");
        assert_eq!(args[vf_idx + 1], "scale=224:224");
        assert!(args.contains(&"rawvideo".to_string()));
        assert!(args.contains(&"rgb24".to_string()));
        assert!(args.contains(&"pipe:1".to_string()));
    }

    #[test]
    fn test_decode_rejects_missing_file() {
        let result = decode_video(Path::new("/nonexistent/clip.mp4"), MODEL_INPUT_SIZE);
        assert!(result
            .err()
            .expect("should be Err")
            .to_string()
            .contains("does not exist"));
    }

    #[test]
    fn test_model_tensor_normalization() {
        let frame = Array3::from_elem((4, 4, 3), 255u8);
        let mut dark = Array3::from_elem((4, 4, 3), 0u8);
        dark[[0, 0, 0]] = 51;

        let video = DecodedVideo {
            frames: vec![frame, dark],
            fps: Some(8.0),
            side: 4,
        };
        let tensor = video.to_model_tensor().unwrap();

        assert_eq!(tensor.dim(), (2, 4, 4, 3));
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < f32::EPSILON);
        assert!((tensor[[1, 0, 0, 0]] - 0.2).abs() < 1e-6);
        assert!((tensor[[1, 0, 0, 1]]).abs() < f32::EPSILON);
    }

    #[test]
    fn test_model_tensor_rejects_mismatched_frame() {
        let video = DecodedVideo {
            frames: vec![Array3::from_elem((2, 4, 3), 0u8)],
            fps: None,
            side: 4,
        };
        assert!(video.to_model_tensor().is_err());
    }

    fn test_mp4_path() -> PathBuf {
        std::env::temp_dir().join("test.mp4")
    }

    #[test]
    #[ignore = "requires the ffmpeg and ffprobe binaries"]
    fn test_decode_generated_clip() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("testsrc.mp4");
        let status = Command::new("ffmpeg")
            .args(["-nostdin", "-y", "-f", "lavfi", "-i", "testsrc=duration=1:size=64x64:rate=8"])
            .arg(&clip)
            .status()
            .expect("ffmpeg must be installed for this test");
        assert!(status.success());

        let video = decode_video(&clip, 32).unwrap();
        assert_eq!(video.frame_count(), 8);
        assert_eq!(video.side, 32);
        assert!((video.fps.unwrap() - 8.0).abs() < 0.01);
        assert_eq!(video.frames[0].dim(), (32, 32, 3));
    }
}
