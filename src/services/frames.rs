//! Frame extraction from staged artifacts and annotation of the winning frame.

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::models::detection::Detection;

/// Iterator over the decoded frames of one artifact.
pub type Frames = Box<dyn Iterator<Item = Result<RgbImage, FrameError>>>;

/// Turns a staged file into frames. Runs on the blocking pool.
pub trait FrameDecoder: Send + Sync {
    fn frames(&self, path: &Path) -> Result<Frames, FrameError>;
}

/// Decoder backed by the `image` crate: every frame of an animated GIF,
/// or the single frame of a still image. Anything the `image` crate does not
/// recognise goes to the video decoder, when one is configured.
#[derive(Debug, Default, Clone)]
pub struct ImageFrameDecoder {
    video: Option<FfmpegFrameDecoder>,
}

impl ImageFrameDecoder {
    /// Stills and GIFs only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stills and GIFs, with video containers handed to `video`.
    pub fn with_video(video: FfmpegFrameDecoder) -> Self {
        Self { video: Some(video) }
    }
}

impl FrameDecoder for ImageFrameDecoder {
    fn frames(&self, path: &Path) -> Result<Frames, FrameError> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;

        match reader.format() {
            Some(ImageFormat::Gif) => {
                let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
                let frames = decoder.into_frames().map(|frame| {
                    frame
                        .map(|f| DynamicImage::ImageRgba8(f.into_buffer()).to_rgb8())
                        .map_err(FrameError::from)
                });
                Ok(Box::new(frames))
            }
            Some(_) => {
                let image = reader.decode()?.to_rgb8();
                Ok(Box::new(std::iter::once(Ok(image))))
            }
            None => match &self.video {
                Some(video) => video.frames(path),
                None => Err(FrameError::Unsupported(path.display().to_string())),
            },
        }
    }
}

/// Video decoder that shells out to `ffprobe` for the frame size and streams
/// `ffmpeg`'s raw `rgb24` output one frame at a time.
#[derive(Debug, Clone)]
pub struct FfmpegFrameDecoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

#[derive(Debug, Deserialize)]
struct StreamListing {
    #[serde(default)]
    streams: Vec<StreamEntry>,
}

#[derive(Debug, Deserialize)]
struct StreamEntry {
    width: Option<u32>,
    height: Option<u32>,
}

impl FfmpegFrameDecoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Whether both binaries can be run.
    pub fn available(&self) -> bool {
        let runs = |binary: &Path| {
            Command::new(binary)
                .arg("-version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        };
        runs(&self.ffprobe) && runs(&self.ffmpeg)
    }

    /// Width and height of the first video stream.
    fn stream_size(&self, path: &Path) -> Result<(u32, u32), FrameError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height",
                "-print_format",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()?;

        if !output.status.success() {
            return Err(FrameError::Ffmpeg {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let listing: StreamListing = serde_json::from_slice(&output.stdout)
            .map_err(|e| FrameError::StreamInfo(e.to_string()))?;
        match listing.streams.first() {
            Some(StreamEntry {
                width: Some(width),
                height: Some(height),
            }) if *width > 0 && *height > 0 => Ok((*width, *height)),
            _ => Err(FrameError::StreamInfo(format!(
                "no video stream in {}",
                path.display()
            ))),
        }
    }
}

impl FrameDecoder for FfmpegFrameDecoder {
    fn frames(&self, path: &Path) -> Result<Frames, FrameError> {
        let (width, height) = self.stream_size(path)?;

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(FrameError::StreamInfo("ffmpeg stdout was not captured".to_string()));
        };

        tracing::debug!(path = %path.display(), width, height, "Streaming video frames through ffmpeg");
        Ok(Box::new(RawVideoFrames {
            child,
            stdout,
            width,
            height,
            done: false,
        }))
    }
}

/// Frames read off a running ffmpeg process. The process is reaped on drop.
struct RawVideoFrames {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    done: bool,
}

impl RawVideoFrames {
    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Fill `buf` unless the stream ends first. Returns the bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stdout.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Iterator for RawVideoFrames {
    type Item = Result<RgbImage, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.frame_len()];
        let read = match self.fill(&mut buf) {
            Ok(read) => read,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        if read == buf.len() {
            return RgbImage::from_raw(self.width, self.height, buf).map(Ok);
        }

        self.done = true;
        match self.child.wait() {
            Ok(status) if status.success() && read == 0 => None,
            Ok(status) => Some(Err(FrameError::Ffmpeg {
                exit_code: status.code(),
                stderr: format!("stream ended after {read} bytes of a {} byte frame", buf.len()),
            })),
            Err(e) => Some(Err(e.into())),
        }
    }
}

impl Drop for RawVideoFrames {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 3;

/// Copy of `frame` with the detection box drawn on it.
pub fn annotate(frame: &RgbImage, detection: &Detection) -> RgbImage {
    let mut out = frame.clone();
    let (w, h) = out.dimensions();
    if w == 0 || h == 0 {
        return out;
    }

    let clamp = |v: f64, max: u32| v.max(0.0).min((max - 1) as f64) as u32;
    let [x1, y1, x2, y2] = detection.box_xyxy;
    let (left, right) = (clamp(x1.min(x2), w), clamp(x1.max(x2), w));
    let (top, bottom) = (clamp(y1.min(y2), h), clamp(y1.max(y2), h));

    for t in 0..BOX_THICKNESS {
        for x in left..=right {
            for y in [top.saturating_add(t).min(bottom), bottom.saturating_sub(t).max(top)] {
                out.put_pixel(x, y, BOX_COLOR);
            }
        }
        for y in top..=bottom {
            for x in [left.saturating_add(t).min(right), right.saturating_sub(t).max(left)] {
                out.put_pixel(x, y, BOX_COLOR);
            }
        }
    }

    out
}

/// Encode a frame as JPEG.
pub fn encode_jpeg(frame: &RgbImage) -> Result<Vec<u8>, FrameError> {
    let mut buf = Cursor::new(Vec::new());
    frame.write_to(&mut buf, ImageFormat::Jpeg)?;
    Ok(buf.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Image decoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("I/O error reading frames: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported artifact format: {0}")]
    Unsupported(String),

    #[error("ffmpeg failed (exit code {exit_code:?}): {stderr}")]
    Ffmpeg {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Could not read video stream info: {0}")]
    StreamInfo(String),
}
