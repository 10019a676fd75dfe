//! Export of generated videos as JPEG frames and looping GIFs.
//!
//! Videos come out of the pipeline as `[B, T, 3, H, W]` tensors in `[0, 1]`.
//! Context frames can be marked with a coloured border, and samples can be
//! placed side by side with ground truth for comparison.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{DType, Tensor};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, Rgb, RgbImage, imageops};

use crate::{Error, Result};

/// Border colour marking context frames.
pub const CONTEXT_BORDER: Rgb<u8> = Rgb([255, 0, 0]);

/// Default playback rate.
pub const DEFAULT_FPS: u32 = 8;

/// Which files [`save_video_to_dir`] writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveFormats {
    /// `frames/{idx:05}_{suffix}.jpg` per frame.
    pub frames: bool,
    /// `{suffix}.gif`.
    pub gif: bool,
}

impl FromStr for SaveFormats {
    type Err = Error;

    /// Parse `_`-joined format names, e.g. `"frame_gif"`.
    fn from_str(s: &str) -> Result<Self> {
        let mut formats = SaveFormats::default();
        for name in s.split('_') {
            match name {
                "frame" => formats.frames = true,
                "gif" => formats.gif = true,
                other => {
                    return Err(Error::Config(format!(
                        "unsupported save format '{other}' (expected 'frame' or 'gif')"
                    )));
                }
            }
        }
        Ok(formats)
    }
}

/// Convert `[B, T, 3, H, W]` in `[0, 1]` to `B` lists of `T` RGB frames.
pub fn tensor_to_frames(video: &Tensor) -> Result<Vec<Vec<RgbImage>>> {
    let (b, t, c, h, w) = video.dims5()?;
    if c != 3 {
        return Err(Error::Config(format!("expected 3 channels, got {c}")));
    }
    let bytes = video
        .to_dtype(DType::F32)?
        .clamp(0.0, 1.0)?
        .affine(255.0, 0.0)?
        .to_dtype(DType::U8)?
        .permute((0, 1, 3, 4, 2))?
        .contiguous()?
        .flatten_all()?
        .to_vec1::<u8>()?;

    let frame_len = h * w * 3;
    let mut videos = Vec::with_capacity(b);
    for clip in bytes.chunks(t * frame_len).take(b) {
        let frames = clip
            .chunks(frame_len)
            .map(|raw| {
                RgbImage::from_raw(w as u32, h as u32, raw.to_vec())
                    .ok_or_else(|| Error::Config("frame buffer size mismatch".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        videos.push(frames);
    }
    Ok(videos)
}

/// Draw a 1-pixel border of `color` on the first `context_frames` frames.
pub fn annotate_context_frames(frames: &mut [RgbImage], context_frames: usize, color: Rgb<u8>) {
    for frame in frames.iter_mut().take(context_frames) {
        let (w, h) = frame.dimensions();
        if w == 0 || h == 0 {
            continue;
        }
        for x in 0..w {
            frame.put_pixel(x, 0, color);
            frame.put_pixel(x, h - 1, color);
        }
        for y in 0..h {
            frame.put_pixel(0, y, color);
            frame.put_pixel(w - 1, y, color);
        }
    }
}

/// Place `right` to the right of `left`.
pub fn side_by_side(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let height = left.height().max(right.height());
    let mut canvas = RgbImage::new(left.width() + right.width(), height);
    imageops::replace(&mut canvas, left, 0, 0);
    imageops::replace(&mut canvas, right, i64::from(left.width()), 0);
    canvas
}

/// Write `frames` under `save_dir` in the requested formats.
pub fn save_video_to_dir(
    frames: &[RgbImage],
    save_dir: impl AsRef<Path>,
    save_suffix: &str,
    formats: SaveFormats,
    fps: u32,
) -> Result<()> {
    let save_dir = save_dir.as_ref();
    std::fs::create_dir_all(save_dir)?;

    if formats.frames {
        let frame_dir = save_dir.join("frames");
        std::fs::create_dir_all(&frame_dir)?;
        for (idx, frame) in frames.iter().enumerate() {
            frame.save(frame_dir.join(format!("{idx:05}_{save_suffix}.jpg")))?;
        }
    }

    if formats.gif {
        save_gif(frames, save_dir.join(format!("{save_suffix}.gif")), fps)?;
    }
    Ok(())
}

/// Write `frames` as an endlessly looping GIF.
pub fn save_gif(frames: &[RgbImage], path: impl AsRef<Path>, fps: u32) -> Result<()> {
    let delay_ms = 1000 / fps.max(1);
    let file = File::create(path)?;
    let mut encoder = GifEncoder::new(BufWriter::new(file));
    encoder.set_repeat(Repeat::Infinite)?;
    for frame in frames {
        let rgba = DynamicImage::ImageRgb8(frame.clone()).into_rgba8();
        encoder.encode_frame(Frame::from_parts(
            rgba,
            0,
            0,
            Delay::from_numer_denom_ms(delay_ms, 1),
        ))?;
    }
    Ok(())
}

/// Save each batch element of `sample` (next to `gt`, if given) as
/// `sample_gt_{suffix}.gif`, marking the first `context_frames` frames.
///
/// Returns the written paths, one per `(batch element, suffix)` pair.
pub fn log_paired_video(
    sample: &Tensor,
    gt: Option<&Tensor>,
    context_frames: usize,
    save_suffixes: &[String],
    save_dir: impl AsRef<Path>,
    annotate_context_frame: bool,
) -> Result<Vec<PathBuf>> {
    let save_dir = save_dir.as_ref();
    let mut samples = tensor_to_frames(sample)?;
    let mut gts = gt.map(tensor_to_frames).transpose()?;

    if annotate_context_frame {
        for frames in samples.iter_mut() {
            annotate_context_frames(frames, context_frames, CONTEXT_BORDER);
        }
        for frames in gts.iter_mut().flatten() {
            annotate_context_frames(frames, context_frames, CONTEXT_BORDER);
        }
    }

    let mut written = Vec::new();
    for (idx, (frames, suffix)) in samples.iter().zip(save_suffixes).enumerate() {
        let frames = match gts.as_ref().and_then(|g| g.get(idx)) {
            Some(gt_frames) => frames
                .iter()
                .zip(gt_frames)
                .map(|(s, g)| side_by_side(s, g))
                .collect(),
            None => frames.clone(),
        };
        let save_suffix = format!("sample_gt_{suffix}");
        let formats = SaveFormats {
            frames: false,
            gif: true,
        };
        save_video_to_dir(&frames, save_dir, &save_suffix, formats, DEFAULT_FPS)?;
        written.push(save_dir.join(format!("{save_suffix}.gif")));
    }
    tracing::debug!("wrote {} videos to {}", written.len(), save_dir.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn gray_video(b: usize, t: usize, value: f32) -> Tensor {
        Tensor::full(value, (b, t, 3, 4, 6), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_parse_formats() {
        let f: SaveFormats = "frame_gif".parse().unwrap();
        assert!(f.frames && f.gif);
        let f: SaveFormats = "gif".parse().unwrap();
        assert!(!f.frames && f.gif);
        assert!(matches!("video".parse::<SaveFormats>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_tensor_to_frames() {
        let videos = tensor_to_frames(&gray_video(2, 3, 0.5)).unwrap();
        assert_eq!(videos.len(), 2);
        assert_eq!(videos[0].len(), 3);
        assert_eq!(videos[0][0].dimensions(), (6, 4));
        // 0.5 * 255 = 127.5, truncated
        assert_eq!(videos[1][2].get_pixel(3, 2), &Rgb([127, 127, 127]));
    }

    #[test]
    fn test_out_of_range_values_clipped() {
        let videos = tensor_to_frames(&gray_video(1, 1, 2.0)).unwrap();
        assert_eq!(videos[0][0].get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn test_annotate_only_context() {
        let mut frames = tensor_to_frames(&gray_video(1, 3, 0.0)).unwrap().remove(0);
        annotate_context_frames(&mut frames, 2, CONTEXT_BORDER);
        assert_eq!(frames[0].get_pixel(0, 0), &CONTEXT_BORDER);
        assert_eq!(frames[1].get_pixel(5, 3), &CONTEXT_BORDER);
        assert_eq!(frames[1].get_pixel(2, 2), &Rgb([0, 0, 0]));
        assert_eq!(frames[2].get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_side_by_side() {
        let left = RgbImage::from_pixel(2, 3, Rgb([1, 1, 1]));
        let right = RgbImage::from_pixel(4, 3, Rgb([9, 9, 9]));
        let both = side_by_side(&left, &right);
        assert_eq!(both.dimensions(), (6, 3));
        assert_eq!(both.get_pixel(1, 0), &Rgb([1, 1, 1]));
        assert_eq!(both.get_pixel(2, 0), &Rgb([9, 9, 9]));
    }

    #[test]
    fn test_save_frames_and_gif() {
        let dir = tempfile::tempdir().unwrap();
        let frames = tensor_to_frames(&gray_video(1, 2, 0.25)).unwrap().remove(0);
        let formats: SaveFormats = "frame_gif".parse().unwrap();
        save_video_to_dir(&frames, dir.path(), "clip", formats, DEFAULT_FPS).unwrap();

        assert!(dir.path().join("frames/00000_clip.jpg").exists());
        assert!(dir.path().join("frames/00001_clip.jpg").exists());
        let gif = dir.path().join("clip.gif");
        assert!(std::fs::metadata(&gif).unwrap().len() > 0);
    }

    #[test]
    fn test_log_paired_video() {
        let dir = tempfile::tempdir().unwrap();
        let sample = gray_video(2, 3, 0.1);
        let gt = gray_video(2, 3, 0.9);
        let suffixes = vec!["0".to_string(), "1".to_string()];
        let paths =
            log_paired_video(&sample, Some(&gt), 1, &suffixes, dir.path(), true).unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));
        assert!(paths[1].ends_with("sample_gt_1.gif"));
    }
}
