//! Camera frame staging.
//!
//! Raw camera buffers interleave fixed-size metadata tags with the pixels:
//! every block starts with a tag followed by pixel payload. Image rows are
//! laid out contiguously in payload space, so a row may run across a block
//! boundary and has to be copied around the tag.
//!
//! Some frames arrive corrupted (mostly black). They are detected by their
//! brightness relative to the last accepted frame and skipped, keeping the
//! previous image on screen.

use crate::config::{FrameFilterConfig, TagLayout};
use crate::error::{PassthroughError, PassthroughResult};

/// One contiguous run of pixel bytes in the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    raw_offset: usize,
    len: usize,
}

/// Raw spans making up row `y`.
fn row_spans(y: usize, width: usize, layout: &TagLayout) -> impl Iterator<Item = Span> + '_ {
    let payload = layout.payload_size();
    let mut remaining = width;
    let mut p = y * width;

    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let block = p / payload;
        let within = p % payload;
        let len = remaining.min(payload - within);
        let span = Span {
            raw_offset: block * layout.block_size + layout.tag_size + within,
            len,
        };
        p += len;
        remaining -= len;
        Some(span)
    })
}

/// Whether row `y` crosses at least one block boundary.
pub fn row_straddles(y: usize, width: usize, layout: &TagLayout) -> bool {
    let payload = layout.payload_size();
    (y * width) % payload + width > payload
}

/// Raw bytes needed to hold a `width` x `height` image.
pub fn raw_len(width: usize, height: usize, layout: &TagLayout) -> usize {
    let pixels = width * height;
    if pixels == 0 {
        return 0;
    }
    let last = pixels - 1;
    (last / layout.payload_size()) * layout.block_size + layout.tag_size + last % layout.payload_size() + 1
}

fn check_raw_len(raw: &[u8], width: usize, height: usize, layout: &TagLayout) -> PassthroughResult<()> {
    let needed = raw_len(width, height, layout);
    if raw.len() < needed {
        return Err(PassthroughError::InvalidArgument(format!(
            "Camera frame {}x{} needs {} raw bytes, got {}",
            width,
            height,
            needed,
            raw.len()
        )));
    }
    Ok(())
}

/// Copy the pixels of `raw` into `dst` (tightly packed, `width * height`),
/// skipping the tags.
pub fn copy_untagged_rows(
    raw: &[u8],
    width: usize,
    height: usize,
    layout: &TagLayout,
    dst: &mut Vec<u8>,
) -> PassthroughResult<()> {
    check_raw_len(raw, width, height, layout)?;

    dst.clear();
    dst.reserve(width * height);
    for y in 0..height {
        for span in row_spans(y, width, layout) {
            dst.extend_from_slice(&raw[span.raw_offset..span.raw_offset + span.len]);
        }
    }
    Ok(())
}

/// Average of every `stride`-th pixel of the rows straddling a block
/// boundary, or of all rows when none do.
pub fn sample_brightness(
    raw: &[u8],
    width: usize,
    height: usize,
    layout: &TagLayout,
    stride: usize,
) -> PassthroughResult<f32> {
    check_raw_len(raw, width, height, layout)?;

    let stride = stride.max(1);
    let any_straddle = (0..height).any(|y| row_straddles(y, width, layout));

    let mut sum = 0u64;
    let mut count = 0u64;
    for y in (0..height).filter(|&y| !any_straddle || row_straddles(y, width, layout)) {
        let mut x = 0usize;
        for span in row_spans(y, width, layout) {
            // First sampled column inside this span.
            let start = (stride - x % stride) % stride;
            for i in (start..span.len).step_by(stride) {
                sum += raw[span.raw_offset + i] as u64;
                count += 1;
            }
            x += span.len;
        }
    }

    if count == 0 {
        return Ok(0.0);
    }
    Ok(sum as f32 / count as f32)
}

/// What to do with a freshly acquired camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Upload it and make it the new brightness baseline.
    Accept,
    /// Keep showing the previous image.
    Reuse,
}

/// Brightness-based rejection of corrupted frames.
#[derive(Debug, Clone)]
pub struct FrameFilter {
    config: FrameFilterConfig,
    baseline: Option<f32>,
    skipped: u32,
}

impl FrameFilter {
    pub fn new(config: FrameFilterConfig) -> Self {
        Self {
            config,
            baseline: None,
            skipped: 0,
        }
    }

    /// Decide on a frame of `brightness`. `has_previous` tells whether there
    /// is an earlier image to fall back on.
    pub fn evaluate(&mut self, brightness: f32, has_previous: bool) -> FrameDecision {
        if let Some(baseline) = self.baseline {
            if has_previous
                && brightness < baseline * self.config.rejection_ratio
                && self.skipped < self.config.max_consecutive_rejections
            {
                self.skipped += 1;
                return FrameDecision::Reuse;
            }
        }

        self.baseline = Some(brightness);
        self.skipped = 0;
        FrameDecision::Accept
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.skipped
    }

    pub fn baseline(&self) -> Option<f32> {
        self.baseline
    }
}
