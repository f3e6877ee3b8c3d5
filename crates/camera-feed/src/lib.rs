//! Camera frame feed for the passthrough layer.
//!
//! The capture client (the process talking to the headset cameras) publishes
//! raw frames into a [`CameraFeed`]. The layer pulls them through the
//! [`CameraSource`] interface once per rendered frame, never blocking.
//!
//! Frames are borrowed: the layer may only look at the pixel data between a
//! successful [`CameraSource::acquire_next_frame`] and the matching
//! [`CameraSource::release_frame`]. [`FrameLease`] ties the two together.

use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Frames the feed buffers before new ones are dropped.
pub const DEFAULT_FEED_CAPACITY: usize = 2;

// ============================================================================
// Frames
// ============================================================================

/// One raw frame as produced by the capture client.
///
/// `data` still contains the metadata tags the camera interleaves with the
/// pixels; stripping them is the consumer's job.
pub struct CameraFrame {
    /// Image width in pixels (one byte per pixel).
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Raw buffer, tags included.
    pub data: Vec<u8>,
    /// Monotonic id assigned by the feed.
    pub frame_id: u64,
}

impl CameraFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
            frame_id: 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl Debug for CameraFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.data.len())
            .field("frame_id", &self.frame_id)
            .finish()
    }
}

impl Display for CameraFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}x{}", self.frame_id, self.width, self.height)
    }
}

// ============================================================================
// Source interface
// ============================================================================

/// The camera service as seen by the layer.
pub trait CameraSource: Send {
    /// Try to take the next frame without blocking. Returns `true` when a
    /// frame is now held and must be released with [`Self::release_frame`].
    fn acquire_next_frame(&mut self) -> bool;

    /// The frame currently held, if any.
    fn current_frame(&self) -> Option<&CameraFrame>;

    /// Give the held frame back. Called exactly once per successful acquire.
    fn release_frame(&mut self);
}

/// Scoped borrow of a camera frame; releases it when dropped.
pub struct FrameLease<'a, S: CameraSource + ?Sized> {
    source: &'a mut S,
}

impl<'a, S: CameraSource + ?Sized> FrameLease<'a, S> {
    /// Acquire the next frame, or `None` when the camera has nothing new.
    pub fn acquire(source: &'a mut S) -> Option<Self> {
        if source.acquire_next_frame() {
            Some(Self { source })
        } else {
            None
        }
    }

    pub fn frame(&self) -> Option<&CameraFrame> {
        self.source.current_frame()
    }
}

impl<S: CameraSource + ?Sized> Drop for FrameLease<'_, S> {
    fn drop(&mut self) {
        self.source.release_frame();
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Frame has no pixels or zero dimensions
    #[error("Invalid frame: {width}x{height} with {len} bytes")]
    InvalidFrame { width: u32, height: u32, len: usize },

    /// Consumer is behind, frame dropped
    #[error("Camera feed is full, frame dropped")]
    Full,
}

/// Bounded, non-blocking frame channel between the capture client and the layer.
#[derive(Clone)]
pub struct CameraFeed {
    sender: Sender<CameraFrame>,
    receiver: Receiver<CameraFrame>,
    next_frame_id: Arc<AtomicU64>,
    dropped_frames: Arc<AtomicU64>,
}

lazy_static::lazy_static! {
    /// Feed shared by the capture client and the layer inside one process.
    static ref GLOBAL_FEED: Mutex<Option<CameraFeed>> = Mutex::new(None);
}

impl CameraFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        Self {
            sender,
            receiver,
            next_frame_id: Arc::new(AtomicU64::new(1)),
            dropped_frames: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The process-wide feed, created on first use.
    pub fn global() -> CameraFeed {
        GLOBAL_FEED
            .lock()
            .get_or_insert_with(|| {
                debug!("[CAMERA_FEED] Creating global feed");
                CameraFeed::new(DEFAULT_FEED_CAPACITY)
            })
            .clone()
    }

    /// Hand a frame to the consumer. Never blocks.
    pub fn publish(&self, width: u32, height: u32, data: Vec<u8>) -> Result<u64, FeedError> {
        if width == 0 || height == 0 || data.is_empty() {
            return Err(FeedError::InvalidFrame {
                width,
                height,
                len: data.len(),
            });
        }

        let frame_id = self.next_frame_id.fetch_add(1, Ordering::Relaxed);
        let frame = CameraFrame {
            width,
            height,
            data,
            frame_id,
        };

        match self.sender.try_send(frame) {
            Ok(()) => {
                trace!("[CAMERA_FEED] Published frame {}", frame_id);
                Ok(frame_id)
            },
            // The feed holds a receiver itself, so the channel never disconnects.
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(FeedError::Full)
            },
        }
    }

    /// A consumer handle implementing [`CameraSource`].
    pub fn source(&self) -> FeedSource {
        FeedSource {
            receiver: self.receiver.clone(),
            current: None,
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

/// Consumer end of a [`CameraFeed`].
pub struct FeedSource {
    receiver: Receiver<CameraFrame>,
    current: Option<CameraFrame>,
}

impl CameraSource for FeedSource {
    fn acquire_next_frame(&mut self) -> bool {
        if self.current.is_some() {
            warn!("[CAMERA_FEED] Acquire while a frame is still held, releasing it");
            self.current = None;
        }

        // Only the newest frame is interesting, older ones are stale.
        let mut latest = None;
        while let Ok(frame) = self.receiver.try_recv() {
            if let Some(stale) = latest.replace(frame) {
                trace!("[CAMERA_FEED] Skipping stale frame {}", stale);
            }
        }

        self.current = latest;
        self.current.is_some()
    }

    fn current_frame(&self) -> Option<&CameraFrame> {
        self.current.as_ref()
    }

    fn release_frame(&mut self) {
        self.current = None;
    }
}
