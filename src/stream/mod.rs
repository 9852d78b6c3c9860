//! Push notifications over `text/event-stream`.

mod consumer;
mod frame;
mod policy;

pub use consumer::{MountOutcome, StreamConfig, StreamConsumer, STREAM_PATH};
pub use frame::{decode_frame, Decoded, FrameError, FrameParser, SseFrame, NOTIFICATION_EVENT};
