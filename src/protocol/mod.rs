//! Wire protocol between the coordinator and its contexts

pub mod messages;
pub mod native;

pub use messages::{ErrorBody, InboundMessage, Request, ResultEnvelope, DEFAULT_CONTEXT};
pub use native::{read_frame, write_frame, FrameError};
