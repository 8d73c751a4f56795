// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy
//!
//! Every operation returns a structured result. The library logs at the
//! point of detection through the `log` facade; callers decide what to do
//! with the error itself.

use std::io;

use thiserror::Error;
use x11rb::errors::{ConnectionError, ReplyError, ReplyOrIdError};

/// Errors raised while allocating or refreshing a capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The window geometry query failed: the window is gone or the
    /// connection broke. Fatal to the call, no partial state is created.
    #[error("window geometry query failed: {0}")]
    Geometry(#[source] ReplyError),

    /// The connection setup advertises no pixmap format for the window's
    /// depth.
    #[error("no pixmap format for depth {0}")]
    UnsupportedDepth(u8),

    /// Creating, sizing, or mapping the shared memory segment failed.
    #[error("shared memory segment allocation failed: {0}")]
    Segment(#[source] io::Error),

    /// The connection refused to hand out a resource id for the segment.
    #[error("X resource id allocation failed: {0}")]
    IdAlloc(#[source] ReplyOrIdError),

    /// The server rejected the segment attach.
    #[error("server rejected shared segment attach: {0}")]
    Attach(#[source] ReplyError),

    /// The image transfer itself failed.
    #[error("image transfer failed: {0}")]
    Populate(#[source] ReplyError),

    /// A request could not be sent on the connection.
    #[error("X connection failure: {0}")]
    Connection(#[from] ConnectionError),
}

/// Errors raised by the PPM serializer.
#[derive(Debug, Error)]
pub enum PpmError {
    /// The frame has no pixels to write. No file is created.
    #[error("frame is empty")]
    EmptyFrame,

    /// The frame's buffer is shorter than its dimensions claim.
    #[error("frame buffer holds {actual} bytes, expected at least {expected}")]
    Truncated { expected: usize, actual: usize },

    /// Packed pixels narrower than 24 bits cannot be split into RGB
    /// triplets. The destination file is left empty.
    #[error("unsupported pixel depth: {0} bits per pixel")]
    UnsupportedDepth(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}
