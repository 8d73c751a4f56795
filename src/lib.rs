// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! X11 window snapshot capture
//!
//! Captures the pixels of an X11 window into an in-process frame, using the
//! MIT-SHM extension when the server offers it so the image never travels
//! through the connection, and writes frames out as binary PPM.
//!
//! The accelerated path attaches a process-private memory segment to the
//! server and asks the server to populate it. When any step of that fails,
//! the partial resources unwind in reverse acquisition order and capture
//! falls back to a plain `GetImage` round trip.
//!
//! ```no_run
//! use x11rb::connection::Connection;
//! use xsnap::{CaptureOptions, Frame};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (conn, screen_num) = x11rb::connect(None)?;
//! let root = conn.setup().roots[screen_num].root;
//!
//! let opts = CaptureOptions::probe(&conn);
//! let frame = Frame::capture(&conn, root, &opts)?;
//! xsnap::write_ppm(&frame, "screen.ppm")?;
//! frame.release(&conn);
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod error;
pub mod ppm;
pub mod shm;

pub use capture::{CaptureOptions, Frame, PixelBuffer, RefreshFallback, Strategy};
pub use error::{CaptureError, PpmError};
pub use ppm::write_ppm;
pub use shm::ShmSegment;
