// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! Window capture lifecycle
//!
//! A [`Frame`] holds one captured image for an X11 window, backed either by
//! a plain heap buffer (direct-copy strategy) or by a shared memory segment
//! the server writes into (MIT-SHM, the accelerated strategy). Allocation,
//! in-place refresh, and teardown keep the segment and its server-side
//! attachment balanced on every path: server detach, then unmap, then
//! kernel release, each exactly once.

use log::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::shm;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, ImageOrder, Setup, Window};

use crate::error::CaptureError;
use crate::shm::ShmSegment;

/// Capture transport, negotiated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// MIT-SHM: the server writes pixels straight into a shared segment.
    Accelerated,
    /// Plain `GetImage`: the whole buffer travels through the connection.
    Direct,
}

impl Strategy {
    /// Probe the connection once: accelerated when the SHM extension
    /// answers, direct otherwise.
    pub fn probe(conn: &impl Connection) -> Self {
        match shm::query_version(conn) {
            Ok(cookie) => match cookie.reply() {
                Ok(version) => {
                    info!(
                        "MIT-SHM {}.{} available, using accelerated capture",
                        version.major_version, version.minor_version
                    );
                    Strategy::Accelerated
                }
                Err(e) => {
                    debug!("MIT-SHM version query failed: {}", e);
                    Strategy::Direct
                }
            },
            Err(e) => {
                debug!("MIT-SHM extension unavailable: {}", e);
                Strategy::Direct
            }
        }
    }
}

/// What refresh does with the previous frame when reallocation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshFallback {
    /// Keep the last valid pixels in the slot, possibly at a stale
    /// geometry, and still report the error.
    #[default]
    KeepStale,
    /// Release the previous frame and leave the slot empty.
    Discard,
}

/// Per-call capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub strategy: Strategy,
    /// Fall back to the direct path when an accelerated allocation fails
    /// partway.
    pub fallback_to_direct: bool,
    pub refresh_fallback: RefreshFallback,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            strategy: Strategy::Direct,
            fallback_to_direct: true,
            refresh_fallback: RefreshFallback::default(),
        }
    }
}

impl CaptureOptions {
    /// Options with the strategy probed from the connection.
    pub fn probe(conn: &impl Connection) -> Self {
        Self {
            strategy: Strategy::probe(conn),
            ..Self::default()
        }
    }
}

/// Pixel storage, owned either directly or through a mapped segment. Both
/// construction paths expose the same bytes, so readers never care which
/// strategy produced the data.
#[derive(Debug)]
pub enum PixelBuffer {
    Owned(Vec<u8>),
    Shared {
        seg: ShmSegment,
        /// Server-side attachment id, detached in [`Frame::release`].
        xid: shm::Seg,
    },
}

impl PixelBuffer {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PixelBuffer::Owned(data) => data,
            PixelBuffer::Shared { seg, .. } => seg.as_slice(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, PixelBuffer::Shared { .. })
    }
}

/// One captured image plus its optional shared-memory backing.
///
/// A frame is single-writer state: refresh and release must be externally
/// serialized. One connection and its frames per thread.
#[derive(Debug)]
pub struct Frame {
    pub pixels: PixelBuffer,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub bytes_per_line: usize,
    pub byte_order: ImageOrder,
}

impl Frame {
    /// Capture `window` into a new frame.
    ///
    /// A geometry-query failure is fatal and creates no state. A failure
    /// inside the accelerated path unwinds the partial resources and falls
    /// back to the direct path when the options allow it.
    pub fn capture(
        conn: &impl Connection,
        window: Window,
        opts: &CaptureOptions,
    ) -> Result<Self, CaptureError> {
        let geom = conn
            .get_geometry(window)?
            .reply()
            .map_err(CaptureError::Geometry)?;
        let layout = layout_for_depth(conn.setup(), geom.depth, geom.width)?;

        match opts.strategy {
            Strategy::Accelerated => {
                match capture_shared(conn, window, geom.width, geom.height, geom.depth, layout) {
                    Ok(frame) => Ok(frame),
                    Err(e) if opts.fallback_to_direct => {
                        warn!("accelerated capture failed, falling back to direct: {}", e);
                        capture_direct(conn, window, geom.width, geom.height, geom.depth, layout)
                    }
                    Err(e) => Err(e),
                }
            }
            Strategy::Direct => {
                capture_direct(conn, window, geom.width, geom.height, geom.depth, layout)
            }
        }
    }

    /// Refresh the frame in `slot` from `window`, reallocating when the
    /// geometry changed or the in-place pull failed.
    ///
    /// An empty slot gets a full capture. If the geometry query itself
    /// fails the slot is left untouched. On reallocation failure the
    /// [`RefreshFallback`] policy decides whether the previous frame
    /// survives in the slot; the error is returned either way.
    pub fn refresh(
        slot: &mut Option<Frame>,
        conn: &impl Connection,
        window: Window,
        opts: &CaptureOptions,
    ) -> Result<(), CaptureError> {
        let Some(frame) = slot.as_mut() else {
            *slot = Some(Frame::capture(conn, window, opts)?);
            return Ok(());
        };

        let geom = conn
            .get_geometry(window)?
            .reply()
            .map_err(CaptureError::Geometry)?;

        let dims_match =
            geom.width == frame.width && geom.height == frame.height && geom.depth == frame.depth;
        if dims_match {
            match frame.repull(conn, window) {
                Ok(()) => return Ok(()),
                Err(e) => warn!("in-place refresh failed, reallocating: {}", e),
            }
        }

        // Stale frame. Allocate the replacement before touching the old one
        // so no failure point leaves the slot holding an invalid frame.
        match Frame::capture(conn, window, opts) {
            Ok(new) => {
                if let Some(old) = slot.replace(new) {
                    old.release(conn);
                }
                Ok(())
            }
            Err(e) => {
                match opts.refresh_fallback {
                    RefreshFallback::KeepStale => {
                        if !dims_match {
                            // The window may still serve its previous
                            // geometry as a sub-image; degrade to that
                            // rather than losing the frame.
                            if let Some(frame) = slot.as_mut() {
                                let _ = frame.repull(conn, window);
                            }
                        }
                        warn!("refresh reallocation failed, keeping previous frame: {}", e);
                    }
                    RefreshFallback::Discard => {
                        if let Some(old) = slot.take() {
                            old.release(conn);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Re-pull pixels into the existing storage at the frame's recorded
    /// geometry, using the strategy the frame was created with.
    fn repull(&mut self, conn: &impl Connection, window: Window) -> Result<(), CaptureError> {
        match &mut self.pixels {
            PixelBuffer::Shared { xid, .. } => {
                shm::get_image(
                    conn,
                    window,
                    0,
                    0,
                    self.width,
                    self.height,
                    u32::MAX,
                    ImageFormat::Z_PIXMAP.into(),
                    *xid,
                    0,
                )?
                .reply()
                .map_err(CaptureError::Populate)?;
                Ok(())
            }
            PixelBuffer::Owned(data) => {
                let reply = conn
                    .get_image(
                        ImageFormat::Z_PIXMAP,
                        window,
                        0,
                        0,
                        self.width,
                        self.height,
                        u32::MAX,
                    )?
                    .reply()
                    .map_err(CaptureError::Populate)?;
                *data = reply.data;
                Ok(())
            }
        }
    }

    /// Decode the packed pixel at (`x`, `y`), honoring the connection's
    /// image byte order.
    pub fn pixel(&self, x: u16, y: u16) -> u32 {
        let bpp = usize::from(self.bits_per_pixel) / 8;
        let offset = usize::from(y) * self.bytes_per_line + usize::from(x) * bpp;
        let bytes = &self.pixels.bytes()[offset..offset + bpp];
        if self.byte_order == ImageOrder::MSB_FIRST {
            bytes.iter().fold(0u32, |px, &b| (px << 8) | u32::from(b))
        } else {
            bytes
                .iter()
                .enumerate()
                .fold(0u32, |px, (i, &b)| px | (u32::from(b) << (8 * i)))
        }
    }

    pub fn is_shared(&self) -> bool {
        self.pixels.is_shared()
    }

    /// Tear the frame down. The server detach round trip completes before
    /// the mapping is dropped; detach failures are not actionable here and
    /// are only logged.
    pub fn release(self, conn: &impl Connection) {
        if let PixelBuffer::Shared { xid, .. } = &self.pixels {
            match shm::detach(conn, *xid) {
                Ok(cookie) => {
                    if let Err(e) = cookie.check() {
                        warn!("segment detach failed: {}", e);
                    }
                }
                Err(e) => warn!("segment detach could not be sent: {}", e),
            }
        }
        // Dropping self unmaps the segment and closes its fd.
    }

    /// Drop the frame's bookkeeping without touching the pixel storage,
    /// for when ownership of the mapping and its server attachment has
    /// been handed off.
    pub fn forget(mut self) {
        if let PixelBuffer::Shared { seg, .. } =
            std::mem::replace(&mut self.pixels, PixelBuffer::Owned(Vec::new()))
        {
            std::mem::forget(seg);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PixelLayout {
    bits_per_pixel: u8,
    bytes_per_line: usize,
}

fn layout_for_depth(setup: &Setup, depth: u8, width: u16) -> Result<PixelLayout, CaptureError> {
    let format = setup
        .pixmap_formats
        .iter()
        .find(|f| f.depth == depth)
        .ok_or(CaptureError::UnsupportedDepth(depth))?;
    Ok(PixelLayout {
        bits_per_pixel: format.bits_per_pixel,
        bytes_per_line: row_bytes(width, format.bits_per_pixel, format.scanline_pad),
    })
}

/// Row stride in bytes for `width` pixels padded to `scanline_pad` bits.
fn row_bytes(width: u16, bits_per_pixel: u8, scanline_pad: u8) -> usize {
    let pad = usize::from(scanline_pad.max(8));
    let bits = usize::from(width) * usize::from(bits_per_pixel);
    (bits + pad - 1) / pad * pad / 8
}

/// Accelerated allocation: segment, X id, server attach, server populate.
///
/// Everything before the attach unwinds by scope. Past the attach, the
/// server holds a reference that must be detached before the mapping drops.
fn capture_shared(
    conn: &impl Connection,
    window: Window,
    width: u16,
    height: u16,
    depth: u8,
    layout: PixelLayout,
) -> Result<Frame, CaptureError> {
    let size = layout.bytes_per_line * usize::from(height);
    let seg = ShmSegment::new(size).map_err(CaptureError::Segment)?;
    let xid = conn.generate_id().map_err(CaptureError::IdAlloc)?;

    let fd = seg.dup_fd().map_err(CaptureError::Segment)?;
    shm::attach_fd(conn, xid, fd, false)?
        .check()
        .map_err(CaptureError::Attach)?;

    let populated = shm::get_image(
        conn,
        window,
        0,
        0,
        width,
        height,
        u32::MAX,
        ImageFormat::Z_PIXMAP.into(),
        xid,
        0,
    )
    .map_err(CaptureError::from)
    .and_then(|cookie| cookie.reply().map_err(CaptureError::Populate));

    match populated {
        Ok(reply) => {
            debug!(
                "shared capture {}x{} depth {} ({} bytes)",
                width, height, reply.depth, reply.size
            );
            Ok(Frame {
                pixels: PixelBuffer::Shared { seg, xid },
                width,
                height,
                depth,
                bits_per_pixel: layout.bits_per_pixel,
                bytes_per_line: layout.bytes_per_line,
                byte_order: conn.setup().image_byte_order,
            })
        }
        Err(e) => {
            // Ordered unwind: the detach round trip first, then the segment
            // unmaps and closes when it drops.
            match shm::detach(conn, xid) {
                Ok(cookie) => {
                    let _ = cookie.check();
                }
                Err(detach_err) => warn!("segment detach could not be sent: {}", detach_err),
            }
            Err(e)
        }
    }
}

/// Direct-copy allocation: one blocking `GetImage`, the reply buffer
/// becomes the frame's storage.
fn capture_direct(
    conn: &impl Connection,
    window: Window,
    width: u16,
    height: u16,
    depth: u8,
    layout: PixelLayout,
) -> Result<Frame, CaptureError> {
    let reply = conn
        .get_image(ImageFormat::Z_PIXMAP, window, 0, 0, width, height, u32::MAX)?
        .reply()
        .map_err(CaptureError::Populate)?;

    debug!(
        "direct capture {}x{} depth {} ({} bytes)",
        width,
        height,
        reply.depth,
        reply.data.len()
    );

    Ok(Frame {
        pixels: PixelBuffer::Owned(reply.data),
        width,
        height,
        depth,
        bits_per_pixel: layout.bits_per_pixel,
        bytes_per_line: layout.bytes_per_line,
        byte_order: conn.setup().image_byte_order,
    })
}

/// Heap-backed frame with the gradient pattern used across the test
/// modules: `R = x mod 256`, `G = y mod 256`, `B = (x + y) mod 256`.
#[cfg(test)]
pub(crate) fn synthetic_frame(width: u16, height: u16, order: ImageOrder) -> Frame {
    let bytes_per_line = usize::from(width) * 4;
    let mut data = vec![0u8; bytes_per_line * usize::from(height)];
    for y in 0..u32::from(height) {
        for x in 0..u32::from(width) {
            let px = ((x % 256) << 16) | ((y % 256) << 8) | ((x + y) % 256);
            let off = y as usize * bytes_per_line + x as usize * 4;
            let enc = if order == ImageOrder::MSB_FIRST {
                px.to_be_bytes()
            } else {
                px.to_le_bytes()
            };
            data[off..off + 4].copy_from_slice(&enc);
        }
    }
    Frame {
        pixels: PixelBuffer::Owned(data),
        width,
        height,
        depth: 24,
        bits_per_pixel: 32,
        bytes_per_line,
        byte_order: order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_stride_honors_scanline_pad() {
        assert_eq!(row_bytes(4, 32, 32), 16);
        assert_eq!(row_bytes(3, 24, 32), 12);
        assert_eq!(row_bytes(5, 24, 32), 16);
        assert_eq!(row_bytes(1, 1, 32), 4);
    }

    #[test]
    fn pixel_decodes_lsb_first() {
        let frame = synthetic_frame(8, 4, ImageOrder::LSB_FIRST);
        assert_eq!(frame.pixel(0, 0), 0x00_00_00);
        assert_eq!(frame.pixel(3, 2), 0x03_02_05);
        assert_eq!(frame.pixel(7, 3), 0x07_03_0a);
    }

    #[test]
    fn pixel_decodes_msb_first() {
        let frame = synthetic_frame(8, 4, ImageOrder::MSB_FIRST);
        assert_eq!(frame.pixel(3, 2), 0x03_02_05);
        assert_eq!(frame.pixel(7, 3), 0x07_03_0a);
    }

    #[test]
    fn pixel_respects_row_padding() {
        // 3-byte pixels with a padded stride: 2 pixels per row, 8-byte rows.
        let bytes_per_line = 8;
        let mut data = vec![0u8; bytes_per_line * 2];
        // Pixel (1, 1) = 0x112233, LSB first.
        data[bytes_per_line + 3..bytes_per_line + 6].copy_from_slice(&[0x33, 0x22, 0x11]);
        let frame = Frame {
            pixels: PixelBuffer::Owned(data),
            width: 2,
            height: 2,
            depth: 24,
            bits_per_pixel: 24,
            bytes_per_line,
            byte_order: ImageOrder::LSB_FIRST,
        };
        assert_eq!(frame.pixel(1, 1), 0x112233);
        assert_eq!(frame.pixel(0, 0), 0);
    }

    #[test]
    fn default_options() {
        let opts = CaptureOptions::default();
        assert_eq!(opts.strategy, Strategy::Direct);
        assert!(opts.fallback_to_direct);
        assert_eq!(opts.refresh_fallback, RefreshFallback::KeepStale);
    }

    #[test]
    fn forget_skips_cleanup() {
        let frame = synthetic_frame(2, 2, ImageOrder::LSB_FIRST);
        frame.forget();
    }
}
