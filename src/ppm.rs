// Copyright 2025 xsnap Authors
// SPDX-License-Identifier: Apache-2.0

//! PPM (P6) serialization
//!
//! One output file per call: ASCII header, then raw RGB triplets in
//! row-major order, no padding, no compression. Channels come out of the
//! packed pixel with the usual truecolor shifts.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::capture::Frame;
use crate::error::PpmError;

/// Serialize `frame` to `path` as binary PPM.
///
/// An empty frame is rejected before the file is created. A sub-24-bit
/// pixel format is rejected after, leaving the file empty; the output
/// would be useless anyway.
pub fn write_ppm<P: AsRef<Path>>(frame: &Frame, path: P) -> Result<(), PpmError> {
    if frame.width == 0 || frame.height == 0 || frame.pixels.bytes().is_empty() {
        return Err(PpmError::EmptyFrame);
    }
    let expected = frame.bytes_per_line * usize::from(frame.height);
    let actual = frame.pixels.bytes().len();
    if actual < expected {
        return Err(PpmError::Truncated { expected, actual });
    }

    let file = File::create(path)?;
    if frame.bits_per_pixel < 24 {
        return Err(PpmError::UnsupportedDepth(frame.bits_per_pixel));
    }

    let mut out = BufWriter::new(file);
    write!(out, "P6\n{} {}\n255\n", frame.width, frame.height)?;
    for y in 0..frame.height {
        for x in 0..frame.width {
            let px = frame.pixel(x, y);
            out.write_all(&[(px >> 16) as u8, (px >> 8) as u8, px as u8])?;
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use x11rb::protocol::xproto::ImageOrder;

    use super::*;
    use crate::capture::{synthetic_frame, PixelBuffer};

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("xsnap-ppm-{}-{}.ppm", tag, std::process::id()))
    }

    #[test]
    fn round_trip() {
        let frame = synthetic_frame(16, 9, ImageOrder::LSB_FIRST);
        let path = temp_path("roundtrip");
        write_ppm(&frame, &path).unwrap();

        let bytes = fs::read(&path).unwrap();
        let header = format!("P6\n{} {}\n255\n", 16, 9);
        assert_eq!(bytes.len(), header.len() + 16 * 9 * 3);
        assert!(bytes.starts_with(header.as_bytes()));

        let body = &bytes[header.len()..];
        for y in 0u32..9 {
            for x in 0u32..16 {
                let i = ((y * 16 + x) * 3) as usize;
                assert_eq!(u32::from(body[i]), x % 256);
                assert_eq!(u32::from(body[i + 1]), y % 256);
                assert_eq!(u32::from(body[i + 2]), (x + y) % 256);
            }
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn byte_orders_serialize_identically() {
        let lsb = synthetic_frame(10, 6, ImageOrder::LSB_FIRST);
        let msb = synthetic_frame(10, 6, ImageOrder::MSB_FIRST);
        let lsb_path = temp_path("order-lsb");
        let msb_path = temp_path("order-msb");
        write_ppm(&lsb, &lsb_path).unwrap();
        write_ppm(&msb, &msb_path).unwrap();
        assert_eq!(fs::read(&lsb_path).unwrap(), fs::read(&msb_path).unwrap());
        fs::remove_file(&lsb_path).unwrap();
        fs::remove_file(&msb_path).unwrap();
    }

    #[test]
    fn rejects_low_depth() {
        let mut frame = synthetic_frame(4, 3, ImageOrder::LSB_FIRST);
        frame.bits_per_pixel = 16;
        let path = temp_path("lowdepth");
        match write_ppm(&frame, &path) {
            Err(PpmError::UnsupportedDepth(16)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // The file exists but holds no triplet data.
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_empty_frame() {
        let frame = Frame {
            pixels: PixelBuffer::Owned(Vec::new()),
            width: 0,
            height: 0,
            depth: 0,
            bits_per_pixel: 32,
            bytes_per_line: 0,
            byte_order: ImageOrder::LSB_FIRST,
        };
        let path = temp_path("empty");
        assert!(matches!(write_ppm(&frame, &path), Err(PpmError::EmptyFrame)));
        assert!(!path.exists());
    }

    #[test]
    fn rejects_truncated_buffer() {
        let mut frame = synthetic_frame(4, 3, ImageOrder::LSB_FIRST);
        if let PixelBuffer::Owned(data) = &mut frame.pixels {
            data.truncate(8);
        }
        let path = temp_path("truncated");
        assert!(matches!(
            write_ppm(&frame, &path),
            Err(PpmError::Truncated { .. })
        ));
        assert!(!path.exists());
    }
}
