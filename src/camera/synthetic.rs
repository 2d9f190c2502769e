//! Generated test-pattern frames shaped like baseline JPEG files.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CameraDriver, FrameError};

/// Produces JPEG-framed (SOI ... EOI) payloads whose size tracks resolution
/// and quality, so transport pacing behaves like a real sensor.
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    quality: u8,
    frame_index: u64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32, quality: u8) -> Self {
        Self {
            width,
            height,
            quality,
            frame_index: 0,
        }
    }

    fn payload_len(&self) -> usize {
        // lower quality values mean finer quantization and bigger frames
        let pixels = self.width as usize * self.height as usize;
        (pixels / (8 + self.quality as usize)).max(64)
    }
}

impl CameraDriver for SyntheticCamera {
    fn init(&mut self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::InitFailed(format!(
                "invalid synthetic resolution {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }

    fn grab(&mut self) -> Option<Bytes> {
        self.frame_index += 1;
        let comment = format!("camnode frame {}", self.frame_index);
        let payload_len = self.payload_len();

        let mut frame = BytesMut::with_capacity(payload_len + comment.len() + 8);
        frame.put_slice(&[0xFF, 0xD8]);
        frame.put_slice(&[0xFF, 0xFE]);
        frame.put_u16(comment.len() as u16 + 2);
        frame.put_slice(comment.as_bytes());

        let seed = self.frame_index as u8;
        for i in 0..payload_len {
            // keep 0xFF out of the scan data so markers stay unambiguous
            frame.put_u8(((i as u8).wrapping_mul(31) ^ seed) & 0x7F);
        }

        frame.put_slice(&[0xFF, 0xD9]);
        Some(frame.freeze())
    }

    fn describe(&self) -> String {
        format!("synthetic {}x{} q{}", self.width, self.height, self.quality)
    }
}
