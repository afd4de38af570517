use std::time::Instant;

use jpeg_decoder::Decoder;
use tracing::trace;

use super::frame::{Frame, PixelFormat};
use crate::error::StreamError;

/// Decode one marker-delimited JPEG payload into an RGB frame.
///
/// Corrupt payloads surface as `StreamError::Decode`, which callers drop.
pub fn decode_jpeg(data: &[u8]) -> Result<Frame, StreamError> {
    let start = Instant::now();

    let mut decoder = Decoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| StreamError::Decode(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| StreamError::Decode("missing image header".into()))?;

    let format = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
        jpeg_decoder::PixelFormat::L8 => PixelFormat::Gray8,
        other => {
            return Err(StreamError::Decode(format!(
                "unsupported jpeg pixel format {:?}",
                other
            )))
        }
    };

    let width = u32::from(info.width);
    let height = u32::from(info.height);
    if pixels.len() != width as usize * height as usize * format.channels() {
        return Err(StreamError::Decode(format!(
            "decoded {} bytes for {}x{} {:?}",
            pixels.len(),
            width,
            height,
            format
        )));
    }

    let elapsed = start.elapsed();
    metrics::histogram!("phonecam_decode_time_us").record(elapsed.as_micros() as f64);
    trace!(width, height, ?elapsed, "decoded jpeg");

    Ok(Frame::new(pixels, width, height, format).with_sequence(0, data.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 10]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg).unwrap();
        out.into_inner()
    }

    #[test]
    fn decodes_rgb_jpeg() {
        let jpeg = encode_jpeg(32, 16);
        let frame = decode_jpeg(&jpeg).unwrap();
        assert_eq!(frame.width(), 32);
        assert_eq!(frame.height(), 16);
        assert_eq!(frame.format(), PixelFormat::Rgb24);
        assert_eq!(frame.data.len(), 32 * 16 * 3);
        assert_eq!(frame.meta.encoded_len, jpeg.len());
    }

    #[test]
    fn corrupt_payload_is_a_decode_error() {
        let err = decode_jpeg(&[0xFF, 0xD8, 0x00, 0x11, 0xFF, 0xD9]).unwrap_err();
        assert!(err.is_recoverable());
    }
}
