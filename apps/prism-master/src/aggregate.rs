//! Averaging of stochastic render samples into one output image.
//!
//! Pure functions over decoded images; the only state is the accumulator.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, ImageFormat, RgbImage};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("no samples to aggregate")]
    Empty,
    #[error("sample {index} is {got_w}x{got_h}, expected {want_w}x{want_h}")]
    DimensionMismatch {
        index: usize,
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// Quantize one accumulated channel back to 8 bits, clamping the extremes.
/// Rounds to nearest so that averaging N identical samples reproduces the
/// input exactly despite accumulation error.
fn clamp_channel(value: f32) -> u8 {
    ((value * 255.0).round() as i32).clamp(0, 255) as u8
}

/// Average N same-dimension samples channel-wise in floating point.
/// Every sample must match the first sample's dimensions.
pub fn average_images(samples: &[RgbImage]) -> Result<RgbImage, AggregateError> {
    let first = samples.first().ok_or(AggregateError::Empty)?;
    let (width, height) = first.dimensions();

    let mut accum = vec![0f32; (width * height * 3) as usize];
    for (index, sample) in samples.iter().enumerate() {
        let (got_w, got_h) = sample.dimensions();
        if (got_w, got_h) != (width, height) {
            return Err(AggregateError::DimensionMismatch {
                index,
                got_w,
                got_h,
                want_w: width,
                want_h: height,
            });
        }
        for (acc, channel) in accum.iter_mut().zip(sample.as_raw()) {
            *acc += f32::from(*channel) / 255.0;
        }
    }

    let inv = 1.0 / samples.len() as f32;
    let pixels: Vec<u8> = accum.iter().map(|c| clamp_channel(c * inv)).collect();

    Ok(RgbImage::from_raw(width, height, pixels)
        .expect("accumulator length matches image dimensions"))
}

/// Decode N JPEG samples, average them, and re-encode the result.
pub fn aggregate_jpegs(samples: &[Vec<u8>]) -> Result<Vec<u8>, AggregateError> {
    let decoded = samples
        .iter()
        .map(|bytes| {
            image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
                .map(|img| img.to_rgb8())
        })
        .collect::<Result<Vec<_>, _>>()?;

    let averaged = average_images(&decoded)?;
    let (width, height) = averaged.dimensions();

    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 100).encode(
        averaged.as_raw(),
        width,
        height,
        ColorType::Rgb8,
    )?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, image::Rgb(rgb))
    }

    #[test]
    fn uniform_samples_average_to_themselves() {
        let samples = vec![solid(10, 10, [200, 0, 0]); 4];
        let averaged = average_images(&samples).unwrap();
        assert_eq!(averaged, samples[0]);
    }

    #[test]
    fn two_samples_average_channel_wise() {
        let samples = vec![solid(2, 2, [0, 0, 0]), solid(2, 2, [255, 255, 255])];
        let averaged = average_images(&samples).unwrap();
        assert_eq!(averaged.get_pixel(0, 0).0, [128, 128, 128]);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(average_images(&[]), Err(AggregateError::Empty)));
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let samples = vec![solid(4, 4, [1, 2, 3]), solid(4, 5, [1, 2, 3])];
        let err = average_images(&samples).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::DimensionMismatch { index: 1, .. }
        ));
    }

    #[test]
    fn clamp_saturates_at_both_ends() {
        assert_eq!(clamp_channel(-0.5), 0);
        assert_eq!(clamp_channel(0.0), 0);
        assert_eq!(clamp_channel(1.0), 255);
        assert_eq!(clamp_channel(2.0), 255);
    }

    #[test]
    fn jpeg_round_trip_produces_decodable_output() {
        let mut sample = Vec::new();
        JpegEncoder::new_with_quality(&mut sample, 100)
            .encode(solid(10, 10, [255, 0, 0]).as_raw(), 10, 10, ColorType::Rgb8)
            .unwrap();

        let out = aggregate_jpegs(&[sample.clone(), sample]).unwrap();
        let decoded = image::load_from_memory_with_format(&out, ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded.dimensions(), (10, 10));
        // Averaging identical samples must not shift the dominant channel.
        let pixel = decoded.get_pixel(5, 5).0;
        assert!(pixel[0] > 240 && pixel[1] < 15 && pixel[2] < 15);
    }
}
