use std::io::Cursor;

use anyhow::{Context, Result};
use chrono::Utc;
use image::{DynamicImage, ImageFormat};

use atelier_contracts::logs::jst;

/// Decodes any supported upload or service response and re-encodes it as the
/// canonical form: RGBA PNG. Corrupt data surfaces as an error and the
/// caller leaves the target slot untouched.
pub fn normalize_png(bytes: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes).context("could not decode image data")?;
    let rgba = DynamicImage::ImageRgba8(decoded.to_rgba8());
    encode(&rgba, ImageFormat::Png)
}

/// WebP rendition of a canonical PNG, for the alternate download format.
pub fn encode_webp(png: &[u8]) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(png).context("could not decode image data")?;
    encode(&decoded, ImageFormat::WebP)
}

/// Preview no larger than `max` on either side, keeping aspect ratio.
pub fn thumbnail_png(png: &[u8], max: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(png).context("could not decode image data")?;
    encode(&decoded.thumbnail(max, max), ImageFormat::Png)
}

pub fn dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let decoded = image::load_from_memory(bytes).context("could not decode image data")?;
    Ok((decoded.width(), decoded.height()))
}

/// Timestamped download name in the fixed civil time zone, e.g.
/// `generated_20260301_142305.png` for prefix `generated`.
pub fn download_name(prefix: &str, extension: &str) -> String {
    let now = Utc::now().with_timezone(&jst());
    format!("{prefix}_{}.{extension}", now.format("%Y%m%d_%H%M%S"))
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, format)
        .with_context(|| format!("{format:?} encode failed"))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn sample_jpeg() -> Vec<u8> {
        let mut img = RgbImage::new(64, 32);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 4) as u8, (y * 8) as u8, 128]);
        }
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Jpeg)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn normalize_re_encodes_as_rgba_png() -> Result<()> {
        let png = normalize_png(&sample_jpeg())?;
        let decoded = image::load_from_memory(&png)?;
        assert_eq!(image::guess_format(&png)?, ImageFormat::Png);
        assert_eq!(decoded.color(), image::ColorType::Rgba8);
        assert_eq!(dimensions(&png)?, (64, 32));
        Ok(())
    }

    #[test]
    fn normalize_rejects_corrupt_data() {
        assert!(normalize_png(b"not an image").is_err());
        assert!(normalize_png(&[]).is_err());
    }

    #[test]
    fn webp_export_round_trips_dimensions() -> Result<()> {
        let png = normalize_png(&sample_jpeg())?;
        let webp = encode_webp(&png)?;
        assert_eq!(image::guess_format(&webp)?, ImageFormat::WebP);
        assert_eq!(dimensions(&webp)?, (64, 32));
        Ok(())
    }

    #[test]
    fn thumbnail_fits_within_the_bound() -> Result<()> {
        let png = normalize_png(&sample_jpeg())?;
        let thumb = thumbnail_png(&png, 16)?;
        let (width, height) = dimensions(&thumb)?;
        assert!(width <= 16 && height <= 16);
        assert_eq!((width, height), (16, 8));
        Ok(())
    }

    #[test]
    fn download_name_embeds_prefix_and_extension() {
        let name = download_name("edited", "png");
        assert!(name.starts_with("edited_"));
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "edited_YYYYMMDD_HHMMSS.png".len());
    }
}
