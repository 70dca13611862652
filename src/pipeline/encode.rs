//! Image encoding for the VLM: `DynamicImage` → base64 PNG `ImageData`.
//!
//! PNG keeps rendered text crisp; JPEG artefacts on small glyphs throw off
//! region boundaries. Page images go out at `detail: "high"` so small
//! captions and footnotes are still visible to the model; language crops
//! are small and go out at `"low"`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::DynamicImage;
use std::io::Cursor;
use tracing::debug;

/// Encode an image as PNG bytes.
pub fn png_bytes(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

/// Encode a full page for layout analysis.
pub fn encode_page(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    encode_with_detail(img, "high")
}

/// Encode a text-region crop for language detection.
pub fn encode_crop(img: &DynamicImage) -> Result<ImageData, image::ImageError> {
    encode_with_detail(img, "low")
}

fn encode_with_detail(img: &DynamicImage, detail: &str) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    debug!(
        "Encoded {}x{} image → {} bytes base64",
        img.width(),
        img.height(),
        b64.len()
    );
    Ok(ImageData::new(b64, "image/png").with_detail(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn page_encodes_as_png() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(10, 10, Rgba([255, 0, 0, 255])));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn crop_encodes_too() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255])));
        assert!(!encode_crop(&img).unwrap().data.is_empty());
    }
}
