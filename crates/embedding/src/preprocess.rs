//! Image decoding and tensor layout.
//!
//! Every image goes through the same fixed recipe before it reaches the trunk:
//! decode to RGB8, bilinear resize to `image_size`², optional center crop,
//! scale to `[0, 1]`, then per-channel standardization. The output is a flat
//! CHW buffer ready to be stacked into an `(N, 3, S, S)` tensor.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};

use crate::normalize::standardize_chw;
use crate::{EmbeddingError, ExtractorConfig};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// List JPEG/PNG files directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, EmbeddingError> {
    if !dir.is_dir() {
        return Err(EmbeddingError::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

pub(crate) fn decode_path(path: &Path) -> Result<RgbImage, EmbeddingError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| EmbeddingError::Decode {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

pub(crate) fn decode_bytes(bytes: &[u8]) -> Result<RgbImage, EmbeddingError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| EmbeddingError::Decode {
            path: "<upload>".into(),
            reason: e.to_string(),
        })
}

/// Resize, crop and standardize an image into a CHW `f32` buffer.
pub(crate) fn to_chw(img: &RgbImage, cfg: &ExtractorConfig) -> Vec<f32> {
    let size = cfg.image_size as u32;
    let resized = imageops::resize(img, size, size, FilterType::Triangle);
    let view = match cfg.center_crop {
        Some(crop) => {
            let crop = crop as u32;
            let offset = (size - crop) / 2;
            imageops::crop_imm(&resized, offset, offset, crop, crop).to_image()
        }
        None => resized,
    };

    let (w, h) = view.dimensions();
    let plane = (w * h) as usize;
    let mut out = vec![0f32; 3 * plane];
    for (i, px) in view.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = f32::from(px.0[c]) / 255.0;
        }
    }
    standardize_chw(&mut out, plane, &cfg.mean, &cfg.std);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn cfg(size: usize) -> ExtractorConfig {
        ExtractorConfig::default()
            .with_weights(None)
            .with_image_size(size)
    }

    #[test]
    fn chw_layout_has_three_planes() {
        let img = RgbImage::from_pixel(10, 20, Rgb([255, 0, 128]));
        let out = to_chw(&img, &cfg(32));
        assert_eq!(out.len(), 3 * 32 * 32);

        let c = cfg(32);
        let red = (1.0 - c.mean[0]) / c.std[0];
        let green = (0.0 - c.mean[1]) / c.std[1];
        assert!((out[0] - red).abs() < 1e-5);
        assert!((out[32 * 32] - green).abs() < 1e-5);
    }

    #[test]
    fn center_crop_shrinks_output() {
        let img = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
        let out = to_chw(&img, &cfg(64).with_center_crop(Some(48)));
        assert_eq!(out.len(), 3 * 48 * 48);
    }

    #[test]
    fn list_images_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.jpeg"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = list_images(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.jpeg"]);
    }

    #[test]
    fn list_images_missing_directory() {
        let err = list_images(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, EmbeddingError::DirectoryNotFound(_)));
    }

    #[test]
    fn decode_bytes_rejects_garbage() {
        let err = decode_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, EmbeddingError::Decode { .. }));
    }
}
