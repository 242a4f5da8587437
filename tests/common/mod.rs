//! Shared fixtures for the MedGuard integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use image::{Rgb, RgbImage};
use medguard::{AutoencoderConfig, MedguardConfig};

/// A scratch workspace with `real_medicines/` and `fake_medicines/`.
pub struct Workspace {
    pub dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new(genuine: usize, counterfeit: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real_medicines");
        let fake = dir.path().join("fake_medicines");
        std::fs::create_dir_all(&real).unwrap();
        std::fs::create_dir_all(&fake).unwrap();
        for i in 0..genuine {
            genuine_package(i).save(real.join(format!("pack_{i:03}.png"))).unwrap();
        }
        for i in 0..counterfeit {
            counterfeit_package(i).save(fake.join(format!("pack_{i:03}.png"))).unwrap();
        }
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn genuine_dir(&self) -> PathBuf {
        self.path().join("real_medicines")
    }

    pub fn counterfeit_dir(&self) -> PathBuf {
        self.path().join("fake_medicines")
    }

    /// Small, fast run configuration rooted in this workspace.
    pub fn config(&self, out: &str) -> MedguardConfig {
        let mut cfg = MedguardConfig::default();
        cfg.data.genuine_dir = self.genuine_dir();
        cfg.data.counterfeit_dir = self.counterfeit_dir();
        cfg.data.val_fraction = 0.25;
        cfg.extractor = cfg.extractor.with_weights(None).with_image_size(32).with_batch_size(8);
        cfg.autoencoder = AutoencoderConfig::default()
            .with_architecture(vec![32], 8)
            .with_batch_size(8)
            .with_max_epochs(5);
        let out = self.path().join(out);
        cfg.output.model_dir = out.join("models");
        cfg.output.report_dir = out.join("reports");
        cfg.output.labels_csv = out.join("labels.csv");
        cfg
    }
}

/// Clean print: pale background, a blue band and a regular text block.
pub fn genuine_package(i: usize) -> RgbImage {
    let shift = (i % 5) as u32;
    RgbImage::from_fn(48, 48, |x, y| {
        if (16..24).contains(&y) {
            Rgb([20, 60, 200])
        } else if (30..40).contains(&y) && (x + shift) % 4 == 0 {
            Rgb([40, 40, 40])
        } else {
            Rgb([235, 235, 230])
        }
    })
}

/// Smudged reprint: off colours and noisy texture.
pub fn counterfeit_package(i: usize) -> RgbImage {
    RgbImage::from_fn(48, 48, |x, y| {
        let noise = ((x * 31 + y * 17 + i as u32 * 13) % 97) as u8;
        Rgb([150 + noise, 90 + noise / 2, 40 + noise])
    })
}
