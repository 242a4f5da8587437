//! Two-column `filename,label` table of a labeled image set.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::PipelineError;
use crate::dataset::LabeledImages;

pub const LABELS_HEADER: &str = "filename,label";

/// Render the table: a header row, then one row per image with `real` or
/// `fake`, genuine images first.
pub fn render_labels(images: &LabeledImages) -> String {
    let mut out = String::with_capacity(32 * (images.len() + 1));
    out.push_str(LABELS_HEADER);
    out.push('\n');
    for (path, label) in images.entries() {
        out.push_str(&csv_field(&path.display().to_string()));
        out.push(',');
        out.push_str(label.table_name());
        out.push('\n');
    }
    out
}

/// Write the table to `path`, creating parent directories.
pub fn write_labels(path: impl AsRef<Path>, images: &LabeledImages) -> Result<(), PipelineError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = BufWriter::new(fs::File::create(path)?);
    writer.write_all(render_labels(images).as_bytes())?;
    writer.flush()?;
    info!(path = %path.display(), rows = images.len(), "label table written");
    Ok(())
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
