use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

/// A file placed at the top level of a bundle.
pub struct BundleEntry<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Packs `entries` into an in-memory `.tar.gz`, preserving their order.
pub fn build_bundle(entries: &[BundleEntry<'_>]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(entry.data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        builder
            .append_data(&mut header, entry.name, entry.data)
            .with_context(|| format!("Failed to add {} to bundle", entry.name))?;
    }

    let encoder = builder.into_inner().context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}
