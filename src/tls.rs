use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// 加载额外信任的 CA 证书（PEM，可包含多张）
pub fn load_ca_bundle(path: &Path) -> Result<Vec<reqwest::Certificate>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open CA bundle: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let ders = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse CA bundle: {:?}", path))?;

    if ders.is_empty() {
        anyhow::bail!("No certificates found in CA bundle {:?}", path);
    }

    ders.iter()
        .map(|der| {
            reqwest::Certificate::from_der(der.as_ref())
                .context("Failed to load CA certificate")
        })
        .collect()
}
