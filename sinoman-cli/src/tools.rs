//! Offline helpers: request signatures and certificate pins.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use eyre::{bail, eyre, WrapErr};
use reqwest::Method;
use sinoman_core::{CertificatePin, RequestSigner, SIGNATURE_HEADER};

pub fn sign(key: &str, method: &str, url: &str, body: Option<&str>) -> eyre::Result<String> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| eyre!("invalid HTTP method `{method}`"))?;
    let signer = RequestSigner::from_bytes(key.as_bytes())?;
    Ok(signer.sign(&method, url, body.map(str::as_bytes)))
}

pub fn print_signature(signature: &str, json: bool) {
    if json {
        println!("{}", serde_json::json!({ "header": SIGNATURE_HEADER, "value": signature }));
    } else {
        println!("{SIGNATURE_HEADER}: {signature}");
    }
}

pub fn fingerprint(path: &Path) -> eyre::Result<CertificatePin> {
    let bytes = std::fs::read(path)
        .wrap_err_with(|| format!("failed to read certificate {}", path.display()))?;
    Ok(CertificatePin::from_der(&certificate_der(&bytes)?))
}

/// Accepts DER as-is and takes the first certificate of a PEM file.
fn certificate_der(bytes: &[u8]) -> eyre::Result<Vec<u8>> {
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Ok(bytes.to_vec());
    };
    if !text.contains("-----BEGIN") {
        return Ok(bytes.to_vec());
    }

    let body: String = text
        .lines()
        .skip_while(|line| !line.starts_with("-----BEGIN CERTIFICATE-----"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END CERTIFICATE-----"))
        .map(str::trim)
        .collect();
    if body.is_empty() {
        bail!("no CERTIFICATE block in PEM input");
    }
    STANDARD
        .decode(body)
        .wrap_err("PEM certificate is not valid base64")
}
