//! Self-signed TLS material for `serve --self-signed`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use sha2::{Digest, Sha256};

pub struct SelfSigned {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// `sha256:<hex>` of the DER certificate
    pub fingerprint: String,
}

/// Compute SHA-256 fingerprint from a PEM certificate file.
/// Returns `"sha256:<hex>"` or None if parsing fails.
pub fn fingerprint_from_pem(cert_path: &Path) -> Option<String> {
    let pem = std::fs::read_to_string(cert_path).ok()?;
    let b64: String = pem
        .lines()
        .skip_while(|l| !l.starts_with("-----BEGIN CERTIFICATE"))
        .skip(1)
        .take_while(|l| !l.starts_with("-----END"))
        .collect();
    let der = base64::engine::general_purpose::STANDARD.decode(&b64).ok()?;
    Some(fingerprint_der(&der))
}

fn fingerprint_der(der: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(der)))
}

/// Ensure `cert.pem` and `key.pem` exist in `dir`, generating them if needed.
pub fn ensure_self_signed(dir: &Path) -> anyhow::Result<SelfSigned> {
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    if cert_path.exists() && key_path.exists() {
        let fingerprint = fingerprint_from_pem(&cert_path)
            .with_context(|| format!("unreadable certificate {}", cert_path.display()))?;
        return Ok(SelfSigned {
            cert_path,
            key_path,
            fingerprint,
        });
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    // SANs: localhost, loopback addresses, and the machine hostname
    let mut sans = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];
    if let Ok(hostname) = hostname::get() {
        let hostname = hostname.to_string_lossy().to_string();
        if !hostname.is_empty() && !sans.contains(&hostname) {
            sans.push(hostname);
        }
    }

    let mut subject_alt_names = Vec::with_capacity(sans.len());
    for san in sans {
        let entry = match san.parse::<IpAddr>() {
            Ok(ip) => rcgen::SanType::IpAddress(ip),
            Err(_) => rcgen::SanType::DnsName(san.try_into()?),
        };
        subject_alt_names.push(entry);
    }

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
    params.subject_alt_names = subject_alt_names;

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    let fingerprint = fingerprint_der(cert.der());

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600));
    }

    Ok(SelfSigned {
        cert_path,
        key_path,
        fingerprint,
    })
}
