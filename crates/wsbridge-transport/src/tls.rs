use tracing::debug;

/// Install aws-lc-rs as the process-wide rustls provider unless one is set.
///
/// rustls refuses to pick a provider on its own when more than one backend
/// is compiled in, and both axum-server and tokio-tungstenite build their
/// configs from the process default.
pub(crate) fn ensure_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_ok()
    {
        debug!("installed aws-lc-rs as default rustls provider");
    }
}
