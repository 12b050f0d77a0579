//! QUIC configuration and fingerprinting for HTTP/3.
//!
//! The rustls/quinn pair is the engine here. [`QuicOptions`] mirror the TCP
//! side's TLS options; a [`QuicFingerprint`] carries the transport
//! parameters a specific client implementation would advertise, applied to
//! the engine's transport config where it exposes them. Configs are built
//! fresh per dial; the caller's structs are never mutated.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Baseline options for QUIC-carried handshakes.
#[derive(Debug, Clone, TypedBuilder)]
pub struct QuicOptions {
    /// Skip certificate verification, like the TCP-side default.
    #[builder(default = true)]
    pub insecure_skip_verify: bool,

    /// Idle timeout before the engine drops the connection.
    #[builder(default, setter(into))]
    pub max_idle_timeout: Option<Duration>,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Transport-parameter shape to imitate in the QUIC handshake.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct QuicFingerprint {
    /// max_idle_timeout transport parameter.
    #[builder(default, setter(into))]
    pub max_idle_timeout: Option<Duration>,

    /// initial_max_data.
    #[builder(default, setter(into))]
    pub initial_max_data: Option<u64>,

    /// initial_max_stream_data (applied to receive windows).
    #[builder(default, setter(into))]
    pub initial_max_stream_data: Option<u64>,

    /// initial_max_streams_bidi.
    #[builder(default, setter(into))]
    pub initial_max_streams_bidi: Option<u64>,

    /// initial_max_streams_uni.
    #[builder(default, setter(into))]
    pub initial_max_streams_uni: Option<u64>,
}

/// ALPN identifier for HTTP/3.
pub(crate) const ALPN_H3: &[u8] = b"h3";

struct DangerousServerVerifier;

impl rustls::client::ServerCertVerifier for DangerousServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Build the per-dial quinn client config: cloned-from-options rustls config
/// with `h3` ALPN, plus transport parameters from the fingerprint.
pub(crate) fn client_config(
    options: &QuicOptions,
    fingerprint: Option<&QuicFingerprint>,
) -> Result<quinn::ClientConfig> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();
    let mut crypto = if options.insecure_skip_verify {
        builder
            .with_custom_certificate_verifier(Arc::new(DangerousServerVerifier))
            .with_no_client_auth()
    } else {
        // manual-roots policy: nothing trusted until the caller installs roots
        builder
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth()
    };
    crypto.alpn_protocols = vec![ALPN_H3.to_vec()];
    crypto.enable_early_data = true;

    let mut config = quinn::ClientConfig::new(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    let idle = fingerprint
        .and_then(|fp| fp.max_idle_timeout)
        .or(options.max_idle_timeout);
    if let Some(idle) = idle {
        let idle = quinn::IdleTimeout::try_from(idle).map_err(Error::quic)?;
        transport.max_idle_timeout(Some(idle));
    }
    if let Some(fp) = fingerprint {
        if let Some(window) = fp.initial_max_data {
            transport.receive_window(var_int(window)?);
        }
        if let Some(window) = fp.initial_max_stream_data {
            transport.stream_receive_window(var_int(window)?);
        }
        if let Some(streams) = fp.initial_max_streams_bidi {
            transport.max_concurrent_bidi_streams(var_int(streams)?);
        }
        if let Some(streams) = fp.initial_max_streams_uni {
            transport.max_concurrent_uni_streams(var_int(streams)?);
        }
    }
    config.transport_config(Arc::new(transport));

    Ok(config)
}

fn var_int(value: u64) -> Result<quinn::VarInt> {
    quinn::VarInt::from_u64(value).map_err(Error::quic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_config() {
        let options = QuicOptions::default();
        assert!(client_config(&options, None).is_ok());
    }

    #[test]
    fn builds_fingerprinted_config() {
        let options = QuicOptions::default();
        let fp = QuicFingerprint::builder()
            .max_idle_timeout(Duration::from_secs(30))
            .initial_max_data(15728640u64)
            .initial_max_stream_data(6291456u64)
            .initial_max_streams_bidi(100u64)
            .build();
        assert!(client_config(&options, Some(&fp)).is_ok());
    }

    #[test]
    fn var_int_bounds() {
        assert!(var_int(u64::MAX).is_err());
        assert!(var_int(1024).is_ok());
    }
}
