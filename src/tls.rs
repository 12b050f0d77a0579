//! TLS configuration and ClientHello fingerprinting.
//!
//! The baseline [`TlsOptions`] cover verification and session behaviour; a
//! [`Ja3Fingerprint`] reshapes the ClientHello (cipher order, curves,
//! signature algorithms, GREASE, extension permutation) so the handshake
//! imitates a specific client implementation. BoringSSL is the engine; the
//! fingerprint is applied as connector configuration, and both are cloned
//! per dial so a caller's config is never mutated.

use std::borrow::Cow;
use std::fmt;

use boring::ssl::{
    SslConnector, SslConnectorBuilder, SslCurve, SslMethod, SslOptions, SslSessionCacheMode,
    SslVerifyMode, SslVersion,
};
use tokio::io::{AsyncRead, AsyncWrite};
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// A TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls1_0,
    Tls1_1,
    Tls1_2,
    Tls1_3,
}

impl TlsVersion {
    fn into_ssl_version(self) -> SslVersion {
        match self {
            TlsVersion::Tls1_0 => SslVersion::TLS1,
            TlsVersion::Tls1_1 => SslVersion::TLS1_1,
            TlsVersion::Tls1_2 => SslVersion::TLS1_2,
            TlsVersion::Tls1_3 => SslVersion::TLS1_3,
        }
    }
}

/// Baseline TLS options for TCP-carried handshakes.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TlsOptions {
    /// Skip certificate verification. The crate exists to look like specific
    /// clients against arbitrary endpoints, so this defaults to `true`.
    #[builder(default = true)]
    pub insecure_skip_verify: bool,

    /// Verify that the certificate matches the server name.
    #[builder(default = false)]
    pub verify_hostname: bool,

    /// Send the server_name extension.
    #[builder(default = true)]
    pub tls_sni: bool,

    /// Keep an in-memory session cache so resumed handshakes carry tickets
    /// the way long-lived browser sessions do.
    #[builder(default = true)]
    pub session_cache: bool,

    /// The minimum TLS version to offer.
    #[builder(default, setter(into))]
    pub min_tls_version: Option<TlsVersion>,

    /// The maximum TLS version to offer.
    #[builder(default, setter(into))]
    pub max_tls_version: Option<TlsVersion>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A ClientHello shape to imitate.
///
/// BoringSSL applies what its configuration surface exposes: the cipher
/// mini-language, curve and signature-algorithm lists, GREASE and extension
/// permutation. Knobs are optional; unset ones leave the engine default.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct Ja3Fingerprint {
    /// Cipher suites, in offer order, in BoringSSL's mini-language.
    #[builder(default, setter(strip_option, into))]
    pub cipher_list: Option<Cow<'static, str>>,

    /// Supported groups / key-share curves, in offer order.
    #[builder(default, setter(strip_option, into))]
    pub curves: Option<Cow<'static, [SslCurve]>>,

    /// Signature algorithms, in offer order.
    #[builder(default, setter(strip_option, into))]
    pub sigalgs_list: Option<Cow<'static, str>>,

    /// Offer GREASE values (RFC 8701).
    #[builder(default, setter(into))]
    pub grease_enabled: Option<bool>,

    /// Permute ClientHello extension order.
    #[builder(default, setter(into))]
    pub permute_extensions: Option<bool>,

    /// Request OCSP stapling.
    #[builder(default = false)]
    pub enable_ocsp_stapling: bool,

    /// Request signed certificate timestamps.
    #[builder(default = false)]
    pub enable_signed_cert_timestamps: bool,

    /// Omit the session_ticket extension.
    #[builder(default = false)]
    pub no_session_ticket: bool,
}

/// ALPN sets the dialer advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlpnProtos {
    /// `h2, http/1.1`
    All,
    /// `http/1.1` only, for forced HTTP/1.
    Http1,
}

impl AlpnProtos {
    fn wire(self) -> &'static [u8] {
        match self {
            AlpnProtos::All => b"\x02h2\x08http/1.1",
            AlpnProtos::Http1 => b"\x08http/1.1",
        }
    }
}

/// A ready-to-handshake TLS connector, built per dial from cloned options.
pub(crate) struct TlsConnector {
    connector: SslConnector,
    verify_hostname: bool,
    tls_sni: bool,
}

impl TlsConnector {
    pub(crate) fn new(
        options: &TlsOptions,
        ja3: Option<&Ja3Fingerprint>,
        alpn: AlpnProtos,
    ) -> Result<TlsConnector> {
        let mut builder =
            SslConnector::builder(SslMethod::tls_client()).map_err(Error::tls)?;

        if options.insecure_skip_verify {
            builder.set_verify(SslVerifyMode::NONE);
        }
        if options.session_cache {
            builder.set_session_cache_mode(SslSessionCacheMode::CLIENT);
        }
        if let Some(min) = options.min_tls_version {
            builder
                .set_min_proto_version(Some(min.into_ssl_version()))
                .map_err(Error::tls)?;
        }
        if let Some(max) = options.max_tls_version {
            builder
                .set_max_proto_version(Some(max.into_ssl_version()))
                .map_err(Error::tls)?;
        }
        builder.set_alpn_protos(alpn.wire()).map_err(Error::tls)?;

        if let Some(ja3) = ja3 {
            apply_fingerprint(&mut builder, ja3)?;
        }

        Ok(TlsConnector {
            connector: builder.build(),
            verify_hostname: options.verify_hostname && !options.insecure_skip_verify,
            tls_sni: options.tls_sni,
        })
    }

    /// Run the handshake over an established stream, returning the encrypted
    /// stream. The negotiated ALPN is read off the stream by the caller.
    pub(crate) async fn handshake<S>(
        &self,
        host: &str,
        stream: S,
    ) -> Result<tokio_boring::SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug + 'static,
    {
        let mut config = self.connector.configure().map_err(Error::tls)?;
        config.set_verify_hostname(self.verify_hostname);
        config.set_use_server_name_indication(self.tls_sni);
        tokio_boring::connect(config, host, stream)
            .await
            .map_err(|e| Error::tls(e.to_string()))
    }
}

fn apply_fingerprint(builder: &mut SslConnectorBuilder, ja3: &Ja3Fingerprint) -> Result<()> {
    if let Some(ref ciphers) = ja3.cipher_list {
        builder.set_cipher_list(ciphers).map_err(Error::tls)?;
    }
    if let Some(ref curves) = ja3.curves {
        builder.set_curves(curves).map_err(Error::tls)?;
    }
    if let Some(ref sigalgs) = ja3.sigalgs_list {
        builder.set_sigalgs_list(sigalgs).map_err(Error::tls)?;
    }
    if let Some(grease) = ja3.grease_enabled {
        builder.set_grease_enabled(grease);
    }
    if let Some(permute) = ja3.permute_extensions {
        builder.set_permute_extensions(permute);
    }
    if ja3.enable_ocsp_stapling {
        builder.enable_ocsp_stapling();
    }
    if ja3.enable_signed_cert_timestamps {
        builder.enable_signed_cert_timestamps();
    }
    if ja3.no_session_ticket {
        builder.set_options(SslOptions::NO_TICKET);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_skip_verification() {
        let options = TlsOptions::default();
        assert!(options.insecure_skip_verify);
        assert!(options.tls_sni);
        assert!(options.session_cache);
    }

    #[test]
    fn fingerprinted_connector_builds() {
        let ja3 = Ja3Fingerprint::builder()
            .cipher_list(
                "TLS_AES_128_GCM_SHA256:TLS_AES_256_GCM_SHA384:TLS_CHACHA20_POLY1305_SHA256",
            )
            .curves(vec![SslCurve::X25519, SslCurve::SECP256R1, SslCurve::SECP384R1])
            .sigalgs_list("ecdsa_secp256r1_sha256:rsa_pss_rsae_sha256:rsa_pkcs1_sha256")
            .grease_enabled(true)
            .permute_extensions(true)
            .build();

        let options = TlsOptions::default();
        assert!(TlsConnector::new(&options, Some(&ja3), AlpnProtos::All).is_ok());
        assert!(TlsConnector::new(&options, None, AlpnProtos::Http1).is_ok());
    }
}
