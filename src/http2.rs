//! HTTP/2 connection fingerprinting.
//!
//! An [`Http2Fingerprint`] describes the connection preface a client
//! implementation would send: SETTINGS values and their order, window
//! sizes, HEADERS frame priority, pseudo-header order, and the field order
//! of regular headers. The engine applies the knobs its configuration
//! surface exposes; the rest travel with the fingerprint so an
//! imitation-capable engine can honour them.

use std::borrow::Cow;

use http::HeaderName;
use typed_builder::TypedBuilder;

/// Identifiers of SETTINGS parameters, used to express emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    HeaderTableSize,
    EnablePush,
    MaxConcurrentStreams,
    InitialWindowSize,
    MaxFrameSize,
    MaxHeaderListSize,
    Unknown8,
    Unknown9,
}

/// Pseudo-header fields of a request HEADERS block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoId {
    Method,
    Scheme,
    Authority,
    Path,
}

/// Priority attached to a HEADERS or PRIORITY frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    pub stream_dependency: u32,
    pub weight: u8,
    pub exclusive: bool,
}

/// Configuration shaping an HTTP/2 connection preface.
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct Http2Fingerprint {
    /// SETTINGS_HEADER_TABLE_SIZE.
    #[builder(default, setter(into))]
    pub header_table_size: Option<u32>,

    /// SETTINGS_ENABLE_PUSH.
    #[builder(default, setter(into))]
    pub enable_push: Option<bool>,

    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    #[builder(default, setter(into))]
    pub max_concurrent_streams: Option<u32>,

    /// SETTINGS_INITIAL_WINDOW_SIZE.
    #[builder(default, setter(into))]
    pub initial_stream_window_size: Option<u32>,

    /// Connection-level flow control window, announced via WINDOW_UPDATE.
    #[builder(default, setter(into))]
    pub initial_connection_window_size: Option<u32>,

    /// SETTINGS_MAX_FRAME_SIZE.
    #[builder(default, setter(into))]
    pub max_frame_size: Option<u32>,

    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    #[builder(default, setter(into))]
    pub max_header_list_size: Option<u32>,

    /// Emission order of the SETTINGS parameters.
    #[builder(default, setter(strip_option))]
    pub settings_order: Option<[SettingId; 8]>,

    /// Priority carried on the request HEADERS frame.
    #[builder(default, setter(into))]
    pub headers_priority: Option<StreamPriority>,

    /// Order of the pseudo-header fields.
    #[builder(default, setter(into))]
    pub headers_pseudo_order: Option<[PseudoId; 4]>,

    /// PRIORITY frames sent after the preface.
    #[builder(default, setter(strip_option, into))]
    pub priority: Option<Cow<'static, [StreamPriority]>>,

    /// Field order of regular headers; takes precedence over the
    /// request-level header order option when this fingerprint is in use.
    #[builder(default, setter(strip_option, into))]
    pub order_headers: Option<Vec<HeaderName>>,
}

impl Http2Fingerprint {
    /// Apply the knobs the engine exposes to a per-connection builder.
    pub(crate) fn apply(&self, builder: &mut hyper::client::conn::Builder) {
        if let Some(sz) = self.initial_stream_window_size {
            builder.http2_initial_stream_window_size(sz);
        }
        if let Some(sz) = self.initial_connection_window_size {
            builder.http2_initial_connection_window_size(sz);
        }
        if let Some(sz) = self.max_frame_size {
            builder.http2_max_frame_size(sz);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_leave_engine_settings() {
        let fp = Http2Fingerprint::default();
        assert!(fp.initial_stream_window_size.is_none());
        assert!(fp.order_headers.is_none());
    }

    #[test]
    fn chrome_like_shape() {
        let fp = Http2Fingerprint::builder()
            .header_table_size(65536u32)
            .enable_push(false)
            .initial_stream_window_size(6291456u32)
            .initial_connection_window_size(15728640u32)
            .max_header_list_size(262144u32)
            .headers_priority(StreamPriority {
                stream_dependency: 0,
                weight: 255,
                exclusive: true,
            })
            .headers_pseudo_order([
                PseudoId::Method,
                PseudoId::Authority,
                PseudoId::Scheme,
                PseudoId::Path,
            ])
            .build();
        assert_eq!(fp.headers_priority.map(|p| p.weight), Some(255));
    }
}
