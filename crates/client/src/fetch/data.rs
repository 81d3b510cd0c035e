//! `data:` URL transport.
//!
//! The payload is decoded when the fetch starts; the response is a
//! `Content-Type` header, one data chunk and completion. There is no status
//! line, so the fetch reports HTTP code 0.

use std::collections::VecDeque;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use url::Url;

use rescache_core::{Error, FetchId, FetchMsg, FetchRequest, Fetcher};

const DEFAULT_MEDIA_TYPE: &str = "text/plain;charset=US-ASCII";

/// A decoded `data:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub media_type: String,
    pub body: Vec<u8>,
}

/// Decode a `data:` URL.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] when the URL has no `,` separator, a
/// percent-escape is incomplete or the base64 payload is malformed.
pub fn decode_data_url(url: &Url) -> Result<DataUrl, Error> {
    let rest = url.as_str().strip_prefix("data:").ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    let (meta, payload) = rest.split_once(',').ok_or_else(|| Error::InvalidUrl(format!("{url}: missing ','")))?;

    let (media_type, base64) = match meta.strip_suffix(";base64") {
        Some(media_type) => (media_type, true),
        None => (meta, false),
    };
    let media_type = if media_type.is_empty() {
        DEFAULT_MEDIA_TYPE.to_string()
    } else if media_type.starts_with(';') {
        format!("text/plain{media_type}")
    } else {
        String::from_utf8_lossy(&percent_decode(media_type)?).into_owned()
    };

    let decoded = percent_decode(payload)?;
    let body = if base64 {
        let compact: Vec<u8> = decoded.into_iter().filter(|b| !b.is_ascii_whitespace()).collect();
        STANDARD.decode(compact).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?
    } else {
        decoded
    };

    Ok(DataUrl { media_type, body })
}

/// Decode `%XX` escapes.
fn percent_decode(input: &str) -> Result<Vec<u8>, Error> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let byte = input
            .get(i + 1..i + 3)
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| Error::InvalidUrl(format!("incomplete percent-escape at byte {i}")))?;
        out.push(byte);
        i += 3;
    }
    Ok(out)
}

/// Serves `data:` URLs without touching the network.
#[derive(Debug, Default)]
pub struct DataFetcher {
    next_id: u64,
    queue: VecDeque<(FetchId, FetchMsg)>,
}

impl DataFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Fetcher for DataFetcher {
    fn can_fetch(&self, url: &Url) -> bool {
        url.scheme() == "data"
    }

    fn start(&mut self, request: FetchRequest) -> Result<FetchId, Error> {
        if !self.can_fetch(&request.url) {
            return Err(Error::FetchStart(request.url.to_string()));
        }
        self.next_id += 1;
        let id = FetchId(self.next_id);

        match decode_data_url(&request.url) {
            Ok(data) => {
                tracing::debug!(?id, media_type = %data.media_type, bytes = data.body.len(), "decoded data URL");
                self.queue.push_back((id, FetchMsg::Header(format!("Content-Type: {}", data.media_type))));
                self.queue.push_back((id, FetchMsg::Header(format!("Content-Length: {}", data.body.len()))));
                if !data.body.is_empty() {
                    self.queue.push_back((id, FetchMsg::Data(Bytes::from(data.body))));
                }
                self.queue.push_back((id, FetchMsg::Finished));
            }
            Err(e) => self.queue.push_back((id, FetchMsg::Error(e.to_string()))),
        }
        Ok(id)
    }

    fn abort(&mut self, id: FetchId) {
        self.queue.retain(|(f, _)| *f != id);
    }

    fn http_code(&self, _id: FetchId) -> u16 {
        0
    }

    fn poll(&mut self) -> Vec<(FetchId, FetchMsg)> {
        self.queue.drain(..).collect()
    }
}
