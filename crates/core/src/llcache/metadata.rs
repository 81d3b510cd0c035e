//! Serialised object metadata stored in the backing store's META slot.
//!
//! The format is newline-delimited, in order: URL, source length, request
//! time, response time, completion time, header count, one `name:value`
//! line per header, certificate count, then an error-code line and a
//! base64 DER line per certificate. The certificate section may be absent.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

use super::object::CacheObject;
use crate::Error;
use crate::transport::{CertChain, CertError, Certificate, MAX_CERT_DEPTH};

/// Metadata recovered from the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub url: Url,
    pub source_len: usize,
    pub req_time: i64,
    pub res_time: i64,
    pub fin_time: i64,
    /// Raw `name:value` header lines, to be replayed through header processing.
    pub headers: Vec<String>,
    pub cert_chain: Option<CertChain>,
}

/// Serialise an object's metadata.
pub fn serialise(object: &CacheObject) -> Vec<u8> {
    let mut out = String::new();
    let mut line = |s: &str| {
        out.push_str(s);
        out.push('\n');
    };

    line(object.url.as_str());
    line(&object.source_len.to_string());
    line(&object.cache.req_time.to_string());
    line(&object.cache.res_time.to_string());
    line(&object.cache.fin_time.to_string());
    line(&object.headers.len().to_string());
    for header in &object.headers {
        line(&format!("{}:{}", header.name, header.value));
    }

    let certs = object.cert_chain.as_ref().map_or(&[][..], |c| c.certs.as_slice());
    line(&certs.len().to_string());
    for cert in certs {
        line(&cert.err.code().to_string());
        line(&STANDARD.encode(&cert.der));
    }

    out.into_bytes()
}

struct Lines<'a> {
    inner: std::str::Split<'a, char>,
    line: usize,
}

impl<'a> Lines<'a> {
    fn next_line(&mut self) -> Result<&'a str, Error> {
        self.line += 1;
        self.inner.next().ok_or_else(|| self.error("unexpected end of metadata"))
    }

    fn peek_end(&self) -> bool {
        let mut rest = self.inner.clone();
        matches!((rest.next(), rest.next()), (None, _) | (Some(""), None))
    }

    fn number<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, Error> {
        let line = self.next_line()?;
        line.trim().parse().map_err(|_| self.error(&format!("invalid {what} {line:?}")))
    }

    fn error(&self, reason: &str) -> Error {
        Error::InvalidMetadata { line: self.line, reason: reason.to_string() }
    }
}

/// Parse metadata fetched for `expected`.
///
/// # Errors
///
/// Returns [`Error::MetadataUrlMismatch`] if the metadata names another URL
/// (a store key collision), or [`Error::InvalidMetadata`] if it is malformed.
pub fn deserialise(data: &[u8], expected: &Url) -> Result<Metadata, Error> {
    let text =
        std::str::from_utf8(data).map_err(|e| Error::InvalidMetadata { line: 0, reason: e.to_string() })?;
    let mut lines = Lines { inner: text.split('\n'), line: 0 };

    let url_line = lines.next_line()?;
    if url_line.len() < 7 {
        return Err(lines.error("URL too short"));
    }
    let url = Url::parse(url_line).map_err(|e| lines.error(&e.to_string()))?;
    if url != *expected {
        return Err(Error::MetadataUrlMismatch { expected: expected.to_string(), found: url.to_string() });
    }

    let source_len = lines.number("source length")?;
    let req_time = lines.number("request time")?;
    let res_time = lines.number("response time")?;
    let fin_time = lines.number("completion time")?;
    let header_count: usize = lines.number("header count")?;

    let mut headers = Vec::new();
    for _ in 0..header_count {
        headers.push(lines.next_line()?.to_string());
    }

    let mut cert_chain = None;
    if !lines.peek_end() {
        let count: usize = lines.number("certificate count")?;
        if count > MAX_CERT_DEPTH {
            return Err(lines.error(&format!("{count} certificates exceeds maximum chain depth")));
        }
        if count > 0 {
            let mut certs = Vec::with_capacity(count);
            for _ in 0..count {
                let err = CertError::from_code(lines.number("certificate error code")?);
                let encoded = lines.next_line()?.trim();
                let der = if encoded.is_empty() {
                    Vec::new()
                } else {
                    STANDARD.decode(encoded).map_err(|e| lines.error(&e.to_string()))?
                };
                certs.push(Certificate { err, der });
            }
            cert_chain = Some(CertChain::new(certs));
        }
    }

    Ok(Metadata { url, source_len, req_time, res_time, fin_time, headers, cert_chain })
}
