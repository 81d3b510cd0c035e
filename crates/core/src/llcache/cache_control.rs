//! Freshness model built from response headers (RFC 2616 §13.2).

use chrono::{DateTime, NaiveDateTime};

/// Expiry used when an `Expires` header cannot be parsed.
const FAR_FUTURE: i64 = 0x7fff_ffff;

/// Revalidation requirement of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validate {
    /// Usable while within its freshness lifetime.
    #[default]
    Fresh,
    /// Must always be revalidated.
    Always,
    /// Must be revalidated once, then reverts to `Fresh`.
    Once,
}

/// Cache-control state of an object. Times are Unix seconds; 0 is unset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheControl {
    pub req_time: i64,
    pub res_time: i64,
    pub fin_time: i64,
    pub date: Option<i64>,
    pub expires: Option<i64>,
    pub last_modified: Option<i64>,
    pub age: Option<i64>,
    pub max_age: Option<i64>,
    pub no_cache: Validate,
    pub etag: Option<String>,
}

impl CacheControl {
    /// Forget everything learned from headers, including timestamps.
    pub fn invalidate(&mut self) {
        *self = Self::default();
    }

    /// Fold one response header into the model. Unknown names are ignored.
    pub fn apply_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("Age") {
            if value.starts_with(|c: char| c.is_ascii_digit()) {
                let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
                self.age = digits.parse().ok();
            }
        } else if name.eq_ignore_ascii_case("Date") {
            match parse_http_date(value) {
                Some(date) => self.date = Some(date),
                None => tracing::debug!(value, "unparseable Date header"),
            }
        } else if name.eq_ignore_ascii_case("ETag") {
            self.etag = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("Expires") {
            self.expires = Some(parse_http_date(value).unwrap_or_else(|| {
                tracing::debug!(value, "unparseable Expires header");
                FAR_FUTURE
            }));
        } else if name.eq_ignore_ascii_case("Cache-Control") {
            self.parse_cache_control(value);
        } else if name.eq_ignore_ascii_case("Last-Modified")
            && let Some(modified) = parse_http_date(value)
        {
            self.last_modified = Some(modified);
        }
    }

    fn parse_cache_control(&mut self, value: &str) {
        for directive in value.split(',') {
            let directive = directive.trim();
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };
            if name.eq_ignore_ascii_case("no-cache") || name.eq_ignore_ascii_case("no-store") {
                self.no_cache = Validate::Always;
            } else if name.eq_ignore_ascii_case("max-age")
                && let Some(age) = arg.and_then(|a| a.parse::<i64>().ok())
            {
                self.max_age = Some(age);
            }
        }
    }

    /// Seconds this object stays fresh at `now`, or 0 once stale.
    pub fn remaining_lifetime(&self, now: i64) -> i64 {
        let date = self.date.unwrap_or(0);

        let mut current_age = (self.res_time - date).max(0);
        current_age = current_age.max(self.age.unwrap_or(0));
        current_age += self.res_time - self.req_time + now - self.res_time;

        let freshness_lifetime = if let Some(max_age) = self.max_age {
            max_age
        } else if let Some(expires) = self.expires {
            expires - date
        } else if let Some(modified) = self.last_modified {
            (now - modified) / 10
        } else {
            0
        };

        if self.no_cache == Validate::Fresh && freshness_lifetime > current_age {
            freshness_lifetime - current_age
        } else {
            0
        }
    }

    /// Copy this state into `dest`.
    ///
    /// Timestamps are always copied; other fields only when set here. The
    /// ETag is copied when `deep`, otherwise moved.
    pub fn copy_into(&mut self, dest: &mut CacheControl, deep: bool) {
        let etag = if deep { self.etag.clone() } else { self.etag.take() };
        if etag.is_some() {
            dest.etag = etag;
        }

        dest.req_time = self.req_time;
        dest.res_time = self.res_time;
        dest.fin_time = self.fin_time;

        if self.date.is_some() {
            dest.date = self.date;
        }
        if self.expires.is_some() {
            dest.expires = self.expires;
        }
        if self.age.is_some() {
            dest.age = self.age;
        }
        if self.max_age.is_some() {
            dest.max_age = self.max_age;
        }
        if self.no_cache != Validate::Fresh {
            dest.no_cache = self.no_cache;
        }
        if self.last_modified.is_some() {
            dest.last_modified = self.last_modified;
        }
    }

    /// Bring state up to date after a completed response.
    pub fn update(&mut self, now: i64) {
        if self.date.is_none() {
            self.date = Some(now);
        }
    }
}

/// Parse an HTTP date in RFC 1123, RFC 850 or asctime form.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.timestamp());
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|date| date.and_utc().timestamp())
}

/// Format a Unix time as an RFC 1123 date.
pub fn rfc1123_date(t: i64) -> Option<String> {
    DateTime::from_timestamp(t, 0).map(|d| d.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}
