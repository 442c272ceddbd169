//! RFC 2557 (MHTML, multipart/related) parsing.
//!
//! [`PartWalker`] makes one forward pass over an MHTML byte stream,
//! yielding part headers and letting the caller decide per part whether the
//! decoded body is kept or discarded. The converter in [`convert`] runs two
//! such passes so memory stays bounded by the HTML part plus the resources
//! it actually references.

pub mod convert;

pub use convert::mhtml_to_html;

use base64::Engine as _;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Error)]
pub enum MhtmlError {
    #[error("document is not multipart: missing boundary parameter")]
    MissingBoundary,
    #[error("document has no text/html part")]
    MissingHtmlPart,
    #[error("malformed MHTML: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Content-Transfer-Encoding of a part body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Base64,
    QuotedPrintable,
    Identity,
}

impl Encoding {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "base64" => Encoding::Base64,
            "quoted-printable" => Encoding::QuotedPrintable,
            _ => Encoding::Identity,
        }
    }
}

/// Headers of one MHTML part.
#[derive(Debug, Clone)]
pub struct PartHeaders {
    pub content_type: String,
    pub content_id: Option<String>,
    pub content_location: Option<String>,
    pub encoding: Encoding,
}

impl PartHeaders {
    pub fn is_html(&self) -> bool {
        self.content_type
            .split(';')
            .next()
            .is_some_and(|t| t.trim().eq_ignore_ascii_case("text/html"))
    }

    /// Content-ID normalized to its bare form (no `<>`, no `cid:`).
    pub fn normalized_cid(&self) -> Option<String> {
        self.content_id.as_deref().map(normalize_cid)
    }
}

/// Strips `cid:` prefixes and angle brackets from a Content-ID reference so
/// `<abc@x>`, `cid:abc@x` and `abc@x` all index the same part.
pub fn normalize_cid(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.strip_prefix("cid:").unwrap_or(raw);
    raw.trim_start_matches('<').trim_end_matches('>').to_string()
}

/// One parsed part: headers plus the decoded body when requested.
#[derive(Debug)]
pub struct Part {
    pub headers: PartHeaders,
    pub body: Option<Vec<u8>>,
}

/// Forward-only walker over an MHTML stream.
#[derive(Debug)]
pub struct PartWalker<R> {
    reader: R,
    boundary: Vec<u8>,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> PartWalker<R> {
    /// Parses the top-level headers, extracts the multipart boundary and
    /// positions the walker at the first part.
    pub async fn new(mut reader: R) -> Result<Self, MhtmlError> {
        let top = read_headers(&mut reader).await?;
        let content_type = header_value(&top, "content-type").unwrap_or_default();
        let boundary =
            boundary_param(&content_type).ok_or(MhtmlError::MissingBoundary)?;

        let mut walker = Self {
            reader,
            boundary: boundary.into_bytes(),
            finished: false,
        };
        walker.skip_to_first_boundary().await?;
        Ok(walker)
    }

    async fn skip_to_first_boundary(&mut self) -> Result<(), MhtmlError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Err(MhtmlError::Malformed("no opening boundary".into()));
            }
            match self.classify_boundary(&line) {
                BoundaryKind::Open => return Ok(()),
                BoundaryKind::Close => {
                    self.finished = true;
                    return Ok(());
                }
                BoundaryKind::None => {}
            }
        }
    }

    fn classify_boundary(&self, line: &[u8]) -> BoundaryKind {
        let trimmed = trim_line(line);
        let Some(rest) = trimmed.strip_prefix(b"--") else {
            return BoundaryKind::None;
        };
        if rest == self.boundary.as_slice() {
            BoundaryKind::Open
        } else if rest.strip_suffix(b"--") == Some(self.boundary.as_slice()) {
            BoundaryKind::Close
        } else {
            BoundaryKind::None
        }
    }

    /// Yields the next part. `want_body` sees the parsed headers and
    /// decides whether the body is decoded and kept or streamed past.
    pub async fn next_part(
        &mut self,
        want_body: impl FnOnce(&PartHeaders) -> bool,
    ) -> Result<Option<Part>, MhtmlError> {
        if self.finished {
            return Ok(None);
        }

        let raw = read_headers(&mut self.reader).await?;
        let headers = PartHeaders {
            content_type: header_value(&raw, "content-type").unwrap_or_default(),
            content_id: header_value(&raw, "content-id"),
            content_location: header_value(&raw, "content-location"),
            encoding: header_value(&raw, "content-transfer-encoding")
                .map(|v| Encoding::parse(&v))
                .unwrap_or(Encoding::Identity),
        };

        let keep = want_body(&headers);
        let mut body: Vec<u8> = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                // Tolerate a missing closing boundary.
                self.finished = true;
                break;
            }
            match self.classify_boundary(&line) {
                BoundaryKind::Open => break,
                BoundaryKind::Close => {
                    self.finished = true;
                    break;
                }
                BoundaryKind::None => {
                    if keep {
                        body.extend_from_slice(&line);
                    }
                }
            }
        }

        let body = if keep {
            // The line break before the boundary belongs to the delimiter,
            // not the body.
            if body.last() == Some(&b'\n') {
                body.pop();
                if body.last() == Some(&b'\r') {
                    body.pop();
                }
            }
            Some(decode_body(&body, headers.encoding)?)
        } else {
            None
        };

        Ok(Some(Part { headers, body }))
    }
}

enum BoundaryKind {
    Open,
    Close,
    None,
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// Reads a header block up to the blank line, unfolding continuation lines.
async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<(String, String)>, MhtmlError> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            break;
        }
        let text = String::from_utf8_lossy(trim_line(&line)).into_owned();
        if text.is_empty() {
            break;
        }
        if text.starts_with(' ') || text.starts_with('\t') {
            if let Some((_, value)) = headers.last_mut() {
                value.push(' ');
                value.push_str(text.trim());
            }
            continue;
        }
        match text.split_once(':') {
            Some((name, value)) => {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
            None => {
                return Err(MhtmlError::Malformed(format!(
                    "header line without colon: {text:?}"
                )));
            }
        }
    }
    Ok(headers)
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

/// Pulls the `boundary` parameter out of a Content-Type value.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

fn decode_body(raw: &[u8], encoding: Encoding) -> Result<Vec<u8>, MhtmlError> {
    match encoding {
        Encoding::Identity => Ok(raw.to_vec()),
        Encoding::Base64 => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| MhtmlError::Malformed(format!("invalid base64 body: {e}")))
        }
        Encoding::QuotedPrintable => Ok(decode_quoted_printable(raw)),
    }
}

/// Quoted-printable per RFC 2045: `=XX` escapes, `=` before a line break is
/// a soft break. Undecodable escapes pass through untouched.
fn decode_quoted_printable(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }
        let rest = &raw[i + 1..];
        if rest.starts_with(b"\r\n") {
            i += 3;
        } else if rest.first() == Some(&b'\n') {
            i += 2;
        } else if rest.len() >= 2 {
            match u8::from_str_radix(&String::from_utf8_lossy(&rest[..2]), 16) {
                Ok(decoded) => {
                    out.push(decoded);
                    i += 3;
                }
                Err(_) => {
                    out.push(b);
                    i += 1;
                }
            }
        } else {
            out.push(b);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const SIMPLE: &str = "From: <Saved by arkiv>\r\n\
Subject: test\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/related; type=\"text/html\"; boundary=\"----=_Part_0\"\r\n\
\r\n\
------=_Part_0\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
Content-Location: https://example.com/\r\n\
\r\n\
<html><body>caf=C3=A9</body></html>\r\n\
------=_Part_0\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-ID: <img1@example>\r\n\
\r\n\
aGVsbG8=\r\n\
------=_Part_0--\r\n";

    #[tokio::test]
    async fn walks_parts_and_decodes_bodies() {
        let mut walker = PartWalker::new(BufReader::new(SIMPLE.as_bytes()))
            .await
            .unwrap();

        let html = walker.next_part(|_| true).await.unwrap().unwrap();
        assert!(html.headers.is_html());
        assert_eq!(html.headers.encoding, Encoding::QuotedPrintable);
        assert_eq!(
            String::from_utf8(html.body.unwrap()).unwrap(),
            "<html><body>café</body></html>"
        );

        let img = walker.next_part(|_| true).await.unwrap().unwrap();
        assert_eq!(img.headers.normalized_cid().as_deref(), Some("img1@example"));
        assert_eq!(img.body.unwrap(), b"hello");

        assert!(walker.next_part(|_| true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skipped_bodies_are_discarded() {
        let mut walker = PartWalker::new(BufReader::new(SIMPLE.as_bytes()))
            .await
            .unwrap();

        let html = walker.next_part(|h| h.is_html()).await.unwrap().unwrap();
        assert!(html.body.is_some());
        let img = walker.next_part(|h| h.is_html()).await.unwrap().unwrap();
        assert!(img.body.is_none());
    }

    #[tokio::test]
    async fn missing_boundary_is_an_error() {
        let doc = "Content-Type: text/html\r\n\r\n<html></html>";
        match PartWalker::new(BufReader::new(doc.as_bytes())).await {
            Err(MhtmlError::MissingBoundary) => {}
            other => panic!("expected MissingBoundary, got {other:?}"),
        }
    }

    #[test]
    fn cid_normalization_variants() {
        assert_eq!(normalize_cid("<abc@x>"), "abc@x");
        assert_eq!(normalize_cid("cid:abc@x"), "abc@x");
        assert_eq!(normalize_cid("cid:<abc@x>"), "abc@x");
        assert_eq!(normalize_cid("abc@x"), "abc@x");
    }

    #[test]
    fn quoted_printable_soft_breaks() {
        assert_eq!(
            decode_quoted_printable(b"foo=\r\nbar=3D1"),
            b"foobar=1".to_vec()
        );
    }
}
