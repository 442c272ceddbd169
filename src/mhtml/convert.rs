//! MHTML → self-contained HTML conversion.
//!
//! Two passes over the MHTML bytes keep memory bounded by the HTML part
//! plus the sub-resources the HTML actually references:
//!
//! 1. index every part by Content-ID / Content-Location and keep only the
//!    decoded HTML part;
//! 2. scan the HTML for `cid:` and absolute http(s) references (attributes
//!    and CSS `url(...)`), then re-walk the parts retaining just the
//!    referenced bodies;
//!
//! and finally re-emit the HTML with matched references inlined as `data:`
//! URLs. Unresolvable references pass through unchanged.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use base64::Engine as _;
use lol_html::{HtmlRewriter, Settings, element, text};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::{MhtmlError, PartWalker, normalize_cid};

static CSS_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*['"]?([^'")]+?)['"]?\s*\)"#).expect("css url pattern")
});

/// A retained sub-resource.
struct Resource {
    content_type: String,
    bytes: Vec<u8>,
}

impl Resource {
    fn data_url(&self) -> String {
        let mime = self
            .content_type
            .split(';')
            .next()
            .unwrap_or("application/octet-stream")
            .trim();
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Converts one MHTML document into self-contained HTML.
///
/// `first_pass` and `second_pass` must be two independent readers over the
/// same bytes (e.g. two storage readers for the same key); `out` receives
/// the finished HTML.
pub async fn mhtml_to_html<R1, R2, W>(
    first_pass: R1,
    second_pass: R2,
    out: &mut W,
) -> Result<(), MhtmlError>
where
    R1: AsyncBufRead + Unpin,
    R2: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Pass 1: find and decode the HTML part; bodies of everything else are
    // discarded as they stream past.
    let mut walker = PartWalker::new(first_pass).await?;
    let mut html: Option<Vec<u8>> = None;
    while let Some(part) = walker
        .next_part(|headers| headers.is_html())
        .await?
    {
        if let Some(body) = part.body {
            if html.is_none() {
                html = Some(body);
            }
        }
    }
    let html = html.ok_or(MhtmlError::MissingHtmlPart)?;

    // Scan: collect every reference the HTML makes.
    let referenced = collect_references(&html)?;

    // Pass 2: retain only the referenced bodies.
    let mut resources: HashMap<String, Arc<Resource>> = HashMap::new();
    let mut walker = PartWalker::new(second_pass).await?;
    loop {
        let mut keys: Vec<String> = Vec::new();
        let part = walker
            .next_part(|headers| {
                if let Some(cid) = headers.normalized_cid() {
                    let key = format!("cid:{cid}");
                    if referenced.contains(&key) {
                        keys.push(key);
                    }
                }
                if let Some(location) = &headers.content_location {
                    if referenced.contains(location.as_str()) {
                        keys.push(location.clone());
                    }
                }
                !keys.is_empty()
            })
            .await?;
        let Some(part) = part else { break };
        if let Some(body) = part.body {
            let resource = Arc::new(Resource {
                content_type: part.headers.content_type.clone(),
                bytes: body,
            });
            for key in keys {
                resources.entry(key).or_insert_with(|| Arc::clone(&resource));
            }
        }
    }

    // Emit: substitute matched references with data: URLs.
    let rewritten = inline_references(&html, &resources)?;
    out.write_all(&rewritten).await?;
    out.flush().await?;
    Ok(())
}

/// Normalizes an attribute/CSS reference into a lookup key, or `None` when
/// it can never match a part.
fn reference_key(value: &str) -> Option<String> {
    let value = value.trim();
    if value.starts_with("cid:") {
        Some(format!("cid:{}", normalize_cid(value)))
    } else if value.starts_with("http://") || value.starts_with("https://") {
        Some(value.to_string())
    } else {
        None
    }
}

/// Tokenizes the HTML once, collecting `src`/`href` values and CSS
/// `url(...)` occurrences from `<style>` bodies and `style` attributes.
fn collect_references(html: &[u8]) -> Result<HashSet<String>, MhtmlError> {
    let refs = Rc::new(RefCell::new(HashSet::new()));
    let style_buf = Rc::new(RefCell::new(String::new()));

    let attr_refs = Rc::clone(&refs);
    let css_refs = Rc::clone(&refs);
    let style_refs = Rc::clone(&refs);
    let style_buf_handler = Rc::clone(&style_buf);

    let src_refs = Rc::clone(&refs);
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("[src]", move |el| {
                    if let Some(value) = el.get_attribute("src") {
                        if let Some(key) = reference_key(&value) {
                            src_refs.borrow_mut().insert(key);
                        }
                    }
                    Ok(())
                }),
                element!("[href]", move |el| {
                    if let Some(value) = el.get_attribute("href") {
                        if let Some(key) = reference_key(&value) {
                            attr_refs.borrow_mut().insert(key);
                        }
                    }
                    Ok(())
                }),
                element!("[style]", move |el| {
                    if let Some(css) = el.get_attribute("style") {
                        for key in css_reference_keys(&css) {
                            css_refs.borrow_mut().insert(key);
                        }
                    }
                    Ok(())
                }),
                text!("style", move |chunk| {
                    style_buf_handler.borrow_mut().push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let css = std::mem::take(&mut *style_buf_handler.borrow_mut());
                        for key in css_reference_keys(&css) {
                            style_refs.borrow_mut().insert(key);
                        }
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        |_: &[u8]| {},
    );

    rewriter
        .write(html)
        .map_err(|e| MhtmlError::Malformed(format!("HTML scan failed: {e}")))?;
    rewriter
        .end()
        .map_err(|e| MhtmlError::Malformed(format!("HTML scan failed: {e}")))?;

    drop(style_buf);
    Ok(Rc::try_unwrap(refs)
        .map(RefCell::into_inner)
        .unwrap_or_default())
}

fn css_reference_keys(css: &str) -> Vec<String> {
    CSS_URL
        .captures_iter(css)
        .filter_map(|caps| reference_key(&caps[1]))
        .collect()
}

/// Replaces matched CSS `url(...)` references with data URLs.
fn rewrite_css(css: &str, resources: &HashMap<String, Arc<Resource>>) -> String {
    CSS_URL
        .replace_all(css, |caps: &regex::Captures<'_>| {
            match reference_key(&caps[1]).and_then(|key| resources.get(&key)) {
                Some(resource) => format!("url({})", resource.data_url()),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Re-tokenizes the HTML, substituting every resolvable reference.
fn inline_references(
    html: &[u8],
    resources: &HashMap<String, Arc<Resource>>,
) -> Result<Vec<u8>, MhtmlError> {
    let output = Rc::new(RefCell::new(Vec::with_capacity(html.len())));
    let style_buf = Rc::new(RefCell::new(String::new()));
    let sink = Rc::clone(&output);

    let attr_resources = resources.clone();
    let css_resources = resources.clone();
    let style_resources = resources.clone();
    let style_buf_handler = Rc::clone(&style_buf);

    let src_resources = resources.clone();
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("[src]", move |el| {
                    if let Some(value) = el.get_attribute("src") {
                        if let Some(resource) =
                            reference_key(&value).and_then(|key| src_resources.get(&key))
                        {
                            el.set_attribute("src", &resource.data_url())?;
                        }
                    }
                    Ok(())
                }),
                element!("[href]", move |el| {
                    if let Some(value) = el.get_attribute("href") {
                        if let Some(resource) =
                            reference_key(&value).and_then(|key| attr_resources.get(&key))
                        {
                            el.set_attribute("href", &resource.data_url())?;
                        }
                    }
                    Ok(())
                }),
                element!("[style]", move |el| {
                    if let Some(css) = el.get_attribute("style") {
                        let rewritten = rewrite_css(&css, &css_resources);
                        if rewritten != css {
                            el.set_attribute("style", &rewritten)?;
                        }
                    }
                    Ok(())
                }),
                text!("style", move |chunk| {
                    style_buf_handler.borrow_mut().push_str(chunk.as_str());
                    if chunk.last_in_text_node() {
                        let css = std::mem::take(&mut *style_buf_handler.borrow_mut());
                        // Raw content: entity-escaping would corrupt CSS.
                        chunk.replace(
                            &rewrite_css(&css, &style_resources),
                            lol_html::html_content::ContentType::Html,
                        );
                    } else {
                        chunk.remove();
                    }
                    Ok(())
                }),
            ],
            ..Settings::default()
        },
        move |chunk: &[u8]| sink.borrow_mut().extend_from_slice(chunk),
    );

    rewriter
        .write(html)
        .map_err(|e| MhtmlError::Malformed(format!("HTML rewrite failed: {e}")))?;
    rewriter
        .end()
        .map_err(|e| MhtmlError::Malformed(format!("HTML rewrite failed: {e}")))?;

    drop(style_buf);
    Ok(Rc::try_unwrap(output)
        .map(RefCell::into_inner)
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn doc(html: &str, extra_parts: &str) -> String {
        format!(
            "MIME-Version: 1.0\r\n\
Content-Type: multipart/related; boundary=\"BOUND\"\r\n\
\r\n\
--BOUND\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Content-Location: https://example.com/\r\n\
\r\n\
{html}\r\n\
{extra_parts}--BOUND--\r\n"
        )
    }

    async fn convert(doc: &str) -> String {
        let mut out = Vec::new();
        mhtml_to_html(
            BufReader::new(doc.as_bytes()),
            BufReader::new(doc.as_bytes()),
            &mut out,
        )
        .await
        .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn cid_image_is_inlined_as_data_url() {
        let png_part = "--BOUND\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-ID: <img1@arkiv>\r\n\
\r\n\
iVBORw0KGgo=\r\n";
        let input = doc(r#"<html><body><img src="cid:img1@arkiv"></body></html>"#, png_part);

        let output = convert(&input).await;
        assert!(
            output.contains("src=\"data:image/png;base64,iVBORw0KGgo=\""),
            "expected inlined data url, got: {output}"
        );
        assert!(!output.contains("cid:img1@arkiv"));
    }

    #[tokio::test]
    async fn content_location_resources_resolve_absolute_urls() {
        let css_part = "--BOUND\r\n\
Content-Type: text/css\r\n\
Content-Location: https://example.com/site.css\r\n\
\r\n\
body { color: red }\r\n";
        let input = doc(
            r#"<html><head><link rel="stylesheet" href="https://example.com/site.css"></head></html>"#,
            css_part,
        );

        let output = convert(&input).await;
        assert!(output.contains("href=\"data:text/css;base64,"));
    }

    #[tokio::test]
    async fn css_url_references_are_inlined_in_style_blocks_and_attrs() {
        let img_part = "--BOUND\r\n\
Content-Type: image/gif\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-Location: https://example.com/bg.gif\r\n\
\r\n\
R0lGODdh\r\n";
        let html = r#"<html><head><style>body { background: url("https://example.com/bg.gif"); }</style></head><body><div style="background-image: url(https://example.com/bg.gif)">x</div></body></html>"#;
        let input = doc(html, img_part);

        let output = convert(&input).await;
        let inlined = output.matches("data:image/gif;base64,R0lGODdh").count();
        assert_eq!(inlined, 2, "style block and style attribute: {output}");
    }

    #[tokio::test]
    async fn unreferenced_parts_are_dropped_and_unresolvable_refs_pass_through() {
        let unused_part = "--BOUND\r\n\
Content-Type: image/png\r\n\
Content-Transfer-Encoding: base64\r\n\
Content-ID: <unused@arkiv>\r\n\
\r\n\
AAAA\r\n";
        let input = doc(
            r#"<html><body><img src="https://elsewhere.example/missing.png"><a href="/relative">x</a></body></html>"#,
            unused_part,
        );

        let output = convert(&input).await;
        assert!(output.contains("https://elsewhere.example/missing.png"));
        assert!(output.contains("href=\"/relative\""));
        assert!(!output.contains("base64,AAAA"));
    }

    #[tokio::test]
    async fn self_contained_html_is_untouched() {
        let html = r#"<html><body><p>plain</p><img src="data:image/png;base64,AA=="></body></html>"#;
        let input = doc(html, "");

        let output = convert(&input).await;
        assert_eq!(output, html);
    }
}
