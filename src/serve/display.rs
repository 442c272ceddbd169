//! Capture display page.
//!
//! Deliberately minimal HTML assembled by hand; the admin UI and its
//! templating live outside this crate.

use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};

use crate::catalog::{ArchiveItem, ArchiveType, ItemStatus};

use super::{ApiError, AppState};

/// `GET /{shortid}`: one tab per archive item.
pub async fn page(
    State(state): State<AppState>,
    Path(short_id): Path<String>,
) -> Result<Response, ApiError> {
    let capture = state
        .catalog
        .capture_by_short_id(&short_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    let items = state.catalog.items_for_capture(capture.id).await?;

    let mut tabs = String::new();
    for item in &items {
        tabs.push_str(&render_tab(&state, &short_id, item).await?);
    }

    let html = format!(
        r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>{short_id} — archive of {url}</title>
<style>
body {{ font-family: sans-serif; max-width: 60rem; margin: 2rem auto; padding: 0 1rem; }}
section {{ border: 1px solid #ccc; border-radius: 4px; padding: 1rem; margin: 1rem 0; }}
h2 {{ margin-top: 0; }}
img {{ max-width: 100%; }}
.status {{ color: #666; }}
</style>
</head>
<body>
<h1>Archive of <a href="{url}">{url}</a></h1>
<p class="status">captured {captured}</p>
{tabs}
</body>
</html>
"#,
        url = html_escape(&capture.original_url),
        captured = capture.created_at.format("%Y-%m-%d %H:%M UTC"),
    );

    Ok(Html(html).into_response())
}

async fn render_tab(
    state: &AppState,
    short_id: &str,
    item: &ArchiveItem,
) -> Result<String, ApiError> {
    let kind = item.kind;
    let body = match item.status {
        ItemStatus::Completed => match kind {
            ArchiveType::Mhtml => format!(
                r#"<p><a href="/archive/{short_id}/mhtml/html">view page</a> ·
<a href="/{short_id}/web">download MHTML</a></p>"#
            ),
            ArchiveType::Screenshot => format!(
                r#"<p><img src="/{short_id}/screenshot" alt="full-page screenshot"></p>"#
            ),
            ArchiveType::Git => format!(
                r#"<p><code>git clone &lt;this-host&gt;/git/{short_id}</code> ·
<a href="/{short_id}/git">download tar</a></p>"#
            ),
            ArchiveType::Youtube => format!(
                r#"<p><video controls src="/{short_id}/youtube"></video> ·
<a href="/{short_id}/youtube">download video</a></p>"#
            ),
        },
        ItemStatus::Pending => {
            let position = state.catalog.queue_position(item.id).await?;
            format!(r#"<p class="status">queued (position {position})</p>"#)
        }
        ItemStatus::Processing => r#"<p class="status">archiving…</p>"#.to_string(),
        ItemStatus::Failed => format!(
            r#"<p class="status">failed — <a href="/logs/{short_id}/{kind}">logs</a></p>"#
        ),
    };

    Ok(format!(
        r#"<section id="{kind}">
<h2>{kind}</h2>
{body}
</section>
"#
    ))
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_covers_markup_characters() {
        assert_eq!(
            html_escape(r#"https://x/?a=1&b=<c>"d""#),
            "https://x/?a=1&amp;b=&lt;c&gt;&quot;d&quot;"
        );
    }
}
