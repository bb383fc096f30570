//! HTML body templating
//!
//! A template is an HTML file containing `{{BODY}}` and optionally
//! `{{PROFILE_IMAGE}}`. A missing or unreadable template degrades to the
//! untemplated body.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};

const BODY_PLACEHOLDER: &str = "{{BODY}}";
const IMAGE_PLACEHOLDER: &str = "{{PROFILE_IMAGE}}";

/// Loaded template text
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Read a template from disk
    ///
    /// Returns `None` (after logging) when the file cannot be read.
    pub fn load(path: &Path) -> Option<Self> {
        match std::fs::read_to_string(path) {
            Ok(source) => {
                if !source.contains(BODY_PLACEHOLDER) {
                    warn!(path = %path.display(), "template has no body placeholder");
                }
                Some(Self::new(source))
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "template unavailable");
                None
            }
        }
    }

    /// Render the final HTML body
    ///
    /// `html` wins when present; otherwise the plain body is used with
    /// newlines turned into `<br>`.
    pub fn render(&self, plain: &str, html: Option<&str>, profile_image_tag: &str) -> String {
        let content = match html {
            Some(h) if !h.is_empty() => h.to_owned(),
            _ => plain_to_html(plain),
        };
        self.source
            .replace(BODY_PLACEHOLDER, &content)
            .replace(IMAGE_PLACEHOLDER, profile_image_tag)
    }
}

/// Escape plain text as HTML; newlines become `<br>`
pub fn plain_to_html(text: &str) -> String {
    text.replace("\r\n", "\n")
        .split('\n')
        .map(ammonia::clean_text)
        .collect::<Vec<_>>()
        .join("<br>")
}

/// Build an inline `<img>` element from an image file
///
/// Returns an empty string when no path is configured or the file cannot be
/// read.
pub fn profile_image_tag(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match std::fs::read(path) {
        Ok(data) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            format!(
                r#"<img src="data:{};base64,{}" alt="Profile" style="max-width: 150px; height: auto; border-radius: 50%;">"#,
                mime.essence_str(),
                STANDARD.encode(data)
            )
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "profile image unreadable");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{Template, plain_to_html, profile_image_tag};

    #[test]
    fn plain_body_is_line_broken_into_template() {
        let t = Template::new("<div>{{PROFILE_IMAGE}}{{BODY}}</div>");
        assert_eq!(t.render("a\nb", None, ""), "<div>a<br>b</div>");
    }

    #[test]
    fn plain_text_markup_is_escaped() {
        assert_eq!(plain_to_html("a<b&c"), "a&lt;b&amp;c");
        let t = Template::new("<p>{{BODY}}</p>");
        assert_eq!(t.render("<script>\nx", None, ""), "<p>&lt;script&gt;<br>x</p>");
    }

    #[test]
    fn html_body_takes_precedence() {
        let t = Template::new("<main>{{BODY}}</main>");
        assert_eq!(t.render("plain", Some("<p>rich</p>"), ""), "<main><p>rich</p></main>");
    }

    #[test]
    fn profile_image_is_embedded_as_data_uri() {
        let mut file = tempfile::Builder::new().suffix(".png").tempfile().expect("tmp");
        file.write_all(&[0x89, b'P', b'N', b'G']).expect("write");
        let tag = profile_image_tag(Some(file.path()));
        assert!(tag.starts_with(r#"<img src="data:image/png;base64,iVBORw"#));
    }

    #[test]
    fn missing_template_or_image_degrades() {
        assert!(Template::load(std::path::Path::new("/nonexistent/t.html")).is_none());
        assert_eq!(profile_image_tag(None), "");
        assert_eq!(
            profile_image_tag(Some(std::path::Path::new("/nonexistent/me.png"))),
            ""
        );
    }
}
