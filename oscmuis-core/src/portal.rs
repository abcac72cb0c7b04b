//! Captive portal page.
//!
//! The page is embedded into the binary and rendered on every request by
//! substituting `%NAME%` placeholders with values from the registered
//! providers. `%%` renders a literal percent sign.

use crate::traits::TemplateVariables;
use crate::{Error, Result};
use rust_embed::RustEmbed;
use std::borrow::Cow;
use std::sync::Arc;

// 门户页面在编译时嵌入
#[derive(RustEmbed)]
#[folder = "ui/"]
struct PortalAssets;

pub const PORTAL_PAGE: &str = "portal.html";

/// Looks up an embedded asset and guesses its MIME type.
pub fn asset(path: &str) -> Result<(Cow<'static, [u8]>, String)> {
    let asset = PortalAssets::get(path).ok_or_else(|| {
        tracing::debug!("Asset not found: {}", path);
        Error::AssetNotFound(path.to_string())
    })?;
    let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();
    Ok((asset.data, mime))
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Escapes text for use in HTML content and quoted attribute values.
fn escape_html(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 16);
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[derive(Default, Clone)]
pub struct Portal {
    providers: Vec<Arc<dyn TemplateVariables>>,
}

impl Portal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a variable provider. Earlier providers win on name clashes.
    pub fn with_provider(mut self, provider: Arc<dyn TemplateVariables>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Resolves a variable to HTML-escaped text.
    async fn lookup(&self, name: &str) -> String {
        for provider in &self.providers {
            if let Some(value) = provider.variable(name).await {
                return escape_html(&value).into_owned();
            }
        }
        tracing::debug!("Unknown portal variable %{}%", name);
        String::new()
    }

    /// Substitutes placeholders in `template`.
    ///
    /// A `%` that does not open a well-formed placeholder is copied as is.
    pub async fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('%') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];

            match after.find('%') {
                Some(0) => {
                    out.push('%');
                    rest = &after[1..];
                }
                Some(end) if is_placeholder_name(&after[..end]) => {
                    out.push_str(&self.lookup(&after[..end]).await);
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('%');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Renders the embedded portal page.
    pub async fn render_page(&self) -> Result<String> {
        let (data, _) = asset(PORTAL_PAGE)?;
        let template = String::from_utf8_lossy(&data);
        Ok(self.render(&template).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Fixed(HashMap<&'static str, &'static str>);

    #[async_trait]
    impl TemplateVariables for Fixed {
        async fn variable(&self, name: &str) -> Option<String> {
            self.0.get(name).map(|v| v.to_string())
        }
    }

    fn portal() -> Portal {
        Portal::new()
            .with_provider(Arc::new(Fixed(HashMap::from([
                ("BATTERY", "87"),
                ("AP_SSID", "OSC-Muis"),
            ]))))
            .with_provider(Arc::new(Fixed(HashMap::from([
                ("OSC_PORT", "8001"),
                ("AP_SSID", "shadowed"),
                ("OSC_ADDRESS_FORMAT", "<script>alert('x')</script>"),
                ("STA_SSID", "Tom & \"Jerry\""),
            ]))))
    }

    #[tokio::test]
    async fn substitutes_from_all_providers() {
        let out = portal().render("<b>%AP_SSID%</b> port %OSC_PORT%").await;
        assert_eq!(out, "<b>OSC-Muis</b> port 8001");
    }

    #[tokio::test]
    async fn substituted_values_are_html_escaped() {
        assert_eq!(
            portal().render("<p>%OSC_ADDRESS_FORMAT%</p>").await,
            "<p>&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;</p>"
        );
        assert_eq!(
            portal().render(r#"<input value="%STA_SSID%">"#).await,
            r#"<input value="Tom &amp; &quot;Jerry&quot;">"#
        );
    }

    #[tokio::test]
    async fn double_percent_is_literal() {
        assert_eq!(portal().render("%BATTERY%%%").await, "87%");
        assert_eq!(portal().render("width: 100%%;").await, "width: 100%;");
    }

    #[tokio::test]
    async fn unknown_names_render_empty() {
        assert_eq!(portal().render("[%NOPE%]").await, "[]");
    }

    #[tokio::test]
    async fn stray_percent_is_kept() {
        assert_eq!(portal().render("50% off").await, "50% off");
        assert_eq!(portal().render("a % b %OSC_PORT%").await, "a % b 8001");
    }

    #[tokio::test]
    async fn embedded_page_renders() {
        let page = portal().render_page().await.unwrap();
        assert!(page.contains("<h1>"));
        assert!(page.contains("87%"));
        assert!(!page.contains("%%"));
        assert!(!page.contains("%OSC_PORT%"));
    }

    #[test]
    fn asset_mime_type() {
        let (_, mime) = asset(PORTAL_PAGE).unwrap();
        assert_eq!(mime, "text/html");
        assert!(matches!(asset("missing.css"), Err(Error::AssetNotFound(_))));
    }
}
