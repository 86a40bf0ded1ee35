// Content rewrites applied before a downloaded file is committed to the
// library. Both are pure string transforms over `regex`.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn css_url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"url\(\s*(['"]?)(https?://[^'"\)\s]+)(['"]?)\s*\)"#)
            .expect("css url regex")
    })
}

fn file_attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\b(src|href)\s*=\s*(["'])([^"']*?[?&]file=([^"'&#]+)[^"']*)(["'])"#)
            .expect("file attribute regex")
    })
}

fn file_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[?&]file=([^&#]+)"#).expect("file param regex")
    })
}

/// Library name a remote URL refers to: the `file=` query value if there is
/// one, otherwise the last path segment.
fn remote_name(url: &str) -> Option<&str> {
    if let Some(c) = file_param_re().captures(url) {
        return c.get(1).map(|m| m.as_str());
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, rest) = path.split_once("://")?;
    let (_, path) = rest.split_once('/')?;
    path.rsplit('/').next().filter(|s| !s.is_empty())
}

fn local(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Point `url(...)` references at remote hosts to `base` (the local file
/// server prefix). Relative and `data:` references are left alone.
pub fn rewrite_font_css(css: &str, base: &str) -> String {
    css_url_re()
        .replace_all(css, |caps: &Captures<'_>| match remote_name(&caps[2]) {
            Some(name) => format!("url(\"{}\")", local(base, name)),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Point `src`/`href` attributes carrying a `file=` parameter to `base`.
pub fn rewrite_resource_html(html: &str, base: &str) -> String {
    file_attr_re()
        .replace_all(html, |caps: &Captures<'_>| {
            let quote = &caps[2];
            format!("{}={quote}{}{quote}", &caps[1], local(base, &caps[4]))
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn font_css_remote_urls_become_local() {
        let css = r#"@font-face { font-family: 'a'; src: url('https://cms.example.com/xmds.php?file=roboto.ttf&displayId=1'); }
@font-face { font-family: 'b'; src: url(https://cms.example.com/fonts/open-sans.woff2); }
@font-face { font-family: 'c'; src: url("local.ttf"); }"#;

        let out = rewrite_font_css(css, "/files");
        assert!(out.contains(r#"url("/files/roboto.ttf")"#));
        assert!(out.contains(r#"url("/files/open-sans.woff2")"#));
        assert!(out.contains(r#"url("local.ttf")"#));
        assert!(!out.contains("cms.example.com"));
    }

    #[test]
    fn font_css_rewrite_is_deterministic() {
        let css = "src: url(https://h/xmds.php?file=x.ttf);";
        assert_eq!(rewrite_font_css(css, "/files/"), rewrite_font_css(css, "/files"));
    }

    #[test]
    fn resource_attributes_with_file_param_are_rewritten() {
        let html = r#"<html><head>
<script src="https://cms/xmds.php?file=bundle.min.js&displayId=3"></script>
<link rel="stylesheet" href='https://cms/xmds.php?x=1&file=fonts.css' />
<script src="https://cdn.example.com/other.js"></script>
</head></html>"#;

        let out = rewrite_resource_html(html, "http://127.0.0.1:9696/files");
        assert!(out.contains(r#"src="http://127.0.0.1:9696/files/bundle.min.js""#));
        assert!(out.contains("href='http://127.0.0.1:9696/files/fonts.css'"));
        assert!(out.contains(r#"src="https://cdn.example.com/other.js""#));
    }
}
