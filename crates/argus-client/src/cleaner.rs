use std::sync::Arc;

use argus_core::error::AppError;
use argus_core::traits::Cleaner;
use htmd::HtmlToMarkdown;

/// Tags that never carry product information.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "svg", "canvas", "nav", "footer",
    "aside", "form", "button", "select", "input",
];

/// HTML-to-Markdown cleaner using htmd.
///
/// Produces the page text handed to the LLM oracle: navigation, scripts and
/// form chrome are dropped and runs of blank lines collapsed, so the oracle's
/// character budget is spent on the product itself.
pub struct HtmdCleaner {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdCleaner {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdCleaner {
    pub fn new() -> Self {
        Self::with_skip_tags(&[])
    }

    /// Like [`new`](Self::new), additionally dropping `extra` tags.
    pub fn with_skip_tags(extra: &[&str]) -> Self {
        let mut tags: Vec<&str> = SKIP_TAGS.to_vec();
        tags.extend_from_slice(extra);
        let converter = HtmlToMarkdown::builder().skip_tags(tags).build();

        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl Cleaner for HtmdCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        let markdown = self
            .converter
            .convert(html)
            .map_err(|e| AppError::CleanerError(e.to_string()))?;
        Ok(collapse_blank_lines(&markdown))
    }
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
