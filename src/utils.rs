//! Utility functions for rendering model output as Telegram HTML.
//!
//! Patterns are declared with `lazy_regex!`, so they are validated at compile
//! time and built on first use.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use thiserror::Error;
use uuid::Uuid;

const CODE_FENCE: &str = "```";

/// Match fenced code blocks with optional language: ```language\ncode```
static RE_CODE_BLOCK_FENCE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"```([\w+-]+)?\n?([\s\S]*?)```");

/// Match inline code: `code`
static RE_INLINE_CODE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"`([^`\n]+)`");

/// Match headings of any level
static RE_HEADING: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^#{1,6}[ \t]+(.+)$");

/// Match links: [text](url)
static RE_LINK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r#"\[([^\]\n]+)\]\(([^)\s"]+)\)"#);

/// Match bullet points at start of line: * or -
static RE_BULLET: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^([ \t]*)[*-] ");

/// Match bold text: **text**
static RE_BOLD: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*\*(.+?)\*\*");

/// Match italic text: *text*
static RE_ITALIC: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*([^*\n]+?)\*");

/// Match strikethrough: ~~text~~
static RE_STRIKE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"~~(.+?)~~");

/// Match 3+ consecutive newlines
static RE_MULTI_NEWLINE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\n{3,}");

/// Reasons a chunk cannot be rendered as rich markup
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// A code fence is opened but never closed (or vice versa)
    #[error("unbalanced code fence")]
    UnbalancedFence,
    /// Nothing is left to send after rendering
    #[error("rendered message is empty")]
    Empty,
}

/// Code spans swapped out for opaque placeholders while prose is rewritten.
///
/// Placeholders carry a random UUID so text that merely looks like a
/// placeholder is never substituted.
struct CodeSlots {
    slots: Vec<(String, String)>,
}

impl CodeSlots {
    const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    fn stash(&mut self, html: String) -> String {
        let placeholder = format!("CODESLOT{}END", Uuid::new_v4().as_simple());
        self.slots.push((placeholder.clone(), html));
        placeholder
    }

    fn restore(self, mut text: String) -> String {
        for (placeholder, html) in self.slots {
            text = text.replace(&placeholder, &html);
        }
        text
    }
}

/// Converts model markdown into Telegram-compatible HTML.
///
/// Supported formatting:
/// - Code blocks: ` ```language\ncode``` ` -> `<pre><code class="language-language">code</code></pre>`
/// - Inline code: `` `code` `` -> `<code>code</code>`
/// - Headings: `# Title` -> `📌 <b>Title</b>`
/// - Links: `[text](url)` -> `🔗 <a href="url">text</a>`
/// - Bullets: `* ` or `- ` at the start of a line -> `• `
/// - Bold `**text**`, italic `*text*`, strikethrough `~~text~~`
/// - Multiple newlines (3+) are collapsed into two.
///
/// Everything else is HTML-escaped.
///
/// # Errors
///
/// Returns `FormatError::UnbalancedFence` if the text contains an odd number of
/// code fences (typically a chunk cut in the middle of a code block) and
/// `FormatError::Empty` if nothing printable remains.
///
/// # Examples
///
/// ```
/// use chatpix_bot::utils::render_html;
/// let formatted = render_html("**Bold** and *italic* with `a < b`").unwrap();
/// assert_eq!(formatted, "<b>Bold</b> and <i>italic</i> with <code>a &lt; b</code>");
/// ```
pub fn render_html(text: &str) -> Result<String, FormatError> {
    if text.matches(CODE_FENCE).count() % 2 != 0 {
        return Err(FormatError::UnbalancedFence);
    }

    let mut slots = CodeSlots::new();

    let stashed = RE_CODE_BLOCK_FENCE.replace_all(text, |caps: &regex::Captures| {
        let code = caps.get(2).map_or("", |m| m.as_str()).trim_end();
        let escaped = html_escape::encode_text(code);
        let html = match caps.get(1) {
            Some(lang) => format!(
                "<pre><code class=\"language-{}\">{escaped}</code></pre>",
                lang.as_str()
            ),
            None => format!("<pre>{escaped}</pre>"),
        };
        slots.stash(html)
    });
    let stashed = RE_INLINE_CODE
        .replace_all(&stashed, |caps: &regex::Captures| {
            let code = caps.get(1).map_or("", |m| m.as_str());
            slots.stash(format!("<code>{}</code>", html_escape::encode_text(code)))
        })
        .into_owned();

    let mut html = html_escape::encode_text(&stashed).into_owned();
    html = RE_HEADING.replace_all(&html, "📌 <b>$1</b>").into_owned();
    html = RE_LINK
        .replace_all(&html, "🔗 <a href=\"$2\">$1</a>")
        .into_owned();
    html = RE_BULLET.replace_all(&html, "$1• ").into_owned();
    html = RE_BOLD.replace_all(&html, "<b>$1</b>").into_owned();
    html = RE_ITALIC.replace_all(&html, "<i>$1</i>").into_owned();
    html = RE_STRIKE.replace_all(&html, "<s>$1</s>").into_owned();
    html = RE_MULTI_NEWLINE.replace_all(&html, "\n\n").into_owned();

    let rendered = slots.restore(html).trim().to_string();
    if rendered.is_empty() {
        return Err(FormatError::Empty);
    }
    Ok(rendered)
}

/// Safely truncates a string to a maximum character length (not bytes).
///
/// # Examples
///
/// ```
/// use chatpix_bot::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}
