use once_cell::sync::Lazy;
use regex::Regex;

/// Tag prefixes whose presence marks a remote body as real HTML rather
/// than plain text that happens to contain angle brackets.
const HTML_MARKERS: &[&str] = &[
    "<div", "<p ", "<p>", "<br", "<img ", "<h1>", "<h2>", "<h3>", "<h4>", "<h5>", "<h6>",
    "<ol>", "<ul>", "<li>", "<table", "<hr", "<strong>", "<b>", "<em>", "<i>", "<s>",
    "<strike>", "<del>", "<code>", "<pre", "<codeblock", "<blockquote>", "<a ", "<span",
    "<at ", "<emoji", "<attachment",
];

static ENTITY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#(\d{1,7})|#[xX]([0-9a-fA-F]{1,6})|([a-zA-Z]+));")
        .expect("valid html entity regex")
});

static BLANK_LINES_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n(?:[ \t]*\n)+").expect("valid blank line regex"));

pub fn contains_html(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    HTML_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Decodes the named entities the remote platform emits plus numeric
/// references. Non-breaking spaces become plain spaces.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY_REGEX
        .replace_all(text, |caps: &regex::Captures| {
            let decoded = if let Some(decimal) = caps.get(1) {
                decimal.as_str().parse::<u32>().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16).ok().and_then(char::from_u32)
            } else {
                match caps.get(3).map(|name| name.as_str()) {
                    Some("nbsp") => Some(' '),
                    Some("amp") => Some('&'),
                    Some("lt") => Some('<'),
                    Some("gt") => Some('>'),
                    Some("quot") => Some('"'),
                    Some("apos") => Some('\''),
                    _ => None,
                }
            };
            match decoded {
                Some('\u{a0}') => " ".to_string(),
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Canonical form used when comparing bodies: trailing spaces dropped,
/// runs of blank lines collapsed, outer whitespace trimmed.
pub fn normalize_whitespace(text: &str) -> String {
    let trimmed_lines = text
        .replace("\r\n", "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    BLANK_LINES_REGEX
        .replace_all(&trimmed_lines, "\n\n")
        .trim()
        .to_string()
}
