use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::common::escape_html;
use crate::emoji::replace_shortcodes;
use crate::msteams::OutgoingMention;

const SLOT_OPEN: char = '\u{E000}';
const SLOT_CLOSE: char = '\u{E001}';

static FENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s{0,3}(`{3,}|~{3,})\s*([\w+#.\-]*)\s*$").expect("valid fence regex")
});
static HEADING_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s{0,3}(#{1,6})\s+(.*?)(?:\s+#+)?\s*$").expect("valid heading regex")
});
static RULE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s{0,3}(?:(?:-\s*){3,}|(?:\*\s*){3,}|(?:_\s*){3,})$").expect("valid rule regex")
});
static QUOTE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s{0,3}>\s?(.*)$").expect("valid quote regex"));
static LIST_ITEM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([ \t]*)(?:([-*+])|(\d{1,9})[.)])[ \t]+(.*)$").expect("valid list item regex")
});
static TABLE_SEPARATOR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\|?\s*:?-{3,}:?\s*(?:\|\s*:?-{3,}:?\s*)*\|?\s*$").expect("valid table separator regex")
});

static CODE_SPAN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`\n]+)`").expect("valid code span regex"));
static IMAGE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").expect("valid image regex"));
static LINK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("valid link regex"));
static BARE_URL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://[^\s\x{E000}\x{E001}]+").expect("valid url regex")
});
static STRONG_STAR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\*\*([^\s*](?:[^*]*?[^\s*])?)\*\*").expect("valid strong regex")
});
static STRONG_UNDERSCORE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__([^\s_](?:[^_]*?[^\s_])?)__").expect("valid strong regex"));
static STRIKE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"~~([^\s~](?:[^~]*?[^\s~])?)~~").expect("valid strike regex"));
static EM_STAR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^\s*](?:[^*]*?[^\s*])?)\*").expect("valid emphasis regex"));
static EM_UNDERSCORE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w])_([^\s_](?:[^_]*?[^\s_])?)_($|[^\w])").expect("valid emphasis regex")
});
static MENTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^\w@.\-])@([a-zA-Z0-9][a-zA-Z0-9._\-]*)").expect("valid mention regex")
});
static SLOT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x{E000}(\d+)\x{E001}").expect("valid slot regex"));

/// A local username that resolves to a remote user, used to turn
/// `@username` into a remote mention.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionTarget {
    pub username: String,
    pub remote_user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedHtml {
    pub html: String,
    pub mentions: Vec<OutgoingMention>,
}

/// Renders local markdown as remote HTML without resolving mentions.
pub fn markdown_to_html(markdown: &str) -> String {
    render_markdown(markdown, &[]).html
}

/// Renders local markdown as remote HTML. Every `@username` that matches
/// one of `targets` becomes an `<at>` element with its own mention id.
pub fn render_markdown(markdown: &str, targets: &[MentionTarget]) -> RenderedHtml {
    let cleaned = markdown
        .replace("\r\n", "\n")
        .replace([SLOT_OPEN, SLOT_CLOSE], "");
    let lines = cleaned.lines().map(str::to_string).collect::<Vec<_>>();

    let mut renderer = Renderer {
        targets: targets
            .iter()
            .map(|target| (target.username.to_lowercase(), target))
            .collect(),
        mentions: Vec::new(),
    };
    let html = renderer.blocks(&lines);
    RenderedHtml {
        html,
        mentions: renderer.mentions,
    }
}

struct ListItem {
    indent: usize,
    ordered: bool,
    number: u64,
    content: String,
}

fn indent_width(prefix: &str) -> usize {
    prefix.chars().map(|c| if c == '\t' { 4 } else { 1 }).sum()
}

fn list_item(line: &str) -> Option<ListItem> {
    if RULE_REGEX.is_match(line) {
        return None;
    }
    let caps = LIST_ITEM_REGEX.captures(line)?;
    let number = caps.get(3).and_then(|n| n.as_str().parse().ok());
    Some(ListItem {
        indent: indent_width(&caps[1]),
        ordered: number.is_some(),
        number: number.unwrap_or(1),
        content: caps[4].to_string(),
    })
}

fn is_table_start(lines: &[String], index: usize) -> bool {
    lines[index].contains('|')
        && lines
            .get(index + 1)
            .is_some_and(|next| next.contains('|') && TABLE_SEPARATOR_REGEX.is_match(next))
}

fn starts_block(lines: &[String], index: usize) -> bool {
    let line = &lines[index];
    FENCE_REGEX.is_match(line)
        || HEADING_REGEX.is_match(line)
        || RULE_REGEX.is_match(line)
        || QUOTE_REGEX.is_match(line)
        || list_item(line).is_some()
        || is_table_start(lines, index)
}

fn split_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    let trimmed = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix('|').unwrap_or(trimmed);
    trimmed
        .replace("\\|", "\u{E002}")
        .split('|')
        .map(|cell| cell.trim().replace('\u{E002}', "|"))
        .collect()
}

struct Renderer<'a> {
    targets: HashMap<String, &'a MentionTarget>,
    mentions: Vec<OutgoingMention>,
}

impl Renderer<'_> {
    fn blocks(&mut self, lines: &[String]) -> String {
        let mut html = String::new();
        let mut index = 0;

        while index < lines.len() {
            let line = &lines[index];
            if line.trim().is_empty() {
                index += 1;
                continue;
            }

            if let Some(caps) = FENCE_REGEX.captures(line) {
                let fence = caps[1].to_string();
                let language = caps[2].to_lowercase();
                index += 1;
                let mut code = Vec::new();
                while index < lines.len() {
                    let candidate = lines[index].trim();
                    if candidate.starts_with(&fence)
                        && candidate.chars().all(|c| Some(c) == fence.chars().next())
                    {
                        index += 1;
                        break;
                    }
                    code.push(lines[index].as_str());
                    index += 1;
                }
                let class = if language.is_empty() {
                    String::new()
                } else {
                    format!(" class=\"language-{}\"", escape_html(&language))
                };
                html.push_str(&format!(
                    "<pre><code{}>{}</code></pre>",
                    class,
                    escape_html(&code.join("\n"))
                ));
                continue;
            }

            if let Some(caps) = HEADING_REGEX.captures(line) {
                let level = caps[1].len();
                let text = self.inline(&caps[2]);
                html.push_str(&format!("<h{level}>{text}</h{level}>"));
                index += 1;
                continue;
            }

            if RULE_REGEX.is_match(line) {
                html.push_str("<hr>");
                index += 1;
                continue;
            }

            if QUOTE_REGEX.is_match(line) {
                let mut quoted = Vec::new();
                while let Some(caps) = lines.get(index).and_then(|l| QUOTE_REGEX.captures(l)) {
                    quoted.push(caps[1].to_string());
                    index += 1;
                }
                let inner = self.blocks(&quoted);
                html.push_str(&format!("<blockquote>{inner}</blockquote>"));
                continue;
            }

            if is_table_start(lines, index) {
                html.push_str(&self.table(lines, &mut index));
                continue;
            }

            if list_item(line).is_some() {
                html.push_str(&self.list(lines, &mut index));
                continue;
            }

            let mut paragraph = vec![line.trim().to_string()];
            index += 1;
            while index < lines.len()
                && !lines[index].trim().is_empty()
                && !starts_block(lines, index)
            {
                paragraph.push(lines[index].trim().to_string());
                index += 1;
            }
            let rendered = paragraph
                .iter()
                .map(|line| self.inline(line))
                .collect::<Vec<_>>()
                .join("<br>");
            html.push_str(&format!("<p>{rendered}</p>"));
        }
        html
    }

    fn list(&mut self, lines: &[String], index: &mut usize) -> String {
        let Some(first) = list_item(&lines[*index]) else {
            return String::new();
        };
        let base = first.indent;
        let ordered = first.ordered;
        let start = first.number;
        let mut items: Vec<(Vec<String>, String)> = Vec::new();

        while *index < lines.len() {
            let line = &lines[*index];
            if line.trim().is_empty() {
                let next = lines[*index..].iter().position(|l| !l.trim().is_empty());
                let continues = next
                    .and_then(|offset| list_item(&lines[*index + offset]))
                    .is_some_and(|item| item.indent >= base && item.ordered == ordered);
                if !continues {
                    break;
                }
                *index += 1;
                continue;
            }

            match list_item(line) {
                Some(item) if item.indent < base => break,
                Some(item) if item.indent <= base + 1 => {
                    if item.ordered != ordered {
                        break;
                    }
                    items.push((vec![item.content], String::new()));
                    *index += 1;
                }
                Some(_) => {
                    let nested = self.list(lines, index);
                    match items.last_mut() {
                        Some((_, children)) => children.push_str(&nested),
                        None => items.push((Vec::new(), nested)),
                    }
                }
                None => {
                    let is_continuation = indent_width(&line[..line.len() - line.trim_start().len()]) > base
                        || !starts_block(lines, *index);
                    match items.last_mut() {
                        Some((content, _)) if is_continuation => {
                            content.push(line.trim().to_string());
                            *index += 1;
                        }
                        _ => break,
                    }
                }
            }
        }

        let tag = if ordered { "ol" } else { "ul" };
        let open = if ordered && start != 1 {
            format!("<ol start=\"{start}\">")
        } else {
            format!("<{tag}>")
        };
        let body = items
            .into_iter()
            .map(|(content, children)| {
                let text = content
                    .iter()
                    .map(|line| self.inline(line))
                    .collect::<Vec<_>>()
                    .join("<br>");
                format!("<li>{text}{children}</li>")
            })
            .collect::<String>();
        format!("{open}{body}</{tag}>")
    }

    fn table(&mut self, lines: &[String], index: &mut usize) -> String {
        let header = split_row(&lines[*index]);
        *index += 2;
        let mut rows = Vec::new();
        while *index < lines.len() && lines[*index].contains('|') && !lines[*index].trim().is_empty() {
            rows.push(split_row(&lines[*index]));
            *index += 1;
        }

        let columns = header.len();
        let mut html = String::from("<table><thead><tr>");
        for cell in &header {
            html.push_str(&format!("<th>{}</th>", self.inline(cell)));
        }
        html.push_str("</tr></thead><tbody>");
        for row in rows {
            html.push_str("<tr>");
            for column in 0..columns {
                let cell = row.get(column).map(String::as_str).unwrap_or_default();
                html.push_str(&format!("<td>{}</td>", self.inline(cell)));
            }
            html.push_str("</tr>");
        }
        html.push_str("</tbody></table>");
        html
    }

    fn inline(&mut self, text: &str) -> String {
        let mut slots: Vec<String> = Vec::new();
        let protect = |slots: &mut Vec<String>, html: String| {
            slots.push(html);
            format!("{}{}{}", SLOT_OPEN, slots.len() - 1, SLOT_CLOSE)
        };

        let text = CODE_SPAN_REGEX
            .replace_all(text, |caps: &Captures| {
                protect(&mut slots, format!("<code>{}</code>", escape_html(&caps[1])))
            })
            .into_owned();
        let text = escape_html(&text);

        let text = IMAGE_REGEX
            .replace_all(&text, |caps: &Captures| {
                protect(
                    &mut slots,
                    format!("<img src=\"{}\" alt=\"{}\">", &caps[2], &caps[1]),
                )
            })
            .into_owned();
        let text = LINK_REGEX
            .replace_all(&text, |caps: &Captures| {
                let label = emphasis(&caps[1]);
                protect(&mut slots, format!("<a href=\"{}\">{}</a>", &caps[2], label))
            })
            .into_owned();
        let text = BARE_URL_REGEX
            .replace_all(&text, |caps: &Captures| {
                let matched = &caps[0];
                let url = matched.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
                let rest = &matched[url.len()..];
                let anchor = protect(&mut slots, format!("<a href=\"{url}\">{url}</a>"));
                format!("{anchor}{rest}")
            })
            .into_owned();

        let text = emphasis(&text);
        let text = replace_shortcodes(&text);
        let text = self.mentions(&text);
        restore(&text, &slots)
    }

    fn mentions(&mut self, text: &str) -> String {
        if self.targets.is_empty() || !text.contains('@') {
            return text.to_string();
        }
        MENTION_REGEX
            .replace_all(text, |caps: &Captures| {
                let prefix = &caps[1];
                let candidate = &caps[2];
                let username = candidate.trim_end_matches(['.', '-', '_']);
                let rest = &candidate[username.len()..];
                let Some(target) = self.targets.get(&username.to_lowercase()) else {
                    return caps[0].to_string();
                };
                let id = self.mentions.len() as i64;
                self.mentions.push(OutgoingMention {
                    id,
                    text: target.display_name.clone(),
                    user_id: target.remote_user_id.clone(),
                });
                format!(
                    "{prefix}<at id=\"{id}\">{}</at>{rest}",
                    escape_html(&target.display_name)
                )
            })
            .into_owned()
    }
}

fn emphasis(text: &str) -> String {
    let text = STRONG_STAR_REGEX.replace_all(text, "<strong>$1</strong>");
    let text = STRONG_UNDERSCORE_REGEX.replace_all(&text, "<strong>$1</strong>");
    let text = STRIKE_REGEX.replace_all(&text, "<s>$1</s>");
    let mut text = EM_STAR_REGEX.replace_all(&text, "<em>$1</em>").into_owned();
    loop {
        let next = EM_UNDERSCORE_REGEX
            .replace_all(&text, "${1}<em>${2}</em>${3}")
            .into_owned();
        if next == text {
            return text;
        }
        text = next;
    }
}

fn restore(text: &str, slots: &[String]) -> String {
    let mut current = text.to_string();
    while current.contains(SLOT_OPEN) {
        let next = SLOT_REGEX
            .replace_all(&current, |caps: &Captures| {
                caps[1]
                    .parse::<usize>()
                    .ok()
                    .and_then(|slot| slots.get(slot))
                    .cloned()
                    .unwrap_or_default()
            })
            .into_owned();
        if next == current {
            break;
        }
        current = next;
    }
    current
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::parsers::html_parser::html_to_markdown;

    #[test_case("hello", "<p>hello</p>" ; "plain paragraph")]
    #[test_case("a < b & c", "<p>a &lt; b &amp; c</p>" ; "escaping")]
    #[test_case("**bold** and *it* and ~~gone~~", "<p><strong>bold</strong> and <em>it</em> and <s>gone</s></p>" ; "emphasis")]
    #[test_case("use `a*b*c` here", "<p>use <code>a*b*c</code> here</p>" ; "code span is literal")]
    #[test_case("line one\nline two", "<p>line one<br>line two</p>" ; "soft breaks")]
    #[test_case("# Title", "<h1>Title</h1>" ; "heading")]
    #[test_case("---", "<hr>" ; "rule")]
    #[test_case("[site](https://example.com/a_b_c)", "<p><a href=\"https://example.com/a_b_c\">site</a></p>" ; "link keeps underscores")]
    #[test_case("see https://example.com/x_y_z.", "<p>see <a href=\"https://example.com/x_y_z\">https://example.com/x_y_z</a>.</p>" ; "bare url")]
    #[test_case("ship it :rocket:", "<p>ship it 🚀</p>" ; "emoji shortcode")]
    #[test_case("snake_case_name", "<p>snake_case_name</p>" ; "intraword underscores")]
    fn renders_markdown(markdown: &str, expected: &str) {
        assert_eq!(markdown_to_html(markdown), expected);
    }

    #[test]
    fn fenced_code_keeps_language_and_escapes() {
        assert_eq!(
            markdown_to_html("```rust\nif a < b {}\n```"),
            "<pre><code class=\"language-rust\">if a &lt; b {}</code></pre>"
        );
    }

    #[test]
    fn nested_lists() {
        assert_eq!(
            markdown_to_html("- a\n  - b\n- c"),
            "<ul><li>a<ul><li>b</li></ul></li><li>c</li></ul>"
        );
        assert_eq!(
            markdown_to_html("3. three\n4. four"),
            "<ol start=\"3\"><li>three</li><li>four</li></ol>"
        );
    }

    #[test]
    fn tables_render_with_head_and_body() {
        assert_eq!(
            markdown_to_html("| a | b |\n| --- | --- |\n| 1 | 2 |"),
            "<table><thead><tr><th>a</th><th>b</th></tr></thead><tbody><tr><td>1</td><td>2</td></tr></tbody></table>"
        );
    }

    #[test]
    fn blockquotes_recurse() {
        assert_eq!(
            markdown_to_html("> quoted\n> **more**"),
            "<blockquote><p>quoted<br><strong>more</strong></p></blockquote>"
        );
    }

    #[test]
    fn mentions_resolve_to_remote_users() {
        let targets = vec![MentionTarget {
            username: "alice".to_string(),
            remote_user_id: "aad-alice".to_string(),
            display_name: "Alice Liddell".to_string(),
        }];
        let rendered = render_markdown("hey @alice, and @bob. mail alice@example.com", &targets);
        assert_eq!(
            rendered.html,
            "<p>hey <at id=\"0\">Alice Liddell</at>, and @bob. mail alice@example.com</p>"
        );
        assert_eq!(
            rendered.mentions,
            vec![OutgoingMention {
                id: 0,
                text: "Alice Liddell".to_string(),
                user_id: "aad-alice".to_string(),
            }]
        );
    }

    #[test]
    fn repeated_mentions_get_distinct_ids() {
        let targets = vec![MentionTarget {
            username: "alice".to_string(),
            remote_user_id: "aad-alice".to_string(),
            display_name: "Alice".to_string(),
        }];
        let rendered = render_markdown("@alice @Alice", &targets);
        assert_eq!(rendered.mentions.len(), 2);
        assert!(rendered.html.contains("<at id=\"1\">Alice</at>"));
    }

    #[test_case("**bold** and _it_ and ~~s~~ and `code`" ; "inline formatting")]
    #[test_case("# Title\n\nText" ; "heading and paragraph")]
    #[test_case("1. One\n2. Two" ; "ordered list")]
    #[test_case("- a\n  - b\n- c" ; "nested bullets")]
    #[test_case("> quoted\n> more" ; "quote")]
    #[test_case("```rust\nfn main() {}\n```" ; "fenced code")]
    #[test_case("| a | b |\n| --- | --- |\n| 1 | 2 |" ; "table")]
    #[test_case("[link](https://example.com/a_b) and https://x.test/z_w_" ; "links")]
    #[test_case("![alt](https://x.test/i.png)" ; "image")]
    #[test_case("before\n\n---\n\nafter" ; "rule between paragraphs")]
    #[test_case("a < b && c > d" ; "escaped text")]
    fn html_round_trip_is_stable(markdown: &str) {
        let html = markdown_to_html(markdown);
        assert_eq!(markdown_to_html(&html_to_markdown(&html)), html);
    }
}
