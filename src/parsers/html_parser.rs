use once_cell::sync::Lazy;
use regex::Regex;

use super::common::{contains_html, decode_entities, normalize_whitespace};

static TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<!--.*?-->|<(/?)([a-zA-Z][a-zA-Z0-9]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#)
        .expect("valid html tag regex")
});

static ATTR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([a-zA-Z_:][-a-zA-Z0-9_:.]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("valid html attribute regex")
});

static SPACE_RUN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t\r\n\f]+").expect("valid whitespace regex"));

static DOUBLE_SPACE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r" {2,}").expect("valid space regex"));

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img", "input", "meta", "link", "col", "wbr", "source"];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "blockquote", "pre",
    "codeblock", "hr", "table", "thead", "tbody", "tfoot", "tr", "section", "article", "header",
    "footer", "nav", "aside", "figure", "figcaption", "main", "dl", "dt", "dd", "address",
    "details", "summary", "form", "fieldset", "body", "html",
];

/// Elements whose content never reaches the local side.
const DROPPED_ELEMENTS: &[&str] = &["attachment", "script", "style", "head", "title", "systemeventmessage"];

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Element(Element),
}

#[derive(Debug, Clone, PartialEq)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn new(name: &str, raw_attrs: &str) -> Self {
        let attrs = ATTR_REGEX
            .captures_iter(raw_attrs)
            .map(|caps| {
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map(|m| decode_entities(m.as_str()))
                    .unwrap_or_default();
                (caps[1].to_ascii_lowercase(), value)
            })
            .collect();
        Self {
            name: name.to_ascii_lowercase(),
            attrs,
            children: Vec::new(),
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn is_block(&self) -> bool {
        BLOCK_ELEMENTS.contains(&self.name.as_str())
    }
}

/// Converts a remote HTML body to local markdown. Bodies without any
/// recognized HTML tag are returned untouched.
pub fn html_to_markdown(html: &str) -> String {
    if !contains_html(html) {
        return html.to_string();
    }
    let root = parse(html);
    let blocks = render_blocks(&root.children);
    normalize_whitespace(&blocks.join("\n\n"))
}

fn parse(html: &str) -> Element {
    let mut stack = vec![Element::new("#root", "")];
    let mut cursor = 0;

    for caps in TAG_REGEX.captures_iter(html) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        push_text(&mut stack, &html[cursor..whole.start()]);
        cursor = whole.end();

        let Some(name) = caps.get(2) else {
            continue;
        };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let raw_attrs = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let element = Element::new(name.as_str(), raw_attrs);

        if closing {
            close(&mut stack, &element.name);
            continue;
        }

        if matches!(element.name.as_str(), "li" | "p")
            && stack.last().is_some_and(|top| top.name == element.name)
        {
            close(&mut stack, &element.name);
        }

        if VOID_ELEMENTS.contains(&element.name.as_str()) || raw_attrs.trim_end().ends_with('/') {
            attach(&mut stack, Node::Element(element));
        } else {
            stack.push(element);
        }
    }
    push_text(&mut stack, &html[cursor..]);

    while stack.len() > 1 {
        if let Some(done) = stack.pop() {
            attach(&mut stack, Node::Element(done));
        }
    }
    stack.pop().unwrap_or_else(|| Element::new("#root", ""))
}

fn push_text(stack: &mut [Element], raw: &str) {
    if raw.is_empty() {
        return;
    }
    if let Some(top) = stack.last_mut() {
        top.children.push(Node::Text(decode_entities(raw)));
    }
}

fn attach(stack: &mut [Element], node: Node) {
    if let Some(top) = stack.last_mut() {
        top.children.push(node);
    }
}

fn close(stack: &mut Vec<Element>, name: &str) {
    let Some(position) = stack.iter().rposition(|open| open.name == name) else {
        return;
    };
    if position == 0 {
        return;
    }
    while stack.len() > position {
        if let Some(done) = stack.pop() {
            attach(stack, Node::Element(done));
        }
    }
}

fn render_blocks(nodes: &[Node]) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut inline = String::new();

    for node in nodes {
        match node {
            Node::Element(element) if element.is_block() => {
                flush_inline(&mut inline, &mut blocks);
                render_block(element, &mut blocks);
            }
            other => inline.push_str(&render_inline(std::slice::from_ref(other))),
        }
    }
    flush_inline(&mut inline, &mut blocks);
    blocks
}

fn flush_inline(inline: &mut String, blocks: &mut Vec<String>) {
    let text = tidy_lines(inline);
    if !text.is_empty() {
        blocks.push(text);
    }
    inline.clear();
}

fn tidy_lines(text: &str) -> String {
    text.lines()
        .map(|line| DOUBLE_SPACE_REGEX.replace_all(line.trim(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n")
        .trim_matches('\n')
        .to_string()
}

fn render_block(element: &Element, blocks: &mut Vec<String>) {
    match element.name.as_str() {
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
            let level = element.name[1..].parse::<usize>().unwrap_or(1);
            let text = tidy_lines(&render_inline(&element.children)).replace('\n', " ");
            if !text.is_empty() {
                blocks.push(format!("{} {}", "#".repeat(level), text));
            }
        }
        "ul" | "ol" => {
            let lines = render_list(element);
            if !lines.is_empty() {
                blocks.push(lines.join("\n"));
            }
        }
        "li" => {
            let lines = render_list_item(element, "- ");
            if !lines.is_empty() {
                blocks.push(lines.join("\n"));
            }
        }
        "blockquote" => {
            let inner = render_blocks(&element.children).join("\n\n");
            if !inner.is_empty() {
                let quoted = inner
                    .lines()
                    .map(|line| {
                        if line.is_empty() {
                            ">".to_string()
                        } else {
                            format!("> {}", line)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                blocks.push(quoted);
            }
        }
        "pre" | "codeblock" => blocks.push(render_code_block(element)),
        "hr" => blocks.push("---".to_string()),
        "table" => {
            if let Some(table) = render_table(element) {
                blocks.push(table);
            }
        }
        _ => blocks.extend(render_blocks(&element.children)),
    }
}

fn render_inline(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(&SPACE_RUN_REGEX.replace_all(text, " ")),
            Node::Element(element) => out.push_str(&render_inline_element(element)),
        }
    }
    out
}

fn render_inline_element(element: &Element) -> String {
    if DROPPED_ELEMENTS.contains(&element.name.as_str()) {
        return String::new();
    }
    match element.name.as_str() {
        "strong" | "b" => wrap(&render_inline(&element.children), "**"),
        "em" | "i" => wrap(&render_inline(&element.children), "_"),
        "s" | "strike" | "del" => wrap(&render_inline(&element.children), "~~"),
        "code" => {
            let code = SPACE_RUN_REGEX.replace_all(&text_content(&element.children), " ").into_owned();
            if code.trim().is_empty() {
                code
            } else {
                format!("`{}`", code)
            }
        }
        "br" => "\n".to_string(),
        "a" => {
            let text = tidy_lines(&render_inline(&element.children)).replace('\n', " ");
            let href = element.attr("href").unwrap_or_default().trim();
            if href.is_empty() {
                text
            } else if text.is_empty() || text == href {
                href.to_string()
            } else {
                format!("[{}]({})", text, href)
            }
        }
        "img" => {
            let src = element.attr("src").unwrap_or_default();
            if src.is_empty() {
                String::new()
            } else {
                format!("![{}]({})", element.attr("alt").unwrap_or_default(), src)
            }
        }
        "emoji" => element
            .attr("alt")
            .map(str::to_string)
            .unwrap_or_else(|| render_inline(&element.children)),
        "pre" | "codeblock" => render_code_block(element),
        _ if element.is_block() => {
            let text = render_blocks(&element.children).join("\n");
            format!("\n{}\n", text)
        }
        _ => render_inline(&element.children),
    }
}

/// Places markers around the trimmed content so surrounding whitespace
/// stays outside the emphasis.
fn wrap(inner: &str, marker: &str) -> String {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        return inner.to_string();
    }
    let leading = &inner[..inner.len() - inner.trim_start().len()];
    let trailing = &inner[inner.trim_end().len()..];
    format!("{}{}{}{}{}", leading, marker, trimmed, marker, trailing)
}

fn text_content(nodes: &[Node]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) if element.name == "br" => out.push('\n'),
            Node::Element(element) if DROPPED_ELEMENTS.contains(&element.name.as_str()) => {}
            Node::Element(element) => {
                out.push_str(&text_content(&element.children));
                if matches!(element.name.as_str(), "p" | "div") {
                    out.push('\n');
                }
            }
        }
    }
    out
}

fn code_language(element: &Element) -> Option<String> {
    let mut candidates = vec![element];
    candidates.extend(element.children.iter().filter_map(|child| match child {
        Node::Element(inner) if inner.name == "code" => Some(inner),
        _ => None,
    }));
    candidates.into_iter().find_map(|candidate| {
        let class = candidate.attr("class")?;
        let language = class
            .split_whitespace()
            .map(|token| token.strip_prefix("language-").unwrap_or(token))
            .next()?;
        Some(language.to_ascii_lowercase())
    })
}

fn render_code_block(element: &Element) -> String {
    let code = text_content(&element.children);
    let code = code.trim_matches('\n');
    format!(
        "```{}\n{}\n```",
        code_language(element).unwrap_or_default(),
        code
    )
}

fn render_list(list: &Element) -> Vec<String> {
    let ordered = list.name == "ol";
    let mut number = list
        .attr("start")
        .and_then(|start| start.trim().parse::<u64>().ok())
        .unwrap_or(1);
    let mut lines = Vec::new();

    for child in &list.children {
        let Node::Element(element) = child else {
            continue;
        };
        match element.name.as_str() {
            "li" => {
                let marker = if ordered {
                    format!("{}. ", number)
                } else {
                    "- ".to_string()
                };
                number += 1;
                lines.extend(render_list_item(element, &marker));
            }
            "ul" | "ol" => lines.extend(render_list(element).into_iter().map(|line| format!("  {}", line))),
            _ => {
                let text = tidy_lines(&render_inline_element(element));
                if !text.is_empty() {
                    lines.push(text);
                }
            }
        }
    }
    lines
}

fn render_list_item(item: &Element, marker: &str) -> Vec<String> {
    let indent = " ".repeat(marker.len());
    let mut content: Vec<Node> = Vec::new();
    let mut nested: Vec<String> = Vec::new();

    for child in &item.children {
        match child {
            Node::Element(element) if matches!(element.name.as_str(), "ul" | "ol") => {
                nested.extend(render_list(element));
            }
            other => content.push(other.clone()),
        }
    }

    let text = render_blocks(&content).join("\n");
    let mut lines = Vec::new();
    let mut content_lines = text.lines();
    lines.push(format!("{}{}", marker, content_lines.next().unwrap_or_default()).trim_end().to_string());
    for line in content_lines {
        lines.push(format!("{}{}", indent, line));
    }
    for line in nested {
        lines.push(format!("{}{}", indent, line));
    }
    lines
}

fn collect_rows<'a>(element: &'a Element, rows: &mut Vec<(&'a Element, bool)>, in_head: bool) {
    for child in &element.children {
        let Node::Element(inner) = child else {
            continue;
        };
        match inner.name.as_str() {
            "tr" => rows.push((inner, in_head)),
            "thead" => collect_rows(inner, rows, true),
            "tbody" | "tfoot" => collect_rows(inner, rows, false),
            _ => {}
        }
    }
}

fn render_table(table: &Element) -> Option<String> {
    let mut rows = Vec::new();
    collect_rows(table, &mut rows, false);
    if rows.is_empty() {
        return None;
    }

    let cells_of = |row: &Element| -> (Vec<String>, bool) {
        let mut all_headers = true;
        let cells = row
            .children
            .iter()
            .filter_map(|child| match child {
                Node::Element(cell) if matches!(cell.name.as_str(), "td" | "th") => {
                    all_headers &= cell.name == "th";
                    let text = render_blocks(&cell.children).join(" ").replace('\n', " ");
                    Some(text.trim().replace('|', "\\|"))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        (cells, all_headers)
    };

    let mut parsed: Vec<(Vec<String>, bool)> = rows
        .iter()
        .map(|(row, in_head)| {
            let (cells, all_headers) = cells_of(row);
            (cells, *in_head || all_headers)
        })
        .collect();

    let columns = parsed.iter().map(|(cells, _)| cells.len()).max().unwrap_or(0);
    if columns == 0 {
        return None;
    }

    let header = if parsed.first().is_some_and(|(_, is_header)| *is_header) {
        parsed.remove(0).0
    } else {
        vec!["   ".to_string(); columns]
    };

    let format_row = |cells: &[String]| {
        let padded = (0..columns)
            .map(|index| cells.get(index).map(String::as_str).unwrap_or_default())
            .collect::<Vec<_>>();
        format!("| {} |", padded.join(" | "))
    };

    let mut lines = vec![format_row(&header)];
    lines.push(format!("| {} |", vec!["---"; columns].join(" | ")));
    for (cells, _) in &parsed {
        lines.push(format_row(cells));
    }
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("This is text area <></>", "This is text area <></>" ; "no tags")]
    #[test_case("This is text area with <div> and <p> tags", "This is text area with\n\nand\n\ntags" ; "div and paragraph")]
    #[test_case("This is <p><b>bold</b></p>, <p><i>italics</i></p> and <p><s>strike through</s></p> text",
        "This is\n\n**bold**\n\n,\n\n_italics_\n\nand\n\n~~strike through~~\n\ntext" ; "emphasis in paragraphs")]
    #[test_case("<h1>H1</h1><h2>H2</h2><h3>H3</h3>", "# H1\n\n## H2\n\n### H3" ; "headings")]
    #[test_case("<p><strong>bold </strong>normal <i>Italics <s>&nbsp;strike through&nbsp;</s></i></p>",
        "**bold** normal _Italics ~~strike through~~_" ; "nested emphasis")]
    #[test_case("<p><a href=\"http://my.test.link/\">my message</a></p>", "[my message](http://my.test.link/)" ; "link")]
    #[test_case("<ol>\n<li><span style=\"font-size:inherit\">One</span></li><li><span style=\"font-size:inherit\">Two</span></li></ol>",
        "1. One\n2. Two" ; "numbered list")]
    #[test_case("<ul>\n<li>bullet one</li><li>bullet two</li></ul>", "- bullet one\n- bullet two" ; "bulleted list")]
    #[test_case("<p>**BOLD**</p>", "**BOLD**" ; "literal markdown survives")]
    #[test_case("<p>a<br>b</p>", "a\nb" ; "line break")]
    #[test_case("<p>x <emoji id=\"1f600_grinning\" alt=\"😀\" title=\"Grinning\"></emoji></p>", "x 😀" ; "emoji alt")]
    #[test_case("<p>see <unknown>inner</unknown> text</p>", "see inner text" ; "unknown inline tag")]
    #[test_case("<div>one<section>two</section>three</div>", "one\n\ntwo\n\nthree" ; "unknown block tag")]
    #[test_case("<p>file</p><attachment id=\"abc\"></attachment>", "file" ; "attachment tag dropped")]
    fn converts_html(html: &str, expected: &str) {
        assert_eq!(html_to_markdown(html), expected);
    }

    #[test]
    fn table_without_header_gets_empty_header() {
        let html = "<p>&nbsp;</p>\n<table itemprop=\"copy-paste-table\">\n<tbody>\n<tr>\n<td>\n<p>one</p>\n</td>\n<td>\n<p>two</p>\n</td>\n</tr>\n<tr>\n<td>\n<p>three</p>\n</td>\n<td>\n<p>four</p>\n</td>\n</tr>\n</tbody>\n</table>\n<p>&nbsp;</p>";
        assert_eq!(
            html_to_markdown(html),
            "|     |     |\n| --- | --- |\n| one | two |\n| three | four |"
        );
    }

    #[test]
    fn table_with_header() {
        let html = "<table><thead><tr><th>one</th><th>two</th></tr></thead><tbody><tr><td>three</td><td>four</td></tr></tbody></table>";
        assert_eq!(
            html_to_markdown(html),
            "| one | two |\n| --- | --- |\n| three | four |"
        );
    }

    #[test]
    fn nested_lists_are_indented() {
        let html = "<ul><li>a<ul><li>b</li></ul></li><li>c</li></ul>";
        assert_eq!(html_to_markdown(html), "- a\n  - b\n- c");
    }

    #[test]
    fn code_blocks_keep_language_and_newlines() {
        let html = "<codeblock class=\"Rust\"><code>fn main() {<br>    run();<br>}</code></codeblock>";
        assert_eq!(html_to_markdown(html), "```rust\nfn main() {\n    run();\n}\n```");

        let html = "<pre><code class=\"language-go\">a := 1\nb := 2</code></pre>";
        assert_eq!(html_to_markdown(html), "```go\na := 1\nb := 2\n```");
    }

    #[test]
    fn blockquote_lines_are_prefixed() {
        assert_eq!(
            html_to_markdown("<blockquote><p>first<br>second</p></blockquote>"),
            "> first\n> second"
        );
    }

    #[test]
    fn images_become_markdown_images() {
        assert_eq!(
            html_to_markdown("<p><img src=\"https://x.test/a.png\" alt=\"pic\"></p>"),
            "![pic](https://x.test/a.png)"
        );
    }
}
