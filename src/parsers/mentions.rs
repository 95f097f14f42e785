use once_cell::sync::Lazy;
use regex::Regex;

use crate::msteams::RemoteMention;

static AT_TAG_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<at\s+id=["']?(\d+)["']?[^>]*>(.*?)</at>"#).expect("valid mention tag regex")
});

static SEPARATOR_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:\s|&nbsp;|&#160;)*$").expect("valid separator regex"));

static LOCAL_MENTION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^\w@.\-])@([a-zA-Z0-9][a-zA-Z0-9._\-]*)").expect("valid mention regex")
});

const EVERYONE: &str = "Everyone";

/// Usernames mentioned in a local message, in order of first appearance.
pub fn extract_local_mentions(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in LOCAL_MENTION_REGEX.captures_iter(text) {
        let name = caps[1].trim_end_matches(['.', '-', '_']).to_lowercase();
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Rewrites `<at id="N">` tokens in a remote body into local mentions.
///
/// The remote platform splits a multi-word display name into one token per
/// word; adjacent tokens that point at the same user collapse into a single
/// mention. `resolve` maps a remote user id to a local username; tokens it
/// cannot resolve keep their display text.
pub fn rewrite_remote_mentions<F>(html: &str, mentions: &[RemoteMention], resolve: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if mentions.is_empty() || !html.contains("<at") {
        return html.to_string();
    }

    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    let mut previous: Option<(usize, Option<&str>)> = None;

    for caps in AT_TAG_REGEX.captures_iter(html) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let between = &html[cursor..whole.start()];
        let mention = caps[1]
            .parse::<i64>()
            .ok()
            .and_then(|id| mentions.iter().find(|m| m.id == id));
        let user_id = mention.and_then(|m| m.user_id.as_deref());

        let continues_previous = matches!(
            previous,
            Some((end, Some(prev_user))) if end == cursor && Some(prev_user) == user_id
        ) && SEPARATOR_REGEX.is_match(between);

        if continues_previous {
            cursor = whole.end();
            previous = Some((cursor, user_id));
            continue;
        }

        out.push_str(between);
        let text = caps[2].trim();
        let replacement = match (mention, user_id) {
            (Some(_), Some(remote_id)) => resolve(remote_id)
                .map(|username| format!("@{}", username))
                .unwrap_or_else(|| text.to_string()),
            (Some(m), None) if m.text == EVERYONE || text == EVERYONE => "@all".to_string(),
            _ => text.to_string(),
        };
        out.push_str(&replacement);
        cursor = whole.end();
        previous = Some((cursor, user_id));
    }
    out.push_str(&html[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mention(id: i64, text: &str, user: Option<&str>) -> RemoteMention {
        RemoteMention {
            id,
            text: text.to_string(),
            user_id: user.map(str::to_string),
        }
    }

    fn resolver(remote_id: &str) -> Option<String> {
        match remote_id {
            "u-john" => Some("john.smith".to_string()),
            _ => None,
        }
    }

    #[test]
    fn split_display_names_collapse_into_one_mention() {
        let html = "<p>hi <at id=\"0\">John</at>&nbsp;<at id=\"1\">Smith</at> there</p>";
        let mentions = vec![mention(0, "John", Some("u-john")), mention(1, "Smith", Some("u-john"))];
        assert_eq!(
            rewrite_remote_mentions(html, &mentions, resolver),
            "<p>hi @john.smith there</p>"
        );
    }

    #[test]
    fn adjacent_mentions_of_different_users_stay_separate() {
        let html = "<at id=\"0\">John</at> <at id=\"1\">Jane</at>";
        let mentions = vec![mention(0, "John", Some("u-john")), mention(1, "Jane", Some("u-jane"))];
        assert_eq!(rewrite_remote_mentions(html, &mentions, resolver), "@john.smith Jane");
    }

    #[test]
    fn everyone_becomes_all() {
        let html = "<at id=\"0\">Everyone</at> lunch";
        let mentions = vec![mention(0, "Everyone", None)];
        assert_eq!(rewrite_remote_mentions(html, &mentions, resolver), "@all lunch");
    }

    #[test]
    fn unknown_ids_keep_text() {
        let html = "<at id=\"7\">Team Rocket</at>";
        assert_eq!(
            rewrite_remote_mentions(html, &[mention(0, "x", None)], resolver),
            "Team Rocket"
        );
    }

    #[test]
    fn local_mentions_are_extracted_once() {
        assert_eq!(
            extract_local_mentions("@alice and @Bob. then @alice again, mail x@y.z"),
            vec!["alice".to_string(), "bob".to_string()]
        );
    }
}
