use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::parsers::normalize_whitespace;
use crate::utils::formatting::apply_pattern_string;

const MAX_PREVIEW_CHARS: usize = 120;
const MAX_USERNAME_CHARS: usize = 64;
const MAX_BACKOFF_SHIFT: u32 = 16;

pub(crate) fn preview_text(value: &str) -> String {
    let mut chars = value.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{preview}…")
    } else {
        preview
    }
}

/// Fingerprint of a message body in its local (markdown) form, whitespace
/// normalized. Equal hashes mean an edit changes nothing.
pub(crate) fn edit_hash(markdown: &str) -> String {
    let digest = Sha256::digest(normalize_whitespace(markdown).as_bytes());
    hex(&digest)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Lowercase ASCII slug: letters and digits kept, every other run
/// collapsed into a single dash.
pub(crate) fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Username for a placeholder account. Remote users without a usable
/// display name fall back to their id.
pub(crate) fn synthetic_username(prefix: &str, display_name: &str, remote_user_id: &str) -> String {
    let mut slug = slugify(display_name);
    if slug.is_empty() {
        slug = slugify(remote_user_id);
    }
    let mut username = format!("{prefix}{slug}");
    if username.chars().count() > MAX_USERNAME_CHARS {
        username = username.chars().take(MAX_USERNAME_CHARS).collect();
        username = username.trim_end_matches('-').to_string();
    }
    username
}

pub(crate) fn synthetic_display_name(pattern: &str, display_name: &str) -> String {
    apply_pattern_string(pattern, &[("displayname", display_name)])
}

/// Marker for a write toward the local side, keyed on the remote message
/// that caused it. The local hook finds it through the correspondence.
pub(crate) fn local_echo_key(link_id: &str, remote_message_id: &str) -> String {
    format!("to_local:{link_id}:{remote_message_id}")
}

pub(crate) fn local_reaction_echo_key(post_id: &str, user_id: &str, emoji_name: &str) -> String {
    format!("to_local:reaction:{post_id}:{user_id}:{emoji_name}")
}

/// Marker for a write toward the remote side, keyed on the remote message
/// the resulting notification will point at.
pub(crate) fn remote_echo_key(container_key: &str, remote_message_id: &str) -> String {
    format!("to_remote:{container_key}:{remote_message_id}")
}

/// Exponential backoff from `base`, doubling per attempt and capped.
pub(crate) fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32 << attempt.min(MAX_BACKOFF_SHIFT);
    base.saturating_mul(factor).min(cap)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn preview_text_returns_original_when_short() {
        let text = "short message";
        assert_eq!(preview_text(text), text);
    }

    #[test]
    fn preview_text_truncates_and_appends_ellipsis_when_long() {
        let text = "x".repeat(130);
        let preview = preview_text(&text);
        assert_eq!(preview.chars().count(), 121);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn edit_hash_ignores_whitespace_noise() {
        assert_eq!(edit_hash("hello  world\n"), edit_hash("hello world"));
        assert_ne!(edit_hash("hello"), edit_hash("hello!"));
        assert_eq!(edit_hash("").len(), 64);
    }

    #[test_case("Unknown User", "msteams_unknown-user")]
    #[test_case("  Zoë O'Brien ", "msteams_zo-o-brien")]
    #[test_case("李雷", "msteams_5f2b")]
    fn synthetic_usernames_are_slugged(display_name: &str, expected: &str) {
        assert_eq!(synthetic_username("msteams_", display_name, "5F2B"), expected);
    }

    #[test]
    fn synthetic_usernames_are_bounded() {
        let name = synthetic_username("msteams_", &"a".repeat(200), "id");
        assert_eq!(name.chars().count(), MAX_USERNAME_CHARS);
    }

    #[test]
    fn display_name_pattern_is_applied() {
        assert_eq!(
            synthetic_display_name(":displayname (Teams)", "Jane Doe"),
            "Jane Doe (Teams)"
        );
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, 0, cap), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2, cap), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 10, cap), cap);
        assert_eq!(backoff_delay(base, 100, cap), cap);
    }

    #[test]
    fn echo_keys_separate_directions() {
        assert_ne!(local_echo_key("l1", "m1"), remote_echo_key("l1", "m1"));
        assert_eq!(remote_echo_key("T1/C1", "m1"), "to_remote:T1/C1:m1");
    }
}
