use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::models::{MessageTarget, RemoteContainer, RemoteMessage};

/// The message a change notification points at, parsed from its
/// `resource` string. Both the OData form
/// `teams('T')/channels('C')/messages('M')/replies('R')` and the plain
/// path form `/chats/X/messages/M` are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    pub container: RemoteContainer,
    pub message_id: String,
    pub reply_id: Option<String>,
}

impl ResourceLocator {
    pub fn parse(resource: &str) -> Option<Self> {
        let segments = segments(resource);
        let find = |name: &str| {
            segments
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.clone())
                .filter(|value| !value.is_empty())
        };

        let message_id = find("messages")?;
        if let Some(chat_id) = find("chats") {
            return Some(Self {
                container: RemoteContainer::Chat { chat_id },
                message_id,
                reply_id: None,
            });
        }

        Some(Self {
            container: RemoteContainer::Channel {
                team_id: find("teams")?,
                channel_id: find("channels")?,
            },
            message_id,
            reply_id: find("replies"),
        })
    }

    /// Locator of an already fetched message, as a notification for it
    /// would have carried.
    pub fn for_message(message: &RemoteMessage) -> Self {
        match (&message.container, message.reply_to_id.as_ref()) {
            (RemoteContainer::Channel { .. }, Some(parent)) => Self {
                container: message.container.clone(),
                message_id: parent.clone(),
                reply_id: Some(message.id.clone()),
            },
            _ => Self {
                container: message.container.clone(),
                message_id: message.id.clone(),
                reply_id: None,
            },
        }
    }

    /// Id of the message that actually changed.
    pub fn changed_message_id(&self) -> &str {
        self.reply_id.as_deref().unwrap_or(&self.message_id)
    }

    pub fn target(&self) -> MessageTarget {
        match self.reply_id.as_ref() {
            Some(reply) => {
                MessageTarget::reply(self.container.clone(), self.message_id.clone(), reply.clone())
            }
            None => MessageTarget::new(self.container.clone(), self.message_id.clone()),
        }
    }
}

fn segments(resource: &str) -> Vec<(String, String)> {
    let resource = resource.split('?').next().unwrap_or_default();
    let mut tokens = resource.split('/').filter(|token| !token.is_empty()).peekable();
    let mut pairs = Vec::new();

    while let Some(token) = tokens.next() {
        if let Some(open) = token.find('(') {
            let name = &token[..open];
            let value = token[open + 1..]
                .trim_end_matches(')')
                .trim_matches(|c| c == '\'' || c == '"');
            pairs.push((name.to_string(), value.to_string()));
            continue;
        }
        let value = tokens.next_if(|next| !next.contains('(')).unwrap_or_default();
        pairs.push((token.to_string(), value.to_string()));
    }
    pairs
}

/// Graph subscription resource for one channel.
pub fn channel_subscription_resource(team_id: &str, channel_id: &str) -> String {
    format!("/teams/{}/channels/{}/messages", team_id, channel_id)
}

pub const CHATS_SUBSCRIPTION_RESOURCE: &str = "chats/getAllMessages";

pub fn user_chats_subscription_resource(user_id: &str) -> String {
    format!("/users/{}/chats/getAllMessages", user_id)
}

/// Compares subscription resources the way Graph reports them back: the
/// leading slash and the `?model=` suffix are not significant.
pub fn same_resource(left: &str, right: &str) -> bool {
    fn canonical(resource: &str) -> String {
        resource
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_ascii_lowercase()
    }
    canonical(left) == canonical(right)
}

/// Share id for the `/shares/{id}` endpoint, built from a file web URL.
pub fn encode_share_id(web_url: &str) -> String {
    format!("u!{}", URL_SAFE_NO_PAD.encode(web_url.as_bytes()))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn channel_reply_locator() {
        let locator = ResourceLocator::parse(
            "teams('team-id')/channels('19:abc@thread.tacv2')/messages('1700')/replies('1800')",
        )
        .unwrap();
        assert_eq!(
            locator.container,
            RemoteContainer::channel("team-id", "19:abc@thread.tacv2")
        );
        assert_eq!(locator.changed_message_id(), "1800");
        assert_eq!(locator.target().parent_id.as_deref(), Some("1700"));
    }

    #[test]
    fn chat_locator() {
        let locator = ResourceLocator::parse("chats('19:x@unq.gbl.spaces')/messages('42')").unwrap();
        assert_eq!(locator.container, RemoteContainer::chat("19:x@unq.gbl.spaces"));
        assert_eq!(locator.changed_message_id(), "42");
        assert!(locator.reply_id.is_none());
    }

    #[test]
    fn path_form_is_accepted() {
        let locator = ResourceLocator::parse("/teams/T/channels/C/messages/M").unwrap();
        assert_eq!(locator.container, RemoteContainer::channel("T", "C"));
        assert_eq!(locator.message_id, "M");
    }

    #[test_case("" ; "empty")]
    #[test_case("teams('T')" ; "team only")]
    #[test_case("teams('T')/channels('C')" ; "no message")]
    #[test_case("chats('')/messages('1')" ; "empty chat id")]
    fn incomplete_locators_are_rejected(resource: &str) {
        assert!(ResourceLocator::parse(resource).is_none());
    }

    #[test]
    fn resources_compare_loosely() {
        assert!(same_resource(
            "/teams/T/channels/C/messages",
            "teams/T/channels/C/messages?model=B"
        ));
        assert!(!same_resource(CHATS_SUBSCRIPTION_RESOURCE, "/users/u/chats/getAllMessages"));
    }

    #[test]
    fn share_id_is_url_safe() {
        let id = encode_share_id("https://contoso.sharepoint.com/a b?c=d");
        assert!(id.starts_with("u!"));
        assert!(!id.contains('='));
        assert!(!id.contains('/'));
    }
}
