use once_cell::sync::Lazy;
use regex::Regex;

use super::common::decode_entities;
use crate::msteams::models::CONTENT_TYPE_MESSAGE_REFERENCE;
use crate::msteams::{RemoteAttachment, RemoteMessage};

static HOSTED_IMAGE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc=["']([^"']*/hostedContents/[^"']*)["'][^>]*>"#)
        .expect("valid hosted image regex")
});

const CONTENT_TYPE_ADAPTIVE_CARD: &str = "application/vnd.microsoft.card.adaptive";
const CONTENT_TYPE_HERO_CARD: &str = "application/vnd.microsoft.card.hero";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    File,
    Image,
    Card,
    Hosted,
    CodeSnippet,
}

/// A remote attachment reduced to what the local side needs to fetch or
/// inline it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentDescriptor {
    pub kind: AttachmentKind,
    pub name: String,
    pub url: String,
    pub language: Option<String>,
    pub inline: Option<String>,
}

impl AttachmentDescriptor {
    fn new(kind: AttachmentKind, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            url: url.into(),
            language: None,
            inline: None,
        }
    }

    pub fn is_file_upload(&self) -> bool {
        matches!(
            self.kind,
            AttachmentKind::File | AttachmentKind::Image | AttachmentKind::Hosted
        )
    }
}

pub fn is_image_name(name: &str) -> bool {
    matches!(
        extension(name).as_deref(),
        Some("png" | "jpg" | "jpeg" | "gif" | "bmp" | "webp" | "svg" | "heic")
    )
}

fn extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// MIME type guessed from a file name, used when uploading to either side.
pub fn content_type_for(name: &str) -> &'static str {
    match extension(name).as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("txt" | "log") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("zip") => "application/zip",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("pptx") => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => "application/octet-stream",
    }
}

fn describe(attachment: &RemoteAttachment) -> Option<AttachmentDescriptor> {
    if let Some((language, url)) = attachment.code_snippet() {
        let mut descriptor = AttachmentDescriptor::new(
            AttachmentKind::CodeSnippet,
            attachment.name.clone().unwrap_or_default(),
            url,
        );
        descriptor.language = Some(language);
        return Some(descriptor);
    }

    if attachment.is_file() {
        let name = attachment.name.clone().unwrap_or_else(|| "file".to_string());
        let kind = if is_image_name(&name) {
            AttachmentKind::Image
        } else {
            AttachmentKind::File
        };
        let url = attachment.content_url.clone().unwrap_or_default();
        return Some(AttachmentDescriptor::new(kind, name, url));
    }

    if matches!(
        attachment.content_type.as_str(),
        CONTENT_TYPE_ADAPTIVE_CARD | CONTENT_TYPE_HERO_CARD
    ) {
        let mut descriptor = AttachmentDescriptor::new(
            AttachmentKind::Card,
            attachment.name.clone().unwrap_or_default(),
            String::new(),
        );
        descriptor.inline = attachment.content.clone();
        return Some(descriptor);
    }

    None
}

/// Descriptors for every attachment the local side can represent, in
/// message order. Message references and unknown types are skipped.
pub fn describe_attachments(message: &RemoteMessage) -> Vec<AttachmentDescriptor> {
    message
        .attachments
        .iter()
        .filter(|attachment| attachment.content_type != CONTENT_TYPE_MESSAGE_REFERENCE)
        .filter_map(describe)
        .collect()
}

/// Removes hosted-content images from a remote body. Each removed image is
/// returned as a descriptor so it can be uploaded as a separate file.
pub fn extract_hosted_images(html: &str) -> (String, Vec<AttachmentDescriptor>) {
    let mut images = Vec::new();
    let stripped = HOSTED_IMAGE_REGEX
        .replace_all(html, |caps: &regex::Captures| {
            images.push(AttachmentDescriptor::new(
                AttachmentKind::Hosted,
                format!("image-{}.png", images.len() + 1),
                decode_entities(&caps[1]),
            ));
            String::new()
        })
        .into_owned();
    (stripped, images)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use test_case::test_case;

    use super::*;
    use crate::msteams::RemoteContainer;

    fn attachment(content_type: &str, name: &str, url: Option<&str>, content: Option<&str>) -> RemoteAttachment {
        RemoteAttachment {
            id: Some("a1".to_string()),
            content_type: content_type.to_string(),
            content: content.map(str::to_string),
            content_url: url.map(str::to_string),
            name: Some(name.to_string()),
        }
    }

    fn message(attachments: Vec<RemoteAttachment>) -> RemoteMessage {
        RemoteMessage {
            id: "m1".to_string(),
            container: RemoteContainer::chat("c1"),
            reply_to_id: None,
            user_id: Some("u1".to_string()),
            user_display_name: None,
            application_id: None,
            body: String::new(),
            body_is_html: true,
            subject: None,
            message_type: "message".to_string(),
            attachments,
            mentions: Vec::new(),
            reactions: Vec::new(),
            created_at: Utc::now(),
            last_modified_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn attachments_are_classified() {
        let msg = message(vec![
            attachment("reference", "report.pdf", Some("https://files/report.pdf"), None),
            attachment("reference", "photo.JPG", Some("https://files/photo.JPG"), None),
            attachment(
                "application/vnd.microsoft.card.codesnippet",
                "snippet",
                None,
                Some(r#"{"language":"rust","codeSnippetUrl":"https://graph/snippet"}"#),
            ),
            attachment("messageReference", "", None, Some(r#"{"messageId":"p1"}"#)),
            attachment("application/vnd.unknown", "x", None, None),
        ]);

        let descriptors = describe_attachments(&msg);
        let kinds = descriptors.iter().map(|d| d.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![AttachmentKind::File, AttachmentKind::Image, AttachmentKind::CodeSnippet]
        );
        assert_eq!(descriptors[2].language.as_deref(), Some("rust"));
        assert_eq!(descriptors[2].url, "https://graph/snippet");
        assert!(!descriptors[2].is_file_upload());
    }

    #[test]
    fn hosted_images_are_pulled_out_of_the_body() {
        let html = "<p>look <img src=\"https://graph.microsoft.com/v1.0/chats/c1/messages/m1/hostedContents/abc/$value\" width=\"250\"> and <img src=\"https://cdn/x.png\"></p>";
        let (body, images) = extract_hosted_images(html);
        assert_eq!(body, "<p>look  and <img src=\"https://cdn/x.png\"></p>");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].kind, AttachmentKind::Hosted);
        assert_eq!(images[0].name, "image-1.png");
        assert!(images[0].url.ends_with("/hostedContents/abc/$value"));
    }

    #[test_case("a.PNG", "image/png")]
    #[test_case("notes.txt", "text/plain")]
    #[test_case("archive", "application/octet-stream")]
    fn content_types(name: &str, expected: &str) {
        assert_eq!(content_type_for(name), expected);
    }
}
