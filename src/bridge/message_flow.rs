use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::events::DiscardReason;
use crate::config::Config;
use crate::mattermost::LocalApi;
use crate::msteams::{
    OutgoingMessage, RemoteApi, RemoteContainer, RemoteMessage, UploadedFile, download_bounded,
};
use crate::parsers::common::escape_html;
use crate::parsers::{
    AttachmentDescriptor, AttachmentKind, MentionTarget, content_type_for, describe_attachments,
    extract_hosted_images, html_to_markdown, render_markdown, rewrite_remote_mentions,
};
use crate::web::metrics::{ACTION_CREATED, Metrics, NOT_DISCARDED, SOURCE_LOCAL, SOURCE_REMOTE};

/// A remote message rendered for the local side. Files still have to be
/// fetched and uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContent {
    pub message: String,
    pub files: Vec<AttachmentDescriptor>,
}

/// Outcome of moving the files of one message across.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTransfer {
    pub local_file_ids: Vec<String>,
    pub remote_files: Vec<UploadedFile>,
    pub discarded: Vec<(String, DiscardReason)>,
}

impl FileTransfer {
    pub fn discarded_count(&self, reason: DiscardReason) -> usize {
        self.discarded.iter().filter(|(_, r)| *r == reason).count()
    }

    pub fn transferred(&self) -> usize {
        self.local_file_ids.len() + self.remote_files.len()
    }

    fn record(&self, source: &'static str, is_direct: bool) {
        Metrics::observe_files(ACTION_CREATED, source, is_direct, NOT_DISCARDED, self.transferred() as u64);
        for reason in [
            DiscardReason::Size,
            DiscardReason::FileLimitReached,
            DiscardReason::UnableToGetRemoteData,
            DiscardReason::Error,
        ] {
            Metrics::observe_files(
                ACTION_CREATED,
                source,
                is_direct,
                reason.as_str(),
                self.discarded_count(reason) as u64,
            );
        }
    }
}

/// Markdown body of a remote message: mentions rewritten to local
/// usernames, hosted images pulled out as files, subject as a heading.
pub fn remote_to_local(message: &RemoteMessage, usernames: &HashMap<String, String>) -> LocalContent {
    let mut files = Vec::new();
    let body = if message.body_is_html {
        let (html, hosted) = extract_hosted_images(&message.body);
        files.extend(hosted);
        let html = rewrite_remote_mentions(&html, &message.mentions, |remote_id| {
            usernames.get(remote_id).cloned()
        });
        html_to_markdown(&html)
    } else {
        message.body.trim().to_string()
    };

    let text = match message.subject.as_deref() {
        Some(subject) if body.is_empty() => format!("## {subject}"),
        Some(subject) => format!("## {subject}\n\n{body}"),
        None => body,
    };

    for descriptor in describe_attachments(message) {
        match descriptor.kind {
            AttachmentKind::File
            | AttachmentKind::Image
            | AttachmentKind::Hosted
            | AttachmentKind::CodeSnippet => files.push(descriptor),
            AttachmentKind::Card => {
                debug!("card attachment not mirrored message_id={} name={}", message.id, descriptor.name);
            }
        }
    }

    LocalContent {
        message: text,
        files,
    }
}

/// Remote HTML for a local post. The bridge posts as the application, so
/// the author's name leads the message.
pub fn local_to_remote(markdown: &str, targets: &[MentionTarget], author: Option<&str>) -> OutgoingMessage {
    let rendered = render_markdown(markdown, targets);
    let html = match author {
        Some(name) if !name.is_empty() => {
            format!("<p><strong>{}</strong></p>{}", escape_html(name), rendered.html)
        }
        _ => rendered.html,
    };
    OutgoingMessage {
        html,
        mentions: rendered.mentions,
        ..Default::default()
    }
}

pub fn append_code_block(message: &mut String, language: &str, code: &str) {
    if !message.is_empty() {
        message.push_str("\n\n");
    }
    message.push_str("```");
    message.push_str(language);
    message.push('\n');
    message.push_str(code.trim_end_matches('\n'));
    message.push_str("\n```");
}

/// Moves content and files between the two servers for the sync engine.
pub struct MessageFlow {
    remote: Arc<dyn RemoteApi>,
    local: Arc<dyn LocalApi>,
    config: Arc<Config>,
}

impl MessageFlow {
    pub fn new(remote: Arc<dyn RemoteApi>, local: Arc<dyn LocalApi>, config: Arc<Config>) -> Self {
        Self {
            remote,
            local,
            config,
        }
    }

    /// Renders a remote message and inlines its code snippets. Files are
    /// returned untouched for [`MessageFlow::transfer_to_local`].
    pub async fn render_for_local(
        &self,
        message: &RemoteMessage,
        usernames: &HashMap<String, String>,
    ) -> LocalContent {
        let mut content = remote_to_local(message, usernames);
        let (snippets, files): (Vec<_>, Vec<_>) = content
            .files
            .into_iter()
            .partition(|file| file.kind == AttachmentKind::CodeSnippet);
        content.files = files;

        for snippet in snippets {
            match self.remote.get_code_snippet(&snippet.url).await {
                Ok(code) => append_code_block(
                    &mut content.message,
                    snippet.language.as_deref().unwrap_or_default(),
                    &code,
                ),
                Err(err) => warn!(
                    "code snippet not fetched message_id={} error={}",
                    message.id, err
                ),
            }
        }
        content
    }

    /// Downloads remote files and uploads them into `channel_id` as
    /// `user_id`. Oversized, excess and unreadable files are dropped and
    /// counted; the message itself is always mirrored.
    pub async fn transfer_to_local(
        &self,
        files: &[AttachmentDescriptor],
        user_id: &str,
        channel_id: &str,
        is_direct: bool,
    ) -> FileTransfer {
        let max_files = self.config.local.max_file_attachments;
        let max_size = self.config.local.max_file_size;
        let mut transfer = FileTransfer::default();

        for (index, file) in files.iter().enumerate() {
            if index >= max_files {
                transfer
                    .discarded
                    .push((file.name.clone(), DiscardReason::FileLimitReached));
                continue;
            }

            let data = match self.fetch_remote_file(file, max_size).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!("file over size cap name={} max_size={}", file.name, max_size);
                    transfer.discarded.push((file.name.clone(), DiscardReason::Size));
                    continue;
                }
                Err(err) => {
                    warn!("file download failed name={} error={}", file.name, err);
                    transfer
                        .discarded
                        .push((file.name.clone(), DiscardReason::UnableToGetRemoteData));
                    continue;
                }
            };

            match self.local.upload_file(user_id, channel_id, &file.name, data).await {
                Ok(info) => transfer.local_file_ids.push(info.id),
                Err(err) => {
                    warn!("file upload to local failed name={} error={}", file.name, err);
                    transfer.discarded.push((file.name.clone(), DiscardReason::Error));
                }
            }
        }

        transfer.record(SOURCE_REMOTE, is_direct);
        transfer
    }

    async fn fetch_remote_file(
        &self,
        file: &AttachmentDescriptor,
        max_size: u64,
    ) -> Result<Option<Vec<u8>>, crate::msteams::RemoteError> {
        if file.kind == AttachmentKind::Hosted {
            let data = self.remote.get_hosted_content(&file.url).await?;
            return Ok((data.len() as u64 <= max_size).then_some(data));
        }

        let (size, download_url) = self.remote.get_file_size_and_download_url(&file.url).await?;
        if size > max_size {
            return Ok(None);
        }
        download_bounded(self.remote.as_ref(), &download_url, max_size).await
    }

    /// Copies local files into the remote conversation's file store.
    pub async fn transfer_to_remote(
        &self,
        file_ids: &[String],
        container: &RemoteContainer,
        is_direct: bool,
    ) -> FileTransfer {
        let max_files = self.config.local.max_file_attachments;
        let max_size = self.config.local.max_file_size;
        let mut transfer = FileTransfer::default();

        for (index, file_id) in file_ids.iter().enumerate() {
            if index >= max_files {
                transfer
                    .discarded
                    .push((file_id.clone(), DiscardReason::FileLimitReached));
                continue;
            }

            let info = match self.local.get_file_info(file_id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!("local file info failed file_id={} error={}", file_id, err);
                    transfer.discarded.push((file_id.clone(), DiscardReason::Error));
                    continue;
                }
            };
            if info.size > max_size {
                debug!("file over size cap name={} size={}", info.name, info.size);
                transfer.discarded.push((info.name, DiscardReason::Size));
                continue;
            }

            let data = match self.local.get_file(file_id).await {
                Ok(data) => data,
                Err(err) => {
                    warn!("local file read failed file_id={} error={}", file_id, err);
                    transfer.discarded.push((info.name, DiscardReason::Error));
                    continue;
                }
            };

            let content_type = if info.mime_type.is_empty() {
                content_type_for(&info.name).to_string()
            } else {
                info.mime_type.clone()
            };
            match self
                .remote
                .upload_file(container, &info.name, &content_type, data)
                .await
            {
                Ok(uploaded) => transfer.remote_files.push(uploaded),
                Err(err) => {
                    warn!("file upload to remote failed name={} error={}", info.name, err);
                    transfer.discarded.push((info.name, DiscardReason::Error));
                }
            }
        }

        transfer.record(SOURCE_LOCAL, is_direct);
        transfer
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::msteams::{RemoteAttachment, RemoteMention};

    fn remote_message(body: &str) -> RemoteMessage {
        RemoteMessage {
            id: "m1".to_string(),
            container: RemoteContainer::channel("T1", "C1"),
            reply_to_id: None,
            user_id: Some("r-jane".to_string()),
            user_display_name: Some("Jane".to_string()),
            application_id: None,
            body: body.to_string(),
            body_is_html: true,
            subject: None,
            message_type: "message".to_string(),
            attachments: Vec::new(),
            mentions: Vec::new(),
            reactions: Vec::new(),
            created_at: Utc::now(),
            last_modified_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[test]
    fn bold_and_lists_survive_translation() {
        let bold = remote_to_local(&remote_message("<p><strong>BOLD</strong></p>"), &HashMap::new());
        assert_eq!(bold.message, "**BOLD**");

        let list = remote_to_local(
            &remote_message("<ol><li>One</li><li>Two</li></ol>"),
            &HashMap::new(),
        );
        assert_eq!(list.message, "1. One\n2. Two");
    }

    #[test]
    fn plain_text_bodies_pass_through() {
        let mut message = remote_message("1. One\n2. Two");
        message.body_is_html = false;
        assert_eq!(remote_to_local(&message, &HashMap::new()).message, "1. One\n2. Two");
    }

    #[test]
    fn subject_and_mentions_are_rendered() {
        let mut message = remote_message(r#"<p>hi <at id="0">Bob</at></p>"#);
        message.subject = Some("Release".to_string());
        message.mentions = vec![RemoteMention {
            id: 0,
            text: "Bob".to_string(),
            user_id: Some("r-bob".to_string()),
        }];
        let usernames = HashMap::from([("r-bob".to_string(), "bob".to_string())]);

        let content = remote_to_local(&message, &usernames);
        assert_eq!(content.message, "## Release\n\nhi @bob");
    }

    #[test]
    fn hosted_images_and_files_become_uploads() {
        let mut message = remote_message(
            r#"<p>look</p><img src="https://graph.microsoft.com/v1.0/chats/c/messages/m/hostedContents/x/$value">"#,
        );
        message.attachments = vec![
            RemoteAttachment {
                id: Some("a1".to_string()),
                content_type: "reference".to_string(),
                content: None,
                content_url: Some("https://files/report.pdf".to_string()),
                name: Some("report.pdf".to_string()),
            },
            RemoteAttachment {
                id: Some("a2".to_string()),
                content_type: "messageReference".to_string(),
                content: Some(r#"{"messageId":"m0"}"#.to_string()),
                content_url: None,
                name: None,
            },
        ];

        let content = remote_to_local(&message, &HashMap::new());
        assert_eq!(content.message, "look");
        let kinds: Vec<_> = content.files.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![AttachmentKind::Hosted, AttachmentKind::File]);
    }

    #[test]
    fn local_posts_render_with_author() {
        let outgoing = local_to_remote("**hi** :smile:", &[], Some("Jane <Doe>"));
        assert_eq!(
            outgoing.html,
            "<p><strong>Jane &lt;Doe&gt;</strong></p><p><strong>hi</strong> 😄</p>"
        );
        assert!(outgoing.mentions.is_empty());
    }

    #[test]
    fn code_blocks_are_appended_after_text() {
        let mut message = "see".to_string();
        append_code_block(&mut message, "rust", "fn main() {}\n");
        assert_eq!(message, "see\n\n```rust\nfn main() {}\n```");

        let mut empty = String::new();
        append_code_block(&mut empty, "", "x");
        assert_eq!(empty, "```\nx\n```");
    }
}
