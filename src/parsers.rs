pub mod attachments;
pub mod common;
pub mod html_parser;
pub mod markdown_parser;
pub mod mentions;

pub use attachments::{
    AttachmentDescriptor, AttachmentKind, content_type_for, describe_attachments,
    extract_hosted_images,
};
pub use common::{contains_html, normalize_whitespace};
pub use html_parser::html_to_markdown;
pub use markdown_parser::{MentionTarget, RenderedHtml, markdown_to_html, render_markdown};
pub use mentions::{extract_local_mentions, rewrite_remote_mentions};
