//! MIME composition (§4.3-4): assembles the final `lettre::Message` from
//! rendered subject/body, split recipient lists, inline CID images and
//! regular attachments.

use crate::attachments::ValidatedAttachment;
use crate::cid::LiftedImage;
use lettre::message::{header::ContentType, Attachment, Mailbox, Message, MultiPart, SinglePart};
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("invalid recipient address '{0}'")]
    InvalidAddress(String),

    #[error("failed to build MIME message: {0}")]
    Build(#[from] lettre::error::Error),
}

fn recipient_split_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"[,;]").unwrap())
}

/// Split a recipient field on `,` and `;` into parsed mailboxes (§4.3-4).
pub fn parse_recipients(raw: &str) -> Result<Vec<Mailbox>, ComposeError> {
    recipient_split_re()
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|addr| addr.parse::<Mailbox>().map_err(|_| ComposeError::InvalidAddress(addr.to_string())))
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub fn compose_message(
    sender: &Mailbox,
    to: &[Mailbox],
    cc: &[Mailbox],
    bcc: &[Mailbox],
    subject: &str,
    body: &str,
    is_html: bool,
    inline_images: &[LiftedImage],
    attachments: &[ValidatedAttachment],
) -> Result<Message, ComposeError> {
    let mut builder = Message::builder().from(sender.clone()).subject(subject);
    for mailbox in to {
        builder = builder.to(mailbox.clone());
    }
    for mailbox in cc {
        builder = builder.cc(mailbox.clone());
    }
    for mailbox in bcc {
        builder = builder.bcc(mailbox.clone());
    }

    let body_content_type = if is_html { ContentType::TEXT_HTML } else { ContentType::TEXT_PLAIN };
    let body_part = SinglePart::builder().header(body_content_type).body(body.to_string());

    let mut envelope = if inline_images.is_empty() {
        MultiPart::mixed().singlepart(body_part)
    } else {
        let mut related = MultiPart::related().singlepart(body_part);
        for image in inline_images {
            let content_type = parse_content_type(&image.content_type);
            related = related.singlepart(
                Attachment::new_inline(image.content_id.clone()).body(image.bytes.clone(), content_type),
            );
        }
        MultiPart::mixed().multipart(related)
    };

    for attachment in attachments {
        let content_type = parse_content_type(&attachment.content_type);
        let part = if attachment.is_inline {
            let content_id = attachment.content_id.clone().unwrap_or_else(|| attachment.file_name.clone());
            Attachment::new_inline(content_id).body(attachment.bytes.clone(), content_type)
        } else {
            Attachment::new(attachment.file_name.clone()).body(attachment.bytes.clone(), content_type)
        };
        envelope = envelope.singlepart(part);
    }

    builder.multipart(envelope).map_err(ComposeError::from)
}

fn parse_content_type(raw: &str) -> ContentType {
    raw.parse()
        .unwrap_or_else(|_| ContentType::parse("application/octet-stream").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_recipients_splits_on_comma_and_semicolon() {
        let parsed = parse_recipients("a@example.com, b@example.com; c@example.com").unwrap();
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn test_parse_recipients_rejects_invalid_address() {
        let err = parse_recipients("not-an-address").unwrap_err();
        assert!(matches!(err, ComposeError::InvalidAddress(_)));
    }

    #[test]
    fn test_compose_simple_text_message() {
        let sender: Mailbox = "noreply@emailworker.local".parse().unwrap();
        let to = parse_recipients("ada@example.com").unwrap();
        let message = compose_message(&sender, &to, &[], &[], "Hi", "hello", false, &[], &[]).unwrap();
        assert!(!message.headers().get_raw("Subject").unwrap().is_empty());
    }

    #[test]
    fn test_compose_with_inline_image() {
        let sender: Mailbox = "noreply@emailworker.local".parse().unwrap();
        let to = parse_recipients("ada@example.com").unwrap();
        let image = LiftedImage {
            content_id: "image1@emailworker.local".to_string(),
            content_type: "image/png".to_string(),
            bytes: vec![0x89, 0x50, 0x4E, 0x47],
        };
        let message = compose_message(
            &sender,
            &to,
            &[],
            &[],
            "Hi",
            r#"<img src="cid:image1@emailworker.local">"#,
            true,
            std::slice::from_ref(&image),
            &[],
        )
        .unwrap();
        assert!(!message.headers().get_raw("Subject").unwrap().is_empty());
    }
}
