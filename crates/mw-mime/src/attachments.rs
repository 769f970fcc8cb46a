//! Attachment validation (§4.3-1): filename/content-type/size/magic-byte checks
//! ahead of template render and CID lift.

use base64::Engine;
use mw_common::AttachmentSpec;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    #[error("attachment '{0}' has an invalid file name")]
    InvalidFileName(String),

    #[error("attachment '{0}' has a blocked extension")]
    BlockedExtension(String),

    #[error("attachment '{0}' has content-type '{1}', which is not on the allow-list")]
    BlockedContentType(String, String),

    #[error("attachment '{0}' content is neither valid base64 nor a readable file_path")]
    UnreadableContent(String),

    #[error("attachment '{0}' exceeds the per-attachment size limit ({1} bytes)")]
    TooLarge(String, u64),

    #[error("total attachment size exceeds the configured limit ({0} bytes)")]
    TotalTooLarge(u64),

    #[error("attachment '{0}' magic bytes do not match a recognized executable block ({1})")]
    BlockedMagicBytes(String, &'static str),
}

const BLOCKED_EXTENSIONS: &[&str] = &[".exe", ".bat", ".cmd", ".com", ".scr", ".pif", ".vbs", ".js"];
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Content-types accepted for attachments (§4.3-1: "documents, text, images,
/// archives, JSON/XML"). Matched against the MIME type alone, ignoring any
/// `; charset=...` parameter suffix.
const ALLOWED_CONTENT_TYPES: &[&str] = &[
    // documents
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/rtf",
    // text
    "text/plain",
    "text/csv",
    "text/html",
    "text/markdown",
    // images
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/bmp",
    "image/webp",
    "image/svg+xml",
    // archives
    "application/zip",
    "application/x-7z-compressed",
    "application/x-rar-compressed",
    "application/gzip",
    "application/x-tar",
    // JSON/XML
    "application/json",
    "application/xml",
    "text/xml",
];

/// Extension -> content-type, used when a spec arrives with an empty or
/// whitespace-only `content_type`.
fn infer_content_type_from_extension(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name).extension()?.to_str()?.to_lowercase();
    Some(match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "rtf" => "application/rtf",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "md" => "text/markdown",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "7z" => "application/x-7z-compressed",
        "rar" => "application/x-rar-compressed",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "json" => "application/json",
        "xml" => "application/xml",
        _ => return None,
    })
}

fn is_allowed_content_type(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or("").trim().to_lowercase();
    ALLOWED_CONTENT_TYPES.contains(&mime.as_str())
}

/// Resolves the effective content-type for `spec` (inferring from the file
/// extension when the declared one is blank) and rejects anything off the
/// allow-list.
fn resolve_content_type(spec: &AttachmentSpec) -> Result<String, AttachmentError> {
    let declared = spec.content_type.trim();
    let effective = if declared.is_empty() {
        infer_content_type_from_extension(&spec.file_name)
            .map(str::to_string)
            .ok_or_else(|| AttachmentError::BlockedContentType(spec.file_name.clone(), "(missing)".to_string()))?
    } else {
        declared.to_string()
    };

    if !is_allowed_content_type(&effective) {
        return Err(AttachmentError::BlockedContentType(spec.file_name.clone(), effective));
    }
    Ok(effective)
}

pub struct ValidatedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub is_inline: bool,
    pub content_id: Option<String>,
}

fn is_blocked_extension(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    BLOCKED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn validate_file_name(file_name: &str) -> Result<(), AttachmentError> {
    if file_name.is_empty()
        || file_name.len() > 255
        || file_name.chars().any(|c| INVALID_FILENAME_CHARS.contains(&c) || c.is_control())
    {
        return Err(AttachmentError::InvalidFileName(file_name.to_string()));
    }
    if is_blocked_extension(file_name) {
        return Err(AttachmentError::BlockedExtension(file_name.to_string()));
    }
    Ok(())
}

fn reject_executable_magic(file_name: &str, bytes: &[u8]) -> Result<(), AttachmentError> {
    if bytes.starts_with(b"MZ") {
        return Err(AttachmentError::BlockedMagicBytes(file_name.to_string(), "PE/MZ"));
    }
    if bytes.starts_with(&[0x7F, b'E', b'L', b'F']) {
        return Err(AttachmentError::BlockedMagicBytes(file_name.to_string(), "ELF"));
    }
    Ok(())
}

fn load_bytes(spec: &AttachmentSpec) -> Result<Vec<u8>, AttachmentError> {
    if let Some(content) = &spec.content {
        return base64::engine::general_purpose::STANDARD
            .decode(content)
            .map_err(|_| AttachmentError::UnreadableContent(spec.file_name.clone()));
    }
    if let Some(path) = &spec.file_path {
        if !Path::new(path).is_file() {
            return Err(AttachmentError::UnreadableContent(spec.file_name.clone()));
        }
        return std::fs::read(path).map_err(|_| AttachmentError::UnreadableContent(spec.file_name.clone()));
    }
    Err(AttachmentError::UnreadableContent(spec.file_name.clone()))
}

/// Validate and decode every attachment in `specs`: file name, content-type
/// (against the allow-list, inferring from extension when blank), then
/// per-file and cumulative size caps, then magic bytes.
pub fn validate_attachments(
    specs: &[AttachmentSpec],
    max_attachment_bytes: u64,
    max_total_bytes: u64,
) -> Result<Vec<ValidatedAttachment>, AttachmentError> {
    let mut out = Vec::with_capacity(specs.len());
    let mut total: u64 = 0;

    for spec in specs {
        validate_file_name(&spec.file_name)?;
        let content_type = resolve_content_type(spec)?;
        let bytes = load_bytes(spec)?;
        let size = bytes.len() as u64;

        if size > max_attachment_bytes {
            return Err(AttachmentError::TooLarge(spec.file_name.clone(), max_attachment_bytes));
        }
        total += size;
        if total > max_total_bytes {
            return Err(AttachmentError::TotalTooLarge(max_total_bytes));
        }

        reject_executable_magic(&spec.file_name, &bytes)?;

        out.push(ValidatedAttachment {
            file_name: spec.file_name.clone(),
            content_type,
            bytes,
            is_inline: spec.is_inline,
            content_id: spec.content_id.clone(),
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    fn spec(file_name: &str, content: &str) -> AttachmentSpec {
        AttachmentSpec {
            file_name: file_name.to_string(),
            content_type: "text/plain".to_string(),
            content: Some(content.to_string()),
            file_path: None,
            is_inline: false,
            content_id: None,
        }
    }

    #[test]
    fn test_accepts_well_formed_attachment() {
        let content = STANDARD.encode(b"hello world");
        let specs = vec![spec("notes.txt", &content)];
        let out = validate_attachments(&specs, 1024, 4096).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, b"hello world");
    }

    #[test]
    fn test_rejects_blocked_extension() {
        let content = STANDARD.encode(b"MZ\x00\x00");
        let specs = vec![spec("payload.exe", &content)];
        let err = validate_attachments(&specs, 1024, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::BlockedExtension(_)));
    }

    #[test]
    fn test_rejects_executable_magic_bytes_even_with_benign_extension() {
        let content = STANDARD.encode(b"MZ\x90\x00\x03");
        let specs = vec![spec("totally_a_doc.txt", &content)];
        let err = validate_attachments(&specs, 1024, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::BlockedMagicBytes(_, "PE/MZ")));
    }

    #[test]
    fn test_rejects_oversized_attachment() {
        let content = STANDARD.encode(vec![0u8; 100]);
        let specs = vec![spec("big.bin", &content)];
        let err = validate_attachments(&specs, 50, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::TooLarge(_, 50)));
    }

    #[test]
    fn test_rejects_invalid_file_name() {
        let content = STANDARD.encode(b"x");
        let specs = vec![spec("bad/name.txt", &content)];
        let err = validate_attachments(&specs, 1024, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::InvalidFileName(_)));
    }

    #[test]
    fn test_rejects_content_type_off_allow_list() {
        let content = STANDARD.encode(b"hello");
        let mut spec = spec("notes.txt", &content);
        spec.content_type = "application/x-msdownload".to_string();
        let err = validate_attachments(&[spec], 1024, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::BlockedContentType(_, _)));
    }

    #[test]
    fn test_infers_content_type_from_extension_when_missing() {
        let content = STANDARD.encode(b"{\"ok\":true}");
        let mut spec = spec("payload.json", &content);
        spec.content_type = String::new();
        let out = validate_attachments(&[spec], 1024, 4096).unwrap();
        assert_eq!(out[0].content_type, "application/json");
    }

    #[test]
    fn test_rejects_missing_content_type_with_unknown_extension() {
        let content = STANDARD.encode(b"whatever");
        let mut spec = spec("data.bin", &content);
        spec.content_type = String::new();
        let err = validate_attachments(&[spec], 1024, 4096).unwrap_err();
        assert!(matches!(err, AttachmentError::BlockedContentType(_, _)));
    }
}
