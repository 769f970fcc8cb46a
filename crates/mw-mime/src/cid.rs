//! CID image processor (§4.3-3): lifts base64 inline images out of HTML
//! bodies — both `<img src="data:...">` and CSS `background[-image]:
//! url(data:...)` — and replaces each exact occurrence with a `cid:`
//! reference, never a blanket find/replace over the whole payload.

use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, thiserror::Error)]
pub enum CidError {
    #[error("unsupported embedded image subtype: {0}")]
    UnsupportedSubtype(String),

    #[error("embedded image is not valid base64")]
    InvalidBase64,

    #[error("embedded image exceeds the 5 MB per-image limit")]
    TooLarge,

    #[error("embedded image bytes do not match the declared {0} signature")]
    MagicMismatch(String),
}

pub struct LiftedImage {
    pub content_id: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub struct CidLiftResult {
    pub body: String,
    pub images: Vec<LiftedImage>,
}

const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

fn img_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)img\s+src="(data:image/([a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=]+))""#).unwrap()
    })
}

fn css_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?i)background(?:-image)?\s*:\s*url\(\s*['"]?(data:image/([a-zA-Z0-9.+-]+);base64,([A-Za-z0-9+/=]+))['"]?\s*\)"#,
        )
        .unwrap()
    })
}

fn normalized_subtype(subtype: &str) -> Option<(&'static str, &'static str)> {
    match subtype.to_lowercase().as_str() {
        "jpeg" | "jpg" => Some(("jpeg", "image/jpeg")),
        "png" => Some(("png", "image/png")),
        "gif" => Some(("gif", "image/gif")),
        "bmp" => Some(("bmp", "image/bmp")),
        "webp" => Some(("webp", "image/webp")),
        "svg+xml" => Some(("svg+xml", "image/svg+xml")),
        _ => None,
    }
}

fn check_magic_bytes(kind: &str, bytes: &[u8]) -> Result<(), CidError> {
    let ok = match kind {
        "jpeg" => bytes.starts_with(&[0xFF, 0xD8]),
        "png" => bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
        "gif" => bytes.starts_with(b"GIF"),
        "bmp" => bytes.starts_with(b"BM"),
        "webp" => bytes.len() >= 12 && &bytes[8..12] == b"WEBP",
        "svg+xml" => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(CidError::MagicMismatch(kind.to_string()))
    }
}

fn decode_and_validate(subtype: &str, payload: &str) -> Result<(String, Vec<u8>), CidError> {
    let (kind, content_type) =
        normalized_subtype(subtype).ok_or_else(|| CidError::UnsupportedSubtype(subtype.to_string()))?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| CidError::InvalidBase64)?;

    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(CidError::TooLarge);
    }

    check_magic_bytes(kind, &bytes)?;
    Ok((content_type.to_string(), bytes))
}

struct DataUriMatch {
    start: usize,
    end: usize,
    subtype: String,
    payload: String,
}

fn collect_matches(body: &str) -> Vec<DataUriMatch> {
    let mut matches = Vec::new();
    for caps in img_re().captures_iter(body) {
        let uri = caps.get(1).unwrap();
        matches.push(DataUriMatch {
            start: uri.start(),
            end: uri.end(),
            subtype: caps[2].to_string(),
            payload: caps[3].to_string(),
        });
    }
    for caps in css_re().captures_iter(body) {
        let uri = caps.get(1).unwrap();
        matches.push(DataUriMatch {
            start: uri.start(),
            end: uri.end(),
            subtype: caps[2].to_string(),
            payload: caps[3].to_string(),
        });
    }
    matches.sort_by_key(|m| m.start);
    matches
}

/// Scan `body` for embedded base64 images, replace each distinct occurrence
/// with `cid:image{n}@emailworker.local`, and return the lifted attachments.
pub fn lift_images(body: &str) -> Result<CidLiftResult, CidError> {
    let matches = collect_matches(body);

    let mut out = String::with_capacity(body.len());
    let mut images = Vec::new();
    let mut last_end = 0usize;
    let mut n = 0usize;

    for m in &matches {
        if m.start < last_end {
            continue; // overlapping match against an already-lifted span
        }
        n += 1;
        let (content_type, bytes) = decode_and_validate(&m.subtype, &m.payload)?;
        let content_id = format!("image{n}@emailworker.local");

        out.push_str(&body[last_end..m.start]);
        out.push_str("cid:");
        out.push_str(&content_id);

        images.push(LiftedImage { content_id, content_type, bytes });
        last_end = m.end;
    }
    out.push_str(&body[last_end..]);

    Ok(CidLiftResult { body: out, images })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;

    const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_lifts_single_img_tag() {
        let payload = STANDARD.encode(PNG_MAGIC);
        let body = format!(r#"<p>hi</p><img src="data:image/png;base64,{payload}">"#);
        let result = lift_images(&body).unwrap();
        assert_eq!(result.images.len(), 1);
        assert_eq!(result.images[0].content_id, "image1@emailworker.local");
        assert!(result.body.contains("cid:image1@emailworker.local"));
        assert!(!result.body.contains("data:image"));
    }

    #[test]
    fn test_two_images_get_distinct_cids_even_with_identical_payload() {
        let payload = STANDARD.encode(PNG_MAGIC);
        let body = format!(
            r#"<img src="data:image/png;base64,{payload}"><img src="data:image/png;base64,{payload}">"#
        );
        let result = lift_images(&body).unwrap();
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.images[0].content_id, "image1@emailworker.local");
        assert_eq!(result.images[1].content_id, "image2@emailworker.local");
        assert!(result.body.contains("cid:image1@emailworker.local"));
        assert!(result.body.contains("cid:image2@emailworker.local"));
    }

    #[test]
    fn test_css_background_image_lifted() {
        let payload = STANDARD.encode(PNG_MAGIC);
        let body = format!(r#"<div style="background-image: url('data:image/png;base64,{payload}')">"#);
        let result = lift_images(&body).unwrap();
        assert_eq!(result.images.len(), 1);
        assert!(result.body.contains("cid:image1@emailworker.local"));
    }

    #[test]
    fn test_magic_byte_mismatch_rejected() {
        let payload = STANDARD.encode(b"not a real png");
        let body = format!(r#"<img src="data:image/png;base64,{payload}">"#);
        let err = lift_images(&body).unwrap_err();
        assert!(matches!(err, CidError::MagicMismatch(_)));
    }

    #[test]
    fn test_no_embedded_images_is_a_noop() {
        let body = "<p>plain html, no images</p>".to_string();
        let result = lift_images(&body).unwrap();
        assert!(result.images.is_empty());
        assert_eq!(result.body, body);
    }
}
