//! Attachment validation, CID image lift and MIME composition (§4.3-1,
//! §4.3-3, §4.3-4). Pure, synchronous; the Processing Pipeline runs these
//! stages in order before handing the composed message to the SMTP transport.

pub mod attachments;
pub mod cid;
pub mod compose;

pub use attachments::{validate_attachments, AttachmentError, ValidatedAttachment};
pub use cid::{lift_images, CidError, CidLiftResult, LiftedImage};
pub use compose::{compose_message, parse_recipients, ComposeError};
