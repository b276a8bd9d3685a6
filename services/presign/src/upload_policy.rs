//! Upload policy for RFQ attachments.
//!
//! Every descriptor a client sends is checked against fixed tables before
//! any credential is issued. Checks run in a fixed order and the first
//! failing check decides the rejection reason.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest accepted file: 50 MiB
pub const MAX_FILE_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Largest accepted batch
pub const MAX_FILES_PER_BATCH: usize = 5;

/// Type CAD tools commonly report for their own formats
pub const GENERIC_BINARY_TYPE: &str = "application/octet-stream";

/// Accepted extensions and the content type each one is signed with
pub const ALLOWED_EXTENSIONS: &[(&str, &str)] = &[
    (".pdf", "application/pdf"),
    (".dwg", "application/acad"),
    (".dxf", "application/dxf"),
    (".step", "application/step"),
    (".stp", "application/step"),
    (".iges", "application/iges"),
    (".igs", "application/iges"),
    (".stl", "model/stl"),
    (".png", "image/png"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
];

/// Declared content types accepted for any allowed extension
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "image/vnd.dwg",
    "application/acad",
    "application/x-acad",
    "image/vnd.dxf",
    "application/dxf",
    "application/step",
    "application/x-step",
    "model/iges",
    "application/iges",
    "model/stl",
    "application/sla",
    "image/png",
    "image/jpeg",
    GENERIC_BINARY_TYPE,
];

/// A file the client intends to upload, as declared by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

/// Reason a descriptor or batch was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Files array is required and must not be empty")]
    EmptyBatch,

    #[error("Maximum {} files allowed per upload", MAX_FILES_PER_BATCH)]
    TooManyFiles { count: usize },

    #[error("File size exceeds maximum allowed size of {}MB", MAX_FILE_SIZE_BYTES / 1024 / 1024)]
    FileTooLarge { size: u64 },

    #[error("File must not be empty")]
    EmptyFile,

    #[error("File must have a valid extension")]
    MissingExtension,

    #[error("File type {extension} is not allowed. Allowed types: {}", allowed_extension_list())]
    ExtensionNotAllowed { extension: String },

    #[error("Invalid file type {file_type} for extension {extension}")]
    ContentTypeMismatch {
        file_type: String,
        extension: String,
    },
}

fn allowed_extension_list() -> String {
    ALLOWED_EXTENSIONS
        .iter()
        .map(|(ext, _)| *ext)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lower-cased extension including the leading dot, e.g. `.step`
pub fn file_extension(file_name: &str) -> Option<String> {
    let idx = file_name.rfind('.')?;
    let ext = &file_name[idx..];
    if ext.len() < 2 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Content type a file with this name is signed with
pub fn canonical_content_type(file_name: &str) -> Option<&'static str> {
    let ext = file_extension(file_name)?;
    ALLOWED_EXTENSIONS
        .iter()
        .find(|(allowed, _)| *allowed == ext)
        .map(|(_, content_type)| *content_type)
}

/// Check one descriptor against the upload policy
pub fn validate_descriptor(descriptor: &UploadDescriptor) -> Result<(), PolicyViolation> {
    if descriptor.file_size > MAX_FILE_SIZE_BYTES {
        return Err(PolicyViolation::FileTooLarge {
            size: descriptor.file_size,
        });
    }
    if descriptor.file_size == 0 {
        return Err(PolicyViolation::EmptyFile);
    }

    let extension =
        file_extension(&descriptor.file_name).ok_or(PolicyViolation::MissingExtension)?;

    let expected = canonical_content_type(&descriptor.file_name).ok_or_else(|| {
        PolicyViolation::ExtensionNotAllowed {
            extension: extension.clone(),
        }
    })?;

    let declared = descriptor.file_type.as_str();
    let type_ok = declared == expected
        || declared == GENERIC_BINARY_TYPE
        || ALLOWED_CONTENT_TYPES.contains(&declared);

    if !type_ok {
        return Err(PolicyViolation::ContentTypeMismatch {
            file_type: descriptor.file_type.clone(),
            extension,
        });
    }

    Ok(())
}

/// Check a whole batch. The batch cap is enforced before any file is
/// looked at, and one bad file rejects the batch.
pub fn validate_batch(descriptors: &[UploadDescriptor]) -> Result<(), PolicyViolation> {
    if descriptors.is_empty() {
        return Err(PolicyViolation::EmptyBatch);
    }
    if descriptors.len() > MAX_FILES_PER_BATCH {
        return Err(PolicyViolation::TooManyFiles {
            count: descriptors.len(),
        });
    }

    descriptors.iter().try_for_each(validate_descriptor)
}
