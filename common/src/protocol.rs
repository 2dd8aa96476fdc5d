//! Upload protocol shared by the detection server and its clients.
//!
//! Both sides agree on the multipart field carrying the image, on which file
//! extensions are accepted and on how the annotated result is named.

/// Name of the multipart field carrying the uploaded image.
pub const FILE_FIELD: &str = "file";

/// Extensions (lowercase, without the dot) accepted for uploads.
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Prefix put in front of an upload's filename to name its annotated output.
pub const OUTPUT_PREFIX: &str = "annotated_";

/// Encodings an upload can have, derived from its extension.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageKind {
    Png,
    Jpeg,
}

impl ImageKind {
    /// Determine the kind from a filename's extension, case-insensitive.
    pub fn from_filename(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(ImageKind::Png),
            "jpg" | "jpeg" => Some(ImageKind::Jpeg),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageKind::Png => "image/png",
            ImageKind::Jpeg => "image/jpeg",
        }
    }
}

/// Check whether a filename carries one of the allowed extensions.
///
/// The extension is everything after the last `.`, compared case-insensitively.
/// A name without any `.` is never allowed.
pub fn allowed_file(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => ALLOWED_EXTENSIONS
            .iter()
            .any(|allowed| ext.eq_ignore_ascii_case(allowed)),
        None => false,
    }
}

/// Reduce a client-supplied filename to its last path component.
///
/// Both `/` and `\` count as separators. Returns `None` if nothing usable is
/// left, e.g. for `""`, `"dir/"` or `".."`.
pub fn secure_filename(filename: &str) -> Option<&str> {
    let name = filename.rsplit(&['/', '\\'][..]).next()?;
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

/// Name of the annotated output belonging to an uploaded filename.
pub fn output_file_name(filename: &str) -> String {
    format!("{OUTPUT_PREFIX}{filename}")
}
