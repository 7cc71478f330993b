use base64::{ engine::general_purpose::STANDARD, Engine as _ };

use crate::error::UploadError;

const PNG_SIGNATURE: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const JPEG_SIGNATURE: &[u8] = &[0xff, 0xd8, 0xff];

/// A validated JPEG or PNG image staged for analysis.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(PNG_SIGNATURE) {
        Some("image/png")
    } else if bytes.starts_with(JPEG_SIGNATURE) {
        Some("image/jpeg")
    } else {
        None
    }
}

fn is_accepted_mime(mime: &str) -> bool {
    matches!(mime, "image/png" | "image/jpeg" | "image/jpg")
}

impl ImageUpload {
    /// Checks the declared type (or the one guessed from the file name) and
    /// the content signature, and keeps the type detected from the bytes.
    pub fn new(file_name: &str, declared_mime: Option<&str>, bytes: Vec<u8>, limit: usize) -> Result<Self, UploadError> {
        if bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if bytes.len() > limit {
            return Err(UploadError::TooLarge { size: bytes.len(), limit });
        }

        let claimed = match declared_mime.filter(|m| !m.trim().is_empty()) {
            Some(m) => Some(m.trim().to_lowercase()),
            None => mime_guess::from_path(file_name).first().map(|m| m.essence_str().to_string()),
        };
        if let Some(claimed) = claimed {
            if !is_accepted_mime(&claimed) {
                return Err(UploadError::UnsupportedFormat);
            }
        }

        let mime_type = sniff_mime(&bytes).ok_or(UploadError::UnsupportedFormat)?;

        Ok(Self {
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            bytes,
        })
    }

    /// Accepts plain base64 or a `data:image/...;base64,` URL.
    pub fn from_base64(file_name: &str, declared_mime: Option<&str>, data: &str, limit: usize) -> Result<Self, UploadError> {
        let payload = match data.split_once(";base64,") {
            Some((prefix, rest)) if prefix.starts_with("data:") => rest,
            _ => data,
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(UploadError::Empty);
        }
        // base64 inflates by 4/3, reject oversize payloads before decoding
        if payload.len() / 4 * 3 > limit + 3 {
            return Err(UploadError::TooLarge { size: payload.len() / 4 * 3, limit });
        }
        let bytes = STANDARD.decode(payload).map_err(|_| UploadError::InvalidEncoding)?;
        Self::new(file_name, declared_mime, bytes, limit)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Stored stand-in for the image: the encoded bytes cut to `max_chars`.
    pub fn thumbnail(&self, max_chars: usize) -> String {
        let mut encoded = self.to_base64();
        encoded.truncate(max_chars);
        encoded
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

#[cfg(test)]
pub(crate) fn sample_png() -> Vec<u8> {
    let mut bytes = PNG_SIGNATURE.to_vec();
    bytes.extend_from_slice(&[0u8; 64]);
    bytes
}
