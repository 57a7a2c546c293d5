//! Timed metadata (ID3) decoding
//!
//! Inband `emsg` boxes with the ID3 scheme, and transmuxed TS streams,
//! carry ID3v2 tags. This module decodes the frames the engine forwards
//! to the metadata sink: text frames and PRIV frames. Binary frames it
//! does not understand are carried opaquely.

use bytes::Bytes;

/// One decoded metadata frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataFrame {
    /// Four-character frame id, e.g. "TXXX" or "PRIV".
    pub key: String,
    /// Owner/description, when the frame carries one.
    pub description: String,
    /// Decoded payload.
    pub data: MetadataValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Text(String),
    Binary(Bytes),
}

/// 28-bit syncsafe integer: 4 bytes, high bit of each clear.
fn syncsafe_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7F) << 21)
        | ((bytes[1] as u32 & 0x7F) << 14)
        | ((bytes[2] as u32 & 0x7F) << 7)
        | (bytes[3] as u32 & 0x7F)
}

fn decode_text(payload: &[u8]) -> String {
    if payload.is_empty() {
        return String::new();
    }
    let (encoding, text) = (payload[0], &payload[1..]);
    match encoding {
        // UTF-16 with BOM / UTF-16BE.
        1 | 2 => {
            let units: Vec<u16> = text
                .chunks_exact(2)
                .map(|c| {
                    if encoding == 1 && text.first() == Some(&0xFF) {
                        u16::from_le_bytes([c[0], c[1]])
                    } else {
                        u16::from_be_bytes([c[0], c[1]])
                    }
                })
                .filter(|&u| u != 0xFEFF)
                .collect();
            String::from_utf16_lossy(&units)
                .trim_end_matches('\0')
                .to_string()
        }
        // Latin-1 or UTF-8; both pass through lossy UTF-8 well enough
        // for the ASCII identifiers streams actually carry.
        _ => String::from_utf8_lossy(text)
            .trim_end_matches('\0')
            .to_string(),
    }
}

/// Decode the frames of an ID3v2 tag. Returns an empty list when the
/// buffer is not an ID3 tag.
pub fn decode_id3(data: &[u8]) -> Vec<MetadataFrame> {
    let mut frames = Vec::new();
    if data.len() < 10 || &data[0..3] != b"ID3" {
        return frames;
    }
    let major = data[3];
    let tag_size = syncsafe_u32(&data[6..10]) as usize;
    let end = (10 + tag_size).min(data.len());
    let mut pos = 10;

    while pos + 10 <= end {
        let id = &data[pos..pos + 4];
        if id.iter().all(|&b| b == 0) {
            break; // padding
        }
        let size = if major >= 4 {
            syncsafe_u32(&data[pos + 4..pos + 8]) as usize
        } else {
            u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize
        };
        pos += 10;
        if pos + size > end {
            break;
        }
        let payload = &data[pos..pos + size];
        pos += size;

        let key = String::from_utf8_lossy(id).into_owned();
        let frame = if id == b"PRIV" {
            let nul = payload.iter().position(|&b| b == 0).unwrap_or(0);
            MetadataFrame {
                key,
                description: String::from_utf8_lossy(&payload[..nul]).into_owned(),
                data: MetadataValue::Binary(Bytes::copy_from_slice(
                    &payload[(nul + 1).min(payload.len())..],
                )),
            }
        } else if id.starts_with(b"T") || id.starts_with(b"W") {
            MetadataFrame {
                key,
                description: String::new(),
                data: MetadataValue::Text(decode_text(payload)),
            }
        } else {
            MetadataFrame {
                key,
                description: String::new(),
                data: MetadataValue::Binary(Bytes::copy_from_slice(payload)),
            }
        };
        frames.push(frame);
    }
    frames
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Assemble a minimal ID3v2.3 tag from raw frames.
    pub fn id3_tag(frames: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, payload) in frames {
            body.extend_from_slice(*id);
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&[0, 0]); // frame flags
            body.extend_from_slice(payload);
        }
        let mut out = Vec::new();
        out.extend_from_slice(b"ID3");
        out.push(3); // v2.3
        out.push(0);
        out.push(0); // flags
        let size = body.len() as u32;
        out.push(((size >> 21) & 0x7F) as u8);
        out.push(((size >> 14) & 0x7F) as u8);
        out.push(((size >> 7) & 0x7F) as u8);
        out.push((size & 0x7F) as u8);
        out.extend_from_slice(&body);
        out
    }

    pub fn text_frame(text: &str) -> Vec<u8> {
        let mut payload = vec![3u8]; // UTF-8
        payload.extend_from_slice(text.as_bytes());
        payload
    }

    pub fn priv_frame(owner: &str, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(owner.as_bytes());
        payload.push(0);
        payload.extend_from_slice(data);
        payload
    }
}
