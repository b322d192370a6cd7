//! Decoding of the multiplexed exec output stream.
//!
//! The container engine multiplexes stdout and stderr of a non-TTY exec into
//! frames. Every frame starts with an 8-byte header: one byte naming the
//! stream (0 stdin, 1 stdout, 2 stderr), three zero bytes, then the payload
//! length as a big-endian `u32`.

/// Length of a frame header, and of a control marker.
pub const FRAME_HEADER_LEN: usize = 8;

const STDERR: u8 = 2;

/// Reassemble the payloads of every frame in `raw`, dropping the headers.
///
/// A trailing frame whose declared length runs past the end of the buffer
/// contributes whatever payload bytes are present. A buffer that does not
/// open with a frame header is returned unchanged.
pub fn unwrap_frames(raw: &[u8]) -> Vec<u8> {
    if !starts_with_header(raw) {
        return raw.to_vec();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut pos = 0;
    while raw.len() - pos >= FRAME_HEADER_LEN {
        let header = &raw[pos..pos + FRAME_HEADER_LEN];
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = pos + FRAME_HEADER_LEN;
        let end = start.saturating_add(len).min(raw.len());
        out.extend_from_slice(&raw[start..end]);
        pos = end;
    }
    out
}

fn starts_with_header(raw: &[u8]) -> bool {
    raw.len() >= FRAME_HEADER_LEN && raw[0] <= STDERR && raw[1..4] == [0, 0, 0]
}

/// Drop fixed-width control markers.
///
/// A start-of-heading (1) or start-of-text (2) byte opens a marker that is
/// always 8 bytes long including the introducer. Markers are skipped whole;
/// every other byte passes through. A marker cut short by the end of the
/// buffer swallows the rest of it. This is not a general ANSI parser.
pub fn strip_control(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            1 | 2 => i += FRAME_HEADER_LEN,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

/// Full normalization of an attached exec stream into display text.
pub fn normalize(raw: &[u8]) -> String {
    let cleaned = strip_control(&unwrap_frames(raw));
    String::from_utf8_lossy(&cleaned).into_owned()
}
