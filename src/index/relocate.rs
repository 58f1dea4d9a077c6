use super::hasher::sha256_hex;

/// Default fuzzy window size in bytes.
pub const FUZZY_WINDOW: usize = 2000;

/// Find the previous byte-slice verbatim in the head source. Returns the
/// 1-based line pair of the slice's new position; the end line is the line
/// holding the slice's last byte.
pub fn exact_relocate(base_slice: &str, head_src: &str) -> Option<(u32, u32)> {
    if base_slice.is_empty() {
        return None;
    }
    let idx = head_src.find(base_slice)?;
    Some((byte_to_line(head_src, idx), byte_to_line(head_src, idx + base_slice.len() - 1)))
}

/// Slide a fixed-size window over the head source at quarter-window strides,
/// comparing window hashes against the slice's hash. First match wins.
pub fn fuzzy_relocate(base_slice: &str, head_src: &str, window: usize) -> Option<(u32, u32)> {
    let window = window.max(1);
    let head = head_src.as_bytes();
    if head.len() < window {
        return None;
    }
    let base_hash = sha256_hex(base_slice.as_bytes());
    let stride = (window / 4).max(1);
    let mut s = 0;
    while s + window <= head.len() {
        if sha256_hex(&head[s..s + window]) == base_hash {
            return Some((byte_to_line(head_src, s), byte_to_line(head_src, s + window - 1)));
        }
        s += stride;
    }
    None
}

/// Byte offset of the first character of `line_no` (1-based). Offsets past
/// the last line clamp to the end of the source.
pub fn line_to_byte(src: &str, line_no: u32) -> usize {
    if line_no <= 1 {
        return 0;
    }
    let bytes = src.as_bytes();
    let mut idx = 0;
    let mut cur = 1;
    while cur < line_no && idx < bytes.len() {
        match bytes[idx..].iter().position(|b| *b == b'\n') {
            Some(nl) => {
                idx += nl + 1;
                cur += 1;
            }
            None => return src.len(),
        }
    }
    idx
}

/// 1-based line number containing the byte offset.
pub fn byte_to_line(src: &str, byte_off: usize) -> u32 {
    let end = byte_off.min(src.len());
    src.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() as u32 + 1
}
