//! Payload sniffing: binary module magic number and the HTML error-page
//! heuristic.

/// `\0asm`, the first four bytes of every binary module.
pub const MODULE_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];

/// `<!DOC`, the start of a doctype declaration.
pub const HTML_PREFIX: [u8; 5] = [0x3C, 0x21, 0x44, 0x4F, 0x43];

const EXPECTED_CONTENT_TYPES: [&str; 3] = ["application/wasm", "octet-stream", "binary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    BinaryModule,
    Html,
    Unrecognized,
}

pub fn is_valid_binary_module(payload: &[u8]) -> bool {
    payload.len() >= MODULE_MAGIC.len() && payload[..MODULE_MAGIC.len()] == MODULE_MAGIC
}

/// Only answers "did the server hand us a web page"; not a general sniffer.
pub fn looks_like_html(payload: &[u8]) -> bool {
    payload.len() >= HTML_PREFIX.len() && payload[..HTML_PREFIX.len()] == HTML_PREFIX
}

pub fn classify(payload: &[u8]) -> PayloadKind {
    if is_valid_binary_module(payload) {
        PayloadKind::BinaryModule
    } else if looks_like_html(payload) {
        PayloadKind::Html
    } else {
        PayloadKind::Unrecognized
    }
}

/// Space separated hex of the first `n` bytes, for log lines and errors.
pub fn header_hex(payload: &[u8], n: usize) -> String {
    payload
        .iter()
        .take(n)
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns the header value when it does not look like a binary module type.
///
/// Servers often get this wrong while still sending the right bytes, so the
/// caller only warns about it.
pub fn content_type_advisory(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?;
    let lower = ct.to_ascii_lowercase();
    if EXPECTED_CONTENT_TYPES.iter().any(|t| lower.contains(t)) {
        None
    } else {
        Some(ct)
    }
}
