//! `multipart/x-mixed-replace` framing shared by the streamer's output and
//! its MJPEG capture input.

use bytes::{BufMut, Bytes, BytesMut};

/// Boundary token used on every stream this workspace serves.
pub const BOUNDARY_TOKEN: &str = "frame";

/// `Content-Type` of the served stream.
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

pub const JPEG_MIME: &str = "image/jpeg";

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Wrap one encoded image as a stream part:
///
/// ```text
/// --frame\r\n
/// Content-Type: <mime>\r\n\r\n
/// <image bytes>\r\n
/// ```
pub fn encode_part(mime: &str, image: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(image.len() + mime.len() + 40);
    buf.put_slice(b"--");
    buf.put_slice(BOUNDARY_TOKEN.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: ");
    buf.put_slice(mime.as_bytes());
    buf.put_slice(b"\r\n\r\n");
    buf.put_slice(image);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Extract the boundary token from a `multipart/...; boundary=xyz` header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Parse state for a multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<token>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting body bytes until the next boundary.
    CollectingBody,
}

/// Incremental parser that splits a multipart byte stream into part bodies.
///
/// Feed network chunks with [`push`](Self::push) and drain completed parts
/// with [`next_part`](Self::next_part). A part is only complete once the
/// following boundary has arrived.
pub struct MultipartParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    body_scan_from: usize,
}

impl MultipartParser {
    pub fn new(token: &str) -> Self {
        Self {
            boundary: format!("--{token}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            body_scan_from: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes currently held back waiting for more input.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Return the next complete part body, or `None` if more input is needed.
    pub fn next_part(&mut self) -> Option<Vec<u8>> {
        let boundary_len = self.boundary.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        let _ = self.buffer.split_to(pos + boundary_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep the tail in case the boundary spans chunks
                        if self.buffer.len() > boundary_len {
                            let _ = self.buffer.split_to(self.buffer.len() - boundary_len);
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    let pos = find_subsequence(&self.buffer, HEADER_END)?;
                    let _ = self.buffer.split_to(pos + HEADER_END.len());
                    self.body_scan_from = 0;
                    self.state = ParseState::CollectingBody;
                }
                ParseState::CollectingBody => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.body_scan_from..], &self.boundary)
                    else {
                        // Avoid re-scanning bytes already known not to hold a boundary
                        self.body_scan_from = self.buffer.len().saturating_sub(boundary_len);
                        return None;
                    };
                    let body_end = self.body_scan_from + pos;
                    let end = if body_end >= 2
                        && self.buffer[body_end - 2] == b'\r'
                        && self.buffer[body_end - 1] == b'\n'
                    {
                        body_end - 2
                    } else {
                        body_end
                    };

                    let body = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(body_end + boundary_len);
                    self.body_scan_from = 0;
                    self.state = ParseState::SeekingHeaderEnd;

                    if !body.is_empty() {
                        return Some(body);
                    }
                }
            }
        }
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
