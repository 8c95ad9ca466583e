use futures::{Stream, StreamExt};

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Comment(String),
}

/// Pops the next complete frame off `buffer`.
///
/// Frames end at a blank line (`\n\n` or `\r\n\r\n`). Multiple `data:` lines
/// are joined with `\n`; the space after the colon is optional. Blocks with
/// neither data nor a comment are skipped.
pub fn parse_sse_frame(buffer: &mut String) -> Option<SseFrame> {
    loop {
        let (end_idx, delim_len) = match (buffer.find("\r\n\r\n"), buffer.find("\n\n")) {
            (Some(crlf), Some(lf)) if lf < crlf => (lf, 2),
            (Some(crlf), _) => (crlf, 4),
            (None, Some(lf)) => (lf, 2),
            (None, None) => return None,
        };

        let block = buffer[..end_idx].to_string();
        buffer.drain(..end_idx + delim_len);

        let mut data_lines: Vec<&str> = Vec::new();
        let mut comment: Option<&str> = None;
        for raw_line in block.lines() {
            let line = raw_line.trim_end_matches('\r');
            if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            } else if let Some(rest) = line.strip_prefix(':') {
                comment.get_or_insert(rest.trim());
            }
        }

        if !data_lines.is_empty() {
            return Some(SseFrame::Data(data_lines.join("\n")));
        }
        if let Some(comment) = comment {
            return Some(SseFrame::Comment(comment.to_string()));
        }
    }
}

/// Incremental decoder for a chunked SSE body. Bytes of a UTF-8 sequence
/// split across chunks are held back until the rest arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    text: String,
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = consumed + err.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.pending[consumed..valid_end]));
                    match err.error_len() {
                        // truncated sequence at the end; wait for more bytes
                        None => {
                            consumed = valid_end;
                            break;
                        }
                        Some(invalid) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed = valid_end + invalid;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);

        let mut frames = Vec::new();
        while let Some(frame) = parse_sse_frame(&mut self.text) {
            frames.push(frame);
        }
        frames
    }
}

/// Frames decoded from a streaming HTTP body.
pub fn frames(response: reqwest::Response) -> impl Stream<Item = Result<SseFrame, SyncError>> {
    let stream = response.bytes_stream();
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        futures::pin_mut!(stream);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    for frame in decoder.push(&chunk) {
                        yield Ok(frame);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "push stream read failed");
                    yield Err(SyncError::Http(err));
                    break;
                }
            }
        }
        tracing::debug!("push stream ended");
    }
}
