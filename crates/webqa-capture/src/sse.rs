//! Line-level decoding of the agent's server-sent-event stream.

/// Marker prefixing every record of interest.
pub const DATA_LINE_MARKER: &str = "data:";
/// Sentinel payload meaning "no event, end of logical stream".
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits an SSE byte stream into complete `data:` payloads, carrying
/// partial lines across chunk boundaries so records split mid-line (or
/// mid-UTF-8) by transport chunking are still decoded whole.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    /// Consume one transport chunk, returning the payloads of every
    /// complete `data:` line it finished.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(payload) = parse_data_line(&line[..line.len() - 1]) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        parse_data_line(&line)
    }
}

fn parse_data_line(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let line = text.trim_end_matches('\r');
    let payload = line.strip_prefix(DATA_LINE_MARKER)?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload == DONE_SENTINEL {
        return None;
    }
    Some(payload.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_lines_in_one_chunk() {
        let mut decoder = SseLineDecoder::default();
        let payloads =
            decoder.push_chunk(b"data: {\"type\":\"start\"}\n\ndata: {\"type\":\"finish\"}\n");
        assert_eq!(payloads, vec!["{\"type\":\"start\"}", "{\"type\":\"finish\"}"]);
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.push_chunk(b"data: {\"type\":\"text-de").is_empty());
        let payloads = decoder.push_chunk(b"lta\",\"delta\":\"hi\"}\ndata: {\"ty");
        assert_eq!(payloads, vec!["{\"type\":\"text-delta\",\"delta\":\"hi\"}"]);
        let payloads = decoder.push_chunk(b"pe\":\"finish\"}\n");
        assert_eq!(payloads, vec!["{\"type\":\"finish\"}"]);
    }

    #[test]
    fn done_sentinel_is_skipped() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.push_chunk(b"data: [DONE]\ndata: {\"type\":\"start\"}\n");
        assert_eq!(payloads, vec!["{\"type\":\"start\"}"]);
    }

    #[test]
    fn unmarked_and_comment_lines_are_ignored() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.push_chunk(b": keep-alive\nevent: message\ndata: {\"a\":1}\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn crlf_line_endings_are_handled() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.push_chunk(b"data: {\"a\":1}\r\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn marker_without_space_is_accepted() {
        let mut decoder = SseLineDecoder::default();
        let payloads = decoder.push_chunk(b"data:{\"a\":1}\n");
        assert_eq!(payloads, vec!["{\"a\":1}"]);
    }

    #[test]
    fn finish_flushes_a_trailing_unterminated_line() {
        let mut decoder = SseLineDecoder::default();
        assert!(decoder.push_chunk(b"data: {\"type\":\"finish\"}").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("{\"type\":\"finish\"}"));
        assert_eq!(decoder.finish(), None);
    }
}
