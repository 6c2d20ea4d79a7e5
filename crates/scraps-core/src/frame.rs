//! Splits raw transport bytes into logical JSON records.

use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

pub type Record = Value;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Framing {
    /// `text/event-stream` bodies, plus bare newline-delimited JSON lines.
    EventStream,
    /// Message-oriented transports where each delivery is exactly one record.
    Message,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed record {snippet:?}: {source}")]
    Malformed {
        snippet: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("record exceeds {limit} bytes; discarded")]
    Oversized { limit: usize },
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_record_bytes: usize,
    line: Vec<u8>,
    line_overflow: bool,
    data: String,
    data_overflow: bool,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self::with_limit(framing, DEFAULT_MAX_RECORD_BYTES)
    }

    pub fn with_limit(framing: Framing, max_record_bytes: usize) -> Self {
        Self {
            framing,
            max_record_bytes: max_record_bytes.max(1),
            line: Vec::new(),
            line_overflow: false,
            data: String::new(),
            data_overflow: false,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Feeds one chunk of bytes and returns every record it completed.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<Record, DecodeError>> {
        match self.framing {
            Framing::Message => self.push_message(bytes).into_iter().collect(),
            Framing::EventStream => self.push_stream(bytes),
        }
    }

    /// Drops buffered partial input. Called at every connection boundary.
    pub fn reset(&mut self) {
        self.line.clear();
        self.line_overflow = false;
        self.data.clear();
        self.data_overflow = false;
    }

    fn push_message(&self, bytes: &[u8]) -> Option<Result<Record, DecodeError>> {
        if bytes.len() > self.max_record_bytes {
            return Some(Err(DecodeError::Oversized {
                limit: self.max_record_bytes,
            }));
        }
        let text = match std::str::from_utf8(bytes) {
            Ok(t) => t.trim(),
            Err(_) => return Some(Err(DecodeError::InvalidUtf8)),
        };
        if text.is_empty() {
            return None;
        }
        Some(parse_record(text))
    }

    fn push_stream(&mut self, bytes: &[u8]) -> Vec<Result<Record, DecodeError>> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.line_overflow {
                self.line_overflow = false;
                self.line.clear();
                out.push(Err(DecodeError::Oversized {
                    limit: self.max_record_bytes,
                }));
                continue;
            }

            if self.line.is_empty() {
                self.handle_line(head, &mut out);
            } else {
                let mut line = std::mem::take(&mut self.line);
                line.extend_from_slice(head);
                self.handle_line(&line, &mut out);
            }
        }

        if !rest.is_empty() && !self.line_overflow {
            if self.line.len() + rest.len() > self.max_record_bytes {
                self.line.clear();
                self.line_overflow = true;
            } else {
                self.line.extend_from_slice(rest);
            }
        }

        out
    }

    fn handle_line(&mut self, raw: &[u8], out: &mut Vec<Result<Record, DecodeError>>) {
        let Ok(line) = std::str::from_utf8(raw) else {
            out.push(Err(DecodeError::InvalidUtf8));
            return;
        };
        let line = line.trim();

        if line.is_empty() {
            if self.data_overflow {
                self.data_overflow = false;
                out.push(Err(DecodeError::Oversized {
                    limit: self.max_record_bytes,
                }));
            } else if !self.data.is_empty() {
                let data = std::mem::take(&mut self.data);
                out.push(parse_record(&data));
            }
            return;
        }

        if let Some(payload) = line.strip_prefix("data:") {
            if self.data_overflow {
                return;
            }
            let payload = payload.trim();
            if self.data.len() + payload.len() > self.max_record_bytes {
                self.data.clear();
                self.data_overflow = true;
            } else {
                self.data.push_str(payload);
            }
            return;
        }

        if line.starts_with('{') {
            if line.len() > self.max_record_bytes {
                out.push(Err(DecodeError::Oversized {
                    limit: self.max_record_bytes,
                }));
            } else {
                out.push(parse_record(line));
            }
        }
        // `event:`, `id:`, `retry:` and `:` comments carry nothing we render.
    }
}

fn parse_record(text: &str) -> Result<Record, DecodeError> {
    serde_json::from_str(text).map_err(|source| DecodeError::Malformed {
        snippet: crate::event::truncate(text, 80),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_values(results: Vec<Result<Record, DecodeError>>) -> Vec<Value> {
        results.into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn event_stream_emits_on_blank_line() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        let out = d.push(b"event: message\nid: 7\ndata: {\"type\":\"commit\"}\n\n");
        assert_eq!(ok_values(out), vec![json!({"type": "commit"})]);
    }

    #[test]
    fn partial_lines_are_buffered_across_pushes() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        assert!(d.push(b"data: {\"type\":").is_empty());
        assert!(d.push(b"\"commit\"}\r\n").is_empty());
        let out = d.push(b"\r\n");
        assert_eq!(ok_values(out), vec![json!({"type": "commit"})]);
    }

    #[test]
    fn multi_line_data_is_concatenated() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        let out = d.push(b"data: {\"type\":\ndata: \"x\"}\n\n");
        assert_eq!(ok_values(out), vec![json!({"type": "x"})]);
    }

    #[test]
    fn bare_json_lines_are_records() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        let out = d.push(b"{\"type\":\"a\"}\n{\"type\":\"b\"}\n: keepalive\n");
        assert_eq!(
            ok_values(out),
            vec![json!({"type": "a"}), json!({"type": "b"})]
        );
    }

    #[test]
    fn malformed_records_interleaved_with_valid_ones() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        let input = concat!(
            "data: {\"n\":1}\n\n",
            "data: {not json\n\n",
            "data: {\"n\":2}\n\n",
            "{broken\n",
            "data: [1,\n\n",
            "data: {\"n\":3}\n\n",
        );
        let out = d.push(input.as_bytes());
        assert_eq!(out.len(), 6);
        assert_eq!(out.iter().filter(|r| r.is_err()).count(), 3);
        assert_eq!(
            ok_values(out),
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]
        );
    }

    #[test]
    fn byte_at_a_time_delivery_matches_bulk() {
        let input = b"data: {\"n\":1}\n\n{\"n\":2}\ndata:{\"n\":3}\n\n";
        let mut bulk = FrameDecoder::new(Framing::EventStream);
        let expected = ok_values(bulk.push(input));

        let mut trickle = FrameDecoder::new(Framing::EventStream);
        let mut got = Vec::new();
        for b in input {
            got.extend(ok_values(trickle.push(std::slice::from_ref(b))));
        }
        assert_eq!(got, expected);
        assert_eq!(got.len(), 3);
    }

    #[test]
    fn oversized_data_block_is_discarded_and_decoding_continues() {
        let mut d = FrameDecoder::with_limit(Framing::EventStream, 16);
        let out = d.push(b"data: {\"pad\":\"0123456789abcdef\"}\n\ndata: {\"n\":1}\n\n");
        assert!(matches!(out[0], Err(DecodeError::Oversized { limit: 16 })));
        assert_eq!(ok_values(out), vec![json!({"n": 1})]);
    }

    #[test]
    fn oversized_partial_line_is_not_buffered_without_bound() {
        let mut d = FrameDecoder::with_limit(Framing::EventStream, 8);
        assert!(d.push(b"{\"aaaaaaaaaaaa").is_empty());
        assert!(d.line.is_empty());
        let out = d.push(b"\"}\n{\"n\":1}\n");
        assert!(matches!(out[0], Err(DecodeError::Oversized { .. })));
        assert_eq!(ok_values(out), vec![json!({"n": 1})]);
    }

    #[test]
    fn reset_drops_partial_state() {
        let mut d = FrameDecoder::new(Framing::EventStream);
        d.push(b"data: {\"n\":1}\ndata: {\"trunc");
        d.reset();
        let out = d.push(b"data: {\"n\":2}\n\n");
        assert_eq!(ok_values(out), vec![json!({"n": 2})]);
    }

    #[test]
    fn message_framing_is_one_record_per_push() {
        let mut d = FrameDecoder::new(Framing::Message);
        assert_eq!(
            ok_values(d.push(b"{\"type\":\"commit\"}")),
            vec![json!({"type": "commit"})]
        );
        assert!(d.push(b"  ").is_empty());
        assert!(matches!(
            d.push(b"not json").as_slice(),
            [Err(DecodeError::Malformed { .. })]
        ));
        assert!(matches!(
            d.push(&[0xff, 0xfe]).as_slice(),
            [Err(DecodeError::InvalidUtf8)]
        ));
    }
}
