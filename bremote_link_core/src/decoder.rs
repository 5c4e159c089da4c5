// Newline-delimited JSON extraction from raw bytes
use serde::de::DeserializeOwned;

/// Incremental line splitter for a device's output stream.
///
/// Devices interleave log text with JSON data frames, and a read can end
/// anywhere inside a line. Bytes are accumulated until a `\n` arrives; each
/// complete line is trimmed, and only lines starting with `{` are parsed.
/// Anything that fails to parse is dropped without an error.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends `chunk` and returns every object decoded from the lines it
    /// completed, in stream order.
    pub fn feed<T: DeserializeOwned>(&mut self, chunk: &[u8]) -> Vec<T> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        // Everything after the last terminator stays buffered for the next feed.
        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split(|&b| b == b'\n')
            .filter_map(|line| decode_line(line))
            .collect()
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Parses a single line if it looks like a JSON object.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Option<T> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if !text.starts_with('{') {
        return None;
    }
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryFrame;
    use serde_json::{Map, Value};

    #[test]
    fn test_complete_lines() {
        let mut decoder = StreamDecoder::new();
        let frames: Vec<TelemetryFrame> =
            decoder.feed(b"{\"throttle\":1,\"steering\":2}\r\n{\"throttle\":3}\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].steering, Some(2));
        assert_eq!(frames[1].throttle, Some(3));
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_fragment_carried_between_feeds() {
        let mut decoder = StreamDecoder::new();
        let frames: Vec<TelemetryFrame> = decoder.feed(b"{\"thrott");
        assert!(frames.is_empty());
        assert_eq!(decoder.pending(), b"{\"thrott");

        let frames: Vec<TelemetryFrame> = decoder.feed(b"le\":42}\n{\"steer");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].throttle, Some(42));
        assert_eq!(decoder.pending(), b"{\"steer");
    }

    #[test]
    fn test_noise_and_garbage_dropped() {
        let mut decoder = StreamDecoder::new();
        let input = b"BREmote V2 boot\n  [radio] init ok\n{broken json\n{\"throttle\":7}\n[1,2]\n\n";
        let frames: Vec<TelemetryFrame> = decoder.feed(input);
        assert_eq!(frames, vec![TelemetryFrame { throttle: Some(7), ..Default::default() }]);
    }

    #[test]
    fn test_invalid_utf8_does_not_break_framing() {
        let mut decoder = StreamDecoder::new();
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(b"{\"rssi\":-80}\n");
        let frames: Vec<TelemetryFrame> = decoder.feed(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].rssi, Some(-80));
    }

    #[test]
    fn test_generic_map_decoding() {
        let mut decoder = StreamDecoder::new();
        let objects: Vec<Map<String, Value>> = decoder.feed(b"{\"gear\":2,\"locked\":false}\n");
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].get("gear"), Some(&Value::from(2)));
    }

    #[test]
    fn test_clear_discards_fragment() {
        let mut decoder = StreamDecoder::new();
        let _: Vec<TelemetryFrame> = decoder.feed(b"{\"throttle\":");
        decoder.clear();
        let frames: Vec<TelemetryFrame> = decoder.feed(b"{\"throttle\":5}\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].throttle, Some(5));
    }
}
