//! Event stream framing.
//!
//! Splits a byte stream into SSE events on a blank line, accepting `\n\n`,
//! `\r\r` and `\r\n\r\n` as separators. Whatever remains at end of stream
//! is returned as a final event.

use futures_util::{Stream, StreamExt};

const SEPARATORS: [&[u8]; 3] = [b"\r\n\r\n", b"\n\n", b"\r\r"];

/// Length of the longest separator.
const MAX_SEPARATOR_LEN: usize = 4;

/// Reads one event at a time from a chunked body.
#[derive(Debug)]
pub struct EventStreamReader<S> {
    stream: S,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no separator start.
    scanned: usize,
    finished: bool,
}

impl<S, B, E> EventStreamReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    /// Wrap a body stream.
    pub const fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            scanned: 0,
            finished: false,
        }
    }

    /// Next event without its separator, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns the body stream's error.
    pub async fn next_event(&mut self) -> Result<Option<String>, E> {
        loop {
            if let Some((end, separator_len)) = find_separator(&self.buffer, self.scanned) {
                let event = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
                self.buffer.drain(..end + separator_len);
                self.scanned = 0;
                return Ok(Some(event));
            }
            // A separator may still straddle the tail and the next chunk.
            self.scanned = self.buffer.len().saturating_sub(MAX_SEPARATOR_LEN - 1);

            if self.finished {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let event = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                self.scanned = 0;
                return Ok(Some(event));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => return Err(e),
                None => self.finished = true,
            }
        }
    }
}

/// Position and length of the first event separator in `buffer` at or
/// after `from`.
fn find_separator(buffer: &[u8], from: usize) -> Option<(usize, usize)> {
    (from..buffer.len()).find_map(|i| {
        SEPARATORS
            .iter()
            .copied()
            .find(|separator| buffer[i..].starts_with(separator))
            .map(|separator| (i, separator.len()))
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures_util::stream;
    use test_case::test_case;

    use super::*;

    fn reader(
        chunks: &[&'static str],
    ) -> EventStreamReader<impl Stream<Item = Result<&'static [u8], Infallible>> + Unpin> {
        EventStreamReader::new(stream::iter(
            chunks
                .iter()
                .copied()
                .map(|chunk| Ok(chunk.as_bytes()))
                .collect::<Vec<_>>(),
        ))
    }

    async fn collect(chunks: &[&'static str]) -> Vec<String> {
        let mut reader = reader(chunks);
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[test_case(&["data: a\n\ndata: b\n\n"] ; "lf")]
    #[test_case(&["data: a\r\n\r\ndata: b\r\n\r\n"] ; "crlf")]
    #[test_case(&["data: a\r\rdata: b\r\r"] ; "cr")]
    #[test_case(&["data: a\n", "\ndata", ": b\n\n"] ; "split across chunks")]
    #[tokio::test]
    async fn splits_events(chunks: &[&'static str]) {
        assert_eq!(collect(chunks).await, vec!["data: a", "data: b"]);
    }

    #[tokio::test]
    async fn trailing_event_without_separator_is_returned() {
        assert_eq!(
            collect(&["event: next\ndata: 1\n\nevent: complete"]).await,
            vec!["event: next\ndata: 1", "event: complete"]
        );
    }

    #[tokio::test]
    async fn multi_line_event_stays_together() {
        assert_eq!(
            collect(&["event: next\ndata: {\"a\":1}\n\n"]).await,
            vec!["event: next\ndata: {\"a\":1}"]
        );
    }

    #[test_case(&["data: a\r", "\n", "\r", "\ndata: b\r\n\r\n"] ; "crlf byte by byte")]
    #[test_case(&["data: a", "\n", "\n", "data: b", "\n\n"] ; "lf byte by byte")]
    #[tokio::test]
    async fn separator_straddling_chunks(chunks: &[&'static str]) {
        assert_eq!(collect(chunks).await, vec!["data: a", "data: b"]);
    }

    #[tokio::test]
    async fn large_event_in_small_chunks() {
        let payload = "x".repeat(4096);
        let event: &'static str = format!("data: {payload}\n\n").leak();
        let chunks: Vec<&'static str> = event
            .as_bytes()
            .chunks(7)
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect();
        assert_eq!(collect(&chunks).await, vec![format!("data: {payload}")]);
    }

    #[test]
    fn scan_resumes_from_offset() {
        assert_eq!(find_separator(b"ab\n\ncd\n\n", 0), Some((2, 2)));
        assert_eq!(find_separator(b"ab\n\ncd\n\n", 3), Some((6, 2)));
        assert_eq!(find_separator(b"abc", 10), None);
    }

    #[tokio::test]
    async fn empty_stream_has_no_events() {
        assert!(collect(&[]).await.is_empty());
    }
}
