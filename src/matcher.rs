//! Recognises an expected packet inside an arbitrarily chunked byte stream.
//!
//! The matcher owns a fixed-capacity read buffer and three cursors:
//!
//! ```text
//!  0            mark        position          limit        capacity
//!  ├── noise ───┼── partial ──┼──── unread ─────┼─── free ───┤
//!               │   match     │
//! ```
//!
//! - `position`: next byte to compare against the target.
//! - `limit`: end of the bytes received so far.
//! - `mark`: where the match in progress started, if any.  While a match is
//!   in progress the matched length is always `position - mark`.
//!
//! A mismatch after a partial match moves `position` back to `mark + 1`, so
//! overlapping candidates are retried one byte later.  When the buffer fills
//! up, bytes before the mark are dropped (or everything, when no match is in
//! progress) and reading continues.  Bytes that belong to a live partial
//! match are never dropped, which is why a target larger than the buffer is
//! rejected up front.

use std::io;

use crate::error::FlowError;
use crate::packet::Packet;

#[derive(Debug)]
pub struct StreamMatcher {
    buf: Vec<u8>,
    position: usize,
    limit: usize,
    mark: Option<usize>,
}

impl StreamMatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            position: 0,
            limit: 0,
            mark: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes received but not yet consumed by a completed match.
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.limit]
    }

    /// Block until `target` has been seen as a contiguous run of bytes.
    ///
    /// `fill` performs one blocking read into the given free region and
    /// returns the number of bytes read, `0` meaning end of stream.  It is
    /// only called when every buffered byte has been scanned.
    ///
    /// Returns the number of stream bytes consumed by this match: skipped
    /// noise plus the target itself.  Bytes received after the target stay
    /// buffered for the next call.
    pub fn await_match<F>(
        &mut self,
        label: &str,
        target: &[u8],
        mut fill: F,
    ) -> Result<usize, FlowError>
    where
        F: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        if target.len() > self.capacity() {
            return Err(FlowError::BufferTooSmall {
                capacity: self.capacity(),
                packet: Packet::from_bytes(target),
            });
        }
        self.mark = None;
        if target.is_empty() {
            return Ok(0);
        }

        let mut skipped = 0;
        loop {
            if self.position == self.limit {
                let count = fill(&mut self.buf[self.limit..])?;
                if count == 0 {
                    return Err(FlowError::ConnectionClosed {
                        discarded: Packet::from_bytes(&self.buf[..self.limit]),
                    });
                }
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!(
                        "[{label}] read from socket: {}",
                        Packet::from_bytes(&self.buf[self.limit..self.limit + count])
                    );
                }
                self.limit += count;
            }

            if self.scan(target) {
                let start = self.mark.take().unwrap_or(0);
                if start > 0 && log::log_enabled!(log::Level::Trace) {
                    log::trace!(
                        "[{label}] ignoring received {} before expected",
                        Packet::from_bytes(&self.buf[..start])
                    );
                }
                let end = self.position;
                self.compact(end);
                return Ok(skipped + end);
            }

            if self.limit == self.capacity() {
                match self.mark {
                    Some(start) => {
                        log::trace!("[{label}] buffer full, keeping partial match from {start}");
                        skipped += start;
                        self.compact(start);
                        self.mark = Some(0);
                    }
                    None => {
                        if log::log_enabled!(log::Level::Trace) {
                            log::trace!(
                                "[{label}] ignoring received {} while waiting for {}",
                                Packet::from_bytes(&self.buf[..self.limit]),
                                Packet::from_bytes(target)
                            );
                        }
                        skipped += self.limit;
                        self.position = 0;
                        self.limit = 0;
                    }
                }
            }
        }
    }

    /// Compare unread bytes against `target`.  Returns `true` once the whole
    /// target matched; `mark` then points at its first byte and `position`
    /// just past its last.
    fn scan(&mut self, target: &[u8]) -> bool {
        while self.position < self.limit {
            let matched = self.mark.map_or(0, |start| self.position - start);
            if self.buf[self.position] == target[matched] {
                if self.mark.is_none() {
                    self.mark = Some(self.position);
                }
                self.position += 1;
                if matched + 1 == target.len() {
                    return true;
                }
            } else if let Some(start) = self.mark.take() {
                self.position = start + 1;
            } else {
                self.position += 1;
            }
        }
        false
    }

    /// Drop the first `from` bytes, shifting the rest to the front.
    fn compact(&mut self, from: usize) {
        self.buf.copy_within(from..self.limit, 0);
        self.limit -= from;
        self.position -= from;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Feeds `chunks` one read at a time, then reports end of stream.
    fn chunked<T: AsRef<[u8]>>(chunks: &[T]) -> impl FnMut(&mut [u8]) -> io::Result<usize> {
        let mut pending: VecDeque<Vec<u8>> =
            chunks.iter().map(|c| c.as_ref().to_vec()).collect();
        move |free: &mut [u8]| {
            let Some(mut chunk) = pending.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(free.len());
            free[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                pending.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    fn splits_of(stream: &[u8], size: usize) -> Vec<&[u8]> {
        stream.chunks(size).collect()
    }

    #[test]
    fn exact_match_in_one_read() {
        let mut m = StreamMatcher::new(64);
        let consumed = m
            .await_match("t", b"Hello, I'm John", chunked(&["Hello, I'm John"]))
            .unwrap();
        assert_eq!(consumed, 15);
        assert!(m.pending().is_empty());
    }

    #[test]
    fn noise_before_target_is_consumed() {
        let mut m = StreamMatcher::new(64);
        let consumed = m
            .await_match(
                "t",
                b"Hello, I'm John",
                chunked(&["What's up!", "Hello, I'm John"]),
            )
            .unwrap();
        assert_eq!(consumed, 25);
        assert!(m.pending().is_empty());
    }

    #[test]
    fn trailing_bytes_stay_for_next_match() {
        let mut m = StreamMatcher::new(64);
        let mut fill = chunked(&["xxABCDEF"]);
        assert_eq!(m.await_match("t", b"ABC", &mut fill).unwrap(), 5);
        assert_eq!(m.pending(), b"DEF");
        assert_eq!(m.await_match("t", b"EF", &mut fill).unwrap(), 3);
        assert!(m.pending().is_empty());
    }

    #[test]
    fn consumption_is_independent_of_chunk_boundaries() {
        let stream = b"noise-aab-aaab-then-the-target-aaabaaab-rest";
        let target = b"aaabaaab";
        let mut whole = StreamMatcher::new(64);
        let expected = whole.await_match("t", target, chunked(&[stream])).unwrap();
        let expected_rest = whole.pending().to_vec();

        for size in 1..stream.len() {
            let chunks = splits_of(stream, size);
            let mut fill = chunked(&chunks);
            let mut m = StreamMatcher::new(64);
            let consumed = m.await_match("t", target, &mut fill).unwrap();
            assert_eq!(consumed, expected, "chunk size {size}");
            let mut rest = m.pending().to_vec();
            let mut tail = [0u8; 64];
            loop {
                let n = fill(&mut tail[..]).unwrap();
                if n == 0 {
                    break;
                }
                rest.extend_from_slice(&tail[..n]);
            }
            assert_eq!(rest, expected_rest, "chunk size {size}");
        }
    }

    #[test]
    fn overlapping_candidate_is_retried_one_byte_later() {
        let mut m = StreamMatcher::new(16);
        let consumed = m.await_match("t", b"aab", chunked(&["aaab"])).unwrap();
        assert_eq!(consumed, 4);
    }

    #[test]
    fn full_buffer_without_partial_match_is_discarded() {
        let mut m = StreamMatcher::new(8);
        let consumed = m
            .await_match("t", b"XYZ", chunked(&["01234567", "89", "XYZ"]))
            .unwrap();
        assert_eq!(consumed, 13);
    }

    #[test]
    fn full_buffer_keeps_live_partial_match() {
        let mut m = StreamMatcher::new(8);
        let consumed = m
            .await_match("t", b"ABCDEF", chunked(&["012345AB", "CDEF"]))
            .unwrap();
        assert_eq!(consumed, 12);
        assert!(m.pending().is_empty());
    }

    #[test]
    fn target_as_large_as_buffer_matches_across_compaction() {
        let mut m = StreamMatcher::new(4);
        let consumed = m
            .await_match("t", b"ABCD", chunked(&["xxAB", "CD"]))
            .unwrap();
        assert_eq!(consumed, 6);
    }

    #[test]
    fn end_of_stream_reports_unmatched_bytes() {
        let mut m = StreamMatcher::new(16);
        let err = m
            .await_match("t", b"Hello", chunked(&["What's up!"]))
            .unwrap_err();
        match err {
            FlowError::ConnectionClosed { discarded } => {
                assert_eq!(discarded, Packet::from("What's up!"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn oversized_target_is_rejected_without_reading() {
        let mut m = StreamMatcher::new(2);
        let err = m
            .await_match("t", b"abc", |_: &mut [u8]| -> io::Result<usize> {
                panic!("must not read")
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::BufferTooSmall { capacity: 2, .. }));
    }

    #[test]
    fn empty_target_matches_immediately() {
        let mut m = StreamMatcher::new(2);
        let consumed = m
            .await_match("t", b"", |_: &mut [u8]| -> io::Result<usize> {
                panic!("must not read")
            })
            .unwrap();
        assert_eq!(consumed, 0);
    }

    #[test]
    fn read_errors_propagate() {
        let mut m = StreamMatcher::new(8);
        let err = m
            .await_match("t", b"a", |_: &mut [u8]| -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            })
            .unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }
}
