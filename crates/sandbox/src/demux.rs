//! Stream demultiplexer for the container engine's framed byte stream.
//!
//! Frame format: an 8-byte header (`tag: u8`, 3 reserved bytes, `len: u32`
//! big-endian) followed by exactly `len` payload bytes. Tag 1 is stdout, tag
//! 2 is stderr. The demultiplexer never looks at payload bytes to decide
//! where a frame ends — only the header's length field, so a payload that
//! happens to contain header-shaped bytes can never desynchronize it.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

const HEADER_LEN: usize = 8;

/// Which sink a frame's payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_tag(tag: u8) -> Option<StreamKind> {
        match tag {
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

/// One demultiplexed frame: a sink tag plus its exact payload bytes. Frames
/// are never merged across sinks or split across reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("truncated frame: stream ended with an incomplete header or payload")]
    TruncatedFrame,
    #[error("unknown stream tag byte: {0}")]
    UnknownTag(u8),
}

/// Incremental frame parser. Bytes may arrive in arbitrarily sized chunks
/// from a live attach; `push` buffers a partial header or payload across
/// calls and returns every frame it can fully decode from what's buffered so
/// far. Call `finish` at end-of-stream to detect a truncated trailing frame.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    buf: BytesMut,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes in and drain as many complete frames as are
    /// now available. Bytes that don't yet form a complete frame are kept
    /// for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, DemuxError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let tag = self.buf[0];
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if self.buf.len() < HEADER_LEN + len {
                break;
            }

            let kind = StreamKind::from_tag(tag).ok_or(DemuxError::UnknownTag(tag))?;
            self.buf.advance(HEADER_LEN);
            let payload = self.buf.split_to(len).freeze();
            frames.push(Frame { kind, payload });
        }

        Ok(frames)
    }

    /// Signal end-of-stream. Any bytes still buffered that don't form a
    /// complete frame are a `TruncatedFrame` error; an empty buffer is fine.
    pub fn finish(self) -> Result<(), DemuxError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DemuxError::TruncatedFrame)
        }
    }
}

/// Encode one frame into the wire format. Used both by tests constructing
/// fixtures and by the driver to re-frame `bollard`'s already-demuxed
/// `LogOutput` so the same `Demultiplexer` parses live and collected output
/// alike (see `driver.rs`).
pub fn encode_frame(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind.tag());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Demultiplex a complete, already-assembled buffer in one shot ("collect
/// mode" for the batch executor's combined log blob).
pub fn collect(bytes: &[u8]) -> Result<Vec<Frame>, DemuxError> {
    let mut demux = Demultiplexer::new();
    let frames = demux.push(bytes)?;
    demux.finish()?;
    Ok(frames)
}

/// Concatenate every frame's payload in order into one buffer, ignoring
/// which sink each byte came from — used for the batch executor's combined
/// output string, which only needs ordering across sinks preserved, not
/// separability.
pub fn concat_payloads(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&frame.payload);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(kind: StreamKind, payload: &[u8]) -> Vec<u8> {
        encode_frame(kind, payload)
    }

    #[test]
    fn round_trip_single_frame() {
        let wire = frame_bytes(StreamKind::Stdout, b"hello\n");
        let frames = collect(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].payload[..], b"hello\n");
    }

    #[test]
    fn round_trip_interleaved_frames_preserve_order_and_separability() {
        let mut wire = Vec::new();
        wire.extend(frame_bytes(StreamKind::Stdout, b"out1"));
        wire.extend(frame_bytes(StreamKind::Stderr, b"err1"));
        wire.extend(frame_bytes(StreamKind::Stdout, b"out2"));

        let frames = collect(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].payload[..], b"out1");
        assert_eq!(frames[1].kind, StreamKind::Stderr);
        assert_eq!(&frames[1].payload[..], b"err1");
        assert_eq!(frames[2].kind, StreamKind::Stdout);
        assert_eq!(&frames[2].payload[..], b"out2");

        // combined view preserves ordering across sinks
        assert_eq!(concat_payloads(&frames), b"out1err1out2");
    }

    #[test]
    fn empty_stream_is_not_truncated() {
        assert_eq!(collect(&[]).unwrap(), vec![]);
    }

    #[test]
    fn truncated_header_is_an_error() {
        let wire = vec![1u8, 0, 0, 0, 0]; // 5 of 8 header bytes
        assert_eq!(collect(&wire), Err(DemuxError::TruncatedFrame));
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut wire = frame_bytes(StreamKind::Stdout, b"hello world");
        wire.truncate(HEADER_LEN + 3); // header claims 11 bytes, only 3 present
        assert_eq!(collect(&wire), Err(DemuxError::TruncatedFrame));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let wire = frame_bytes(StreamKind::Stdout, b"x");
        let mut bad = wire.clone();
        bad[0] = 9;
        assert_eq!(collect(&bad), Err(DemuxError::UnknownTag(9)));
    }

    #[test]
    fn incremental_push_across_arbitrary_chunk_boundaries() {
        let wire = frame_bytes(StreamKind::Stdout, b"chunked-payload");
        let mut demux = Demultiplexer::new();
        let mut all_frames = Vec::new();

        // Feed one byte at a time to exercise partial-header and
        // partial-payload buffering.
        for byte in &wire {
            all_frames.extend(demux.push(&[*byte]).unwrap());
        }
        demux.finish().unwrap();

        assert_eq!(all_frames.len(), 1);
        assert_eq!(&all_frames[0].payload[..], b"chunked-payload");
    }

    #[test]
    fn zero_length_payload_frame_is_valid() {
        let wire = frame_bytes(StreamKind::Stderr, b"");
        let frames = collect(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 0);
    }
}
