//! Download engine: the two-phase chunked log download.
//!
//! Phase one asks the peripheral for the total log length; phase two pulls
//! the data in batches of up to `19 * batch_factor` bytes, one 19-byte
//! notification at a time. Every request opens a new job (high nibble of the
//! job byte); replies within a job carry a cycling sequence nibble that must
//! arrive strictly in order.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

use crate::protocol::constants::*;
use crate::transport::LinkError;

/// Byte-write capability supplied by the owning session.
///
/// Writes are fire-and-forget; completion is observed by the session via the
/// platform's write confirmation, never by this engine.
pub trait ControlWrite {
    fn write_control(&mut self, frame: &[u8]) -> Result<(), LinkError>;
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("empty reply")]
    EmptyReply,
    #[error("peer reported error {code}")]
    Peer { code: i32 },
    #[error("out-of-order reply: expected sequence {expected:#04x}, got {got:#04x}")]
    OutOfOrder { expected: u8, got: u8 },
    #[error("length reply too short ({len} bytes)")]
    ShortLengthReply { len: usize },
    #[error("reply overruns requested batch ({received} of {expected} bytes)")]
    BatchOverrun { received: u32, expected: u32 },
    #[error("reply overflows declared total length {total}")]
    Overflow { total: u32 },
    #[error("cannot allocate {total} byte buffer for the declared length")]
    OutOfMemory { total: u32 },
    #[error("reply received in state {state:?}")]
    UnexpectedReply { state: DownloadState },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Engine state. `Error` is absorbing: a failed download must be restarted
/// with a fresh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Idle,
    AwaitingLength,
    Reading,
    Finished,
    Error,
}

/// Outcome of feeding one reply to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Stale reply from a superseded job; dropped without effect.
    Ignored,
    /// Reply consumed, download still in progress.
    Progress,
    /// The peer reported a zero-length log; nothing was allocated.
    NoData,
    /// The buffer is exactly full.
    Finished,
}

/// State machine for one log download over the utility control characteristic.
pub struct DownloadEngine {
    state: DownloadState,
    /// Current job id, stored pre-shifted in the high nibble.
    job: u8,
    /// Expected sequence nibble of the next reply, 0..=SEQUENCE_MAX.
    sequence: u8,
    format: u8,
    /// Batches outstanding per request cycle; above ~4 nearly every batch has
    /// to wait for a free notification slot on the peripheral.
    batch_factor: u32,
    total: u32,
    /// Bytes confirmed by completed batches.
    index: u32,
    /// Bytes received overall, including the in-flight batch.
    received: u32,
    batch_length: u32,
    batch_received: u32,
    /// Sized exactly to `total` once known; never resized afterwards.
    data: Option<Vec<u8>>,
}

impl DownloadEngine {
    pub fn new() -> Self {
        Self::with_batch_factor(4)
    }

    pub fn with_batch_factor(batch_factor: u32) -> Self {
        Self {
            state: DownloadState::Idle,
            job: 0,
            sequence: 0,
            format: FORMAT_HTML,
            batch_factor: batch_factor.max(1),
            total: 0,
            index: 0,
            received: 0,
            batch_length: 0,
            batch_received: 0,
            data: None,
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    /// Log format requested from the peer (`FORMAT_*`). Takes effect on the
    /// next [`start`](Self::start).
    pub fn set_format(&mut self, format: u8) {
        self.format = format;
    }

    pub fn format(&self) -> u8 {
        self.format
    }

    /// Total length reported by the peer, 0 until the length reply arrives.
    pub fn total_length(&self) -> u32 {
        self.total
    }

    /// Downloaded data; `Some` only once the engine reports `Finished`.
    pub fn data(&self) -> Option<&[u8]> {
        match self.state {
            DownloadState::Finished => self.data.as_deref(),
            _ => None,
        }
    }

    /// Fraction of confirmed bytes, clamped to `[0, 1]`.
    pub fn progress(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        (self.index as f32 / self.total as f32).clamp(0.0, 1.0)
    }

    fn next_job(&mut self) {
        self.job = self.job.wrapping_add(0x10);
        self.sequence = 0;
    }

    fn advance_sequence(&mut self) {
        self.sequence += 1;
        if self.sequence == SEQUENCE_ERROR {
            self.sequence = 0;
        }
    }

    /// Begin a download: open a new job and send the 3-byte length query.
    pub fn start<W: ControlWrite>(&mut self, link: &mut W) -> Result<(), DownloadError> {
        self.total = 0;
        self.index = 0;
        self.received = 0;
        self.batch_length = 0;
        self.batch_received = 0;
        self.data = None;
        self.next_job();

        let frame = [self.job, REQUEST_TYPE_LENGTH, self.format];
        link.write_control(&frame)?;
        self.state = DownloadState::AwaitingLength;
        tracing::debug!(job = %format!("{:#04x}", self.job), "length query sent");
        Ok(())
    }

    /// Request the next batch: a new job carrying explicit index, batch
    /// length and total length fields.
    fn read_batch<W: ControlWrite>(&mut self, link: &mut W) -> Result<(), DownloadError> {
        self.batch_received = 0;
        self.batch_length = (self.total - self.received).min(REPLY_PAYLOAD_MAX as u32 * self.batch_factor);
        self.next_job();

        let mut frame = Vec::with_capacity(REQUEST_READ_SIZE);
        frame.write_u8(self.job).unwrap();
        frame.write_u8(REQUEST_TYPE_READ).unwrap();
        frame.write_u8(self.format).unwrap();
        frame.write_u8(0).unwrap();
        frame.write_u32::<LittleEndian>(self.index).unwrap();
        frame.write_u32::<LittleEndian>(self.batch_length).unwrap();
        frame.write_u32::<LittleEndian>(self.total).unwrap();
        link.write_control(&frame)?;
        tracing::debug!(
            job = %format!("{:#04x}", self.job),
            index = self.index,
            batch = self.batch_length,
            "batch read requested"
        );
        Ok(())
    }

    /// Feed one notification payload from the control characteristic.
    pub fn on_reply<W: ControlWrite>(
        &mut self,
        reply: &[u8],
        link: &mut W,
    ) -> Result<ReplyOutcome, DownloadError> {
        if reply.is_empty() {
            return self.fail(DownloadError::EmptyReply);
        }

        let job_byte = reply[0];
        if job_byte & 0xF0 != self.job {
            // Stale reply from a superseded job; not an error.
            tracing::trace!(job = %format!("{:#04x}", job_byte), "stale reply ignored");
            return Ok(ReplyOutcome::Ignored);
        }

        let sequence = job_byte & 0x0F;
        if sequence == SEQUENCE_ERROR {
            let code = Cursor::new(&reply[1..])
                .read_i32::<LittleEndian>()
                .unwrap_or(i32::MIN);
            return self.fail(DownloadError::Peer { code });
        }
        if sequence != self.sequence {
            let expected = self.sequence;
            return self.fail(DownloadError::OutOfOrder { expected, got: sequence });
        }
        self.advance_sequence();

        let payload = &reply[1..];
        match self.state {
            DownloadState::AwaitingLength => self.on_length(payload, link),
            DownloadState::Reading => self.on_data(payload.to_vec(), link),
            state => self.fail(DownloadError::UnexpectedReply { state }),
        }
    }

    fn on_length<W: ControlWrite>(
        &mut self,
        payload: &[u8],
        link: &mut W,
    ) -> Result<ReplyOutcome, DownloadError> {
        if payload.len() < 4 {
            return self.fail(DownloadError::ShortLengthReply { len: payload.len() });
        }
        let total = Cursor::new(payload).read_u32::<LittleEndian>().unwrap();
        if total == 0 {
            self.state = DownloadState::Finished;
            return Ok(ReplyOutcome::NoData);
        }

        self.total = total;
        self.index = 0;
        self.received = 0;

        // The length is peer-controlled; a failed reservation must come back
        // as a protocol result, not abort the process.
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(total as usize).is_err() {
            return self.fail(DownloadError::OutOfMemory { total });
        }
        self.data = Some(buffer);
        tracing::debug!(total, "log length received");

        self.state = DownloadState::Reading;
        self.read_batch(link)?;
        Ok(ReplyOutcome::Progress)
    }

    fn on_data<W: ControlWrite>(
        &mut self,
        payload: Vec<u8>,
        link: &mut W,
    ) -> Result<ReplyOutcome, DownloadError> {
        if payload.is_empty() {
            return self.fail(DownloadError::EmptyReply);
        }
        let len = payload.len() as u32;
        if self.received + len > self.total {
            let total = self.total;
            return self.fail(DownloadError::Overflow { total });
        }
        if self.batch_received + len > self.batch_length {
            let err = DownloadError::BatchOverrun {
                received: self.batch_received + len,
                expected: self.batch_length,
            };
            return self.fail(err);
        }

        // The buffer was sized to `total` up front; the overflow check above
        // guarantees this append never reallocates.
        self.data
            .as_mut()
            .expect("buffer allocated on length reply")
            .extend_from_slice(&payload);
        self.received += len;
        self.batch_received += len;

        if self.batch_received == self.batch_length {
            self.index += self.batch_received;

            if self.received == self.total {
                self.state = DownloadState::Finished;
                return Ok(ReplyOutcome::Finished);
            }
            self.read_batch(link)?;
        }
        Ok(ReplyOutcome::Progress)
    }

    fn fail(&mut self, err: DownloadError) -> Result<ReplyOutcome, DownloadError> {
        self.state = DownloadState::Error;
        Err(err)
    }
}

impl Default for DownloadEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Captures frames written by the engine.
    #[derive(Default)]
    struct FrameLog {
        frames: Vec<Vec<u8>>,
    }

    impl ControlWrite for FrameLog {
        fn write_control(&mut self, frame: &[u8]) -> Result<(), LinkError> {
            self.frames.push(frame.to_vec());
            Ok(())
        }
    }

    impl FrameLog {
        fn last_job(&self) -> u8 {
            self.frames.last().expect("no frame written")[0] & 0xF0
        }
    }

    fn length_reply(job: u8, total: u32) -> Vec<u8> {
        let mut reply = vec![job];
        reply.extend_from_slice(&total.to_le_bytes());
        reply
    }

    #[test]
    fn test_length_query_frame_layout() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        assert_eq!(link.frames.len(), 1);
        assert_eq!(link.frames[0], vec![0x10, REQUEST_TYPE_LENGTH, FORMAT_HTML]);
        assert_eq!(engine.state(), DownloadState::AwaitingLength);
    }

    #[test]
    fn test_read_request_frame_layout() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        engine.on_reply(&length_reply(job, 1000), &mut link).unwrap();

        let frame = &link.frames[1];
        assert_eq!(frame.len(), REQUEST_READ_SIZE);
        assert_eq!(frame[1], REQUEST_TYPE_READ);
        assert_eq!(frame[3], 0);
        assert_eq!(u32::from_le_bytes(frame[4..8].try_into().unwrap()), 0); // index
        assert_eq!(u32::from_le_bytes(frame[8..12].try_into().unwrap()), 76); // batch
        assert_eq!(u32::from_le_bytes(frame[12..16].try_into().unwrap()), 1000); // total
    }

    #[test]
    fn test_zero_length_short_circuits_without_allocating() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        let outcome = engine.on_reply(&length_reply(job, 0), &mut link).unwrap();
        assert_eq!(outcome, ReplyOutcome::NoData);
        assert!(engine.data.is_none());
        assert_eq!(link.frames.len(), 1); // no read request went out
    }

    #[test]
    fn test_stale_job_is_ignored_not_failed() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let stale = link.last_job().wrapping_sub(0x10);
        let outcome = engine.on_reply(&length_reply(stale, 42), &mut link).unwrap();
        assert_eq!(outcome, ReplyOutcome::Ignored);
        assert_eq!(engine.state(), DownloadState::AwaitingLength);
    }

    #[test]
    fn test_out_of_order_sequence_is_rejected() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        engine.on_reply(&length_reply(job, 1000), &mut link).unwrap();

        // First data reply must carry sequence 0; send 1 instead.
        let job = link.last_job();
        let mut reply = vec![job | 0x01];
        reply.extend_from_slice(&[0u8; 19]);
        let err = engine.on_reply(&reply, &mut link).unwrap_err();
        assert!(matches!(err, DownloadError::OutOfOrder { expected: 0, got: 1 }));
        assert_eq!(engine.state(), DownloadState::Error);
    }

    #[test]
    fn test_peer_error_nibble_fails_with_code() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        let mut reply = vec![job | SEQUENCE_ERROR];
        reply.extend_from_slice(&(-3i32).to_le_bytes());
        let err = engine.on_reply(&reply, &mut link).unwrap_err();
        assert!(matches!(err, DownloadError::Peer { code: -3 }));
    }

    #[test]
    fn test_overflow_is_a_protocol_failure() {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        engine.on_reply(&length_reply(job, 10), &mut link).unwrap();

        let job = link.last_job();
        let mut reply = vec![job]; // sequence 0
        reply.extend_from_slice(&[0xAA; 19]); // 19 > 10 declared
        let err = engine.on_reply(&reply, &mut link).unwrap_err();
        assert!(matches!(err, DownloadError::Overflow { total: 10 }));
    }

    /// Drives a complete download, feeding 19-byte fragments per batch.
    fn run_download(total: usize) -> (DownloadEngine, FrameLog) {
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::new();
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        engine
            .on_reply(&length_reply(job, total as u32), &mut link)
            .unwrap();

        let mut sent = 0usize;
        let mut last_progress = 0.0f32;
        while engine.state() == DownloadState::Reading {
            let job = link.last_job();
            let frame = link.frames.last().unwrap().clone();
            let batch = u32::from_le_bytes(frame[8..12].try_into().unwrap()) as usize;

            let mut seq = 0u8;
            let mut batch_sent = 0usize;
            while batch_sent < batch {
                let n = (batch - batch_sent).min(REPLY_PAYLOAD_MAX);
                let mut reply = vec![job | seq];
                reply.extend((0..n).map(|i| (sent + i) as u8));
                let outcome = engine.on_reply(&reply, &mut link).unwrap();
                batch_sent += n;
                sent += n;
                if sent == total {
                    assert_eq!(outcome, ReplyOutcome::Finished);
                }
                seq += 1;
                if seq == SEQUENCE_ERROR {
                    seq = 0;
                }
                let progress = engine.progress();
                assert!((0.0..=1.0).contains(&progress));
                assert!(progress >= last_progress, "progress went backwards");
                last_progress = progress;
            }
        }
        (engine, link)
    }

    #[test]
    fn test_download_1000_bytes_in_76_byte_batches() {
        let (engine, link) = run_download(1000);
        assert_eq!(engine.state(), DownloadState::Finished);

        let data = engine.data().unwrap();
        assert_eq!(data.len(), 1000);
        assert_eq!(engine.total_length(), 1000);
        assert_eq!(engine.progress(), 1.0);
        // 1000 = 13 full 76-byte batches + one 12-byte tail batch.
        let reads = link.frames.iter().filter(|f| f.len() == REQUEST_READ_SIZE);
        assert_eq!(reads.count(), 14);
        // Payload bytes arrived in order.
        assert!(data.iter().enumerate().all(|(i, &b)| b == i as u8));
    }

    #[test]
    fn test_sequence_wraps_within_long_batch() {
        // A batch factor large enough that one batch spans > 15 fragments.
        let mut link = FrameLog::default();
        let mut engine = DownloadEngine::with_batch_factor(20);
        engine.start(&mut link).unwrap();

        let job = link.last_job();
        engine.on_reply(&length_reply(job, 380), &mut link).unwrap(); // one 380-byte batch

        let job = link.last_job();
        let mut seq = 0u8;
        for chunk in 0..20 {
            let mut reply = vec![job | seq];
            reply.extend_from_slice(&[chunk as u8; 19]);
            engine.on_reply(&reply, &mut link).unwrap();
            seq += 1;
            if seq == SEQUENCE_ERROR {
                seq = 0;
            }
        }
        assert_eq!(engine.state(), DownloadState::Finished);
    }
}
