//! The read → decode → materialize → write loop

use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, trace, warn};

use crate::capture::{Decoded, Decoder, DeviceSource, Picture, ReadOutcome};
use crate::error::Result;
use crate::pipeline::materialize::FrameBuffer;
use crate::pipeline::session::CaptureSession;
use crate::pipeline::sink::FrameSink;
use crate::pipeline::wait::{Backoff, CancelToken, SleepWaiter, Waiter};

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    EndOfStream,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// No more packets; pictures still buffered in the decoder are written out
    Draining(Termination),
    Terminated(Termination),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub packets_read: u64,
    pub frames_written: u64,
    /// Packets or pictures dropped because they could not be decoded or laid out
    pub decode_errors: u64,
    /// Packets the decoder kept without producing a picture
    pub pending: u64,
    pub not_ready: u64,
    /// Frames written while draining the decoder
    pub drained: u64,
    pub waited: Duration,
}

/// Drives a session until end of stream, cancellation, or a fatal error.
///
/// `NotReady` reads wait through `W` with exponential back-off instead of spinning.
pub struct CaptureLoop<W = SleepWaiter> {
    waiter: W,
    backoff: Backoff,
    cancel: CancelToken,
    state: LoopState,
    stats: CaptureStats,
}

impl CaptureLoop<SleepWaiter> {
    pub fn new(backoff: Backoff, cancel: CancelToken) -> Self {
        Self::with_waiter(SleepWaiter, backoff, cancel)
    }
}

impl<W: Waiter> CaptureLoop<W> {
    pub fn with_waiter(waiter: W, backoff: Backoff, cancel: CancelToken) -> Self {
        Self {
            waiter,
            backoff,
            cancel,
            state: LoopState::Running,
            stats: CaptureStats::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    pub fn waiter(&self) -> &W {
        &self.waiter
    }

    #[instrument(skip_all)]
    pub fn run<S, D, K>(&mut self, session: &mut CaptureSession<S, D, K>) -> Result<CaptureStats>
    where
        S: DeviceSource,
        D: Decoder,
        K: FrameSink,
    {
        self.state = LoopState::Running;

        loop {
            let next = match self.state {
                LoopState::Running => self.step(session),
                LoopState::Draining(reason) => self
                    .drain(session)
                    .map(|()| LoopState::Terminated(reason)),
                LoopState::Terminated(reason) => {
                    info!(
                        ?reason,
                        packets = self.stats.packets_read,
                        frames = self.stats.frames_written,
                        decode_errors = self.stats.decode_errors,
                        "capture finished"
                    );
                    return Ok(self.stats.clone());
                }
            };

            match next {
                Ok(state) => self.state = state,
                Err(e) => {
                    error!(error = %e, "capture failed");
                    self.state = LoopState::Terminated(Termination::Failed);
                    return Err(e);
                }
            }
        }
    }

    /// One iteration: cancellation check, read, decode, and at most one frame written
    fn step<S, D, K>(&mut self, session: &mut CaptureSession<S, D, K>) -> Result<LoopState>
    where
        S: DeviceSource,
        D: Decoder,
        K: FrameSink,
    {
        if self.cancel.is_cancelled() {
            info!("capture cancelled, draining decoder");
            return Ok(LoopState::Draining(Termination::Cancelled));
        }

        let packet = match session.source.read_packet()? {
            ReadOutcome::Packet(packet) => packet,
            ReadOutcome::NotReady => {
                self.wait_for_data();
                return Ok(LoopState::Running);
            }
            ReadOutcome::EndOfStream => {
                info!("end of stream, draining decoder");
                return Ok(LoopState::Draining(Termination::EndOfStream));
            }
        };

        self.backoff.reset();
        self.stats.packets_read += 1;
        metrics::counter!("rawcap_packets_read").increment(1);

        match session.decoder.decode(&packet) {
            Ok(Decoded::Picture(picture)) => {
                self.emit(&mut session.buffer, &mut session.sink, &picture)?;
            }
            Ok(Decoded::NeedsMorePackets) => {
                trace!(sequence = packet.sequence, "decoder needs more packets");
                self.stats.pending += 1;
            }
            Err(e) if !e.is_fatal() => {
                warn!(
                    sequence = packet.sequence,
                    key = packet.is_key,
                    bytes = packet.data.len(),
                    error = %e,
                    "dropping undecodable packet"
                );
                self.record_decode_error();
            }
            Err(e) => return Err(e),
        }

        Ok(LoopState::Running)
    }

    fn drain<S, D, K>(&mut self, session: &mut CaptureSession<S, D, K>) -> Result<()>
    where
        S: DeviceSource,
        D: Decoder,
        K: FrameSink,
    {
        loop {
            match session.decoder.flush() {
                Ok(Some(picture)) => {
                    if self.emit(&mut session.buffer, &mut session.sink, &picture)? {
                        self.stats.drained += 1;
                    }
                }
                Ok(None) => {
                    debug!(drained = self.stats.drained, "decoder drained");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "decoder flush failed, dropping buffered pictures");
                    return Ok(());
                }
            }
        }
    }

    /// Materialize and write one picture; false when the picture was dropped
    fn emit<K: FrameSink>(
        &mut self,
        buffer: &mut FrameBuffer,
        sink: &mut K,
        picture: &Picture<'_>,
    ) -> Result<bool> {
        match buffer.copy(picture) {
            Ok(()) => {}
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "dropping picture that does not match the stream layout");
                self.record_decode_error();
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        let start = Instant::now();
        sink.write_frame(buffer.as_bytes())?;
        metrics::histogram!("rawcap_frame_write_us").record(start.elapsed().as_micros() as f64);

        self.stats.frames_written += 1;
        metrics::counter!("rawcap_frames_written").increment(1);
        Ok(true)
    }

    fn wait_for_data(&mut self) {
        self.stats.not_ready += 1;
        metrics::counter!("rawcap_not_ready").increment(1);

        if self.cancel.is_cancelled() {
            return;
        }
        let delay = self.backoff.next_delay();
        trace!(?delay, "no packet ready");
        self.waiter.wait(delay);
        self.stats.waited += delay;
    }

    fn record_decode_error(&mut self) {
        self.stats.decode_errors += 1;
        metrics::counter!("rawcap_decode_errors").increment(1);
    }
}
