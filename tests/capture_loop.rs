use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use rawcap::capture::{
    Decoded, Decoder, DeviceSource, Packet, Picture, PixelFormat, Plane, ReadOutcome,
    StreamDescriptor,
};
use rawcap::error::Result;
use rawcap::pipeline::{
    Backoff, CancelToken, CaptureLoop, CaptureSession, CaptureStats, FileSink, FrameSink,
    LoopState, Termination, Waiter,
};
use rawcap::CaptureError;

const WIDTH: u32 = 2;
const HEIGHT: u32 = 2;
const FRAME: usize = (WIDTH * HEIGHT) as usize;

type Log = Rc<RefCell<Vec<&'static str>>>;

fn descriptor() -> StreamDescriptor {
    StreamDescriptor {
        stream_index: 0,
        width: WIDTH,
        height: HEIGHT,
        format: PixelFormat::Gray,
        codec: "h264".into(),
    }
}

fn packet(sequence: u64) -> ReadOutcome {
    ReadOutcome::Packet(Packet::new(vec![0u8, 0, 0, 1, sequence as u8], 0, sequence))
}

struct ScriptedSource {
    descriptor: StreamDescriptor,
    script: VecDeque<Result<ReadOutcome>>,
    log: Log,
}

impl ScriptedSource {
    fn new(script: Vec<Result<ReadOutcome>>, log: &Log) -> Self {
        Self {
            descriptor: descriptor(),
            script: script.into(),
            log: log.clone(),
        }
    }
}

impl DeviceSource for ScriptedSource {
    fn descriptor(&self) -> &StreamDescriptor {
        &self.descriptor
    }

    fn read_packet(&mut self) -> Result<ReadOutcome> {
        self.script
            .pop_front()
            .unwrap_or(Ok(ReadOutcome::EndOfStream))
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.log.borrow_mut().push("source released");
    }
}

enum Step {
    Picture(u8),
    NeedsMore,
    Fail,
    /// A picture whose geometry does not match the stream
    Misshapen,
}

struct ScriptedDecoder {
    steps: VecDeque<Step>,
    /// Pictures still held when the stream ends
    buffered: VecDeque<u8>,
    frame: Vec<u8>,
    fail_flush: bool,
    log: Log,
}

impl ScriptedDecoder {
    fn new(steps: Vec<Step>, buffered: Vec<u8>, log: &Log) -> Self {
        Self {
            steps: steps.into(),
            buffered: buffered.into(),
            frame: vec![0; FRAME],
            fail_flush: false,
            log: log.clone(),
        }
    }

    fn picture(&self) -> Picture<'_> {
        Picture::new(
            WIDTH,
            HEIGHT,
            &[Plane {
                data: &self.frame,
                stride: WIDTH as usize,
            }],
        )
    }
}

impl Decoder for ScriptedDecoder {
    fn decode(&mut self, _packet: &Packet) -> Result<Decoded<'_>> {
        match self.steps.pop_front().unwrap_or(Step::NeedsMore) {
            Step::Picture(fill) => {
                self.frame.fill(fill);
                Ok(Decoded::Picture(self.picture()))
            }
            Step::NeedsMore => Ok(Decoded::NeedsMorePackets),
            Step::Fail => Err(CaptureError::Decode("invalid data found".into())),
            Step::Misshapen => {
                self.frame.fill(0xee);
                Ok(Decoded::Picture(Picture::new(
                    WIDTH + 2,
                    HEIGHT,
                    &[Plane {
                        data: &self.frame,
                        stride: WIDTH as usize,
                    }],
                )))
            }
        }
    }

    fn flush(&mut self) -> Result<Option<Picture<'_>>> {
        if self.fail_flush {
            return Err(CaptureError::Decode("flush failed".into()));
        }
        match self.buffered.pop_front() {
            Some(fill) => {
                self.frame.fill(fill);
                Ok(Some(self.picture()))
            }
            None => Ok(None),
        }
    }
}

impl Drop for ScriptedDecoder {
    fn drop(&mut self) {
        self.log.borrow_mut().push("decoder released");
    }
}

struct RecordingSink {
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
    fail_writes: bool,
    log: Log,
}

impl RecordingSink {
    fn new(frames: &Rc<RefCell<Vec<Vec<u8>>>>, log: &Log) -> Self {
        Self {
            frames: frames.clone(),
            fail_writes: false,
            log: log.clone(),
        }
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(CaptureError::Write(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.frames.borrow_mut().push(frame.to_vec());
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.log.borrow_mut().push("sink finished");
        Ok(())
    }
}

/// Records requested delays instead of sleeping
#[derive(Default)]
struct RecordingWaiter {
    waits: Vec<Duration>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl Waiter for RecordingWaiter {
    fn wait(&mut self, timeout: Duration) {
        self.waits.push(timeout);
        if let Some((after, token)) = &self.cancel_after {
            if self.waits.len() >= *after {
                token.cancel();
            }
        }
    }
}

struct Harness {
    log: Log,
    frames: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            log: Log::default(),
            frames: Rc::default(),
        }
    }

    fn session(
        &self,
        script: Vec<Result<ReadOutcome>>,
        decoder: ScriptedDecoder,
    ) -> CaptureSession<ScriptedSource, ScriptedDecoder, RecordingSink> {
        CaptureSession::assemble(
            || Ok(ScriptedSource::new(script, &self.log)),
            |_| Ok(decoder),
            |_| Ok(RecordingSink::new(&self.frames, &self.log)),
        )
        .unwrap()
    }

    fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.borrow().clone()
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.borrow().clone()
    }
}

fn capture_loop(waiter: RecordingWaiter, cancel: CancelToken) -> CaptureLoop<RecordingWaiter> {
    CaptureLoop::with_waiter(
        waiter,
        Backoff::new(Duration::from_millis(1), Duration::from_millis(4)),
        cancel,
    )
}

fn run(
    session: CaptureSession<ScriptedSource, ScriptedDecoder, RecordingSink>,
) -> (Result<CaptureStats>, CaptureLoop<RecordingWaiter>) {
    let mut capture = capture_loop(RecordingWaiter::default(), CancelToken::new());
    let outcome = session.run(&mut capture);
    (outcome, capture)
}

fn frame(fill: u8) -> Vec<u8> {
    vec![fill; FRAME]
}

#[test]
fn each_decoded_picture_is_written_once_in_order() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(
        vec![Step::Picture(1), Step::Picture(2), Step::Picture(3)],
        vec![],
        &h.log,
    );
    let session = h.session(vec![Ok(packet(1)), Ok(packet(2)), Ok(packet(3))], decoder);

    let (outcome, capture) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(h.frames(), vec![frame(1), frame(2), frame(3)]);
    assert_eq!(stats.packets_read, 3);
    assert_eq!(stats.frames_written, 3);
    assert_eq!(
        capture.state(),
        LoopState::Terminated(Termination::EndOfStream)
    );
}

#[test]
fn frames_land_in_the_output_file_back_to_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.output");
    std::fs::write(&path, b"left over from a previous capture").unwrap();

    let log = Log::default();
    let session = CaptureSession::assemble(
        || {
            Ok(ScriptedSource::new(
                vec![Ok(packet(1)), Ok(packet(2))],
                &log,
            ))
        },
        |_| {
            Ok(ScriptedDecoder::new(
                vec![Step::Picture(5), Step::Picture(6)],
                vec![7],
                &log,
            ))
        },
        |d| FileSink::create(&path, d.frame_size(), 0),
    )
    .unwrap();

    let mut capture = capture_loop(RecordingWaiter::default(), CancelToken::new());
    session.run(&mut capture).unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 3 * descriptor().frame_size());
    assert_eq!(written, [frame(5), frame(6), frame(7)].concat());
}

#[test]
fn not_ready_backs_off_instead_of_spinning() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1)], vec![], &h.log);
    let mut script: Vec<Result<ReadOutcome>> = (0..5).map(|_| Ok(ReadOutcome::NotReady)).collect();
    script.push(Ok(packet(1)));
    let session = h.session(script, decoder);

    let (outcome, capture) = run(session);
    let stats = outcome.unwrap();

    let waits = &capture.waiter().waits;
    assert_eq!(waits.len(), 5);
    assert!(waits.iter().all(|w| *w > Duration::ZERO));
    assert!(waits.iter().all(|w| *w <= Duration::from_millis(4)));
    assert!(waits.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(stats.not_ready, 5);
    assert_eq!(stats.waited, waits.iter().sum::<Duration>());
    assert_eq!(h.frames(), vec![frame(1)]);
}

#[test]
fn backoff_restarts_after_a_packet() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1)], vec![], &h.log);
    let script = vec![
        Ok(ReadOutcome::NotReady),
        Ok(ReadOutcome::NotReady),
        Ok(ReadOutcome::NotReady),
        Ok(packet(1)),
        Ok(ReadOutcome::NotReady),
    ];
    let session = h.session(script, decoder);

    let (outcome, capture) = run(session);
    outcome.unwrap();

    let waits = &capture.waiter().waits;
    assert_eq!(
        waits,
        &[1, 2, 4, 1].map(Duration::from_millis).to_vec()
    );
}

#[test]
fn buffered_packets_write_nothing() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(
        vec![Step::NeedsMore, Step::NeedsMore, Step::Picture(9)],
        vec![],
        &h.log,
    );
    let session = h.session(vec![Ok(packet(1)), Ok(packet(2)), Ok(packet(3))], decoder);

    let (outcome, _) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(stats.pending, 2);
    assert_eq!(stats.frames_written, 1);
    assert_eq!(h.frames(), vec![frame(9)]);
}

#[test]
fn undecodable_packet_is_skipped() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(
        vec![Step::Picture(1), Step::Fail, Step::Picture(3)],
        vec![],
        &h.log,
    );
    let session = h.session(vec![Ok(packet(1)), Ok(packet(2)), Ok(packet(3))], decoder);

    let (outcome, capture) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.packets_read, 3);
    assert_eq!(h.frames(), vec![frame(1), frame(3)]);
    assert_eq!(
        capture.state(),
        LoopState::Terminated(Termination::EndOfStream)
    );
}

#[test]
fn misshapen_picture_is_dropped() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(
        vec![Step::Picture(1), Step::Misshapen, Step::Picture(2)],
        vec![],
        &h.log,
    );
    let session = h.session(vec![Ok(packet(1)), Ok(packet(2)), Ok(packet(3))], decoder);

    let (outcome, _) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(stats.decode_errors, 1);
    assert_eq!(h.frames(), vec![frame(1), frame(2)]);
}

#[test]
fn end_of_stream_drains_the_decoder() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(
        vec![Step::NeedsMore, Step::Picture(1)],
        vec![2, 3],
        &h.log,
    );
    let session = h.session(vec![Ok(packet(1)), Ok(packet(2))], decoder);

    let (outcome, capture) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(h.frames(), vec![frame(1), frame(2), frame(3)]);
    assert_eq!(stats.drained, 2);
    assert_eq!(stats.frames_written, 3);
    assert_eq!(
        capture.state(),
        LoopState::Terminated(Termination::EndOfStream)
    );
}

#[test]
fn failed_flush_still_ends_cleanly() {
    let h = Harness::new();
    let mut decoder = ScriptedDecoder::new(vec![Step::Picture(1)], vec![2], &h.log);
    decoder.fail_flush = true;
    let session = h.session(vec![Ok(packet(1))], decoder);

    let (outcome, _) = run(session);
    let stats = outcome.unwrap();

    assert_eq!(stats.frames_written, 1);
    assert_eq!(h.frames(), vec![frame(1)]);
}

#[test]
fn read_failure_stops_the_loop_and_keeps_written_frames() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1), Step::Picture(2)], vec![], &h.log);
    let script = vec![
        Ok(packet(1)),
        Err(CaptureError::Read("device unplugged".into())),
        Ok(packet(2)),
    ];
    let session = h.session(script, decoder);

    let (outcome, capture) = run(session);

    assert!(matches!(outcome, Err(CaptureError::Read(_))));
    assert_eq!(capture.state(), LoopState::Terminated(Termination::Failed));
    assert_eq!(capture.stats().packets_read, 1);
    assert_eq!(h.frames(), vec![frame(1)]);
    assert_eq!(
        h.log(),
        vec!["decoder released", "source released", "sink finished"]
    );
}

#[test]
fn write_failure_is_fatal() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1), Step::Picture(2)], vec![], &h.log);
    let session = CaptureSession::assemble(
        || Ok(ScriptedSource::new(vec![Ok(packet(1)), Ok(packet(2))], &h.log)),
        |_| Ok(decoder),
        |_| {
            let mut sink = RecordingSink::new(&h.frames, &h.log);
            sink.fail_writes = true;
            Ok(sink)
        },
    )
    .unwrap();

    let (outcome, capture) = run(session);

    assert!(matches!(outcome, Err(CaptureError::Write(_))));
    assert_eq!(capture.state(), LoopState::Terminated(Termination::Failed));
    assert_eq!(capture.stats().packets_read, 1);
    assert!(h.frames().is_empty());
}

#[test]
fn cancellation_before_start_reads_nothing() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1)], vec![], &h.log);
    let session = h.session(vec![Ok(packet(1))], decoder);

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut capture = capture_loop(RecordingWaiter::default(), cancel);
    let stats = session.run(&mut capture).unwrap();

    assert_eq!(stats.packets_read, 0);
    assert!(h.frames().is_empty());
    assert_eq!(
        capture.state(),
        LoopState::Terminated(Termination::Cancelled)
    );
}

#[test]
fn cancellation_while_waiting_stops_and_drains() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::NeedsMore], vec![4], &h.log);
    let mut script = vec![Ok(packet(1))];
    script.extend((0..100).map(|_| Ok(ReadOutcome::NotReady)));
    let session = h.session(script, decoder);

    let cancel = CancelToken::new();
    let waiter = RecordingWaiter {
        waits: Vec::new(),
        cancel_after: Some((3, cancel.clone())),
    };
    let mut capture = capture_loop(waiter, cancel);
    let stats = session.run(&mut capture).unwrap();

    assert_eq!(capture.waiter().waits.len(), 3);
    assert_eq!(stats.not_ready, 3);
    assert_eq!(h.frames(), vec![frame(4)]);
    assert_eq!(
        capture.state(),
        LoopState::Terminated(Termination::Cancelled)
    );
}

#[test]
fn teardown_releases_decoder_then_source_then_sink() {
    let h = Harness::new();
    let decoder = ScriptedDecoder::new(vec![Step::Picture(1)], vec![], &h.log);
    let session = h.session(vec![Ok(packet(1))], decoder);

    let (outcome, _) = run(session);
    outcome.unwrap();

    assert_eq!(
        h.log(),
        vec!["decoder released", "source released", "sink finished"]
    );
}

mod setup {
    use super::*;

    type Session = CaptureSession<ScriptedSource, ScriptedDecoder, FileSink>;

    struct Output {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
    }

    fn output() -> Output {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camera.output");
        Output { _dir: dir, path }
    }

    #[test]
    fn source_failures_acquire_nothing() {
        let failures = [
            CaptureError::DriverNotFound("video4linux2".into()),
            CaptureError::ContextAlloc,
            CaptureError::DeviceOpen {
                device: "/dev/video9".into(),
                reason: "No such file or directory".into(),
            },
            CaptureError::StreamInfo("could not find codec parameters".into()),
            CaptureError::NoVideoStream,
        ];

        for failure in failures {
            let expected = failure.to_string();
            let log = Log::default();
            let out = output();
            let mut decoder_opened = false;

            let err = Session::assemble(
                || Err(failure),
                |_| {
                    decoder_opened = true;
                    Ok(ScriptedDecoder::new(vec![], vec![], &log))
                },
                |d| FileSink::create(&out.path, d.frame_size(), 0),
            )
            .err()
            .unwrap();

            assert_eq!(err.to_string(), expected);
            assert!(!decoder_opened);
            assert!(log.borrow().is_empty());
            assert!(!out.path.exists());
        }
    }

    #[test]
    fn decoder_failure_releases_the_source() {
        let failures = [
            CaptureError::CodecNotFound("hevc".into()),
            CaptureError::CodecOpen("Invalid argument".into()),
        ];

        for failure in failures {
            let expected = failure.to_string();
            let log = Log::default();
            let out = output();

            let err = Session::assemble(
                || Ok(ScriptedSource::new(vec![], &log)),
                |_| Err(failure),
                |d| FileSink::create(&out.path, d.frame_size(), 0),
            )
            .err()
            .unwrap();

            assert_eq!(err.to_string(), expected);
            assert_eq!(*log.borrow(), vec!["source released"]);
            assert!(!out.path.exists());
        }
    }

    #[test]
    fn buffer_failure_releases_decoder_then_source() {
        let log = Log::default();
        let out = output();

        let mut empty = ScriptedSource::new(vec![], &log);
        empty.descriptor.width = 0;

        let err = Session::assemble(
            || Ok(empty),
            |_| Ok(ScriptedDecoder::new(vec![], vec![], &log)),
            |d| FileSink::create(&out.path, d.frame_size(), 0),
        )
        .err()
        .unwrap();

        assert!(matches!(err, CaptureError::BufferAlloc { .. }));
        assert_eq!(*log.borrow(), vec!["decoder released", "source released"]);
        assert!(!out.path.exists());
    }

    #[test]
    fn output_failure_releases_decoder_then_source() {
        let log = Log::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("camera.output");

        let err = Session::assemble(
            || Ok(ScriptedSource::new(vec![], &log)),
            |_| Ok(ScriptedDecoder::new(vec![], vec![], &log)),
            |d| FileSink::create(&path, d.frame_size(), 0),
        )
        .err()
        .unwrap();

        assert!(matches!(err, CaptureError::OutputOpen { .. }));
        assert_eq!(*log.borrow(), vec!["decoder released", "source released"]);
    }

    #[test]
    fn assembled_session_reports_stream_geometry() {
        let log = Log::default();
        let out = output();

        let session = Session::assemble(
            || Ok(ScriptedSource::new(vec![], &log)),
            |_| Ok(ScriptedDecoder::new(vec![], vec![], &log)),
            |d| FileSink::create(&out.path, d.frame_size(), 0),
        )
        .unwrap();

        assert_eq!(session.descriptor(), &descriptor());
        assert_eq!(session.frame_size(), FRAME);
        assert!(out.path.exists());
        session.close().unwrap();
    }
}
