//! Bulk loop-back test.
//!
//! The bulk test firmware answers every write on the OUT pipe with the
//! one's complement of the written bytes on the IN pipe. The host writes
//! a known message, reads the echo, complements it back and compares.
//!
//! Two drivers exist: [`run_sync`] performs blocking calls inline, and
//! [`run_async`] steps an [`AsyncBulkTest`] state machine with transfer
//! completions on the session's event loop. Which one the router uses is
//! fixed at build time, see [`TestMode::from_build`].

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};

use crate::device::OpenInterface;
use crate::events::{LoaderEvent, LoaderObserver, PacketDirection};
use crate::protocol::constants::{
    BULK_IN_PIPE, BULK_OUT_PIPE, READ_WINDOW, STATUS_ERROR, TRANSFER_BUFFER_SIZE,
};
use crate::transport::{InterfaceControl, PipeRef, TransferCompletion, TransportError};

/// OUT/IN pipe pair used by the test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkPipes {
    pub out: PipeRef,
    pub input: PipeRef,
}

impl Default for BulkPipes {
    fn default() -> Self {
        Self {
            out: PipeRef(BULK_OUT_PIPE),
            input: PipeRef(BULK_IN_PIPE),
        }
    }
}

/// How the bulk test performs its transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// Blocking write then read, inline in the router.
    Sync,
    /// Queued transfers completed on the event loop.
    Async,
}

impl TestMode {
    /// Mode selected by the `async-io` feature.
    pub fn from_build() -> Self {
        if cfg!(feature = "async-io") {
            TestMode::Async
        } else {
            TestMode::Sync
        }
    }
}

#[derive(Error, Debug)]
pub enum BulkTestError {
    #[error("unable to perform bulk write on pipe {pipe} ({:08x})", .source.code())]
    Write {
        pipe: PipeRef,
        #[source]
        source: TransportError,
    },

    #[error("unable to perform bulk read on pipe {pipe} ({:08x})", .source.code())]
    Read {
        pipe: PipeRef,
        #[source]
        source: TransportError,
    },

    #[error("echo mismatch: sent {sent:?}, decoded {received:?}")]
    EchoMismatch { sent: String, received: String },

    #[error("unexpected completion in state {0:?}")]
    Unexpected(AsyncTestState),
}

impl BulkTestError {
    pub fn code(&self) -> u32 {
        match self {
            BulkTestError::Write { source, .. } | BulkTestError::Read { source, .. } => {
                source.code()
            }
            BulkTestError::EchoMismatch { .. } | BulkTestError::Unexpected(_) => STATUS_ERROR,
        }
    }
}

/// Scratch buffer owned by one test run.
///
/// Reads land in the first [`READ_WINDOW`] bytes; the last byte stays zero
/// so the contents are always a terminated string.
pub struct TransferBuffer {
    bytes: [u8; TRANSFER_BUFFER_SIZE],
    len: usize,
}

impl TransferBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; TRANSFER_BUFFER_SIZE],
            len: 0,
        }
    }

    /// Writable read window.
    pub fn window(&mut self) -> &mut [u8] {
        &mut self.bytes[..READ_WINDOW]
    }

    /// Mark `len` bytes of the window as received.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(READ_WINDOW);
    }

    /// Copy received bytes into the window, truncating to fit.
    pub fn fill(&mut self, data: &[u8]) {
        let n = data.len().min(READ_WINDOW);
        self.bytes[..n].copy_from_slice(&data[..n]);
        self.set_len(n);
    }

    /// Undo the firmware's complement on the received bytes.
    pub fn decode(&mut self) {
        complement_in_place(&mut self.bytes[..self.len]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitwise NOT of every byte.
pub fn complement_in_place(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = !*b;
    }
}

/// Successful round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkTestReport {
    pub written: usize,
    pub read: usize,
    /// Decoded echo.
    pub text: String,
}

fn verify(
    message: &[u8],
    written: usize,
    buffer: &TransferBuffer,
) -> Result<BulkTestReport, BulkTestError> {
    if buffer.as_bytes() != message {
        return Err(BulkTestError::EchoMismatch {
            sent: String::from_utf8_lossy(message).into_owned(),
            received: buffer.text(),
        });
    }
    Ok(BulkTestReport {
        written,
        read: buffer.as_bytes().len(),
        text: buffer.text(),
    })
}

fn report_tx<O: LoaderObserver + ?Sized>(
    observer: &O,
    pipe: PipeRef,
    message: &[u8],
    length: usize,
) {
    observer.on_event(&LoaderEvent::Bulk {
        direction: PacketDirection::Tx,
        pipe,
        length,
        text: String::from_utf8_lossy(message).into_owned(),
    });
}

fn report_rx<O: LoaderObserver + ?Sized>(observer: &O, pipe: PipeRef, text: &str, length: usize) {
    observer.on_event(&LoaderEvent::Bulk {
        direction: PacketDirection::Rx,
        pipe,
        length,
        text: text.to_string(),
    });
}

fn report_error<O: LoaderObserver + ?Sized>(observer: &O, err: &BulkTestError) {
    observer.on_event(&LoaderEvent::Error {
        code: err.code(),
        message: err.to_string(),
    });
}

/// Blocking write of `message` then read of its echo.
pub fn run_sync<I, O>(
    interface: &mut I,
    pipes: BulkPipes,
    message: &[u8],
    observer: &O,
) -> Result<BulkTestReport, BulkTestError>
where
    I: InterfaceControl,
    O: LoaderObserver + ?Sized,
{
    let written = interface
        .write_pipe(pipes.out, message)
        .map_err(|source| BulkTestError::Write {
            pipe: pipes.out,
            source,
        })
        .inspect_err(|e| report_error(observer, e))?;
    report_tx(observer, pipes.out, message, written);

    let mut buffer = TransferBuffer::new();
    let read = interface
        .read_pipe(pipes.input, buffer.window())
        .map_err(|source| BulkTestError::Read {
            pipe: pipes.input,
            source,
        })
        .inspect_err(|e| report_error(observer, e))?;
    buffer.set_len(read);
    buffer.decode();
    report_rx(observer, pipes.input, &buffer.text(), read);

    verify(message, written, &buffer).inspect_err(|e| report_error(observer, e))
}

/// Position of an [`AsyncBulkTest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncTestState {
    Idle,
    AwaitingWriteCompletion,
    AwaitingReadCompletion,
    Done,
    Failed,
}

/// Transfer the driver must queue next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeRequest {
    Write { pipe: PipeRef, data: Vec<u8> },
    Read { pipe: PipeRef, len: usize },
}

/// What the driver does after feeding the state machine.
#[derive(Debug)]
pub enum Transition {
    Submit(PipeRequest),
    Complete(BulkTestReport),
    Fail(BulkTestError),
}

/// Write/read continuation for one device, independent of any executor.
#[derive(Debug)]
pub struct AsyncBulkTest {
    pipes: BulkPipes,
    message: Vec<u8>,
    state: AsyncTestState,
    written: usize,
    buffer_text: Option<String>,
}

impl AsyncBulkTest {
    pub fn new(pipes: BulkPipes, message: impl Into<Vec<u8>>) -> Self {
        Self {
            pipes,
            message: message.into(),
            state: AsyncTestState::Idle,
            written: 0,
            buffer_text: None,
        }
    }

    pub fn state(&self) -> AsyncTestState {
        self.state
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    pub fn pipes(&self) -> BulkPipes {
        self.pipes
    }

    /// Decoded echo, once the read has completed.
    pub fn received_text(&self) -> Option<&str> {
        self.buffer_text.as_deref()
    }

    /// Queue the write.
    pub fn start(&mut self) -> Transition {
        if self.state != AsyncTestState::Idle {
            return self.fail(BulkTestError::Unexpected(self.state));
        }
        self.state = AsyncTestState::AwaitingWriteCompletion;
        Transition::Submit(PipeRequest::Write {
            pipe: self.pipes.out,
            data: self.message.clone(),
        })
    }

    /// Feed the completion of the outstanding transfer.
    pub fn on_completion(&mut self, completion: TransferCompletion) -> Transition {
        match self.state {
            AsyncTestState::AwaitingWriteCompletion => match completion.status {
                Ok(()) => {
                    self.written = completion.actual_len;
                    self.state = AsyncTestState::AwaitingReadCompletion;
                    Transition::Submit(PipeRequest::Read {
                        pipe: self.pipes.input,
                        len: READ_WINDOW,
                    })
                }
                Err(source) => self.fail(BulkTestError::Write {
                    pipe: self.pipes.out,
                    source,
                }),
            },
            AsyncTestState::AwaitingReadCompletion => match completion.status {
                Ok(()) => {
                    let mut buffer = TransferBuffer::new();
                    buffer.fill(&completion.data);
                    buffer.decode();
                    self.buffer_text = Some(buffer.text());
                    match verify(&self.message, self.written, &buffer) {
                        Ok(report) => {
                            self.state = AsyncTestState::Done;
                            Transition::Complete(report)
                        }
                        Err(e) => self.fail(e),
                    }
                }
                Err(source) => self.fail(BulkTestError::Read {
                    pipe: self.pipes.input,
                    source,
                }),
            },
            state => self.fail(BulkTestError::Unexpected(state)),
        }
    }

    fn fail(&mut self, err: BulkTestError) -> Transition {
        self.state = AsyncTestState::Failed;
        Transition::Fail(err)
    }
}

/// Drive an [`AsyncBulkTest`] to completion on `interface`.
///
/// The future owns the interface; it is closed and released when the
/// future finishes, on success and on failure alike.
pub async fn run_async<I, O>(
    mut interface: OpenInterface<I>,
    pipes: BulkPipes,
    message: Vec<u8>,
    observer: Arc<O>,
) -> Result<BulkTestReport, BulkTestError>
where
    I: InterfaceControl,
    O: LoaderObserver + ?Sized,
{
    let mut test = AsyncBulkTest::new(pipes, message);
    let mut transition = test.start();

    loop {
        transition = match transition {
            Transition::Submit(PipeRequest::Write { pipe, data }) => {
                debug!(pipe = %pipe, len = data.len(), "Queueing bulk write");
                let completion = interface.write_pipe_async(pipe, data).await;
                if completion.status.is_ok() {
                    report_tx(&*observer, pipe, test.message(), completion.actual_len);
                }
                test.on_completion(completion)
            }
            Transition::Submit(PipeRequest::Read { pipe, len }) => {
                debug!(pipe = %pipe, len, "Queueing bulk read");
                let completion = interface.read_pipe_async(pipe, len).await;
                let read = completion.actual_len;
                let next = test.on_completion(completion);
                if let Some(text) = test.received_text() {
                    report_rx(&*observer, pipe, text, read);
                }
                next
            }
            Transition::Complete(report) => return Ok(report),
            Transition::Fail(err) => {
                error!("{}", err);
                report_error(&*observer, &err);
                return Err(err);
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OpenDevice;
    use crate::events::testing::RecordingObserver;
    use crate::protocol::constants::TEST_MESSAGE;
    use crate::transport::mock::{EchoMode, MockDevice, MockInterface};
    use crate::transport::{
        DeviceControl, DeviceProvider, InterfaceFilter, MockCall, MockDeviceSpec, MockFault,
        MockUsb,
    };

    fn open_interface(
        usb: &MockUsb,
        spec: MockDeviceSpec,
    ) -> (OpenDevice<MockDevice>, OpenInterface<MockInterface>) {
        let mut dev = OpenDevice::open(usb.create_device(spec).unwrap()).unwrap();
        let intf = dev
            .find_interfaces(&InterfaceFilter::dont_care())
            .unwrap()
            .remove(0);
        (dev, OpenInterface::open(intf).unwrap())
    }

    fn complemented(message: &[u8]) -> Vec<u8> {
        message.iter().map(|b| !b).collect()
    }

    #[test]
    fn test_sync_bulk_echo() {
        let usb = MockUsb::new();
        let observer = RecordingObserver::default();
        let (_dev, mut intf) = open_interface(&usb, MockDeviceSpec::bulk_test(1));

        let report = run_sync(&mut *intf, BulkPipes::default(), TEST_MESSAGE, &observer).unwrap();
        assert_eq!(report.written, 13);
        assert_eq!(report.read, 13);
        assert_eq!(report.text, "Bulk I/O Test");
        assert_eq!(observer.received_text(), vec!["Bulk I/O Test".to_string()]);

        let calls = usb.calls_for(1);
        assert!(calls.contains(&MockCall::WritePipe {
            pipe: 2,
            data: TEST_MESSAGE.to_vec()
        }));
        assert!(calls.contains(&MockCall::ReadPipe { pipe: 9, len: 63 }));
    }

    #[test]
    fn test_sync_write_failure_skips_read() {
        let usb = MockUsb::new();
        let observer = RecordingObserver::default();
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces[0].fail_write = Some(MockFault::Stall);
        let (_dev, mut intf) = open_interface(&usb, spec);

        let err = run_sync(&mut *intf, BulkPipes::default(), TEST_MESSAGE, &observer).unwrap_err();
        assert!(matches!(err, BulkTestError::Write { pipe: PipeRef(2), .. }));
        assert_eq!(err.code(), crate::protocol::constants::STATUS_PIPE_STALLED);
        assert!(!usb
            .calls_for(1)
            .iter()
            .any(|c| matches!(c, MockCall::ReadPipe { .. })));
        assert_eq!(observer.errors().len(), 1);
    }

    #[test]
    fn test_sync_echo_mismatch() {
        let usb = MockUsb::new();
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces[0].echo = EchoMode::Verbatim;
        let (_dev, mut intf) = open_interface(&usb, spec);

        let observer = RecordingObserver::default();
        let err = run_sync(&mut *intf, BulkPipes::default(), TEST_MESSAGE, &observer).unwrap_err();
        assert!(matches!(err, BulkTestError::EchoMismatch { .. }));
    }

    #[test]
    fn test_complement_twice_is_identity() {
        for len in 0..=READ_WINDOW {
            let pattern: Vec<u8> = (0..len).map(|i| (i * 37 + 11) as u8).collect();
            let mut bytes = pattern.clone();
            complement_in_place(&mut bytes);
            if len > 0 {
                assert_ne!(bytes, pattern);
            }
            complement_in_place(&mut bytes);
            assert_eq!(bytes, pattern);
        }
    }

    #[test]
    fn test_buffer_window_reserves_terminator() {
        let mut buffer = TransferBuffer::new();
        assert_eq!(buffer.window().len(), 63);
        buffer.fill(&[0x41; 100]);
        assert_eq!(buffer.as_bytes().len(), 63);
        assert_eq!(buffer.bytes[63], 0);
    }

    #[test]
    fn test_async_transitions() {
        let mut test = AsyncBulkTest::new(BulkPipes::default(), TEST_MESSAGE);
        assert_eq!(test.state(), AsyncTestState::Idle);

        match test.start() {
            Transition::Submit(PipeRequest::Write { pipe, data }) => {
                assert_eq!(pipe, PipeRef(2));
                assert_eq!(data, TEST_MESSAGE);
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(test.state(), AsyncTestState::AwaitingWriteCompletion);

        match test.on_completion(TransferCompletion::written(13)) {
            Transition::Submit(PipeRequest::Read { pipe, len }) => {
                assert_eq!(pipe, PipeRef(9));
                assert_eq!(len, 63);
            }
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(test.state(), AsyncTestState::AwaitingReadCompletion);

        let echo = TransferCompletion::received(complemented(TEST_MESSAGE));
        match test.on_completion(echo) {
            Transition::Complete(report) => assert_eq!(report.text, "Bulk I/O Test"),
            other => panic!("unexpected transition {:?}", other),
        }
        assert_eq!(test.state(), AsyncTestState::Done);
        assert_eq!(test.received_text(), Some("Bulk I/O Test"));
    }

    #[test]
    fn test_async_write_failure_stops_scheduling() {
        let mut test = AsyncBulkTest::new(BulkPipes::default(), TEST_MESSAGE);
        test.start();

        let result = test.on_completion(TransferCompletion::failed(TransportError::Aborted));
        assert!(matches!(result, Transition::Fail(BulkTestError::Write { .. })));
        assert_eq!(test.state(), AsyncTestState::Failed);

        // a stray completion after failure schedules nothing
        let stray = test.on_completion(TransferCompletion::written(13));
        assert!(matches!(
            stray,
            Transition::Fail(BulkTestError::Unexpected(AsyncTestState::Failed))
        ));
    }

    #[test]
    fn test_async_completion_before_start() {
        let mut test = AsyncBulkTest::new(BulkPipes::default(), TEST_MESSAGE);
        assert!(matches!(
            test.on_completion(TransferCompletion::written(1)),
            Transition::Fail(BulkTestError::Unexpected(AsyncTestState::Idle))
        ));
    }

    #[tokio::test]
    async fn test_run_async_echo() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let (_dev, intf) = open_interface(&usb, MockDeviceSpec::bulk_test(1));

        let message = TEST_MESSAGE.to_vec();
        let report = run_async(intf, BulkPipes::default(), message, Arc::clone(&observer))
            .await
            .unwrap();
        assert_eq!(report.text, "Bulk I/O Test");
        assert_eq!(observer.received_text(), vec!["Bulk I/O Test".to_string()]);

        let calls = usb.calls_for(1);
        assert!(calls.contains(&MockCall::WritePipeAsync {
            pipe: 2,
            data: TEST_MESSAGE.to_vec()
        }));
        assert!(calls.contains(&MockCall::ReadPipeAsync { pipe: 9, len: 63 }));
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 1);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);
    }

    #[tokio::test]
    async fn test_run_async_read_failure_closes_interface() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces[0].fail_read = Some(MockFault::Timeout);
        let (_dev, intf) = open_interface(&usb, spec);

        let message = TEST_MESSAGE.to_vec();
        let err = run_async(intf, BulkPipes::default(), message, Arc::clone(&observer))
            .await
            .unwrap_err();
        assert!(matches!(err, BulkTestError::Read { pipe: PipeRef(9), .. }));
        assert!(observer.received_text().is_empty());
        assert_eq!(observer.errors(), vec![crate::protocol::constants::STATUS_TIMEOUT]);
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 1);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);
    }

    #[tokio::test]
    async fn test_run_async_write_failure_skips_read() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces[0].fail_write = Some(MockFault::Stall);
        let (_dev, intf) = open_interface(&usb, spec);

        let message = TEST_MESSAGE.to_vec();
        let err = run_async(intf, BulkPipes::default(), message, Arc::clone(&observer))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BulkTestError::Write {
                pipe: PipeRef(2),
                source: TransportError::Stall
            }
        ));

        let calls = usb.calls_for(1);
        assert!(
            !calls
                .iter()
                .any(|c| matches!(c, MockCall::ReadPipeAsync { .. }))
        );
        assert!(observer.received_text().is_empty());
        assert_eq!(observer.errors(), vec![crate::protocol::constants::STATUS_PIPE_STALLED]);
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 1);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);
    }
}
