//! Transfer lifecycle: status machine, byte accounting and the copy loop.
//!
//! A transfer is the object the application holds. It wraps the stream
//! method the negotiator selects, tracks status transitions and byte
//! counts, and (in the managed modes) performs the actual copy on a
//! spawned worker task. Status moves are compare-and-set: an illegal
//! transition is rejected, never silently coerced, so concurrent callers
//! cannot reorder the negotiate/establish/copy phases.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{Error, ErrorKind, Result};
use crate::jid::Jid;
use crate::method::{ByteSink, ByteSource, StreamMethod, StreamSession};
use crate::negotiator::TransferNegotiator;
use crate::stanza::{ErrorCondition, Payload, Stanza};

/// Read/write buffer of the copy loop.
const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// Which role this endpoint plays in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing has happened yet.
    Initial,
    /// The offer is being negotiated with the peer.
    NegotiatingTransfer,
    /// The peer explicitly declined the offer (outgoing only).
    Refused,
    /// The stream is being negotiated over the chosen method.
    NegotiatingStream,
    /// Stream obtained; copying has not begun.
    Negotiated,
    /// Bytes are moving.
    InProgress,
    /// All bytes copied successfully.
    Complete,
    /// The transfer failed; see the recorded error kind and cause.
    Error,
    /// The user cancelled the transfer.
    Cancelled,
}

impl Status {
    /// True once the transfer can no longer make progress.
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Status::Complete | Status::Error | Status::Cancelled | Status::Refused
        )
    }

    /// The legal forward moves. Error and cancellation are reachable from
    /// every non-terminal state; terminal states admit no exits.
    fn may_become(self, next: Status) -> bool {
        use Status::*;
        if self.is_done() {
            return false;
        }
        match (self, next) {
            (_, Error) | (_, Cancelled) => true,
            (Initial, NegotiatingTransfer) => true,
            (NegotiatingTransfer, NegotiatingStream) => true,
            (NegotiatingTransfer, Refused) => true,
            (NegotiatingStream, Negotiated) => true,
            (Negotiated, InProgress) => true,
            (InProgress, Complete) => true,
            _ => false,
        }
    }
}

/// Watch-backed state cell with compare-and-set transitions.
pub struct StatusCell {
    tx: watch::Sender<Status>,
}

impl StatusCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Status::Initial);
        Self { tx }
    }

    pub fn get(&self) -> Status {
        *self.tx.borrow()
    }

    /// Moves `from` to `to` if and only if the cell currently holds `from`
    /// and the move is legal. Returns whether the transition happened; on
    /// failure the state is unchanged.
    pub fn transition(&self, from: Status, to: Status) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|current| {
            if *current == from && from.may_become(to) {
                *current = to;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    /// Moves any non-terminal state to `to`. Used for the any-state error
    /// and cancellation edges.
    fn force(&self, to: Status) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|current| {
            if current.may_become(to) {
                *current = to;
                moved = true;
                true
            } else {
                false
            }
        });
        moved
    }

    /// Observes status changes; used by the application thread and the
    /// event-driven send mode.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.tx.subscribe()
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct FileInfo {
    name: String,
    size: u64,
    path: Option<PathBuf>,
}

pub(crate) struct TransferCore {
    peer: Jid,
    sid: String,
    direction: Direction,
    status: StatusCell,
    written: AtomicU64,
    file: StdMutex<FileInfo>,
    failure: StdMutex<Option<(ErrorKind, Arc<Error>)>>,
}

impl TransferCore {
    fn new(peer: Jid, sid: String, direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            peer,
            sid,
            direction,
            status: StatusCell::new(),
            written: AtomicU64::new(0),
            file: StdMutex::new(FileInfo::default()),
            failure: StdMutex::new(None),
        })
    }

    fn set_file_info(&self, name: &str, size: u64, path: Option<PathBuf>) {
        let mut file = self.file.lock().unwrap();
        file.name = name.to_string();
        file.size = size;
        file.path = path;
    }

    fn file_size(&self) -> u64 {
        self.file.lock().unwrap().size
    }

    /// Records the first failure and moves the transfer to the error
    /// state. Returns the shared cause for callers that also raise it.
    fn fail(&self, kind: ErrorKind, error: Error) -> Arc<Error> {
        let error = Arc::new(error);
        {
            let mut slot = self.failure.lock().unwrap();
            if slot.is_none() {
                *slot = Some((kind, Arc::clone(&error)));
            }
        }
        self.status.force(Status::Error);
        tracing::debug!(sid = %self.sid, %kind, %error, "transfer failed");
        error
    }
}

/// Cloneable observer handle onto one transfer.
#[derive(Clone)]
pub struct Transfer {
    core: Arc<TransferCore>,
}

impl Transfer {
    pub fn peer(&self) -> &Jid {
        &self.core.peer
    }

    pub fn stream_id(&self) -> &str {
        &self.core.sid
    }

    pub fn direction(&self) -> Direction {
        self.core.direction
    }

    pub fn status(&self) -> Status {
        self.core.status.get()
    }

    /// True iff the status is complete, error, cancelled or refused.
    pub fn is_done(&self) -> bool {
        self.status().is_done()
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.core.status.subscribe()
    }

    pub fn file_name(&self) -> String {
        self.core.file.lock().unwrap().name.clone()
    }

    pub fn file_size(&self) -> u64 {
        self.core.file_size()
    }

    /// Local path of the file, for the managed file modes.
    pub fn file_path(&self) -> Option<PathBuf> {
        self.core.file.lock().unwrap().path.clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.core.written.load(Ordering::Relaxed)
    }

    /// Fraction of the file moved so far, clamped to 0 while undefined.
    pub fn progress(&self) -> f64 {
        let size = self.file_size();
        if size == 0 {
            return if self.status() == Status::Complete {
                1.0
            } else {
                0.0
            };
        }
        (self.bytes_written() as f64 / size as f64).clamp(0.0, 1.0)
    }

    /// The error classifier, once the transfer is in the error state.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.core.failure.lock().unwrap().as_ref().map(|(k, _)| *k)
    }

    /// The failure that caused the error state, for diagnostics.
    pub fn cause(&self) -> Option<Arc<Error>> {
        self.core
            .failure
            .lock()
            .unwrap()
            .as_ref()
            .map(|(_, e)| Arc::clone(e))
    }

    /// Cancels the transfer. Cooperative: the copy loop observes the
    /// cancelled state once per buffer, so latency is bounded by one
    /// buffer's IO time. Never records an error.
    pub fn cancel(&self) {
        if self.core.status.force(Status::Cancelled) {
            tracing::debug!(sid = %self.core.sid, "transfer cancelled");
        }
    }
}

/// Events emitted by the event-driven outgoing send mode.
pub enum TransferEvent {
    /// The transfer moved to a new status.
    StatusChanged(Status),
    /// Negotiation finished; the caller now owns the write end.
    StreamReady(ByteSink),
    /// Negotiation or copying failed with the given classifier.
    Failed(ErrorKind),
}

/// Copies reader to writer with the fixed buffer, polling for
/// cancellation each iteration and classifying a byte-count shortfall as
/// a connection error (a peer that disconnected mid-transfer).
async fn copy_stream<R, W>(core: &TransferCore, reader: &mut R, writer: &mut W)
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let expected = core.file_size();
    let mut buf = [0u8; COPY_BUFFER_SIZE];
    loop {
        if core.status.get() == Status::Cancelled {
            break;
        }
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                core.fail(ErrorKind::Stream, Error::Io(e));
                return;
            }
        };
        if n == 0 {
            break;
        }
        if let Err(e) = writer.write_all(&buf[..n]).await {
            core.fail(ErrorKind::Stream, Error::Io(e));
            return;
        }
        core.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    let written = core.written.load(Ordering::Relaxed);
    let failed = core.failure.lock().unwrap().is_some();
    if core.status.get() != Status::Cancelled && !failed && written != expected {
        core.fail(
            ErrorKind::Connection,
            Error::Truncated { written, expected },
        );
    }
}

/// Runs the in-progress phase of a managed transfer.
async fn run_copy<R, W>(core: &TransferCore, mut reader: R, mut writer: W)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !core.status.transition(Status::Negotiated, Status::InProgress) {
        return;
    }
    copy_stream(core, &mut reader, &mut writer).await;
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
    core.status.transition(Status::InProgress, Status::Complete);
}

/// An inbound transfer, created by accepting an offer.
#[derive(Clone)]
pub struct IncomingTransfer {
    transfer: Transfer,
    negotiator: Arc<TransferNegotiator>,
    offer: Stanza,
}

impl IncomingTransfer {
    pub(crate) fn new(offer: Stanza, negotiator: Arc<TransferNegotiator>) -> Self {
        let core = TransferCore::new(
            offer.from.clone(),
            offer.payload.sid().unwrap_or_default().to_string(),
            Direction::Incoming,
        );
        if let Payload::Offer(details) = &offer.payload {
            core.set_file_info(&details.file_name, details.file_size, None);
        }
        Self {
            transfer: Transfer { core },
            negotiator,
            offer,
        }
    }

    /// Observer handle shared with the application.
    pub fn transfer(&self) -> Transfer {
        self.transfer.clone()
    }

    pub fn status(&self) -> Status {
        self.transfer.status()
    }

    pub fn progress(&self) -> f64 {
        self.transfer.progress()
    }

    pub fn cancel(&self) {
        self.transfer.cancel()
    }

    /// Negotiates the stream and returns its read end; the caller manages
    /// the copying itself.
    pub async fn recv(&self) -> Result<ByteSource> {
        let core = &self.transfer.core;
        if !core
            .status
            .transition(Status::Initial, Status::NegotiatingTransfer)
        {
            return Err(Error::IllegalState(
                "negotiation has already been attempted on this transfer".to_string(),
            ));
        }

        let method = match self.negotiator.select_method(&self.offer) {
            Ok(method) => method,
            Err(e) => return Err(Error::Shared(core.fail(e.kind(), e))),
        };
        if !core
            .status
            .transition(Status::NegotiatingTransfer, Status::NegotiatingStream)
        {
            return Err(Error::Cancelled);
        }

        let source = match self.negotiator.initiate_incoming(&method, &self.offer).await {
            Ok(source) => source,
            Err(e) => return Err(Error::Shared(core.fail(e.kind(), e))),
        };
        if !core
            .status
            .transition(Status::NegotiatingStream, Status::Negotiated)
        {
            return Err(Error::Cancelled);
        }
        Ok(source)
    }

    /// Fully managed mode: negotiates and copies the stream into `path`
    /// on a worker task, updating status as it goes.
    pub fn recv_file(&self, path: impl AsRef<Path>) -> JoinHandle<()> {
        let this = self.clone();
        let path = path.as_ref().to_path_buf();
        tokio::spawn(async move {
            let core = &this.transfer.core;
            {
                let mut file = core.file.lock().unwrap();
                file.path = Some(path.clone());
            }
            let dest = match tokio::fs::File::create(&path).await {
                Ok(dest) => dest,
                Err(e) => {
                    core.fail(ErrorKind::BadFile, Error::Io(e));
                    return;
                }
            };
            let source = match this.recv().await {
                Ok(source) => source,
                // recv already recorded the failure
                Err(_) => return,
            };
            run_copy(core, source, dest).await;
        })
    }
}

/// An outbound transfer towards one peer.
#[derive(Clone)]
pub struct OutgoingTransfer {
    transfer: Transfer,
    negotiator: Arc<TransferNegotiator>,
}

impl OutgoingTransfer {
    pub(crate) fn new(peer: Jid, sid: String, negotiator: Arc<TransferNegotiator>) -> Self {
        let core = TransferCore::new(peer, sid, Direction::Outgoing);
        Self {
            transfer: Transfer { core },
            negotiator,
        }
    }

    /// Observer handle shared with the application.
    pub fn transfer(&self) -> Transfer {
        self.transfer.clone()
    }

    pub fn status(&self) -> Status {
        self.transfer.status()
    }

    pub fn progress(&self) -> f64 {
        self.transfer.progress()
    }

    pub fn cancel(&self) {
        self.transfer.cancel()
    }

    /// Synchronous mode: blocks until the stream is negotiated, then hands
    /// the write end to the caller, who manages the copying.
    pub async fn send(
        &self,
        file_name: &str,
        file_size: u64,
        description: &str,
    ) -> Result<ByteSink> {
        self.transfer
            .core
            .set_file_info(file_name, file_size, None);
        self.negotiate_sink(file_name, file_size, description).await
    }

    /// Event-driven mode: negotiation runs on a worker task; the returned
    /// channel carries status changes, the negotiated stream and failures.
    pub fn send_with_events(
        &self,
        file_name: &str,
        file_size: u64,
        description: &str,
    ) -> mpsc::UnboundedReceiver<TransferEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        // status forwarding
        let mut status_rx = self.transfer.core.status.subscribe();
        let status_tx = tx.clone();
        tokio::spawn(async move {
            loop {
                let status = *status_rx.borrow_and_update();
                if status_tx.send(TransferEvent::StatusChanged(status)).is_err() {
                    break;
                }
                if status.is_done() {
                    break;
                }
                if status_rx.changed().await.is_err() {
                    break;
                }
            }
        });

        let this = self.clone();
        let file_name = file_name.to_string();
        let description = description.to_string();
        tokio::spawn(async move {
            this.transfer
                .core
                .set_file_info(&file_name, file_size, None);
            match this
                .negotiate_sink(&file_name, file_size, &description)
                .await
            {
                Ok(sink) => {
                    let _ = tx.send(TransferEvent::StreamReady(sink));
                }
                Err(_) => {
                    if let Some(kind) = this.transfer.error_kind() {
                        let _ = tx.send(TransferEvent::Failed(kind));
                    }
                }
            }
        });
        rx
    }

    /// Fully managed mode: negotiates and streams a local file on a
    /// worker task.
    pub fn send_file(&self, path: impl AsRef<Path>, description: &str) -> JoinHandle<()> {
        let this = self.clone();
        let path = path.as_ref().to_path_buf();
        let description = description.to_string();
        tokio::spawn(async move {
            let core = &this.transfer.core;
            let meta = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => {
                    core.fail(
                        ErrorKind::BadFile,
                        Error::IllegalState(format!("{} is not a regular file", path.display())),
                    );
                    return;
                }
                Err(e) => {
                    core.fail(ErrorKind::BadFile, Error::Io(e));
                    return;
                }
            };
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            core.set_file_info(&name, meta.len(), Some(path.clone()));

            let sink = match this.negotiate_sink(&name, meta.len(), &description).await {
                Ok(sink) => sink,
                Err(_) => return,
            };
            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    core.fail(ErrorKind::BadFile, Error::Io(e));
                    return;
                }
            };
            run_copy(core, file, sink).await;
        })
    }

    /// Fully managed mode over an arbitrary reader whose length is known.
    pub fn send_reader(
        &self,
        reader: ByteSource,
        file_name: &str,
        file_size: u64,
        description: &str,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let file_name = file_name.to_string();
        let description = description.to_string();
        tokio::spawn(async move {
            let core = &this.transfer.core;
            core.set_file_info(&file_name, file_size, None);
            let sink = match this
                .negotiate_sink(&file_name, file_size, &description)
                .await
            {
                Ok(sink) => sink,
                Err(_) => return,
            };
            run_copy(core, reader, sink).await;
        })
    }

    async fn negotiate_sink(
        &self,
        file_name: &str,
        file_size: u64,
        description: &str,
    ) -> Result<ByteSink> {
        let core = &self.transfer.core;
        if !core
            .status
            .transition(Status::Initial, Status::NegotiatingTransfer)
        {
            return Err(Error::IllegalState(
                "negotiation has already been attempted on this transfer".to_string(),
            ));
        }

        let timeout = self.negotiator.config().response_timeout;
        let method = match self
            .negotiator
            .negotiate_outgoing(
                &core.peer,
                &core.sid,
                file_name,
                file_size,
                description,
                timeout,
            )
            .await
        {
            Ok(Some(method)) => method,
            Ok(None) => {
                let cause = core.fail(
                    ErrorKind::NoResponse,
                    Error::ReplyTimeout("transfer offer", timeout),
                );
                return Err(Error::Shared(cause));
            }
            // an explicit decline is a refusal, not an error
            Err(Error::Remote(e)) if e.condition == ErrorCondition::Forbidden => {
                core.status
                    .transition(Status::NegotiatingTransfer, Status::Refused);
                return Err(Error::Remote(e));
            }
            Err(e) => return Err(Error::Shared(core.fail(e.kind(), e))),
        };
        if !core
            .status
            .transition(Status::NegotiatingTransfer, Status::NegotiatingStream)
        {
            return Err(Error::Cancelled);
        }

        let session = StreamSession::new(
            core.sid.clone(),
            self.negotiator.connection().local_jid().clone(),
            core.peer.clone(),
        );
        let sink = match method.open_outgoing(&session).await {
            Ok(sink) => sink,
            Err(e) => return Err(Error::Shared(core.fail(e.kind(), e))),
        };
        if !core
            .status
            .transition(Status::NegotiatingStream, Status::Negotiated)
        {
            return Err(Error::Cancelled);
        }
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ALL_STATES: [Status; 9] = [
        Status::Initial,
        Status::NegotiatingTransfer,
        Status::Refused,
        Status::NegotiatingStream,
        Status::Negotiated,
        Status::InProgress,
        Status::Complete,
        Status::Error,
        Status::Cancelled,
    ];

    fn core_for_copy(size: u64) -> Arc<TransferCore> {
        let core = TransferCore::new(
            Jid::parse("peer@x/r").unwrap(),
            "s1".to_string(),
            Direction::Outgoing,
        );
        core.set_file_info("payload.bin", size, None);
        // drive to the state the copy loop starts from
        assert!(core
            .status
            .transition(Status::Initial, Status::NegotiatingTransfer));
        assert!(core
            .status
            .transition(Status::NegotiatingTransfer, Status::NegotiatingStream));
        assert!(core
            .status
            .transition(Status::NegotiatingStream, Status::Negotiated));
        core
    }

    #[test]
    fn only_table_transitions_are_accepted() {
        use Status::*;
        let legal = |from: Status, to: Status| -> bool {
            matches!(
                (from, to),
                (Initial, NegotiatingTransfer)
                    | (NegotiatingTransfer, NegotiatingStream)
                    | (NegotiatingTransfer, Refused)
                    | (NegotiatingStream, Negotiated)
                    | (Negotiated, InProgress)
                    | (InProgress, Complete)
            ) || (!from.is_done() && matches!(to, Error | Cancelled))
        };

        for from in ALL_STATES {
            for to in ALL_STATES {
                let cell = StatusCell::new();
                // drive the cell to `from` through the error/cancel edge
                // or the forward chain
                force_state(&cell, from);
                assert_eq!(cell.get(), from, "setup failed for {:?}", from);

                let moved = cell.transition(from, to);
                assert_eq!(
                    moved,
                    legal(from, to),
                    "transition {:?} -> {:?}",
                    from,
                    to
                );
                if moved {
                    assert_eq!(cell.get(), to);
                } else {
                    assert_eq!(cell.get(), from, "failed transition must not move the cell");
                }
            }
        }
    }

    fn force_state(cell: &StatusCell, target: Status) {
        use Status::*;
        match target {
            Refused => {
                assert!(cell.transition(Initial, NegotiatingTransfer));
                assert!(cell.transition(NegotiatingTransfer, Refused));
            }
            Error | Cancelled => {
                assert!(cell.force(target));
            }
            _ => {
                let chain = [
                    Initial,
                    NegotiatingTransfer,
                    NegotiatingStream,
                    Negotiated,
                    InProgress,
                    Complete,
                ];
                let position = chain.iter().position(|s| *s == target).unwrap();
                for pair in chain[..=position].windows(2) {
                    assert!(cell.transition(pair[0], pair[1]));
                }
            }
        }
    }

    #[test]
    fn stale_compare_and_set_fails() {
        let cell = StatusCell::new();
        assert!(cell.transition(Status::Initial, Status::NegotiatingTransfer));
        // a second caller still holding the old observation loses
        assert!(!cell.transition(Status::Initial, Status::NegotiatingTransfer));
        assert_eq!(cell.get(), Status::NegotiatingTransfer);
    }

    #[test]
    fn is_done_covers_exactly_the_terminal_states() {
        for state in ALL_STATES {
            let expected = matches!(
                state,
                Status::Complete | Status::Error | Status::Cancelled | Status::Refused
            );
            assert_eq!(state.is_done(), expected, "{:?}", state);
        }
    }

    #[test]
    fn cancel_never_records_an_error() {
        let core = TransferCore::new(
            Jid::parse("peer@x/r").unwrap(),
            "s1".to_string(),
            Direction::Outgoing,
        );
        let transfer = Transfer { core };
        transfer.cancel();
        assert_eq!(transfer.status(), Status::Cancelled);
        assert!(transfer.error_kind().is_none());
        assert!(transfer.cause().is_none());
    }

    #[test]
    fn progress_is_zero_while_undefined() {
        let core = TransferCore::new(
            Jid::parse("peer@x/r").unwrap(),
            "s1".to_string(),
            Direction::Outgoing,
        );
        let transfer = Transfer { core };
        assert_eq!(transfer.progress(), 0.0);
    }

    #[tokio::test]
    async fn complete_copy_moves_every_byte() {
        let core = core_for_copy(24);
        let payload = b"This is a test transfer!".to_vec();
        assert_eq!(payload.len(), 24);

        let (mut tx, rx) = tokio::io::duplex(64);
        let writer_task = tokio::spawn(async move {
            tx.write_all(&payload).await.unwrap();
            tx.shutdown().await.unwrap();
        });

        let mut out = std::io::Cursor::new(Vec::new());
        run_copy(&core, rx, &mut out).await;
        writer_task.await.unwrap();

        assert_eq!(core.status.get(), Status::Complete);
        assert_eq!(core.written.load(Ordering::Relaxed), 24);
        assert_eq!(out.get_ref().len(), 24);
    }

    #[tokio::test]
    async fn short_stream_classifies_as_connection_error() {
        let core = core_for_copy(24);

        let (mut tx, rx) = tokio::io::duplex(64);
        tokio::spawn(async move {
            tx.write_all(b"only ten b").await.unwrap();
            tx.shutdown().await.unwrap();
            // dropping tx ends the stream early
        });

        let mut out = std::io::Cursor::new(Vec::new());
        run_copy(&core, rx, &mut out).await;

        assert_eq!(core.status.get(), Status::Error);
        let transfer = Transfer {
            core: Arc::clone(&core),
        };
        assert_eq!(transfer.error_kind(), Some(ErrorKind::Connection));
        assert_ne!(transfer.bytes_written(), 24);
    }

    #[tokio::test]
    async fn cancellation_stops_the_copy_without_an_error() {
        let core = core_for_copy(1 << 30);
        let transfer = Transfer {
            core: Arc::clone(&core),
        };

        // a reader that produces data forever
        let (mut tx, rx) = tokio::io::duplex(COPY_BUFFER_SIZE);
        let feeder = tokio::spawn(async move {
            let chunk = [0u8; 1024];
            while tx.write_all(&chunk).await.is_ok() {}
        });

        let copy_core = Arc::clone(&core);
        let copy_task =
            tokio::spawn(async move { run_copy(&copy_core, rx, tokio::io::sink()).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transfer.cancel();

        tokio::time::timeout(Duration::from_secs(2), copy_task)
            .await
            .expect("copy loop must observe cancellation promptly")
            .unwrap();
        assert_eq!(transfer.status(), Status::Cancelled);
        assert!(transfer.error_kind().is_none());
        feeder.abort();
    }

    #[tokio::test]
    async fn progress_tracks_the_byte_counter() {
        let core = core_for_copy(100);
        core.written.store(25, Ordering::Relaxed);
        let transfer = Transfer { core };
        assert!((transfer.progress() - 0.25).abs() < f64::EPSILON);
    }
}
