//! Per-connection receive state machine
//!
//! Each connection is driven by one task that turns socket activity into an
//! ordered stream of [`Event`]s and feeds them to its [`Receiver`] one at a
//! time. The receiver owns the file being assembled and hands it to the
//! write pipeline exactly once, on completion.

use crate::error::IngestError;
use crate::logger::Logger;
use crate::protocol::{MAX_CHUNK_SIZE, MAX_FRAME_LEN};
use crate::protocol_core::{decode, encode_status, read_frame, Frame, Message, Status, StatusReport};
use crate::transfer::FileTransfer;
use crate::writer::WritePipeline;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ReadyToReceive,
    Complete,
    Failed,
}

#[derive(Debug)]
pub enum Event<'a> {
    /// A decoded protocol line
    Message(Message),
    /// Raw file bytes
    Data(&'a [u8]),
    /// Declared size reached (posted by the receiver itself)
    TransferComplete,
    /// Transport closed or failed
    Closed,
}

/// What the driver should do after an event
#[derive(Debug)]
pub enum Flow {
    Continue,
    /// Handle this event next, before reading the socket again
    Post(Event<'static>),
    Close,
}

/// Where completed files go; the write pipeline in production
pub trait Handoff: Send + Sync {
    fn hand_off(&self, transfer: FileTransfer) -> bool;
}

impl Handoff for WritePipeline {
    fn hand_off(&self, transfer: FileTransfer) -> bool {
        self.submit(transfer)
    }
}

pub struct Receiver<W> {
    state: SessionState,
    current: Option<FileTransfer>,
    status_out: W,
    handoff: Arc<dyn Handoff>,
    max_file_size: u64,
    peer: SocketAddr,
    logger: Arc<dyn Logger>,
}

impl<W: AsyncWrite + Unpin> Receiver<W> {
    pub fn new(
        status_out: W,
        handoff: Arc<dyn Handoff>,
        max_file_size: u64,
        peer: SocketAddr,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            current: None,
            status_out,
            handoff,
            max_file_size,
            peer,
            logger,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bytes still expected for the current file (0 when idle)
    pub fn remaining(&self) -> u64 {
        match (self.state, &self.current) {
            (SessionState::ReadyToReceive, Some(t)) => t.remaining(),
            _ => 0,
        }
    }

    /// Handle one event and any events it posts
    pub async fn dispatch(&mut self, event: Event<'_>) -> Result<Flow, IngestError> {
        let mut flow = self.handle(event).await?;
        while let Flow::Post(next) = flow {
            flow = self.handle(next).await?;
        }
        Ok(flow)
    }

    async fn handle(&mut self, event: Event<'_>) -> Result<Flow, IngestError> {
        match event {
            Event::Message(msg) => self.on_message(msg).await,
            Event::Data(bytes) => Ok(self.on_data(bytes)),
            Event::TransferComplete => self.on_complete().await,
            Event::Closed => {
                self.on_close();
                Ok(Flow::Close)
            }
        }
    }

    async fn on_message(&mut self, msg: Message) -> Result<Flow, IngestError> {
        if self.state != SessionState::Idle {
            // the driver never reads lines mid-file
            self.logger
                .fault("Receiver", &format!("<{}> message while receiving data", self.peer));
            return Ok(Flow::Close);
        }
        match msg {
            Message::Announcement(info) => {
                if info.filesize > self.max_file_size {
                    return Err(IngestError::Protocol(crate::error::ProtocolError::BadValue {
                        field: crate::protocol::field::FILESIZE,
                        value: info.filesize.to_string(),
                    }));
                }
                let previous = self.current.take();
                self.current = Some(FileTransfer::reuse_or_allocate(previous, &info));
                self.report(Status::ReadyToReceive).await?;
                if info.filesize == 0 {
                    return Ok(Flow::Post(Event::TransferComplete));
                }
                Ok(Flow::Continue)
            }
            Message::Heartbeat(_) => Ok(Flow::Continue),
        }
    }

    fn on_data(&mut self, bytes: &[u8]) -> Flow {
        if self.state != SessionState::ReadyToReceive {
            self.logger
                .fault("Receiver", &format!("<{}> unexpected raw data", self.peer));
            return Flow::Close;
        }
        match self.current.as_mut() {
            Some(t) => {
                if t.arrive(bytes) {
                    Flow::Post(Event::TransferComplete)
                } else {
                    Flow::Continue
                }
            }
            None => Flow::Close,
        }
    }

    async fn on_complete(&mut self) -> Result<Flow, IngestError> {
        let Some(t) = self.current.as_ref() else {
            self.state = SessionState::Idle;
            return Ok(Flow::Continue);
        };
        if t.is_exact() {
            let identity = self.identity(Status::Complete);
            if let Some(t) = self.current.take() {
                self.handoff.hand_off(t);
            }
            self.send(identity).await?;
        } else {
            let err = IngestError::SizeMismatch {
                declared: t.declared(),
                received: t.received(),
            };
            self.logger.fault("Receiver", &err.to_string());
            self.report(Status::Failed).await?;
        }
        self.state = SessionState::Idle;
        Ok(Flow::Continue)
    }

    fn on_close(&mut self) {
        if let Some(t) = self.current.take() {
            if self.state == SessionState::ReadyToReceive {
                self.logger.warn(&format!(
                    "<{}> closed with <{}> incomplete ({}/{} bytes)",
                    self.peer,
                    t.filename,
                    t.received(),
                    t.declared()
                ));
            }
        }
        self.state = SessionState::Idle;
    }

    fn identity(&self, status: Status) -> StatusReport {
        match &self.current {
            Some(t) => StatusReport {
                status,
                gid: t.gid.clone(),
                uid: t.uid.clone(),
                cid: t.cid.clone(),
                filename: t.filename.clone(),
            },
            None => StatusReport::bare(status),
        }
    }

    async fn report(&mut self, status: Status) -> Result<(), IngestError> {
        let r = self.identity(status);
        self.send(r).await
    }

    async fn send(&mut self, report: StatusReport) -> Result<(), IngestError> {
        self.state = match report.status {
            Status::ReadyToReceive => SessionState::ReadyToReceive,
            Status::Complete => SessionState::Complete,
            Status::Failed => SessionState::Failed,
        };
        let line = encode_status(&report);
        self.status_out
            .write_all(line.as_bytes())
            .await
            .map_err(IngestError::ConnectionLost)?;
        self.status_out
            .flush()
            .await
            .map_err(IngestError::ConnectionLost)
    }
}

/// Drive one connection until it closes, errors or `cancel` fires. Reads
/// only what the current state expects: one line while idle, at most the
/// remaining byte count (capped at [`MAX_CHUNK_SIZE`]) while receiving.
pub async fn run_connection<R, W>(
    mut reader: R,
    receiver: &mut Receiver<W>,
    cancel: CancellationToken,
) -> Result<(), IngestError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        let flow = match receiver.state() {
            SessionState::ReadyToReceive => {
                let want = (receiver.remaining() as usize).min(MAX_CHUNK_SIZE);
                let n = tokio::select! {
                    r = reader.read(&mut chunk[..want]) => r,
                    _ = cancel.cancelled() => Ok(0),
                };
                match n {
                    Ok(0) => receiver.dispatch(Event::Closed).await?,
                    Ok(n) => receiver.dispatch(Event::Data(&chunk[..n])).await?,
                    Err(e) => {
                        receiver.dispatch(Event::Closed).await?;
                        return Err(IngestError::ConnectionLost(e));
                    }
                }
            }
            _ => {
                let frame = tokio::select! {
                    f = read_frame(&mut reader, MAX_FRAME_LEN) => f,
                    _ = cancel.cancelled() => Ok(Frame::Closed),
                };
                match frame {
                    Ok(Frame::Closed) => receiver.dispatch(Event::Closed).await?,
                    Ok(Frame::Line(line)) => match decode(&line) {
                        Ok(msg) => receiver.dispatch(Event::Message(msg)).await?,
                        Err(e) => {
                            receiver.dispatch(Event::Closed).await?;
                            return Err(e.into());
                        }
                    },
                    Err(e) => {
                        receiver.dispatch(Event::Closed).await?;
                        return Err(e);
                    }
                }
            }
        };
        if let Flow::Close = flow {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::logger::{MemoryLogger, NoopLogger};
    use crate::protocol_core::{encode_announcement, Announcement};
    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[derive(Default)]
    struct Collect(Mutex<Vec<FileTransfer>>);

    impl Handoff for Collect {
        fn hand_off(&self, transfer: FileTransfer) -> bool {
            self.0.lock().push(transfer);
            true
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], 40000))
    }

    fn announce(size: u64) -> Announcement {
        Announcement {
            gid: "001".into(),
            uid: "002".into(),
            cid: "011".into(),
            tmobs: "2017-10-29T12:00:00".into(),
            subpath: "G011_171029".into(),
            filename: "G011_a.fit".into(),
            filesize: size,
        }
    }

    fn receiver(sink: Arc<Collect>, log: Arc<dyn Logger>) -> Receiver<Vec<u8>> {
        Receiver::new(Vec::new(), sink, 1 << 20, peer(), log)
    }

    fn replies(r: &Receiver<Vec<u8>>) -> Vec<String> {
        String::from_utf8(r.status_out.clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn exact_delivery_completes_and_hands_off() {
        let sink = Arc::new(Collect::default());
        let mut r = receiver(sink.clone(), Arc::new(NoopLogger));

        r.dispatch(Event::Message(Message::Announcement(announce(6)))).await.unwrap();
        assert_eq!(r.state(), SessionState::ReadyToReceive);
        assert_eq!(r.remaining(), 6);

        r.dispatch(Event::Data(b"abc")).await.unwrap();
        assert_eq!(r.state(), SessionState::ReadyToReceive);
        r.dispatch(Event::Data(b"def")).await.unwrap();
        assert_eq!(r.state(), SessionState::Idle);

        let files = sink.0.lock();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data(), b"abcdef");
        assert_eq!(
            replies(&r),
            vec![
                "filestat status=1, gid=001, uid=002, cid=011, filename=G011_a.fit",
                "filestat status=2, gid=001, uid=002, cid=011, filename=G011_a.fit",
            ]
        );
    }

    #[tokio::test]
    async fn overrun_reports_failure_and_keeps_connection() {
        let sink = Arc::new(Collect::default());
        let log = Arc::new(MemoryLogger::default());
        let mut r = receiver(sink.clone(), log.clone());

        r.dispatch(Event::Message(Message::Announcement(announce(4)))).await.unwrap();
        let flow = r.dispatch(Event::Data(b"abcdef")).await.unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert_eq!(r.state(), SessionState::Idle);
        assert!(sink.0.lock().is_empty());
        assert!(replies(&r).last().unwrap().starts_with("filestat status=3"));
        assert!(log.contains("bytes received<6> is greater than file size<4>"));

        // next file on the same connection, same size: buffer is reused
        r.dispatch(Event::Message(Message::Announcement(announce(4)))).await.unwrap();
        r.dispatch(Event::Data(b"wxyz")).await.unwrap();
        assert_eq!(sink.0.lock()[0].data(), b"wxyz");
    }

    #[tokio::test]
    async fn zero_length_file_completes_at_once() {
        let sink = Arc::new(Collect::default());
        let mut r = receiver(sink.clone(), Arc::new(NoopLogger));
        r.dispatch(Event::Message(Message::Announcement(announce(0)))).await.unwrap();
        assert_eq!(r.state(), SessionState::Idle);
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(replies(&r).len(), 2);
    }

    #[tokio::test]
    async fn heartbeat_is_ignored_and_oversize_is_rejected() {
        let sink = Arc::new(Collect::default());
        let mut r = receiver(sink, Arc::new(NoopLogger));
        let flow = r.dispatch(Event::Message(Message::Heartbeat(None))).await.unwrap();
        assert!(matches!(flow, Flow::Continue));
        assert!(replies(&r).is_empty());

        let err = r
            .dispatch(Event::Message(Message::Announcement(announce(2 << 20))))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Protocol(ProtocolError::BadValue { .. })));
    }

    #[tokio::test]
    async fn close_discards_partial_file() {
        let sink = Arc::new(Collect::default());
        let mut r = receiver(sink.clone(), Arc::new(NoopLogger));
        r.dispatch(Event::Message(Message::Announcement(announce(10)))).await.unwrap();
        r.dispatch(Event::Data(b"part")).await.unwrap();
        let flow = r.dispatch(Event::Closed).await.unwrap();
        assert!(matches!(flow, Flow::Close));
        assert_eq!(r.state(), SessionState::Idle);
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn driver_never_reads_past_the_declared_size() {
        let sink = Arc::new(Collect::default());
        let (client, server) = tokio::io::duplex(1 << 16);
        let (srv_rd, srv_wr) = tokio::io::split(server);
        let mut r = Receiver::new(srv_wr, sink.clone() as Arc<dyn Handoff>, 1 << 20, peer(), Arc::new(NoopLogger));

        let (cli_rd, mut cli_wr) = tokio::io::split(client);
        let task = tokio::spawn(async move {
            run_connection(BufReader::new(srv_rd), &mut r, CancellationToken::new()).await
        });

        // two files back to back in a single write
        let mut wire = Vec::new();
        wire.extend_from_slice(encode_announcement(&announce(5)).as_bytes());
        wire.extend_from_slice(b"hello");
        let mut second = announce(3);
        second.filename = "G011_b.fit".into();
        wire.extend_from_slice(encode_announcement(&second).as_bytes());
        wire.extend_from_slice(b"abc");
        cli_wr.write_all(&wire).await.unwrap();

        let mut lines = BufReader::new(cli_rd).lines();
        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(lines.next_line().await.unwrap().unwrap());
        }
        assert!(got[1].starts_with("filestat status=2") && got[1].ends_with("G011_a.fit"));
        assert!(got[3].starts_with("filestat status=2") && got[3].ends_with("G011_b.fit"));

        drop(cli_wr);
        drop(lines);
        task.await.unwrap().unwrap();
        let files = sink.0.lock();
        assert_eq!(files[0].data(), b"hello");
        assert_eq!(files[1].data(), b"abc");
    }

    #[tokio::test]
    async fn driver_closes_on_garbage() {
        let sink = Arc::new(Collect::default());
        let mut r = receiver(sink, Arc::new(NoopLogger));
        let input: &[u8] = b"GET / HTTP/1.1\r\n";
        let err = run_connection(input, &mut r, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Protocol(ProtocolError::UnknownKind(_))));
    }
}
