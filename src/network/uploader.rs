//! Firmware uploader
//!
//! Drives a device through the OTA update over a single connection:
//! start handshake, one acknowledged frame per 4 KiB chunk, end command,
//! reboot request, disconnect.

use bytes::Bytes;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::connection::{Connection, ConnectionError};
use super::NetworkConfig;
use crate::protocol::{
    frame_count, CodecError, Command, CommandKind, ProtocolError, Response, CHUNK_SIZE,
};

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to read firmware image: {0}")]
    Firmware(#[source] std::io::Error),

    #[error("Could not resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {0} timed out")]
    ConnectTimeout(SocketAddr),

    #[error("Connection error: {0}")]
    Connection(ConnectionError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Encoding error: {0}")]
    Codec(CodecError),
}

impl From<ConnectionError> for UploadError {
    fn from(err: ConnectionError) -> Self {
        match err {
            // Nothing reached the wire; the connection itself is fine.
            ConnectionError::Codec(e) => UploadError::Codec(e),
            other => UploadError::Connection(other),
        }
    }
}

impl UploadError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            UploadError::Protocol(_) => 4,
            UploadError::Firmware(_) => 5,
            UploadError::Codec(_) => 1,
            UploadError::Resolve { .. }
            | UploadError::Connect { .. }
            | UploadError::ConnectTimeout(_)
            | UploadError::Connection(_) => 3,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Progress events emitted by the uploader
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Opening the TCP connection
    Connecting { addr: SocketAddr },
    /// TCP connection established
    Connected { addr: SocketAddr },
    /// About to send a single-line command
    SendingCommand { command: CommandKind },
    /// About to send firmware frame `number` of `total`
    SendingFrame { number: u64, total: u64, len: usize },
    /// Every step completed
    Finished { report: UploadReport },
}

/// Summary of a completed upload
#[derive(Debug, Clone)]
pub struct UploadReport {
    /// Frames sent and acknowledged
    pub frames_sent: u64,
    /// Firmware bytes carried by those frames
    pub bytes_sent: u64,
    /// Exchanges whose response had to be `OK\r\n`
    pub validated_exchanges: u64,
    /// Response to the end command
    pub end_response: Response,
    /// Response to the reboot command
    pub reboot_response: Response,
}

/// A firmware image read sequentially, one chunk at a time
pub struct FirmwareImage<R = File> {
    reader: R,
    len: u64,
}

impl FirmwareImage<File> {
    /// Open an image file and read its size
    pub async fn open(path: &Path) -> UploadResult<Self> {
        let file = File::open(path).await.map_err(UploadError::Firmware)?;
        let len = file.metadata().await.map_err(UploadError::Firmware)?.len();
        Ok(Self::from_reader(file, len))
    }
}

impl<R> FirmwareImage<R>
where
    R: AsyncRead + Unpin,
{
    pub fn from_reader(reader: R, len: u64) -> Self {
        Self { reader, len }
    }

    /// Total size in bytes, as known before reading
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of frames the image will be sent in
    pub fn frame_count(&self) -> u64 {
        frame_count(self.len)
    }

    /// Read the next chunk of up to `CHUNK_SIZE` bytes
    /// Returns Ok(None) at end of file
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;

        while filled < CHUNK_SIZE {
            let n = self.reader.read(&mut chunk[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        chunk.truncate(filled);
        Ok(Some(Bytes::from(chunk)))
    }
}

/// OTA firmware uploader
pub struct FirmwareUploader {
    /// Network configuration
    config: NetworkConfig,
    /// Validate the end command's response as well
    strict_finalize: bool,
    /// Event sender
    event_tx: mpsc::Sender<UploadEvent>,
    /// Event receiver (for consumers)
    event_rx: Option<mpsc::Receiver<UploadEvent>>,
    /// Events discarded because the consumer fell behind
    dropped_events: AtomicU64,
}

impl FirmwareUploader {
    /// Create a new uploader
    pub fn new(config: NetworkConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);

        Self {
            config,
            strict_finalize: false,
            event_tx,
            event_rx: Some(event_rx),
            dropped_events: AtomicU64::new(0),
        }
    }

    pub fn with_strict_finalize(mut self, strict: bool) -> Self {
        self.strict_finalize = strict;
        self
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.event_rx.take()
    }

    /// Number of progress events discarded so far
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    fn emit(&self, event: UploadEvent) {
        // Progress is for display only and must never stall the upload.
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Progress channel full, dropped {:?}", event);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Progress receiver gone, event discarded");
            }
        }
    }

    /// Upload the firmware file at `firmware_path` to the device at `host`
    pub async fn run(&self, host: &str, firmware_path: &Path) -> UploadResult<UploadReport> {
        let image = FirmwareImage::open(firmware_path).await?;

        let addrs = super::resolve_host(host, self.config.port)
            .await
            .map_err(|source| UploadError::Resolve {
                host: host.to_string(),
                source,
            })?;

        let stream = self.connect_any(&addrs).await?;

        self.upload(stream, image).await
    }

    /// Try each address in turn and keep the first connection that succeeds
    async fn connect_any(&self, addrs: &[SocketAddr]) -> UploadResult<TcpStream> {
        let mut last_error = None;

        for &addr in addrs {
            tracing::info!("Connecting to {}", addr);
            self.emit(UploadEvent::Connecting { addr });

            match self.connect(addr).await {
                Ok(stream) => {
                    tracing::info!("Connected to {}", addr);
                    self.emit(UploadEvent::Connected { addr });
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| UploadError::Resolve {
            host: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses to try"),
        }))
    }

    async fn connect(&self, addr: SocketAddr) -> UploadResult<TcpStream> {
        let connect = TcpStream::connect(addr);

        let result = match self.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| UploadError::ConnectTimeout(addr))?,
            None => connect.await,
        };

        result.map_err(|source| UploadError::Connect { addr, source })
    }

    /// Run the whole OTA sequence over an already open stream
    ///
    /// The stream is shut down before returning, whether or not the upload
    /// succeeded.
    pub async fn upload<S, R>(
        &self,
        stream: S,
        mut image: FirmwareImage<R>,
    ) -> UploadResult<UploadReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let mut conn = Connection::new(stream).with_read_timeout(self.config.read_timeout);

        let result = self.drive(&mut conn, &mut image).await;

        if let Err(e) = conn.close().await {
            tracing::debug!("Error closing connection: {}", e);
        }

        let stats = conn.stats();
        tracing::debug!(
            "Session closed ({:?}): {} exchanges, {} bytes sent, {} bytes received",
            conn.state(),
            stats.exchanges,
            stats.bytes_sent,
            stats.bytes_received
        );

        match &result {
            Ok(report) => {
                tracing::info!(
                    "Upload complete: {} frames, {} bytes",
                    report.frames_sent,
                    report.bytes_sent
                );
                self.emit(UploadEvent::Finished {
                    report: report.clone(),
                });
            }
            Err(e) => tracing::error!("Upload aborted: {}", e),
        }

        result
    }

    async fn drive<S, R>(
        &self,
        conn: &mut Connection<S>,
        image: &mut FirmwareImage<R>,
    ) -> UploadResult<UploadReport>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let total = image.frame_count();
        tracing::info!("Starting OTA update: {} bytes in {} frames", image.len(), total);
        if image.is_empty() {
            tracing::warn!("Firmware image is empty, only the handshake will be sent");
        }

        self.emit(UploadEvent::SendingCommand {
            command: CommandKind::Start,
        });
        let response = conn.exchange(&Command::Start).await?;
        expect_ack(CommandKind::Start, None, response)?;
        let mut validated_exchanges = 1;

        let mut frames_sent = 0;
        let mut bytes_sent = 0;
        while let Some(chunk) = image.next_chunk().await.map_err(UploadError::Firmware)? {
            let number = frames_sent + 1;
            let len = chunk.len();

            tracing::debug!("Sending frame {} of {} ({} bytes)", number, total, len);
            self.emit(UploadEvent::SendingFrame { number, total, len });

            let response = conn.exchange(&Command::Frame(chunk)).await?;
            expect_ack(CommandKind::Frame, Some(number), response)?;

            validated_exchanges += 1;
            frames_sent = number;
            bytes_sent += len as u64;
        }

        self.emit(UploadEvent::SendingCommand {
            command: CommandKind::End,
        });
        let end_response = conn.exchange(&Command::End).await?;
        if self.strict_finalize {
            expect_ack(CommandKind::End, None, end_response.clone())?;
            validated_exchanges += 1;
        } else if !end_response.is_ack() {
            tracing::warn!("Device answered end command with \"{}\"", end_response);
        }

        self.emit(UploadEvent::SendingCommand {
            command: CommandKind::Reboot,
        });
        let reboot_response = conn.exchange(&Command::Reboot).await?;
        if !reboot_response.is_ack() {
            tracing::warn!("Device answered reboot command with \"{}\"", reboot_response);
        }

        Ok(UploadReport {
            frames_sent,
            bytes_sent,
            validated_exchanges,
            end_response,
            reboot_response,
        })
    }
}

fn expect_ack(
    command: CommandKind,
    frame: Option<u64>,
    response: Response,
) -> Result<(), ProtocolError> {
    tracing::debug!("{} response: \"{}\"", command, response);

    if response.is_ack() {
        Ok(())
    } else {
        Err(ProtocolError {
            command,
            frame,
            response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use std::io::Write;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_test::io::Builder;

    use crate::protocol::{decode_record, encode_frame};

    fn firmware(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn framed(chunk: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_frame(chunk, &mut buf).unwrap();
        buf.to_vec()
    }

    /// Script the start handshake followed by one OK per frame
    fn script_frames(builder: &mut Builder, data: &[u8], frames: usize) {
        builder.write(b"![\n").read(b"OK\r\n");
        for chunk in data.chunks(CHUNK_SIZE).take(frames) {
            builder.write(&framed(chunk)).read(b"OK\r\n");
        }
    }

    /// Accepts one connection and behaves like the device's OTA listener
    async fn simulated_device(listener: TcpListener) -> Vec<u8> {
        let (socket, _) = listener.accept().await.unwrap();
        serve_device(socket).await
    }

    /// Acknowledges every record until the peer hangs up, returning the image
    async fn serve_device<S>(mut socket: S) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::new();
        let mut image = Vec::new();

        loop {
            let record = loop {
                if let Some(record) = decode_record(&mut buf).unwrap() {
                    break record;
                }
                if socket.read_buf(&mut buf).await.unwrap() == 0 {
                    return image;
                }
            };

            match Command::from_record(record) {
                Some(Command::Frame(payload)) => image.extend_from_slice(&payload),
                Some(Command::Start) | Some(Command::End) | Some(Command::Reboot) => {}
                None => panic!("Device received an unknown record"),
            }
            socket.write_all(b"OK\r\n").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_all_ok_upload() {
        let data = firmware(2 * CHUNK_SIZE + 10);
        let mut builder = Builder::new();
        script_frames(&mut builder, &data, 3);
        // End and reboot answers are observed but not checked.
        builder
            .write(b"!]\n")
            .read(b"OTA_ERROR 5\r\n")
            .write(b"!*\n")
            .read(b"OK\r\n");
        let mock = builder.build();

        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        let report = uploader.upload(mock, image).await.unwrap();

        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.bytes_sent, data.len() as u64);
        assert_eq!(report.validated_exchanges, 4);
        assert_eq!(report.end_response.as_bytes(), b"OTA_ERROR 5\r\n");
        assert!(report.reboot_response.is_ack());
    }

    #[tokio::test]
    async fn test_empty_image_sends_no_frames() {
        let mock = Builder::new()
            .write(b"![\n")
            .read(b"OK\r\n")
            .write(b"!]\n")
            .read(b"OK\r\n")
            .write(b"!*\n")
            .read(b"OK\r\n")
            .build();

        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let image = FirmwareImage::from_reader(&[][..], 0);
        let report = uploader.upload(mock, image).await.unwrap();

        assert_eq!(report.frames_sent, 0);
        assert_eq!(report.validated_exchanges, 1);
    }

    #[tokio::test]
    async fn test_start_rejected() {
        let mock = Builder::new().write(b"![\n").read(b"ERR\r\n").build();

        let data = firmware(100);
        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        let err = uploader.upload(mock, image).await.unwrap_err();

        match err {
            UploadError::Protocol(e) => {
                assert_eq!(e.command, CommandKind::Start);
                assert_eq!(e.frame, None);
                assert_eq!(e.response.as_bytes(), b"ERR\r\n");
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_third_of_five_frames_rejected() {
        let data = firmware(4 * CHUNK_SIZE + 100);
        let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 5);

        let mut builder = Builder::new();
        script_frames(&mut builder, &data, 2);
        builder.write(&framed(chunks[2])).read(b"ERR\r\n");
        let mock = builder.build();

        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        let err = uploader.upload(mock, image).await.unwrap_err();

        match err {
            UploadError::Protocol(e) => {
                assert_eq!(e.command, CommandKind::Frame);
                assert_eq!(e.frame, Some(3));
                assert_eq!(e.response.as_bytes(), b"ERR\r\n");
            }
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peer_closes_while_awaiting_response() {
        let data = firmware(CHUNK_SIZE + 1);
        let mut builder = Builder::new();
        builder.write(b"![\n").read(b"OK\r\n");
        builder.write(&framed(&data[..CHUNK_SIZE]));
        let mock = builder.build();

        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        let err = uploader.upload(mock, image).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::Connection(ConnectionError::BrokenReceive)
        ));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_strict_finalize_checks_end_response() {
        let mock = Builder::new()
            .write(b"![\n")
            .read(b"OK\r\n")
            .write(b"!]\n")
            .read(b"OTA_ERROR 2\r\n")
            .build();

        let uploader = FirmwareUploader::new(NetworkConfig::default()).with_strict_finalize(true);
        let image = FirmwareImage::from_reader(&[][..], 0);
        let err = uploader.upload(mock, image).await.unwrap_err();

        match err {
            UploadError::Protocol(e) => assert_eq!(e.command, CommandKind::End),
            other => panic!("Expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_progress_events() {
        let data = firmware(10);
        let mut builder = Builder::new();
        script_frames(&mut builder, &data, 1);
        builder.write(b"!]\n").read(b"OK\r\n").write(b"!*\n").read(b"OK\r\n");
        let mock = builder.build();

        let mut uploader = FirmwareUploader::new(NetworkConfig::default());
        let mut events = uploader.take_event_receiver().unwrap();
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        uploader.upload(mock, image).await.unwrap();
        drop(uploader);

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }

        assert_eq!(received.len(), 5);
        assert!(matches!(
            received[0],
            UploadEvent::SendingCommand { command: CommandKind::Start }
        ));
        assert!(matches!(
            received[1],
            UploadEvent::SendingFrame { number: 1, total: 1, len: 10 }
        ));
        assert!(matches!(
            received[4],
            UploadEvent::Finished { ref report } if report.frames_sent == 1
        ));
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_events() {
        let data = firmware(300 * CHUNK_SIZE);
        let (client, device) = tokio::io::duplex(64 * 1024);
        let device = tokio::spawn(serve_device(device));

        // The receiver is never drained while the upload runs.
        let mut uploader = FirmwareUploader::new(NetworkConfig::default());
        let mut events = uploader.take_event_receiver().unwrap();
        let image = FirmwareImage::from_reader(&data[..], data.len() as u64);
        let report = uploader.upload(client, image).await.unwrap();
        assert_eq!(report.frames_sent, 300);

        let dropped = uploader.dropped_events();
        drop(uploader);

        let mut received = 0;
        while events.recv().await.is_some() {
            received += 1;
        }

        // start, 300 frames, end, reboot, finished
        assert_eq!(received, 256);
        assert_eq!(dropped, 48);
        assert_eq!(device.await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_unreachable_first_address_falls_through() {
        // Bind then release a port so that nothing listens on it.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = listener.local_addr().unwrap();

        let config = NetworkConfig::default().with_connect_timeout(Duration::from_secs(5));
        let mut uploader = FirmwareUploader::new(config);
        let mut events = uploader.take_event_receiver().unwrap();

        let stream = uploader.connect_any(&[dead_addr, live_addr]).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), live_addr);
        drop(uploader);

        let mut received = Vec::new();
        while let Some(event) = events.recv().await {
            received.push(event);
        }
        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], UploadEvent::Connecting { addr } if addr == dead_addr));
        assert!(matches!(received[1], UploadEvent::Connecting { addr } if addr == live_addr));
        assert!(matches!(received[2], UploadEvent::Connected { addr } if addr == live_addr));
    }

    #[tokio::test]
    async fn test_every_address_unreachable() {
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let uploader = FirmwareUploader::new(NetworkConfig::default());
        let err = uploader.connect_any(&[dead_addr]).await.unwrap_err();

        assert!(matches!(err, UploadError::Connect { addr, .. } if addr == dead_addr));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_codec_error_is_not_a_connection_failure() {
        let err = UploadError::from(ConnectionError::Codec(CodecError::FrameTooLarge(4097, 4096)));
        assert!(matches!(err, UploadError::Codec(CodecError::FrameTooLarge(4097, 4096))));
        assert_eq!(err.exit_code(), 1);

        let err = UploadError::from(ConnectionError::Timeout);
        assert!(matches!(err, UploadError::Connection(ConnectionError::Timeout)));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_run_against_simulated_device() {
        let data = firmware(3 * CHUNK_SIZE - 1);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let device = tokio::spawn(simulated_device(listener));

        let config = NetworkConfig::new(port)
            .with_connect_timeout(Duration::from_secs(5))
            .with_read_timeout(Duration::from_secs(5));
        let uploader = FirmwareUploader::new(config);
        let report = uploader.run("127.0.0.1", file.path()).await.unwrap();

        assert_eq!(report.frames_sent, 3);
        assert_eq!(report.validated_exchanges, 4);

        let received = device.await.unwrap();
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn test_missing_firmware_file() {
        let uploader = FirmwareUploader::new(NetworkConfig::new(9));
        let err = uploader
            .run("127.0.0.1", Path::new("/nonexistent/firmware.bin"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Firmware(_)));
        assert_eq!(err.exit_code(), 5);
    }
}
