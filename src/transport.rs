//! The lowest layer of the stream pipeline: proxies bytes between the
//! one live socket and the codec's byte pipes, and supports swapping
//! the socket for a TLS-wrapped one in the middle of the stream.
//!
//! Each direction runs as its own task holding (at most) one half of
//! the socket. The swap empties both cells, reunites the halves,
//! performs the TLS handshake over the original socket and hands the
//! halves of the wrapped socket back. Reads carry a short deadline so
//! a pending swap is observed promptly; a deadline expiry is not an
//! error. Writes of a chunk always run to completion before the next
//! command is looked at, so no partially-written frame can be split
//! across the swap boundary.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, SimplexStream, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use crate::error::Error;

/// Byte streams usable as the transport socket.
pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

type BoxedSocket = Box<dyn AsyncReadAndWrite>;

const L1_INTERVAL: Duration = Duration::from_secs(1);
const CHUNK: usize = 1024;

enum ReadCmd {
    Pause(oneshot::Sender<ReadHalf<BoxedSocket>>),
    Resume(ReadHalf<BoxedSocket>),
}

enum WriteCmd {
    Pause(oneshot::Sender<WriteHalf<BoxedSocket>>),
    Resume(WriteHalf<BoxedSocket>),
}

/// Handle to the two transport tasks.
pub(crate) struct Transport {
    read_cmd: mpsc::Sender<ReadCmd>,
    write_cmd: mpsc::Sender<WriteCmd>,
}

impl Transport {
    /// Fork the two proxy tasks over `socket`. Bytes read from the
    /// socket are written to `recv_writer`; bytes read from
    /// `send_reader` are written to the socket.
    pub(crate) fn start<S: AsyncReadAndWrite + 'static>(
        socket: S,
        recv_writer: WriteHalf<SimplexStream>,
        send_reader: ReadHalf<SimplexStream>,
    ) -> Transport {
        let socket: BoxedSocket = Box::new(socket);
        let (read_half, write_half) = tokio::io::split(socket);
        let (read_cmd, read_cmd_rx) = mpsc::channel(1);
        let (write_cmd, write_cmd_rx) = mpsc::channel(1);
        tokio::spawn(recv_transport(read_half, read_cmd_rx, recv_writer));
        tokio::spawn(send_transport(write_half, write_cmd_rx, send_reader));
        Transport {
            read_cmd,
            write_cmd,
        }
    }

    /// Pause both directions, wrap the socket with a TLS client using
    /// `config`, and resume. Neither direction loses bytes: the reader
    /// parks between reads and the writer between fully-written
    /// chunks.
    pub(crate) async fn start_tls(
        &self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<(), Error> {
        let (read_reply, read_taken) = oneshot::channel();
        let (write_reply, write_taken) = oneshot::channel();
        self.read_cmd
            .send(ReadCmd::Pause(read_reply))
            .await
            .map_err(|_| Error::Disconnected)?;
        self.write_cmd
            .send(WriteCmd::Pause(write_reply))
            .await
            .map_err(|_| Error::Disconnected)?;
        let read_half = read_taken.await.map_err(|_| Error::Disconnected)?;
        let write_half = write_taken.await.map_err(|_| Error::Disconnected)?;

        let socket = read_half.unsplit(write_half);
        let tls = TlsConnector::from(config)
            .connect(server_name, socket)
            .await?;
        debug!("TLS negotiation succeeded");

        let socket: BoxedSocket = Box::new(tls);
        let (read_half, write_half) = tokio::io::split(socket);
        self.read_cmd
            .send(ReadCmd::Resume(read_half))
            .await
            .map_err(|_| Error::Disconnected)?;
        self.write_cmd
            .send(WriteCmd::Resume(write_half))
            .await
            .map_err(|_| Error::Disconnected)?;
        Ok(())
    }
}

async fn recv_transport(
    initial: ReadHalf<BoxedSocket>,
    mut cmds: mpsc::Receiver<ReadCmd>,
    mut writer: WriteHalf<SimplexStream>,
) {
    enum Step {
        Cmd(Option<ReadCmd>),
        Data(usize),
        Eof,
        Failed(io::Error),
        Deadline,
    }

    let mut sock = Some(initial);
    let mut buf = [0u8; CHUNK];
    loop {
        let step = match sock {
            Some(ref mut s) => tokio::select! {
                cmd = cmds.recv() => Step::Cmd(cmd),
                read = timeout(L1_INTERVAL, s.read(&mut buf)) => match read {
                    Err(_) => Step::Deadline,
                    Ok(Ok(0)) => Step::Eof,
                    Ok(Ok(n)) => Step::Data(n),
                    Ok(Err(e)) => Step::Failed(e),
                },
            },
            // Parked: wait for a replacement socket.
            None => Step::Cmd(cmds.recv().await),
        };
        match step {
            Step::Cmd(Some(ReadCmd::Pause(reply))) => match sock.take() {
                Some(s) => {
                    let _ = reply.send(s);
                }
                None => break,
            },
            Step::Cmd(Some(ReadCmd::Resume(s))) => sock = Some(s),
            Step::Cmd(None) => break,
            Step::Deadline => continue,
            Step::Data(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    warn!("recv transport: {}", e);
                    break;
                }
            }
            Step::Eof => {
                debug!("recv transport: end of stream");
                break;
            }
            Step::Failed(e) => {
                warn!("recv transport: {}", e);
                break;
            }
        }
    }
    // Dropping `writer` closes the decoder's pipe and tears the
    // receive pipeline down.
}

async fn send_transport(
    initial: WriteHalf<BoxedSocket>,
    mut cmds: mpsc::Receiver<WriteCmd>,
    mut reader: ReadHalf<SimplexStream>,
) {
    enum Step {
        Cmd(Option<WriteCmd>),
        Data(usize),
        Eof,
        Failed(io::Error),
    }

    let mut sock = Some(initial);
    let mut buf = [0u8; CHUNK];
    loop {
        let step = match sock {
            Some(_) => tokio::select! {
                cmd = cmds.recv() => Step::Cmd(cmd),
                read = reader.read(&mut buf) => match read {
                    Ok(0) => Step::Eof,
                    Ok(n) => Step::Data(n),
                    Err(e) => Step::Failed(e),
                },
            },
            None => Step::Cmd(cmds.recv().await),
        };
        match step {
            Step::Cmd(Some(WriteCmd::Pause(reply))) => match sock.take() {
                Some(s) => {
                    let _ = reply.send(s);
                }
                None => break,
            },
            Step::Cmd(Some(WriteCmd::Resume(s))) => sock = Some(s),
            Step::Cmd(None) => break,
            Step::Data(n) => {
                // The chunk is written in full before the next command
                // is considered.
                if let Some(ref mut s) = sock {
                    if let Err(e) = s.write_all(&buf[..n]).await {
                        warn!("send transport: {}", e);
                        break;
                    }
                }
            }
            Step::Eof => {
                debug!("send transport: pipeline closed");
                break;
            }
            Step::Failed(e) => {
                warn!("send transport: {}", e);
                break;
            }
        }
    }
    // Let the peer see a clean end of stream.
    if let Some(mut s) = sock.take() {
        let _ = s.shutdown().await;
    }
}
