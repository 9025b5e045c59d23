use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::codec::encode_hex;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is not a valid connection string")]
    ConnectionString(String),
    #[error("lookup of `{1}` failed")]
    LookupHost(#[source] std::io::Error, String),
    #[error("could not connect to `{1}` over TCP")]
    Connect(#[source] std::io::Error, String),
    #[error("could not open the serial device {1:?}")]
    OpenDevice(#[source] tokio_serial::Error, String),
}

#[derive(clap::Parser)]
#[group(id = "connection::Args")]
pub struct Args {
    /// Where the OptoLink adapter is attached: `socket://host:port` or
    /// `tcp://host:port` for a serial-over-TCP bridge, `file://path` or a
    /// bare path for a local serial device.
    #[arg(long, short = 'c')]
    pub link: String,

    /// Serial parity. The optical head runs even parity with 2 stop bits;
    /// some older adapters want none.
    #[arg(long, value_enum, default_value_t = Parity::Even)]
    pub parity: Parity,

    /// Skip the P300 probe and speak the polled KW protocol only.
    #[arg(long)]
    pub kw_only: bool,

    /// How long a read may be answered from the register cache; `0s`
    /// disables caching.
    #[arg(long, default_value = "3s")]
    pub cache_duration: humantime::Duration,

    /// Fold a 3-bit sequence counter into outgoing telegrams, as the vendor
    /// gateway does.
    #[arg(long)]
    pub sequence_counter: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Parity {
    Even,
    None,
}

pub(crate) trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Opens the transport named by the connection string: a TCP bridge with
/// keepalive, or a local serial port at 4800 baud.
pub(crate) async fn open(args: &Args) -> Result<Box<dyn Transport>, Error> {
    let tcp_host = args
        .link
        .strip_prefix("socket://")
        .or_else(|| args.link.strip_prefix("tcp://"));
    if let Some(host) = tcp_host {
        info!(message = "connecting...", host);
        let addresses = tokio::net::lookup_host(host)
            .await
            .map_err(|e| Error::LookupHost(e, host.to_string()))?
            .collect::<Vec<_>>();
        debug!(message = "resolved", ?addresses);
        let socket = TcpStream::connect(&*addresses)
            .await
            .map_err(|e| Error::Connect(e, host.to_string()))?;
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
        let keepalive_result = socket2::SockRef::from(&socket).set_tcp_keepalive(&keepalive);
        trace!(message = "setting keepalive", is_error = ?keepalive_result.err());
        info!(message = "connected");
        return Ok(Box::new(socket));
    }

    let path = args.link.strip_prefix("file://").unwrap_or(&args.link);
    if path.is_empty() || path.contains("://") {
        return Err(Error::ConnectionString(args.link.clone()));
    }
    let parity = match args.parity {
        Parity::Even => tokio_serial::Parity::Even,
        Parity::None => tokio_serial::Parity::None,
    };
    let port = tokio_serial::SerialPortBuilderExt::open_native_async(
        tokio_serial::new(path, 4800)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(parity)
            .stop_bits(tokio_serial::StopBits::Two),
    )
    .map_err(|e| Error::OpenDevice(e, path.to_string()))?;
    info!(message = "serial device open", path);
    Ok(Box::new(port))
}

/// Reads the transport and feeds single bytes to the engine, decoupling
/// protocol timing from the OS read granularity. Cancels the shared token
/// when the transport ends so the engine and the gateway wind down.
pub(crate) async fn byte_pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    bytes: mpsc::Sender<u8>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(message = "transport closed");
                    cancel.cancel();
                    return;
                }
                Ok(n) => {
                    trace!(message = "read", bytes = %encode_hex(&buf[..n]));
                    for b in &buf[..n] {
                        if bytes.send(*b).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(message = "transport read failed", error = %e);
                    cancel.cancel();
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    fn args(link: &str) -> Args {
        Args {
            link: link.to_string(),
            parity: Parity::Even,
            kw_only: false,
            cache_duration: Duration::from_secs(3).into(),
            sequence_counter: false,
        }
    }

    #[tokio::test]
    async fn unknown_schemes_are_rejected() {
        assert!(matches!(
            open(&args("gopher://example:70")).await,
            Err(Error::ConnectionString(_))
        ));
        assert!(matches!(open(&args("")).await, Err(Error::ConnectionString(_))));
    }

    #[tokio::test]
    async fn the_pump_forwards_bytes_and_reports_closure() {
        let (client, mut server) = tokio::io::duplex(64);
        let (reader, _writer) = tokio::io::split(client);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(byte_pump(Box::new(reader), tx, cancel.clone()));

        server.write_all(&[0x05, 0x41, 0x06]).await.unwrap();
        assert_eq!(rx.recv().await, Some(0x05));
        assert_eq!(rx.recv().await, Some(0x41));
        assert_eq!(rx.recv().await, Some(0x06));

        drop(server);
        pump.await.unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(rx.recv().await, None);
    }
}
