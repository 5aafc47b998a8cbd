// ── Line transport ──
//
// The engine never touches a serial port directly. It speaks to an abstract
// duplex line channel: complete text lines in, raw command strings out.
// Production channels wrap a `tokio_serial::SerialStream`; tests wire two
// channels back-to-back with `LineChannel::pair`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::AtError;

const WRITE_QUEUE: usize = 16;
const READ_QUEUE: usize = 64;

/// One half of a duplex line-oriented channel.
///
/// `writer` carries command strings toward the device (line terminators are
/// appended by the pump), `reader` yields complete received lines with the
/// terminator stripped. A closed `reader` means the transport is gone.
pub struct LineChannel {
    pub writer: mpsc::Sender<String>,
    pub reader: mpsc::Receiver<String>,
}

impl LineChannel {
    /// Two channels wired back-to-back: what one writes, the other reads.
    /// The test-side channel plays the modem.
    pub fn pair() -> (LineChannel, LineChannel) {
        let (a_tx, b_rx) = mpsc::channel(READ_QUEUE);
        let (b_tx, a_rx) = mpsc::channel(READ_QUEUE);
        (
            LineChannel {
                writer: a_tx,
                reader: a_rx,
            },
            LineChannel {
                writer: b_tx,
                reader: b_rx,
            },
        )
    }
}

/// Opens line channels onto named ports.
///
/// The supervisor layer holds this as a trait object so device lifecycles
/// can be exercised against in-memory channels.
#[async_trait]
pub trait TransportOpener: Send + Sync {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<LineChannel, AtError>;
}

// ── Serial implementation ────────────────────────────────────────────

/// Opens real serial ports via `tokio-serial`, framed line-by-line.
#[derive(Debug, Default)]
pub struct SerialOpener;

#[async_trait]
impl TransportOpener for SerialOpener {
    async fn open(&self, port: &str, baud_rate: u32) -> Result<LineChannel, AtError> {
        use tokio_serial::SerialPortBuilderExt;

        let stream = tokio_serial::new(port, baud_rate)
            .open_native_async()
            .map_err(|e| AtError::Transport {
                message: format!("open {port}: {e}"),
            })?;

        let framed = Framed::new(stream, LinesCodec::new());
        let (writer, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (read_tx, reader) = mpsc::channel(READ_QUEUE);

        tokio::spawn(pump(framed, write_rx, read_tx));

        Ok(LineChannel { writer, reader })
    }
}

/// Shuttle lines between the framed serial stream and the channel halves.
/// Exits (dropping the stream, which closes the port) as soon as either
/// side goes away or the stream errors.
async fn pump<S>(
    mut framed: Framed<S, LinesCodec>,
    mut write_rx: mpsc::Receiver<String>,
    read_tx: mpsc::Sender<String>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            out = write_rx.recv() => {
                let Some(line) = out else { break };
                // Modems expect CR-terminated commands; LinesCodec adds the LF.
                if let Err(e) = framed.send(format!("{line}\r")).await {
                    tracing::debug!(error = %e, "serial write failed");
                    break;
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(line)) => {
                        let line = line.trim_end_matches('\r').to_owned();
                        if read_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "serial read failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
