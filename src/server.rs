use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{Request, RunInput, RunOutput, SettingChange};
use crate::service::SessionService;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Inbound stdin messages buffered ahead of the child.
const INPUT_QUEUE: usize = 100;

/// Outbound frames buffered ahead of the socket.
const OUTPUT_QUEUE: usize = 100;

enum Line {
    Data(Vec<u8>),
    TooLong,
    Eof,
}

/// Accepts connections forever, one task per connection.
pub async fn serve(listener: TcpListener, service: Arc<SessionService>, max_message_size: usize) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {e}");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        debug!("Connection from {peer}");
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, service, max_message_size).await {
                debug!("Connection {peer} closed: {e}");
            }
        });
    }
}

/// Serves unary calls until the client hangs up or opens a run stream.
async fn handle_connection(
    stream: TcpStream,
    service: Arc<SessionService>,
    max_message_size: usize,
) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let line = match read_line(&mut reader, max_message_size).await? {
            Line::Eof => return Ok(()),
            Line::TooLong => {
                warn!("Request larger than {max_message_size} bytes, skipped");
                write_line(&mut writer, &SettingChange::failed("message too large")).await?;
                continue;
            }
            Line::Data(line) if line.is_empty() => continue,
            Line::Data(line) => line,
        };

        let request = match serde_json::from_slice::<Request>(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed request: {e}");
                write_line(&mut writer, &SettingChange::failed(format!("malformed request: {e}")))
                    .await?;
                continue;
            }
        };

        let reply = match request {
            Request::Configure {
                limits,
                params,
                output_throttle,
            } => service.configure(limits, params, output_throttle),
            Request::UploadFile { file_name, data } => service.upload_file(&file_name, &data).await,
            Request::Reset => service.reset(),
            Request::Stop => service.stop().await,
            Request::RunInteractive => {
                return run_stream(reader, writer, service, max_message_size).await;
            }
        };
        write_line(&mut writer, &reply).await?;
    }
}

/// Bridges the socket to `SessionService::run_interactive` until `EXIT` is written.
async fn run_stream(
    mut reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    service: Arc<SessionService>,
    max_message_size: usize,
) -> io::Result<()> {
    let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
    let (output_tx, mut output_rx) = mpsc::channel::<RunOutput>(OUTPUT_QUEUE);

    // Read task: client lines → child's stdin
    let read_handle = tokio::spawn(async move {
        loop {
            let line = match read_line(&mut reader, max_message_size).await {
                Ok(Line::Data(line)) => line,
                Ok(Line::TooLong) => {
                    warn!("Input line larger than {max_message_size} bytes, skipped");
                    continue;
                }
                Ok(Line::Eof) => break,
                Err(e) => {
                    debug!("Input read error: {e}");
                    break;
                }
            };
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<RunInput>(&line) {
                Ok(input) => {
                    if input_tx.send(input.input).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed input line: {e}"),
            }
        }
    });

    // Write task: output frames → socket
    let write_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(frame) = output_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &frame).await {
                debug!("Output write error: {e}");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    service.run_interactive(input_rx, output_tx).await;
    let _ = write_handle.await;
    read_handle.abort();
    info!("RunInteractive finished");
    Ok(())
}

async fn read_line<R>(reader: &mut R, max: usize) -> io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max).unwrap_or(u64::MAX).saturating_add(1);
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > max {
        skip_line(reader).await?;
        return Ok(Line::TooLong);
    }
    Ok(Line::Data(buf))
}

/// Discards input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await
}
