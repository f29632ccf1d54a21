//! Interactive bftp client.
//!
//! Reads line commands from stdin and drives the stop-and-wait protocol:
//! exactly one request in flight at a time. A background task owns the read
//! half of the socket; it prints BCAST notifications the moment they arrive
//! and forwards everything else to the command loop.

use anyhow::{bail, Context, Result};
use bftp_wire::{Framer, Packet, BLOCK_SIZE};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

#[derive(Parser)]
#[command(name = "bftp")]
#[command(version, about = "Interactive bftp client", long_about = None)]
struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let stream = TcpStream::connect((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", cli.host, cli.port))?;
    let (read_half, mut write_half) = stream.into_split();

    let (tx, mut replies) = mpsc::unbounded_channel();
    tokio::spawn(read_loop(read_half, tx));

    println!("connected to {}:{}", cli.host, cli.port);
    println!("commands: login <user> | dir | read <file> | write <file> | delete <file> | disc");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut parts = line.trim().splitn(2, ' ');
        let command = match parts.next() {
            Some("") | None => continue,
            Some(cmd) => cmd,
        };
        let arg = parts.next().map(str::trim).unwrap_or("");

        let result = match command {
            "login" => login(&mut write_half, &mut replies, arg).await,
            "dir" => list_dir(&mut write_half, &mut replies).await,
            "read" => read_file(&mut write_half, &mut replies, arg).await,
            "write" => write_file(&mut write_half, &mut replies, arg).await,
            "delete" => delete_file(&mut write_half, &mut replies, arg).await,
            "disc" => {
                disconnect(&mut write_half, &mut replies).await?;
                break;
            }
            other => {
                println!("unknown command: {other}");
                continue;
            }
        };
        if let Err(e) = result {
            println!("error: {e:#}");
        }
    }
    Ok(())
}

/// Owns the socket's read half. BCASTs are printed immediately; every other
/// packet goes to whichever command is waiting on it.
async fn read_loop(mut reader: OwnedReadHalf, tx: UnboundedSender<Packet>) {
    let mut framer = Framer::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("socket read failed: {e}");
                break;
            }
        };
        for &byte in &buf[..n] {
            match framer.feed(byte) {
                Ok(Some(Packet::Bcast { added, filename })) => {
                    let action = if added { "added" } else { "deleted" };
                    println!("server: file {filename} was {action}");
                }
                Ok(Some(packet)) => {
                    if tx.send(packet).is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    eprintln!("wire error: {e}");
                    return;
                }
            }
        }
    }
}

async fn send_packet(writer: &mut OwnedWriteHalf, packet: &Packet) -> Result<()> {
    writer
        .write_all(&packet.encode())
        .await
        .context("failed to send")
}

async fn next_reply(replies: &mut UnboundedReceiver<Packet>) -> Result<Packet> {
    replies
        .recv()
        .await
        .context("server closed the connection")
}

/// Wait for ACK(0); surface a server ERROR as a command failure.
async fn expect_go_ahead(replies: &mut UnboundedReceiver<Packet>) -> Result<()> {
    match next_reply(replies).await? {
        Packet::Ack { block: 0 } => Ok(()),
        Packet::Error { code, message } => bail!("server ({code:?}): {message}"),
        other => bail!("unexpected reply: {other:?}"),
    }
}

async fn login(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
    user: &str,
) -> Result<()> {
    if user.is_empty() {
        bail!("usage: login <user>");
    }
    send_packet(
        writer,
        &Packet::Logrq {
            username: user.to_string(),
        },
    )
    .await?;
    expect_go_ahead(replies).await?;
    println!("logged in as {user}");
    Ok(())
}

/// Receive a full read-style transfer, acknowledging each block.
async fn download(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    loop {
        match next_reply(replies).await? {
            Packet::Data { block, payload } => {
                let last = payload.len() < BLOCK_SIZE;
                bytes.extend_from_slice(&payload);
                send_packet(writer, &Packet::Ack { block }).await?;
                if last {
                    return Ok(bytes);
                }
            }
            Packet::Error { code, message } => bail!("server ({code:?}): {message}"),
            other => bail!("unexpected reply: {other:?}"),
        }
    }
}

async fn list_dir(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
) -> Result<()> {
    send_packet(writer, &Packet::Dirq).await?;
    let listing = download(writer, replies).await?;
    let text = String::from_utf8_lossy(&listing);
    let names: Vec<&str> = text.split_terminator('\0').collect();
    if names.is_empty() {
        println!("(no files)");
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

async fn read_file(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
    filename: &str,
) -> Result<()> {
    if filename.is_empty() {
        bail!("usage: read <file>");
    }
    send_packet(
        writer,
        &Packet::Rrq {
            filename: filename.to_string(),
        },
    )
    .await?;
    let bytes = download(writer, replies).await?;
    tokio::fs::write(filename, &bytes)
        .await
        .with_context(|| format!("failed to save {filename}"))?;
    println!("downloaded {filename} ({} bytes)", bytes.len());
    Ok(())
}

async fn write_file(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
    filename: &str,
) -> Result<()> {
    if filename.is_empty() {
        bail!("usage: write <file>");
    }
    let data = tokio::fs::read(filename)
        .await
        .with_context(|| format!("failed to read local file {filename}"))?;

    send_packet(
        writer,
        &Packet::Wrq {
            filename: filename.to_string(),
        },
    )
    .await?;
    expect_go_ahead(replies).await?;

    // Stop-and-wait block loop; the final block is shorter than BLOCK_SIZE,
    // empty when the size is an exact multiple.
    let mut block: u16 = 1;
    let mut chunks: Vec<&[u8]> = data.chunks(BLOCK_SIZE).collect();
    if data.len() % BLOCK_SIZE == 0 {
        chunks.push(&[]);
    }
    for chunk in chunks {
        send_packet(
            writer,
            &Packet::Data {
                block,
                payload: chunk.to_vec(),
            },
        )
        .await?;
        match next_reply(replies).await? {
            Packet::Ack { block: acked } if acked == block => {}
            Packet::Error { code, message } => bail!("server ({code:?}): {message}"),
            other => bail!("unexpected reply: {other:?}"),
        }
        block = block.wrapping_add(1);
    }
    println!("uploaded {filename} ({} bytes)", data.len());
    Ok(())
}

async fn delete_file(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
    filename: &str,
) -> Result<()> {
    if filename.is_empty() {
        bail!("usage: delete <file>");
    }
    send_packet(
        writer,
        &Packet::Delrq {
            filename: filename.to_string(),
        },
    )
    .await?;
    expect_go_ahead(replies).await?;
    println!("deleted {filename}");
    Ok(())
}

async fn disconnect(
    writer: &mut OwnedWriteHalf,
    replies: &mut UnboundedReceiver<Packet>,
) -> Result<()> {
    send_packet(writer, &Packet::Disc).await?;
    expect_go_ahead(replies).await?;
    println!("disconnected");
    Ok(())
}
