use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "wharf")]
#[command(about = "Wharf container fleet control plane and terminal client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Attach an interactive terminal to an existing session
    Attach {
        /// Control plane URL (e.g. ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Session token returned by the container create operation
        #[arg(short, long)]
        token: String,
    },
}

/// Debug terminal client: raw stdin/stdout pumped over the session bridge.
pub async fn run_attach_client(url: String, token: String) -> Result<()> {
    let ws_url = format!("{}/terminal/{}", url.trim_end_matches('/'), token);
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => return Err(anyhow::anyhow!("connection failed: {e}")),
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the control plane running?"
            ))
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            read_result = stdin.read(&mut buf) => match read_result {
                Ok(0) | Err(_) => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                Ok(n) => write.send(Message::Binary(buf[..n].to_vec().into())).await?,
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(Ok(Message::Text(text))) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    Ok(())
}
