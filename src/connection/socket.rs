//! WebSocket transport behind the connection handle.
//!
//! One task per process: connect, pump frames both ways, and on any failure
//! publish an `error` event and retry with capped exponential backoff.

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle, time};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

use super::{
    handle::{ConnectionHandle, LinkStatus},
    protocol::{self, ClientEvent, ServerEvent},
};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_EXPONENT: u32 = 6;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub token: String,
    pub max_backoff: Duration,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

pub(crate) fn spawn_transport(
    handle: ConnectionHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<ClientEvent>,
    options: ConnectOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = handle.shutdown_token();
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            handle.set_status(LinkStatus::Connecting);
            match connect(&options).await {
                Ok(socket) => {
                    attempt = 0;
                    handle.set_status(LinkStatus::Connected);
                    log_info!("Duplex channel established");

                    match run_session(socket, &handle, &mut outbound_rx).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost => {
                            handle.set_status(LinkStatus::Disconnected);
                            handle.publish(ServerEvent::Error {
                                message: "connection lost".into(),
                            });
                        }
                    }
                }
                Err(err) => {
                    log_warn!("Connect attempt {} failed: {err:#}", attempt + 1);
                    handle.set_status(LinkStatus::Disconnected);
                    handle.publish(ServerEvent::Error {
                        message: format!("unable to connect: {err}"),
                    });
                }
            }

            let delay = backoff_delay(attempt, options.max_backoff, jitter_ms(attempt));
            attempt = attempt.saturating_add(1);
            log_debug!("Reconnecting in {} ms", delay.as_millis());

            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        handle.set_status(LinkStatus::Disconnected);
        log_info!("Duplex channel transport stopped");
    })
}

async fn connect(options: &ConnectOptions) -> Result<Socket> {
    let mut request = options
        .url
        .as_str()
        .into_client_request()
        .with_context(|| format!("invalid server url {}", options.url))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", options.token))
        .context("auth token is not a valid header value")?;
    request.headers_mut().insert("Authorization", bearer);

    let (socket, _response) = connect_async(request)
        .await
        .context("websocket handshake failed")?;
    Ok(socket)
}

async fn run_session(
    socket: Socket,
    handle: &ConnectionHandle,
    outbound_rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
) -> SessionEnd {
    let shutdown = handle.shutdown_token();
    let (mut write, mut read) = socket.split();

    let rooms = handle.joined_classrooms();
    if !rooms.is_empty() {
        let rejoin = ClientEvent::JoinClassroom {
            classroom_ids: rooms,
        };
        if let Err(err) = send_event(&mut write, &rejoin).await {
            log_error!("Failed to rejoin classrooms: {err:#}");
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            outbound = outbound_rx.recv() => {
                let Some(event) = outbound else {
                    return SessionEnd::Shutdown;
                };
                if let Err(err) = send_event(&mut write, &event).await {
                    log_error!("Failed to send {}: {err:#}", event.name());
                    return SessionEnd::Lost;
                }
            }

            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                        Ok(event) => handle.publish(event),
                        Err(err) => log_warn!("Dropping unrecognized server frame: {err}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log_info!("Server closed the duplex channel");
                        return SessionEnd::Lost;
                    }
                    Some(Err(err)) => {
                        log_error!("WebSocket error: {err}");
                        return SessionEnd::Lost;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event<S>(write: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = protocol::encode(event).context("failed to encode client event")?;
    write
        .send(Message::Text(text))
        .await
        .context("websocket send failed")?;
    Ok(())
}

fn jitter_ms(attempt: u32) -> u64 {
    let ceiling = base_delay_ms(attempt) / 4;
    rand::thread_rng().gen_range(0..=ceiling)
}

fn base_delay_ms(attempt: u32) -> u64 {
    BASE_BACKOFF_MS.saturating_mul(1 << attempt.min(MAX_BACKOFF_EXPONENT))
}

/// Delay before the retry that follows `attempt` earlier retries: the base
/// first, doubling up to `max_backoff`, plus jitter.
pub(crate) fn backoff_delay(attempt: u32, max_backoff: Duration, jitter_ms: u64) -> Duration {
    let capped = base_delay_ms(attempt).min(u64::try_from(max_backoff.as_millis()).unwrap_or(u64::MAX));
    Duration::from_millis(capped.saturating_add(jitter_ms))
}
