//! Client WebSockets, connected to firewall-approved addresses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tracing::{debug, warn};
use url::Url;

use super::address;
use super::request::{COULD_NOT_CONNECT, TIMED_OUT};
use super::{wait_aborted, wait_cancelled};
use crate::computer::{ComputerHandle, HostObject, Value};
use crate::firewall::Firewall;

pub const WEBSOCKET_SUCCESS: &str = "websocket_success";
pub const WEBSOCKET_FAILURE: &str = "websocket_failure";
pub const WEBSOCKET_MESSAGE: &str = "websocket_message";
pub const WEBSOCKET_CLOSED: &str = "websocket_closed";

pub const MESSAGE_TOO_LARGE: &str = "Message is too large";
pub const NOT_UTF8: &str = "Message is not valid UTF8";
pub const CLOSED_HANDLE: &str = "attempt to use a closed websocket";

/// A script's end of an open WebSocket.
///
/// Dropping every clone of the handle closes the connection.
#[derive(Debug)]
pub struct WebsocketHandle {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    max_message: usize,
    closed: AtomicBool,
}

impl WebsocketHandle {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outgoing.is_closed()
    }

    /// Send a message. Text messages must be valid UTF-8.
    pub fn send(&self, data: Vec<u8>, binary: bool) -> Result<(), String> {
        if self.is_closed() {
            return Err(CLOSED_HANDLE.to_string());
        }
        if self.max_message != 0 && data.len() > self.max_message {
            return Err(MESSAGE_TOO_LARGE.to_string());
        }

        let message = if binary {
            Message::Binary(data.into())
        } else {
            let text = String::from_utf8(data).map_err(|_| NOT_UTF8.to_string())?;
            Message::Text(text.into())
        };
        self.outgoing
            .send(message)
            .map_err(|_| CLOSED_HANDLE.to_string())
    }

    /// Close the connection. No `websocket_closed` event is fired.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outgoing.send(Message::Close(None));
        }
    }
}

/// Parameters of a connection attempt.
pub(crate) struct Connect {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub computer: ComputerHandle,
    pub firewall: Arc<Firewall>,
    pub permit: OwnedSemaphorePermit,
    pub cancel: watch::Receiver<bool>,
    /// Abandons the handshake if the issuing step is hard-aborted.
    pub abort: Option<watch::Receiver<bool>>,
}

/// Connect and pump messages until either side closes.
pub(crate) async fn run(connect: Connect) {
    let Connect {
        url,
        headers,
        computer,
        firewall,
        permit: _permit,
        cancel,
        abort,
    } = connect;
    let address = url.to_string();

    let connecting = tokio::select! {
        _ = wait_cancelled(cancel.clone()) => return,
        _ = wait_aborted(abort) => return,
        result = open(&firewall, &url, &headers) => result,
    };
    let (stream, max_message) = match connecting {
        Ok(opened) => opened,
        Err(message) => {
            computer.queue_event(
                WEBSOCKET_FAILURE,
                vec![Value::from(address.as_str()), Value::from(message)],
            );
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = HostObject::new(WebsocketHandle {
        url: address.clone(),
        outgoing: tx,
        max_message,
        closed: AtomicBool::new(false),
    });
    computer.queue_event(
        WEBSOCKET_SUCCESS,
        vec![Value::from(address.as_str()), Value::Object(handle)],
    );
    debug!(computer_id = computer.id(), url = %address, "Websocket connected");

    let (mut sink, mut incoming) = stream.split();
    loop {
        tokio::select! {
            _ = wait_cancelled(cancel.clone()) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            outgoing = rx.recv() => match outgoing {
                Some(Message::Close(frame)) => {
                    let _ = sink.send(Message::Close(frame)).await;
                    break;
                }
                Some(message) => {
                    if let Err(e) = sink.send(message).await {
                        debug!(url = %address, error = %e, "Websocket send failed");
                        closed(&computer, &address, Value::Nil, Value::Nil);
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            received = incoming.next() => match received {
                Some(Ok(Message::Text(text))) => {
                    if too_large(max_message, text.len()) {
                        reject_oversized(&mut sink, &computer, &address).await;
                        break;
                    }
                    computer.queue_event(
                        WEBSOCKET_MESSAGE,
                        vec![
                            Value::from(address.as_str()),
                            Value::from(text.as_str()),
                            Value::Bool(false),
                        ],
                    );
                }
                Some(Ok(Message::Binary(data))) => {
                    if too_large(max_message, data.len()) {
                        reject_oversized(&mut sink, &computer, &address).await;
                        break;
                    }
                    computer.queue_event(
                        WEBSOCKET_MESSAGE,
                        vec![
                            Value::from(address.as_str()),
                            Value::Bytes(data.to_vec()),
                            Value::Bool(true),
                        ],
                    );
                }
                Some(Ok(Message::Close(frame))) => {
                    let (reason, code) = match frame {
                        Some(frame) => (
                            Value::from(frame.reason.as_str()),
                            Value::from(u16::from(frame.code)),
                        ),
                        None => (Value::Nil, Value::Nil),
                    };
                    closed(&computer, &address, reason, code);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(url = %address, error = %e, "Websocket read failed");
                    closed(&computer, &address, Value::Nil, Value::Nil);
                    break;
                }
                None => {
                    closed(&computer, &address, Value::Nil, Value::Nil);
                    break;
                }
            },
        }
    }
    debug!(computer_id = computer.id(), url = %address, "Websocket finished");
}

type Stream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn open(
    firewall: &Firewall,
    url: &Url,
    headers: &[(String, String)],
) -> Result<(Stream, usize), String> {
    let target = address::resolve(firewall, url).await?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|_| address::URL_MALFORMED.to_string())?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| format!("Invalid header name '{}'", name))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| format!("Invalid value for header '{}'", name))?;
        request.headers_mut().append(name, value);
    }

    let handshake = async {
        let socket = TcpStream::connect(target.address).await.map_err(|e| {
            debug!(address = %target.address, error = %e, "Websocket connect failed");
            COULD_NOT_CONNECT.to_string()
        })?;
        let (stream, _response) = tokio_tungstenite::client_async_tls(request, socket)
            .await
            .map_err(|e| {
                debug!(url = %url, error = %e, "Websocket handshake failed");
                COULD_NOT_CONNECT.to_string()
            })?;
        Ok::<_, String>(stream)
    };

    let stream = match target.options.timeout {
        Some(timeout) => tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TIMED_OUT.to_string())??,
        None => handshake.await?,
    };
    Ok((stream, target.options.max_websocket_message))
}

fn too_large(limit: usize, size: usize) -> bool {
    limit != 0 && size > limit
}

async fn reject_oversized<S>(sink: &mut S, computer: &ComputerHandle, address: &str)
where
    S: futures::Sink<Message> + Unpin,
{
    warn!(computer_id = computer.id(), url = %address, "Websocket message exceeded limit");
    let frame = CloseFrame {
        code: CloseCode::Size,
        reason: Utf8Bytes::from_static(MESSAGE_TOO_LARGE),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    closed(
        computer,
        address,
        Value::from(MESSAGE_TOO_LARGE),
        Value::from(u16::from(CloseCode::Size)),
    );
}

fn closed(computer: &ComputerHandle, address: &str, reason: Value, code: Value) {
    computer.queue_event(WEBSOCKET_CLOSED, vec![Value::from(address), reason, code]);
}
