use crate::socket::consts::{FRAME_LENGTH_SIZE, FRAME_MAX_SIZE, URL, WA_CONN_HEADER};
use crate::socket::error::{Result, SocketError};
use bytes::{Buf, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;
use tokio_websockets::{ClientBuilder, MaybeTlsStream, Message, WebSocketStream};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

type OnDisconnectCallback = Box<dyn Fn(bool) + Send>;

/// Owns the WebSocket and the 3-byte big-endian length framing. Decrypted
/// payload handling lives above this layer; the frame socket only moves
/// whole frames.
pub struct FrameSocket {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
    frames_tx: Sender<bytes::Bytes>,
    on_disconnect: Arc<Mutex<Option<OnDisconnectCallback>>>,
    is_connected: Arc<Mutex<bool>>,
    /// The WA connection header, sent once in front of the first frame.
    header: Arc<Mutex<Option<Vec<u8>>>>,
}

impl FrameSocket {
    pub fn new() -> (Self, Receiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::channel(100);
        let socket = Self {
            ws_sink: Arc::new(Mutex::new(None)),
            frames_tx: tx,
            on_disconnect: Arc::new(Mutex::new(None)),
            is_connected: Arc::new(Mutex::new(false)),
            header: Arc::new(Mutex::new(Some(WA_CONN_HEADER.to_vec()))),
        };
        (socket, rx)
    }

    pub async fn is_connected(&self) -> bool {
        *self.is_connected.lock().await
    }

    pub async fn set_on_disconnect(&self, cb: OnDisconnectCallback) {
        *self.on_disconnect.lock().await = Some(cb);
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_connected().await {
            return Err(SocketError::SocketAlreadyOpen);
        }

        debug!(target: "Socket", "dialing {URL}");
        let uri: http::Uri = URL
            .parse()
            .map_err(|e| SocketError::WebSocket(format!("bad url: {e}")))?;
        let (client, _response) = ClientBuilder::from_uri(uri).connect().await?;

        let (sink, stream) = client.split();
        *self.ws_sink.lock().await = Some(sink);
        *self.is_connected.lock().await = true;

        tokio::spawn(Self::read_pump(
            stream,
            self.frames_tx.clone(),
            self.is_connected.clone(),
            self.on_disconnect.clone(),
        ));
        Ok(())
    }

    /// Sends one frame: header (first frame only) + 3-byte BE length + data.
    pub async fn send_frame(&self, data: &[u8]) -> Result<()> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(SocketError::SocketClosed)?;

        let data_len = data.len();
        if data_len >= FRAME_MAX_SIZE {
            return Err(SocketError::FrameTooLarge {
                max: FRAME_MAX_SIZE,
                got: data_len,
            });
        }

        let mut header = self.header.lock().await.take().unwrap_or_default();
        let mut whole_frame = Vec::with_capacity(header.len() + FRAME_LENGTH_SIZE + data_len);
        whole_frame.append(&mut header);
        whole_frame.extend_from_slice(&u32::to_be_bytes(data_len as u32)[1..]);
        whole_frame.extend_from_slice(data);

        trace!(target: "Socket", "--> frame: {data_len} payload bytes");
        sink.send(Message::binary(bytes::Bytes::from(whole_frame)))
            .await?;
        Ok(())
    }

    async fn read_pump(
        mut stream: WsStream,
        frames_tx: Sender<bytes::Bytes>,
        is_connected: Arc<Mutex<bool>>,
        on_disconnect: Arc<Mutex<Option<OnDisconnectCallback>>>,
    ) {
        let mut buffer = BytesMut::new();

        loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    if msg.is_binary() {
                        buffer.extend_from_slice(msg.as_payload());
                        while buffer.len() >= FRAME_LENGTH_SIZE {
                            let frame_len = ((buffer[0] as usize) << 16)
                                | ((buffer[1] as usize) << 8)
                                | (buffer[2] as usize);
                            if buffer.len() < FRAME_LENGTH_SIZE + frame_len {
                                break;
                            }
                            buffer.advance(FRAME_LENGTH_SIZE);
                            let frame = buffer.split_to(frame_len).freeze();
                            trace!(target: "Socket", "<-- frame: {} bytes", frame.len());
                            if frames_tx.send(frame).await.is_err() {
                                warn!(target: "Socket", "frame receiver dropped, stopping read pump");
                                return;
                            }
                        }
                    } else if msg.is_close() {
                        trace!(target: "Socket", "received close frame");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(target: "Socket", "websocket read failed: {e}");
                    break;
                }
                None => {
                    trace!(target: "Socket", "websocket stream ended");
                    break;
                }
            }
        }

        *is_connected.lock().await = false;
        if let Some(cb) = on_disconnect.lock().await.as_ref() {
            (cb)(true);
        }
    }

    pub async fn close(&self) {
        let mut is_connected = self.is_connected.lock().await;
        if *is_connected {
            *is_connected = false;
            *self.ws_sink.lock().await = None;
            if let Some(cb) = self.on_disconnect.lock().await.as_ref() {
                (cb)(false);
            }
        }
    }
}
