use crate::backoff::Retry;
use crate::error::ConnectError;
use crate::transport::{ConnectionState, Shared, TransportConfig, TransportObserver};
use crossbeam_channel::{Receiver, TryRecvError};
use obsdeck_protocol::{
    authentication_response, encode, op, subscription, FrameBuffer, Identify, Inbound,
    RPC_VERSION,
};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};
use tungstenite::protocol::Message;
use tungstenite::WebSocket;

type Socket = WebSocket<TcpStream>;

/// A serialized request waiting for the network thread.
pub(crate) struct Outbound {
    pub(crate) id: String,
    pub(crate) text: String,
}

pub(crate) struct NetworkThread {
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkThread {
    pub(crate) fn spawn(
        config: TransportConfig,
        shared: Arc<Shared>,
        out_rx: Receiver<Outbound>,
        observer: Arc<dyn TransportObserver>,
    ) -> Self {
        let join_handle = thread::Builder::new()
            .name("obsdeck-net".to_string())
            .spawn(move || run_client(config, shared, out_rx, observer))
            .ok();
        Self {
            join_handle: Mutex::new(join_handle),
        }
    }

    /// Joins the thread. The caller must have moved the state to Terminated.
    pub(crate) fn shutdown(&self) {
        if let Ok(mut h) = self.join_handle.lock() {
            if let Some(h) = h.take() {
                if h.thread().id() != thread::current().id() {
                    let _ = h.join();
                }
            }
        }
    }
}

fn terminated(shared: &Shared) -> bool {
    shared.state.get() == ConnectionState::Terminated
}

fn run_client(
    config: TransportConfig,
    shared: Arc<Shared>,
    out_rx: Receiver<Outbound>,
    observer: Arc<dyn TransportObserver>,
) {
    let mut backoff = config.backoff.clone();

    while !terminated(&shared) {
        shared.state.set(ConnectionState::Connecting);

        // Frames queued for a previous connection belong to requests that
        // were already failed.
        while let Ok(stale) = out_rx.try_recv() {
            shared.fail_one(&stale.id);
        }

        match connect(&config, &shared) {
            Ok(mut ws) => {
                backoff.reset();
                shared.state.set(ConnectionState::Connected);
                shared.state.set(ConnectionState::Running);
                info!(server = %config.server, port = config.port, "connected");
                observer.on_connectivity_change(true);

                let reason = service(&mut ws, &config, &shared, &out_rx, observer.as_ref());

                shared.state.set(ConnectionState::Connecting);
                shared.fail_all();
                let _ = ws.close(None);
                let _ = ws.flush();
                if matches!(reason, ConnectError::Terminated) || terminated(&shared) {
                    break;
                }
                warn!("connection lost: {reason}");
                observer.on_connectivity_change(false);
            }
            Err(ConnectError::Terminated) => break,
            Err(e) => debug!("connect failed: {e}"),
        }

        let delay = match backoff.next_delay() {
            Retry::After(d) => d,
            Retry::Exhausted(d) => {
                info!(retry_in = ?d, "connection attempts exhausted");
                shared.state.set(ConnectionState::Idle);
                shared.fail_all();
                observer.on_connectivity_change(false);
                d
            }
        };
        shared
            .state
            .wait_while(delay, |s| s != ConnectionState::Terminated);
    }

    shared.fail_all();
    debug!("network thread exiting");
}

fn connect(config: &TransportConfig, shared: &Shared) -> Result<Socket, ConnectError> {
    let addr = (config.server.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ConnectError::Handshake(format!("cannot resolve {}", config.server)))?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.connect_timeout))?;
    stream.set_write_timeout(Some(config.connect_timeout))?;

    let url = format!("ws://{}:{}/", config.server, config.port);
    let (mut ws, _) =
        tungstenite::client(url.as_str(), stream).map_err(|e| ConnectError::Handshake(e.to_string()))?;

    if !shared.state.set(ConnectionState::Identifying) {
        return Err(ConnectError::Terminated);
    }
    identify(&mut ws, config)?;

    ws.get_ref().set_read_timeout(Some(config.poll_interval))?;
    Ok(ws)
}

/// Hello -> Identify -> Identified, including the salted challenge.
fn identify(ws: &mut Socket, config: &TransportConfig) -> Result<(), ConnectError> {
    let mut frames = FrameBuffer::new();

    let hello = loop {
        match read_frame(ws, &mut frames)? {
            Inbound::Hello(h) => break h,
            other => trace!(?other, "ignoring frame before hello"),
        }
    };
    if hello.rpc_version < RPC_VERSION {
        return Err(ConnectError::UnsupportedRpcVersion(hello.rpc_version));
    }

    let authentication = match (&hello.authentication, &config.password) {
        (Some(challenge), Some(password)) => Some(authentication_response(
            password,
            &challenge.salt,
            &challenge.challenge,
        )),
        (Some(_), None) => return Err(ConnectError::AuthRequired),
        (None, _) => None,
    };

    let identify = Identify {
        rpc_version: RPC_VERSION,
        authentication,
        event_subscriptions: subscription::DECK,
    };
    let text = encode(op::IDENTIFY, &identify).map_err(|e| ConnectError::Handshake(e.to_string()))?;
    ws.send(Message::Text(text))?;

    let identified = loop {
        match read_frame(ws, &mut frames)? {
            Inbound::Identified(i) => break i,
            other => trace!(?other, "ignoring frame before identified"),
        }
    };
    if identified.negotiated_rpc_version != RPC_VERSION {
        return Err(ConnectError::UnsupportedRpcVersion(identified.negotiated_rpc_version));
    }
    debug!(remote = %hello.obs_web_socket_version, "identified");
    Ok(())
}

fn read_frame(ws: &mut Socket, frames: &mut FrameBuffer) -> Result<Inbound, ConnectError> {
    loop {
        let text = match ws.read()? {
            Message::Text(s) => s,
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(_) => return Err(ConnectError::Closed),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };
        match frames.push(&text) {
            Ok(Some(inbound)) => return Ok(inbound),
            Ok(None) => continue,
            Err(e) => return Err(ConnectError::Handshake(e.to_string())),
        }
    }
}

/// Services one established session until it ends. Always returns the reason.
fn service(
    ws: &mut Socket,
    config: &TransportConfig,
    shared: &Shared,
    out_rx: &Receiver<Outbound>,
    observer: &dyn TransportObserver,
) -> ConnectError {
    let mut frames = FrameBuffer::new();

    loop {
        if terminated(shared) {
            return ConnectError::Terminated;
        }

        // Outbound: drain queued requests.
        let mut wrote = false;
        loop {
            match out_rx.try_recv() {
                Ok(frame) => {
                    if let Err(e) = ws.send(Message::Text(frame.text)) {
                        shared.fail_one(&frame.id);
                        return e.into();
                    }
                    wrote = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return ConnectError::Terminated,
            }
        }
        if wrote {
            shared.state.set(ConnectionState::Writable);
        }

        // Inbound: at most one message per pass; the read timeout keeps the loop moving.
        match ws.read() {
            Ok(Message::Text(text)) => dispatch(&text, config, shared, &mut frames, observer),
            Ok(Message::Binary(b)) => {
                dispatch(&String::from_utf8_lossy(&b), config, shared, &mut frames, observer)
            }
            Ok(Message::Close(_)) => return ConnectError::Closed,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return ConnectError::Closed
            }
            Err(e) => return e.into(),
        }
    }
}

fn dispatch(
    text: &str,
    config: &TransportConfig,
    shared: &Shared,
    frames: &mut FrameBuffer,
    observer: &dyn TransportObserver,
) {
    if config.log_events {
        debug!(frame = %text, "inbound");
    }
    match frames.push(text) {
        Ok(Some(Inbound::Event(event))) => observer.on_event(event),
        Ok(Some(
            inbound @ (Inbound::Response(_) | Inbound::BatchResponse(_) | Inbound::Malformed { .. }),
        )) => shared.resolve(inbound),
        Ok(Some(other)) => trace!(?other, "ignoring frame"),
        Ok(None) => trace!("partial frame buffered"),
        Err(e) => warn!("discarding inbound frame: {e}"),
    }
}
