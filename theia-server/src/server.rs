use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use theia::{Collector, Error, Event, FilterDescriptor};

use crate::gelf::{GelfLevel, GelfLogger};
use crate::protocol::{self, ChannelPath};

/// Shared server state passed to each connection task.
pub struct ServerState {
    pub collector: Arc<Collector>,
    /// Buffer size for a `/live` subscriber's channel (spec §4.4).
    pub live_buffer: usize,
    pub gelf: Option<Arc<GelfLogger>>,
}

fn log(state: &ServerState, level: GelfLevel, msg: &str) {
    eprintln!("{msg}");
    if let Some(gelf) = &state.gelf {
        gelf.send(level, msg, &[]);
    }
}

/// Handle one accepted TCP connection end-to-end.
pub async fn handle_connection(stream: TcpStream, state: Arc<ServerState>) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    log(&state, GelfLevel::Informational, &format!("client connected: {peer}"));

    stream.set_nodelay(true).ok();
    let (mut reader, mut writer) = tokio::io::split(stream);

    let first = match protocol::read_message(&mut reader).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                log(&state, GelfLevel::Warning, &format!("read error from {peer}: {e}"));
            }
            log(&state, GelfLevel::Informational, &format!("client disconnected: {peer}"));
            return;
        }
    };

    match protocol::parse_path(&first) {
        Some(ChannelPath::Event) => handle_event_channel(reader, writer, &state, &peer).await,
        Some(ChannelPath::Find) => handle_find_channel(reader, writer, &state, &peer).await,
        Some(ChannelPath::Live) => handle_live_channel(reader, writer, &state, &peer).await,
        None => {
            let resp = serde_json::json!({"ok": false, "error": "unknown or malformed path"});
            let _ = protocol::write_message(&mut writer, resp.to_string().as_bytes()).await;
        }
    }

    log(&state, GelfLevel::Informational, &format!("client disconnected: {peer}"));
}

/// `/event`: OPEN -> RECEIVING* (spec §4.5). Parse errors are logged and the
/// loop continues; store errors close the channel.
async fn handle_event_channel<R, W>(mut reader: R, mut writer: W, state: &Arc<ServerState>, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = match protocol::read_message(&mut reader).await {
            Ok(m) => m,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    log(state, GelfLevel::Warning, &format!("read error from {peer}: {e}"));
                }
                return;
            }
        };

        let collector = Arc::clone(&state.collector);
        let result = tokio::task::spawn_blocking(move || collector.ingest(&msg))
            .await
            .unwrap_or_else(|e| Err(Error::Parse(format!("ingest task panicked: {e}"))));

        match result {
            Ok(()) => {}
            Err(Error::Parse(detail)) => {
                log(state, GelfLevel::Warning, &format!("parse error from {peer}: {detail}"));
            }
            Err(e) => {
                log(state, GelfLevel::Error, &format!("store error from {peer}: {e}"));
                return;
            }
        }
    }
}

/// `/find`: OPEN -> AWAIT_FILTER -> STREAMING -> CLOSED (spec §4.5).
///
/// The scan itself runs on a blocking thread (disk I/O) and streams
/// results back through a channel rather than collecting into a `Vec`
/// first, so results start arriving as soon as the first bucket/page is
/// read. The `tokio::select!` below races that channel against the read
/// half: a client disconnecting mid-scan sets `cancelled`, which the scan
/// thread observes at its next bucket/page boundary and stops at, instead
/// of running to completion regardless of the caller's continued interest
/// (spec §5).
async fn handle_find_channel<R, W>(mut reader: R, mut writer: W, state: &Arc<ServerState>, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = match protocol::read_message(&mut reader).await {
        Ok(m) => m,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                log(state, GelfLevel::Warning, &format!("read error from {peer}: {e}"));
            }
            return;
        }
    };

    let descriptor: FilterDescriptor = match serde_json::from_slice(&msg) {
        Ok(d) => d,
        Err(e) => {
            let resp = serde_json::json!({"ok": false, "error": format!("invalid filter: {e}")});
            let _ = protocol::write_message(&mut writer, resp.to_string().as_bytes()).await;
            return;
        }
    };

    let cancelled = Arc::new(AtomicBool::new(false));
    let scan_cancelled = Arc::clone(&cancelled);
    let collector = Arc::clone(&state.collector);
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Result<Event, Error>>(32);
    tokio::task::spawn_blocking(move || {
        let iter = match collector.find(&descriptor, scan_cancelled) {
            Ok(iter) => iter,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for item in iter {
            if tx.blocking_send(item).is_err() {
                return; // receiver gone: the connection already stopped reading
            }
        }
    });

    loop {
        tokio::select! {
            read_result = protocol::read_message(&mut reader) => {
                match read_result {
                    Ok(_) => continue, // clients send nothing further on /find; ignore
                    Err(_) => {
                        cancelled.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
            item = rx.recv() => {
                match item {
                    Some(Ok(event)) => {
                        if let Err(e) = protocol::write_message(&mut writer, &event.serialize()).await {
                            log(state, GelfLevel::Warning, &format!("write error to {peer}: {e}"));
                            cancelled.store(true, Ordering::Relaxed);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let resp = serde_json::json!({"ok": false, "error": e.to_string()});
                        let _ = protocol::write_message(&mut writer, resp.to_string().as_bytes()).await;
                        break;
                    }
                    None => break, // scan finished
                }
            }
        }
    }
}

/// `/live`: OPEN -> AWAIT_FILTER -> SUBSCRIBED -> CLOSED (spec §4.5). The
/// subscription ends on client disconnect or broker eviction.
async fn handle_live_channel<R, W>(mut reader: R, mut writer: W, state: &Arc<ServerState>, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let msg = match protocol::read_message(&mut reader).await {
        Ok(m) => m,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                log(state, GelfLevel::Warning, &format!("read error from {peer}: {e}"));
            }
            return;
        }
    };

    let descriptor: FilterDescriptor = match serde_json::from_slice(&msg) {
        Ok(d) => d,
        Err(e) => {
            let resp = serde_json::json!({"ok": false, "error": format!("invalid filter: {e}")});
            let _ = protocol::write_message(&mut writer, resp.to_string().as_bytes()).await;
            return;
        }
    };

    let mut handle = match state.collector.subscribe(&descriptor, state.live_buffer) {
        Ok(h) => h,
        Err(e) => {
            let resp = serde_json::json!({"ok": false, "error": e.to_string()});
            let _ = protocol::write_message(&mut writer, resp.to_string().as_bytes()).await;
            return;
        }
    };

    loop {
        tokio::select! {
            read_result = protocol::read_message(&mut reader) => {
                match read_result {
                    Ok(_) => continue, // clients send nothing further on /live; ignore
                    Err(_) => break,   // disconnect
                }
            }
            event = handle.rx.recv() => {
                match event {
                    Some(bytes) => {
                        if let Err(e) = protocol::write_message(&mut writer, &bytes).await {
                            log(state, GelfLevel::Warning, &format!("write error to {peer}: {e}"));
                            break;
                        }
                    }
                    None => break, // broker evicted this subscriber
                }
            }
        }
    }

    state.collector.unsubscribe(handle.id);
}
