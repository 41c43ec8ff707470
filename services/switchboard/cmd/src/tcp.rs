//! TCP frontend.
//!
//! Every accepted socket is one persistent full-duplex transport carrying
//! marker-framed frames in both directions. The first frame is the handshake
//! query (`transport=websocket&b64=1&sid=...`): without `sid` it opens a new
//! session, with `sid` it joins an open session as its upgrade candidate.

use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use switchboard_session::{
    HandshakeRequest, SessionId, SessionManager, SocketTransport, Transport, TransportId,
};
use switchboard_wire::{encode_frame_into, Frame, FrameDecoder, PayloadStyle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Framing used on the socket
pub const STREAM_STYLE: PayloadStyle = PayloadStyle::Marker;

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, manager: SessionManager) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("accept failed")?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, peer, manager).await {
                crate::component_warn!("tcp", %peer, "connection ended: {:#}", e);
            }
        });
    }
}

/// Drive one accepted socket until either side goes away
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, manager: SessionManager) -> Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(4096);
    let mut decoder = FrameDecoder::with_max_frame_size(manager.config().max_frame_size);

    let handshake = tokio::time::timeout(
        manager.config().first_data_timeout,
        read_frame(&mut reader, &mut buf, &mut decoder),
    )
    .await
    .map_err(|_| anyhow!("no handshake within {:?}", manager.config().first_data_timeout))??;
    let Some(handshake) = handshake else {
        return Ok(());
    };

    let request = HandshakeRequest::from_query(handshake.as_str()?)?.with_remote_addr(peer);
    let (transport, outbound) = SocketTransport::new(request.b64);
    let transport_id = transport.id();
    let sid = match request.sid {
        Some(sid) => {
            manager.attach(sid, transport.clone())?;
            crate::component_debug!("tcp", %peer, %sid, "attached as upgrade candidate");
            sid
        }
        None => manager.connect(request, transport.clone()).await?,
    };

    let writer_task = tokio::spawn(write_frames(writer, outbound, sid));
    let result = pump(&mut reader, buf, decoder, &manager, sid, transport_id, peer, writer_task).await;

    if let Err(e) = manager.transport_closed(sid, transport_id) {
        crate::component_debug!("tcp", %sid, "transport close not applied: {}", e);
    }
    transport.close();
    result
}

/// Feed inbound frames to the session until the peer hangs up or the server
/// closes the transport
#[allow(clippy::too_many_arguments)]
async fn pump(
    reader: &mut OwnedReadHalf,
    mut buf: BytesMut,
    mut decoder: FrameDecoder,
    manager: &SessionManager,
    sid: SessionId,
    transport_id: TransportId,
    peer: SocketAddr,
    mut writer_task: JoinHandle<()>,
) -> Result<()> {
    loop {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf)? {
            frames.push(frame);
        }
        if !frames.is_empty() {
            manager.receive(sid, transport_id, frames)?;
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                if read? == 0 {
                    crate::component_debug!("tcp", %peer, %sid, "peer closed");
                    return Ok(());
                }
            }
            _ = &mut writer_task => {
                crate::component_debug!("tcp", %peer, %sid, "transport closed by server");
                return Ok(());
            }
        }
    }
}

/// Read until one whole frame is buffered. `None` on a clean EOF.
async fn read_frame(reader: &mut OwnedReadHalf, buf: &mut BytesMut, decoder: &mut FrameDecoder) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = decoder.decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(anyhow!("connection closed mid-frame"));
        }
    }
}

/// Flush the transport's outbound channel onto the socket, batching whatever
/// is queued at each wakeup
async fn write_frames(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    sid: SessionId,
) {
    let mut out = BytesMut::with_capacity(4096);
    while let Some(frame) = outbound.recv().await {
        out.clear();
        encode_frame_into(&frame, STREAM_STYLE, &mut out);
        while let Ok(frame) = outbound.try_recv() {
            encode_frame_into(&frame, STREAM_STYLE, &mut out);
        }
        if let Err(e) = writer.write_all(&out).await {
            crate::component_debug!("tcp", %sid, "write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
