//! TCP transport. Every message is one length-prefixed frame; requests and
//! responses are multiplexed on a connection and matched by sequence number.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use fxhash::FxHashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::{error_code, BoxFuture, ConnectionListener, HandlerTable, RaftTransport};
use crate::codec::{
    write_bool, write_bytes, write_uint, BytesAccumulator, PbCallback, PbEncode, PbParser,
};
use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::raft::NodeId;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_BUFFER_SIZE: usize = 4 * 1024;
const MAX_CACHED_WRITE_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcFrame {
    pub command: u32,
    pub seq: u32,
    pub resp_code: u32,
    pub msg: String,
    pub body: Bytes,
    pub is_resp: bool,
    pub from_node: NodeId,
}

impl PbEncode for RpcFrame {
    fn encode(&self, buf: &mut BytesMut) {
        write_uint(buf, 1, self.command as u64);
        write_uint(buf, 2, self.seq as u64);
        write_uint(buf, 3, self.resp_code as u64);
        write_bytes(buf, 4, self.msg.as_bytes());
        write_bytes(buf, 5, &self.body);
        write_bool(buf, 6, self.is_resp);
        write_uint(buf, 7, self.from_node as u64);
    }
}

impl RpcFrame {
    fn response(req: &RpcFrame, result: Result<Bytes>) -> RpcFrame {
        let mut frame = RpcFrame {
            command: req.command,
            seq: req.seq,
            is_resp: true,
            ..Default::default()
        };
        match result {
            Ok(body) => frame.body = body,
            Err(e) => {
                frame.resp_code = error_code(&e);
                frame.msg = e.to_string();
            }
        }
        frame
    }

    fn into_result(self) -> Result<Bytes> {
        if self.resp_code == 0 {
            Ok(self.body)
        } else {
            Err(RaftError::Remote {
                code: self.resp_code,
                msg: self.msg,
            })
        }
    }
}

/// Turns parser callbacks into whole frames.
#[derive(Default)]
struct FrameCollector {
    current: RpcFrame,
    acc: BytesAccumulator,
    frames: Vec<RpcFrame>,
}

impl PbCallback for FrameCollector {
    fn begin(&mut self, _len: usize) {
        self.current = RpcFrame::default();
    }

    fn end(&mut self) {
        self.frames.push(std::mem::take(&mut self.current));
    }

    fn read_varint(&mut self, index: u32, value: u64) -> bool {
        match index {
            1 => self.current.command = value as u32,
            2 => self.current.seq = value as u32,
            3 => self.current.resp_code = value as u32,
            6 => self.current.is_resp = value != 0,
            7 => self.current.from_node = value as NodeId,
            _ => {}
        }
        true
    }

    fn read_bytes(&mut self, index: u32, chunk: &[u8], total: usize, begin: bool, end: bool) -> bool {
        if let Some(v) = self.acc.push(chunk, total, begin, end) {
            match index {
                4 => self.current.msg = String::from_utf8_lossy(&v).into_owned(),
                5 => self.current.body = Bytes::from(v),
                _ => {}
            }
        }
        true
    }
}

/// Write half of a connection with the buffer reused for every frame.
struct FrameWriter {
    stream: OwnedWriteHalf,
    buf: BytesMut,
}

impl FrameWriter {
    fn new(stream: OwnedWriteHalf) -> Self {
        FrameWriter {
            stream,
            buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
        }
    }

    async fn write(&mut self, frame: &RpcFrame) -> Result<()> {
        self.buf.clear();
        frame.encode_frame(&mut self.buf);
        self.stream.write_all(&self.buf).await?;
        if self.buf.capacity() > MAX_CACHED_WRITE_BUFFER {
            self.buf = BytesMut::with_capacity(WRITE_BUFFER_SIZE);
        }
        Ok(())
    }
}

async fn read_frames<F>(mut reader: OwnedReadHalf, max_frame: usize, mut on_frame: F) -> Result<()>
where
    F: FnMut(RpcFrame),
{
    let mut parser = PbParser::new(max_frame);
    let mut collector = FrameCollector::default();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        parser.parse(&buf[..n], &mut collector)?;
        for frame in collector.frames.drain(..) {
            on_frame(frame);
        }
    }
}

struct Connection {
    writer: tokio::sync::Mutex<FrameWriter>,
    pending: Mutex<FxHashMap<u32, oneshot::Sender<Result<Bytes>>>>,
}

impl Connection {
    fn complete(&self, frame: RpcFrame) {
        let tx = self.pending.lock().ok().and_then(|mut p| p.remove(&frame.seq));
        match tx {
            Some(tx) => {
                let _ = tx.send(frame.into_result());
            }
            None => debug!("response seq {} has no waiter", frame.seq),
        }
    }

    fn forget(&self, seq: u32) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&seq);
        }
    }

    fn fail_all(&self, to: NodeId) {
        let waiters: Vec<_> = self
            .pending
            .lock()
            .map(|mut p| p.drain().map(|(_, tx)| tx).collect())
            .unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(Err(RaftError::PeerUnreachable(to)));
        }
    }
}

/// Drops the pending entry when the caller gives up waiting.
struct PendingGuard {
    conn: Arc<Connection>,
    seq: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.conn.forget(self.seq);
    }
}

struct TransportInner {
    self_id: NodeId,
    max_frame: usize,
    connect_timeout: Duration,
    io: Handle,
    seq: AtomicU32,
    nodes: Mutex<FxHashMap<NodeId, String>>,
    conns: Mutex<FxHashMap<NodeId, Arc<Connection>>>,
    connect_lock: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
}

impl TransportInner {
    fn cached(&self, to: NodeId) -> Option<Arc<Connection>> {
        self.conns.lock().ok().and_then(|c| c.get(&to).cloned())
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.lock().ok().and_then(|l| l.clone())
    }

    async fn connection(self: &Arc<Self>, to: NodeId) -> Result<Arc<Connection>> {
        if let Some(c) = self.cached(to) {
            return Ok(c);
        }
        let _guard = self.connect_lock.lock().await;
        if let Some(c) = self.cached(to) {
            return Ok(c);
        }
        let addr = self
            .nodes
            .lock()
            .ok()
            .and_then(|n| n.get(&to).cloned())
            .ok_or(RaftError::PeerUnreachable(to))?;
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!("connect to node {} at {} failed: {}", to, addr, e);
                return Err(RaftError::PeerUnreachable(to));
            }
            Err(_) => return Err(RaftError::Timeout(format!("connect to {}", addr))),
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Connection {
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            pending: Mutex::new(FxHashMap::default()),
        });
        if let Ok(mut conns) = self.conns.lock() {
            conns.insert(to, conn.clone());
        }
        info!("connected to node {} at {}", to, addr);
        if let Some(l) = self.listener() {
            l.on_connected(to);
        }

        let inner = self.clone();
        let c = conn.clone();
        self.io.spawn(async move {
            let r = read_frames(reader, inner.max_frame, |frame| {
                if frame.is_resp {
                    c.complete(frame);
                } else {
                    warn!("unexpected request on client connection to {}", to);
                }
            })
            .await;
            if let Err(e) = r {
                warn!("connection to node {} broken: {}", to, e);
            }
            inner.drop_connection(to, &c);
        });
        Ok(conn)
    }

    fn drop_connection(&self, to: NodeId, conn: &Arc<Connection>) {
        let removed = self
            .conns
            .lock()
            .map(|mut conns| match conns.get(&to) {
                Some(c) if Arc::ptr_eq(c, conn) => conns.remove(&to).is_some(),
                _ => false,
            })
            .unwrap_or(false);
        conn.fail_all(to);
        if removed {
            if let Some(l) = self.listener() {
                l.on_disconnected(to);
            }
        }
    }

    async fn call(self: Arc<Self>, to: NodeId, command: u32, body: Bytes) -> Result<Bytes> {
        let conn = self.connection(to).await?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut p) = conn.pending.lock() {
            p.insert(seq, tx);
        }
        let _guard = PendingGuard {
            conn: conn.clone(),
            seq,
        };
        let frame = RpcFrame {
            command,
            seq,
            body,
            from_node: self.self_id,
            ..Default::default()
        };
        let written = conn.writer.lock().await.write(&frame).await;
        if let Err(e) = written {
            warn!("write to node {} failed: {}", to, e);
            self.drop_connection(to, &conn);
            return Err(RaftError::PeerUnreachable(to));
        }
        rx.await.map_err(|_| RaftError::PeerUnreachable(to))?
    }
}

/// Client and server sides of the TCP network of one node.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<TransportInner>,
}

impl TcpTransport {
    /// Connections and their reader tasks live on `io`.
    pub fn new(self_id: NodeId, max_frame: usize, connect_timeout: Duration, io: Handle) -> Self {
        TcpTransport {
            inner: Arc::new(TransportInner {
                self_id,
                max_frame,
                connect_timeout,
                io,
                seq: AtomicU32::new(1),
                nodes: Mutex::new(FxHashMap::default()),
                conns: Mutex::new(FxHashMap::default()),
                connect_lock: tokio::sync::Mutex::new(()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Accepts connections until `shutdown` resolves. Each request frame is
    /// handled in its own task so a slow handler does not block the
    /// connection.
    pub async fn serve<F>(&self, listener: TcpListener, handlers: HandlerTable, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let max_frame = self.inner.max_frame;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("rpc server stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        tokio::spawn(serve_connection(stream, handlers.clone(), max_frame));
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, handlers: HandlerTable, max_frame: usize) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("set nodelay failed: {}", e);
    }
    let (reader, writer) = stream.into_split();
    let writer = Arc::new(tokio::sync::Mutex::new(FrameWriter::new(writer)));
    let r = read_frames(reader, max_frame, |frame| {
        if frame.is_resp {
            warn!("unexpected response frame from node {}", frame.from_node);
            return;
        }
        let writer = writer.clone();
        let handlers = handlers.clone();
        tokio::spawn(async move {
            let result = handlers
                .dispatch(frame.command, frame.from_node, frame.body.clone())
                .await;
            let resp = RpcFrame::response(&frame, result);
            if let Err(e) = writer.lock().await.write(&resp).await {
                debug!("write response to node {} failed: {}", frame.from_node, e);
            }
        });
    })
    .await;
    if let Err(e) = r {
        warn!("server connection closed: {}", e);
    }
}

impl RaftTransport for TcpTransport {
    fn send(&self, to: NodeId, command: u32, body: Bytes, timeout: Duration) -> BoxFuture<Result<Bytes>> {
        let inner = self.inner.clone();
        let task = self.inner.io.spawn(async move {
            match tokio::time::timeout(timeout, inner.call(to, command, body)).await {
                Ok(r) => r,
                Err(_) => Err(RaftError::Timeout(format!("command {} to node {}", command, to))),
            }
        });
        Box::pin(async move {
            task.await
                .map_err(|e| RaftError::Protocol(format!("rpc task failed: {}", e)))?
        })
    }

    fn add_node(&self, node: &NodeConfig) -> Result<()> {
        if let Ok(mut nodes) = self.inner.nodes.lock() {
            nodes.insert(node.id(), node.addr().clone());
        }
        Ok(())
    }

    fn remove_node(&self, id: NodeId) -> Result<()> {
        if let Ok(mut nodes) = self.inner.nodes.lock() {
            nodes.remove(&id);
        }
        if let Some(conn) = self.inner.cached(id) {
            self.inner.drop_connection(id, &conn);
        }
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        if let Ok(mut l) = self.inner.listener.lock() {
            *l = Some(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{command, RpcHandler};

    #[test]
    fn test_collect_frames_split_anywhere() {
        let frames = vec![
            RpcFrame {
                command: command::RAFT_PING,
                seq: 7,
                from_node: 3,
                body: Bytes::from_static(b"ping body"),
                ..Default::default()
            },
            RpcFrame {
                command: command::RAFT_PING,
                seq: 7,
                resp_code: 5,
                msg: "bad".to_string(),
                is_resp: true,
                ..Default::default()
            },
        ];
        let mut buf = BytesMut::new();
        for f in &frames {
            f.encode_frame(&mut buf);
        }
        for split in [1, 3, 5, buf.len() - 1] {
            let mut parser = PbParser::new(1024);
            let mut collector = FrameCollector::default();
            parser.parse(&buf[..split], &mut collector).unwrap();
            parser.parse(&buf[split..], &mut collector).unwrap();
            assert_eq!(collector.frames, frames, "split at {}", split);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_response_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handlers = HandlerTable::new();
        let echo: Arc<dyn RpcHandler> = Arc::new(|from: NodeId, body: Bytes| -> BoxFuture<Result<Bytes>> {
            Box::pin(async move {
                let mut v = body.to_vec();
                v.push(from as u8);
                Ok(Bytes::from(v))
            })
        });
        handlers.register(command::NODE_PING, echo);

        let server = TcpTransport::new(2, 1024 * 1024, Duration::from_secs(1), Handle::current());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(async move {
            server
                .serve(listener, handlers, async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let client = TcpTransport::new(1, 1024 * 1024, Duration::from_secs(1), Handle::current());
        client
            .add_node(&NodeConfig::new(2, &addr.to_string()))
            .unwrap();
        let timeout = Duration::from_secs(2);
        for _ in 0..3 {
            let r = client
                .send(2, command::NODE_PING, Bytes::from_static(b"x"), timeout)
                .await
                .unwrap();
            assert_eq!(&r[..], b"x\x01");
        }
        let e = client
            .send(2, command::RAFT_QUERY_STATUS, Bytes::new(), timeout)
            .await;
        assert!(matches!(e, Err(RaftError::Remote { code: 5, .. })));

        let e = client.send(9, command::NODE_PING, Bytes::new(), timeout).await;
        assert!(matches!(e, Err(RaftError::PeerUnreachable(9))));

        let _ = stop_tx.send(());
        serving.await.unwrap().unwrap();
    }
}
