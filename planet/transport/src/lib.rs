//! Transport adapters for host sessions: length-prefixed bincode frames over
//! any byte stream, a Unix socket listener that opens one session per
//! connection, and a matching client.
#![deny(missing_docs)]

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use planet_core::{Host, HostSession, SessionEndpoint};
use planet_spec::{Msg, MsgBatch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport error.
pub type TransportResult<T> = Result<T, anyhow::Error>;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Writes `value` as a big-endian `u32` length followed by its bincode encoding.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> TransportResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(value)?;
    if bytes.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds {MAX_FRAME_BYTES}", bytes.len());
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> TransportResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len = [0u8; 4];
    match reader.read_exact(&mut len).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_BYTES {
        bail!("peer sent a {len} byte frame, limit is {MAX_FRAME_BYTES}");
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .context("truncated frame")?;
    Ok(Some(bincode::deserialize(&buf)?))
}

/// Pumps frames between `stream` and `session` until either side closes.
///
/// Inbound frames are [`Msg`]s, outbound frames are [`MsgBatch`]es. When the
/// peer disconnects the session's inbound pipe is dropped, which closes it.
pub async fn serve_session<S>(session: Arc<HostSession>, stream: S) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let SessionEndpoint { inbox, mut outbox } = session
        .take_endpoint()
        .context("session is already attached to a transport")?;
    let session_id = session.session_id();
    let (mut rd, mut wr) = tokio::io::split(stream);

    let writer = async move {
        while let Some(batch) = outbox.recv().await {
            write_frame(&mut wr, &batch).await?;
        }
        let _ = wr.shutdown().await;
        TransportResult::Ok(())
    };
    let reader = async move {
        while let Some(msg) = read_frame::<_, Msg>(&mut rd).await? {
            if inbox.send(msg).await.is_err() {
                break;
            }
        }
        TransportResult::Ok(())
    };
    tokio::pin!(writer);

    let result = tokio::select! {
        read = reader => {
            // Inbound pipe is gone; the session closes and the writer drains.
            let written = writer.await;
            read.and(written)
        }
        written = &mut writer => written,
    };
    match &result {
        Ok(()) => debug!(session_id, "transport finished"),
        Err(err) => warn!(session_id, "transport failed: {err:#}"),
    }
    result
}

/// Unix socket listener serving one host session per connection.
pub struct UnixIpc {
    listener: UnixListener,
    host: Arc<Host>,
}

impl UnixIpc {
    /// Bind `path`, replacing a stale socket file.
    pub async fn bind<P: AsRef<Path>>(path: P, host: Arc<Host>) -> TransportResult<Self> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).context("removing stale socket"),
        }
        let listener = UnixListener::bind(path)
            .with_context(|| format!("binding {}", path.display()))?;
        info!(path = %path.display(), "unix ipc listening");
        Ok(Self { listener, host })
    }

    /// Accept connections until the host starts stopping.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let closing = self.host.context().closing().clone();
            loop {
                let stream = tokio::select! {
                    _ = closing.cancelled() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(err) => {
                            warn!("unix ipc accept error: {err:?}");
                            break;
                        }
                    },
                };
                let session = match self.host.start_new_session() {
                    Ok(session) => session,
                    Err(err) => {
                        warn!("refusing connection: {err}");
                        continue;
                    }
                };
                info!(session_id = session.session_id(), "unix ipc: client connected");
                tokio::spawn(async move {
                    let _ = serve_session(session, stream).await;
                });
            }
            debug!("unix ipc stopped accepting");
        })
    }
}

/// Client side of a framed session connection.
pub struct ClientConn<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
}

impl ClientConn<UnixStream> {
    /// Connect to a host listening on `path`.
    pub async fn connect<P: AsRef<Path>>(path: P) -> TransportResult<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("connecting to {}", path.display()))?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite> ClientConn<S> {
    /// Wrap an established stream.
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self { reader, writer }
    }

    /// Send one message to the host.
    pub async fn send(&mut self, msg: &Msg) -> TransportResult<()> {
        write_frame(&mut self.writer, msg).await
    }

    /// Next batch from the host, or `None` once the host hung up.
    pub async fn recv(&mut self) -> TransportResult<Option<MsgBatch>> {
        read_frame(&mut self.reader).await
    }

    /// Next batch, failing if the host hung up.
    pub async fn expect_batch(&mut self) -> TransportResult<MsgBatch> {
        self.recv()
            .await?
            .context("host closed the connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planet_core::{AttrValue, HostConfig, MemoryApp, ShutdownMode};
    use planet_spec::{AttrSchema, Defs, MsgOp, PinRequest, Value, ValueType};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn host_with_doc() -> Arc<Host> {
        let host = Host::new(HostConfig::default()).unwrap();
        host.start().unwrap();
        let app = Arc::new(MemoryApp::new(
            "test/docs/v1.0.0",
            ["planet/note"],
            host.host_planet().clone(),
        ));
        app.put_doc("/note/1", vec![AttrValue::new("body", Value::Text("hi".into()))])
            .await;
        host.register_app(app).unwrap();
        host
    }

    async fn pin_note<S: AsyncRead + AsyncWrite>(client: &mut ClientConn<S>) -> MsgBatch {
        let login = Msg::new(MsgOp::Login).with_value(Value::Text("ada".into()));
        client.send(&login).await.unwrap();
        assert_eq!(client.expect_batch().await.unwrap().msgs[0].op, MsgOp::Login);

        let defs = Defs::new(vec![
            AttrSchema::new("planet/note").with_attr("body", ValueType::Text)
        ]);
        let register = Msg::new(MsgOp::ResolveAndRegister)
            .with_req(1)
            .with_value(Value::Defs(defs));
        client.send(&register).await.unwrap();
        let reply = client.expect_batch().await.unwrap();
        let Value::Defs(defs) = &reply.msgs[0].value else {
            panic!("unexpected reply {reply:?}");
        };

        let pin = Msg::new(MsgOp::PinCell)
            .with_req(2)
            .with_value(Value::Pin(PinRequest {
                pin_uri: "/note/1".into(),
                schema_id: defs.schemas[0].schema_id,
                ..PinRequest::default()
            }));
        client.send(&pin).await.unwrap();
        client.expect_batch().await.unwrap()
    }

    #[tokio::test]
    async fn frames_round_trip_and_end_cleanly() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let msg = Msg::new(MsgOp::CancelReq).with_req(5);
        write_frame(&mut a, &msg).await.unwrap();
        drop(a);
        assert_eq!(read_frame::<_, Msg>(&mut b).await.unwrap(), Some(msg));
        assert_eq!(read_frame::<_, Msg>(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(read_frame::<_, Msg>(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn session_over_duplex_stream() {
        let host = host_with_doc().await;
        let session = host.start_new_session().unwrap();
        let (client, server) = tokio::io::duplex(4096);
        let served = tokio::spawn(serve_session(session.clone(), server));

        let mut client = ClientConn::new(client);
        let batch = pin_note(&mut client).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.msgs[0].value, Value::Text("hi".into()));
        assert!(batch.msgs.iter().all(|m| m.req_id == 2));

        drop(client);
        timeout(Duration::from_secs(5), served)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), session.context().done())
            .await
            .unwrap();
        assert!(session.is_closed());
        host.stop(ShutdownMode::Immediate).await;
    }

    #[tokio::test]
    async fn unix_socket_serves_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archost.sock");
        let host = host_with_doc().await;
        let ipc = Arc::new(UnixIpc::bind(&path, host.clone()).await.unwrap());
        let accept = ipc.start();

        let mut client = ClientConn::connect(&path).await.unwrap();
        let batch = pin_note(&mut client).await;
        assert_eq!(batch.msgs[1].op, MsgOp::Checkpoint);

        host.stop(ShutdownMode::Immediate).await;
        timeout(Duration::from_secs(5), accept).await.unwrap().unwrap();
        assert!(client.recv().await.unwrap().is_none());
    }
}
