//! RPC client
//!
//! One connection carries many concurrent calls. Callers register a pending
//! call under a fresh sequence number and write the request while holding the
//! send lock; a background receive task matches each response to its pending
//! call by `seq` and completes it. When the connection ends, every call still
//! pending is failed with the reason.

use crate::error::ClientError;
use frpc_config::ClientConfig;
use frpc_protocol::{
    write_handshake, Codec, CodecError, CodecReader, CodecRegistry, CodecWriter, Handshake,
    HandshakeError, Header, Payload, Status,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// An RPC invocation as seen by the caller.
///
/// Exactly one of `reply` and `error` is set once the call is delivered on
/// its completion channel.
#[derive(Debug)]
pub struct Call<R> {
    /// 0 if the call was never registered
    pub seq: u64,
    pub service_method: String,
    pub reply: Option<R>,
    pub error: Option<ClientError>,
}

impl<R> Call<R> {
    fn new(seq: u64, service_method: &str) -> Self {
        Self {
            seq,
            service_method: service_method.to_string(),
            reply: None,
            error: None,
        }
    }

    fn failed(service_method: &str, error: ClientError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(0, service_method)
        }
    }

    pub fn into_result(self) -> Result<R, ClientError> {
        match (self.error, self.reply) {
            (Some(err), _) => Err(err),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(ClientError::ConnectionLost(
                "call completed without a reply".to_string(),
            )),
        }
    }
}

/// A registered call waiting for its response, with the reply type erased.
trait Pending: Send {
    fn complete(self: Box<Self>, result: Result<Payload, ClientError>);
}

struct PendingCall<R> {
    call: Call<R>,
    done: flume::Sender<Call<R>>,
}

impl<R> Pending for PendingCall<R>
where
    R: DeserializeOwned + Send + 'static,
{
    fn complete(self: Box<Self>, result: Result<Payload, ClientError>) {
        let PendingCall { mut call, done } = *self;
        let decoded =
            result.and_then(|body| serde_json::from_value(body).map_err(ClientError::DecodeReply));
        match decoded {
            Ok(reply) => call.reply = Some(reply),
            Err(err) => call.error = Some(err),
        }
        deliver(call, &done);
    }
}

/// Hand a finished call to its caller without ever blocking.
fn deliver<R>(call: Call<R>, done: &flume::Sender<Call<R>>) {
    match done.try_send(call) {
        Ok(()) => {}
        Err(flume::TrySendError::Full(call)) => {
            warn!(seq = call.seq, "rpc client: done channel is full, completion dropped");
        }
        Err(flume::TrySendError::Disconnected(call)) => {
            debug!(seq = call.seq, "rpc client: caller stopped waiting");
        }
    }
}

struct State {
    seq: u64,
    pending: HashMap<u64, Box<dyn Pending>>,
    /// Set by `close`
    closing: bool,
    /// Set once the receive loop has ended
    shutdown: bool,
}

struct Inner {
    handshake: Handshake,
    // Lock order: `sending` before `state`.
    sending: tokio::sync::Mutex<Box<dyn CodecWriter>>,
    state: Mutex<State>,
    cancel: CancellationToken,
}

impl Inner {
    fn register_call<R>(&self, service_method: &str, done: &flume::Sender<Call<R>>) -> Option<u64>
    where
        R: DeserializeOwned + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return None;
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(
            seq,
            Box::new(PendingCall {
                call: Call::new(seq, service_method),
                done: done.clone(),
            }),
        );
        Some(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<Box<dyn Pending>> {
        self.state.lock().pending.remove(&seq)
    }

    /// Mark the client shut down and fail everything still pending.
    async fn terminate_calls(&self, reason: &str) {
        let _sending = self.sending.lock().await;
        let (closing, pending) = {
            let mut state = self.state.lock();
            state.shutdown = true;
            let pending: Vec<_> = state.pending.drain().map(|(_, call)| call).collect();
            (state.closing, pending)
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), reason, "rpc client: failing pending calls");
        }
        for call in pending {
            let err = if closing {
                ClientError::Shutdown
            } else {
                ClientError::ConnectionLost(reason.to_string())
            };
            call.complete(Err(err));
        }
    }
}

/// Multiplexing RPC client
///
/// Share it between tasks behind an `Arc`. Dropping the client stops its
/// receive task, which fails any calls still pending.
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Write `handshake` on `stream` and start the receive task.
    ///
    /// Fails before writing anything if `codecs` has no codec for the
    /// handshake's tag.
    pub async fn new<S>(
        stream: S,
        handshake: Handshake,
        codecs: &CodecRegistry,
    ) -> Result<Self, ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let factory = codecs
            .get(&handshake.codec_type)
            .ok_or_else(|| HandshakeError::UnsupportedCodec(handshake.codec_type.clone()))?;

        let (read, mut write) = tokio::io::split(stream);
        write_handshake(&mut write, &handshake).await?;
        let Codec { reader, writer } = factory(Box::new(BufReader::new(read)), Box::new(write));

        let inner = Arc::new(Inner {
            handshake,
            sending: tokio::sync::Mutex::new(writer),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(receive(inner.clone(), reader));

        Ok(Self { inner })
    }

    /// Connect over TCP and perform the handshake with `config.codec`.
    ///
    /// `config.connect_timeout` bounds both the connect and the handshake.
    pub async fn dial(addr: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let handshake = Handshake::new(config.codec.as_str());
        let connect = async {
            let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
            Self::new(stream, handshake, &CodecRegistry::default()).await
        };
        let client = match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ClientError::ConnectTimeout(limit))??,
            None => connect.await?,
        };
        debug!("rpc client: connected to {}", addr);
        Ok(client)
    }

    #[cfg(unix)]
    pub async fn dial_unix(
        path: impl AsRef<std::path::Path>,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let handshake = Handshake::new(config.codec.as_str());
        let connect = async {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(ClientError::Connect)?;
            Self::new(stream, handshake, &CodecRegistry::default()).await
        };
        match config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ClientError::ConnectTimeout(limit))?,
            None => connect.await,
        }
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    /// Start a call and return without waiting for its reply.
    ///
    /// The finished [`Call`] is delivered on `done`, which must be buffered.
    /// Only an unbuffered `done` is reported through the return value; every
    /// other failure is delivered as the call's `error`.
    pub async fn go<A, R>(
        &self,
        service_method: &str,
        args: &A,
        done: flume::Sender<Call<R>>,
    ) -> Result<(), ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        self.start(service_method, args, done).await.map(|_| ())
    }

    /// Invoke `service_method` and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, completed) = flume::bounded(1);
        self.start(service_method, args, done).await?;
        Self::finish(completed.recv_async().await)
    }

    /// Like [`Client::call`], but give up after `limit`.
    ///
    /// On timeout the call is forgotten; a reply arriving later is discarded.
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        limit: Duration,
    ) -> Result<R, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let (done, completed) = flume::bounded(1);
        let seq = self.start(service_method, args, done).await?;
        match tokio::time::timeout(limit, completed.recv_async()).await {
            Ok(received) => Self::finish(received),
            Err(_) => {
                if let Some(seq) = seq {
                    self.inner.remove_call(seq);
                }
                Err(ClientError::CallTimeout(limit))
            }
        }
    }

    fn finish<R>(received: Result<Call<R>, flume::RecvError>) -> Result<R, ClientError> {
        match received {
            Ok(call) => call.into_result(),
            Err(_) => Err(ClientError::ConnectionLost(
                "call dropped before completion".to_string(),
            )),
        }
    }

    /// Returns the sequence number if the request was written.
    async fn start<A, R>(
        &self,
        service_method: &str,
        args: &A,
        done: flume::Sender<Call<R>>,
    ) -> Result<Option<u64>, ClientError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        if done.capacity() == Some(0) {
            return Err(ClientError::UnbufferedChannel);
        }

        let args = match serde_json::to_value(args) {
            Ok(args) => args,
            Err(e) => {
                deliver(Call::failed(service_method, ClientError::EncodeArgs(e)), &done);
                return Ok(None);
            }
        };

        let mut writer = self.inner.sending.lock().await;
        let Some(seq) = self.inner.register_call(service_method, &done) else {
            deliver(Call::failed(service_method, ClientError::Shutdown), &done);
            return Ok(None);
        };

        debug!(seq, method = service_method, "rpc client: sending request");
        if let Err(e) = writer.write(&Header::request(service_method, seq), &args).await {
            // The receive loop may already have failed this call.
            if let Some(pending) = self.inner.remove_call(seq) {
                pending.complete(Err(e.into()));
            }
            return Ok(None);
        }
        Ok(Some(seq))
    }

    /// Close the connection. Calls still pending fail with
    /// [`ClientError::Shutdown`]; a second `close` returns it too.
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }

        let closed = self.inner.sending.lock().await.close().await;
        self.inner.cancel.cancel();
        closed.map_err(ClientError::from)
    }

    /// True while the client accepts new calls.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

async fn read_frame(
    reader: &mut dyn CodecReader,
) -> Result<(Header, Result<Payload, CodecError>), CodecError> {
    let header = reader.read_header().await?;
    let body = reader.read_body().await;
    Ok((header, body))
}

/// Match responses to pending calls until the connection ends.
async fn receive(inner: Arc<Inner>, mut reader: Box<dyn CodecReader>) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break "client closed".to_string(),
            frame = read_frame(reader.as_mut()) => frame,
        };
        let (header, body) = match frame {
            Ok(frame) => frame,
            Err(e) => break e.to_string(),
        };

        let fatal = match &body {
            Err(e) if !e.is_recoverable() => Some(e.to_string()),
            _ => None,
        };

        match (inner.remove_call(header.seq), header.status, body) {
            (None, _, _) => {
                debug!(seq = header.seq, "rpc client: no pending call for response, discarded");
            }
            (Some(call), Status::Error(err), _) => call.complete(Err(ClientError::Remote(err))),
            (Some(call), Status::Ok, Ok(body)) => call.complete(Ok(body)),
            (Some(call), Status::Ok, Err(e)) => call.complete(Err(ClientError::Codec(e))),
        }

        if let Some(reason) = fatal {
            break reason;
        }
    };

    debug!("rpc client: receive loop ended: {}", reason);
    inner.terminate_calls(&reason).await;
}
