//! RPC server: handshake, per-connection dispatch loop, concurrent handling.
//!
//! Each connection is read sequentially by one task. Every request whose
//! header and body were read is handled on its own task; responses go back
//! through a single writer lock so a header and its body are never
//! interleaved with another response. Response order is not preserved.

use crate::error::ServerError;
use crate::service::{MethodType, RegistryError, Service, ServiceRegistry};
use frpc_config::ServerConfig;
use frpc_protocol::{
    read_handshake, Codec, CodecReader, CodecRegistry, CodecWriter, ErrorCode, HandshakeError,
    Header, Payload, RemoteError,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type SharedWriter = Arc<Mutex<Box<dyn CodecWriter>>>;

/// A request whose header and body were read and whose method resolved.
struct Request {
    header: Header,
    argv: Payload,
    service: Arc<Service>,
    method: Arc<MethodType>,
}

enum Incoming {
    Request(Request),
    /// Answer with this error header and keep reading
    Invalid(Header),
    /// Answer with this error header, then stop reading
    Fatal(Header),
}

/// frpc server
///
/// Cheap to clone; clones share the service registry and shutdown signal.
#[derive(Clone)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
    codecs: Arc<CodecRegistry>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codecs(config, CodecRegistry::default())
    }

    pub fn with_codecs(config: ServerConfig, codecs: CodecRegistry) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            codecs: Arc::new(codecs),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn register(&self, service: Service) -> Result<(), RegistryError> {
        self.registry.register(service)
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Cancelling the returned token stops every accept loop of this server,
    /// including loops started after the cancellation. Connections already
    /// being served run to completion.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Bind a TCP listener on `config.listen_addr`.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!("frpc server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and accept until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.accept(listener).await
    }

    /// Serve every connection accepted on `listener` on its own task.
    ///
    /// Returns when the shutdown handle fires, or with the first accept error.
    pub async fn accept(&self, listener: TcpListener) -> Result<(), ServerError> {
        let listener = &listener;
        self.accept_loop(move || async move {
            let (stream, peer) = listener.accept().await?;
            Ok::<_, std::io::Error>((stream, peer.to_string()))
        })
        .await
    }

    #[cfg(unix)]
    pub async fn accept_unix(&self, listener: tokio::net::UnixListener) -> Result<(), ServerError> {
        let listener = &listener;
        self.accept_loop(move || async move {
            let (stream, peer) = listener.accept().await?;
            Ok::<_, std::io::Error>((stream, format!("{:?}", peer)))
        })
        .await
    }

    async fn accept_loop<S, F, Fut>(&self, mut next: F) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<(S, String)>>,
    {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                accepted = next() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "accepted connection");
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.serve_conn(stream).await {
                                    warn!(peer = %peer, "rpc server: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("rpc server: accept error: {}", e);
                            return Err(e.into());
                        }
                    }
                }
            }
        }
    }

    /// Run one connection to completion: handshake, dispatch, drain, close.
    ///
    /// A handshake failure drops the stream without writing anything and is
    /// returned as an error. Once the handshake succeeds this only returns
    /// after the stream has been closed.
    pub async fn serve_conn<S>(&self, stream: S) -> Result<(), ServerError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        let mut reader = BufReader::new(read);

        let handshake = match self.config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, read_handshake(&mut reader))
                .await
                .map_err(|_| ServerError::HandshakeTimeout(limit))??,
            None => read_handshake(&mut reader).await?,
        };
        handshake.validate()?;

        let codec = self
            .codecs
            .build(&handshake.codec_type, Box::new(reader), Box::new(write))
            .ok_or_else(|| HandshakeError::UnsupportedCodec(handshake.codec_type.clone()))?;
        debug!(codec = %handshake.codec_type, "handshake complete");

        self.serve_codec(codec).await;
        Ok(())
    }

    async fn serve_codec(&self, codec: Codec) {
        let Codec { mut reader, writer } = codec;
        let sending: SharedWriter = Arc::new(Mutex::new(writer));
        let mut requests = JoinSet::new();

        loop {
            let header = match reader.read_header().await {
                Ok(header) => header,
                Err(e) => {
                    if !e.is_closed() {
                        warn!("rpc server: read header error: {}", e);
                    }
                    break;
                }
            };

            match self.read_request(header, reader.as_mut()).await {
                Incoming::Request(request) => {
                    requests.spawn(handle_request(
                        request,
                        sending.clone(),
                        self.config.handle_timeout(),
                    ));
                }
                Incoming::Invalid(header) => {
                    send_response(&sending, &header, &Payload::Null).await;
                }
                Incoming::Fatal(header) => {
                    send_response(&sending, &header, &Payload::Null).await;
                    break;
                }
            }

            while let Some(finished) = requests.try_join_next() {
                log_request_task(finished);
            }
        }

        debug!(in_flight = requests.len(), "draining connection");
        while let Some(finished) = requests.join_next().await {
            log_request_task(finished);
        }

        let closed = sending.lock().await.close().await;
        if let Err(e) = closed {
            debug!("rpc server: close error: {}", e);
        }
    }

    /// Read the body belonging to `header` and resolve its method.
    ///
    /// The body is consumed before the lookup, so an unknown method never
    /// leaves an unread frame behind.
    async fn read_request(&self, header: Header, reader: &mut dyn CodecReader) -> Incoming {
        let argv = match reader.read_body().await {
            Ok(argv) => argv,
            Err(e) => {
                warn!(seq = header.seq, "rpc server: read body error: {}", e);
                let failed = header.with_error(RemoteError::new(
                    ErrorCode::InvalidRequest,
                    format!("read body error: {}", e),
                ));
                return if e.is_recoverable() {
                    Incoming::Invalid(failed)
                } else {
                    Incoming::Fatal(failed)
                };
            }
        };

        match self.registry.lookup(&header.service_method) {
            Ok((service, method)) => Incoming::Request(Request {
                header,
                argv,
                service,
                method,
            }),
            Err(e) => {
                debug!(seq = header.seq, "rpc server: {}", e);
                Incoming::Invalid(header.with_error(e.into()))
            }
        }
    }
}

async fn handle_request(request: Request, sending: SharedWriter, handle_timeout: Option<Duration>) {
    let Request {
        header,
        argv,
        service,
        method,
    } = request;

    let invocation = service.call(&method, argv);
    let result = match handle_timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::new(
                ErrorCode::Timeout,
                format!("request handle timeout: expect within {:?}", limit),
            )),
        },
        None => invocation.await,
    };

    match result {
        Ok(reply) => send_response(&sending, &header, &reply).await,
        Err(err) => {
            debug!(seq = header.seq, method = %header.service_method, "request failed: {}", err);
            send_response(&sending, &header.with_error(err), &Payload::Null).await;
        }
    }
}

async fn send_response(sending: &Mutex<Box<dyn CodecWriter>>, header: &Header, body: &Payload) {
    let mut writer = sending.lock().await;
    if let Err(e) = writer.write(header, body).await {
        warn!(seq = header.seq, "rpc server: write response error: {}", e);
    }
}

fn log_request_task(finished: Result<(), tokio::task::JoinError>) {
    if let Err(e) = finished {
        error!("rpc server: request task failed: {}", e);
    }
}
