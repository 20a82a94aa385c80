//! End-to-end tests: real listeners, real clients
//!
//! Every test starts its own server on an ephemeral port (or a socket in a
//! temp dir) with the `Arith` test service registered.

use anyhow::Result;
use frpc::{
    Call, Client, ClientConfig, ClientError, ErrorCode, Handshake, Header, Server, ServerConfig,
    Service, LENGTH_JSON_CODEC,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize, Deserialize)]
struct Args {
    a: i64,
    b: i64,
}

struct Arith;

fn arith_service() -> Service {
    Service::builder("Arith", Arith)
        .method("Sum", |_: &Arith, args: Args, reply: &mut i64| {
            *reply = args.a + args.b;
            Ok::<_, String>(())
        })
        .method("Div", |_: &Arith, args: Args, reply: &mut i64| {
            if args.b == 0 {
                return Err("divide by zero".to_string());
            }
            *reply = args.a / args.b;
            Ok(())
        })
        .method("Sleep", |_: &Arith, ms: u64, reply: &mut u64| {
            std::thread::sleep(Duration::from_millis(ms));
            *reply = ms;
            Ok::<_, String>(())
        })
        .method(
            "Tally",
            |_: &Arith, words: Vec<String>, reply: &mut HashMap<String, u64>| {
                for word in words {
                    *reply.entry(word).or_default() += 1;
                }
                Ok::<_, String>(())
            },
        )
        .build()
        .unwrap()
}

/// Test fixture that serves `Arith` on an ephemeral TCP port
struct TestServer {
    server: Server,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        Self::start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> Result<Self> {
        let server = Server::new(ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..config
        });
        server.register(arith_service())?;

        let listener = server.bind().await?;
        let addr = listener.local_addr()?;
        let handle = {
            let server = server.clone();
            tokio::spawn(async move {
                let _ = server.accept(listener).await;
            })
        };

        Ok(Self {
            server,
            addr,
            handle,
        })
    }

    async fn dial(&self) -> Result<Client> {
        self.dial_with(&ClientConfig::default()).await
    }

    async fn dial_with(&self, config: &ClientConfig) -> Result<Client> {
        Ok(Client::dial(&self.addr.to_string(), config).await?)
    }

    fn calls_to(&self, service_method: &str) -> u64 {
        self.server
            .registry()
            .lookup(service_method)
            .map(|(_, method)| method.num_calls())
            .unwrap_or(0)
    }

    async fn shutdown(self) {
        self.server.shutdown();
        let _ = self.handle.await;
    }
}

#[tokio::test]
async fn test_sum() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let sum: i64 = client.call("Arith.Sum", &Args { a: 3, b: 4 }).await.unwrap();
    assert_eq!(sum, 7);
    assert_eq!(server.calls_to("Arith.Sum"), 1);

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_share_one_connection() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = Arc::new(server.dial().await.expect("Failed to connect"));

    let mut tasks = Vec::new();
    for i in 0..32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let sum: i64 = client.call("Arith.Sum", &Args { a: i, b: i }).await?;
            Ok::<_, ClientError>((i, sum))
        }));
    }
    for task in tasks {
        let (i, sum) = task.await.unwrap().unwrap();
        assert_eq!(sum, 2 * i);
    }

    let (done, completed) = flume::bounded::<Call<i64>>(32);
    let mut senders = Vec::new();
    for i in 0..32 {
        let client = client.clone();
        let done = done.clone();
        senders.push(tokio::spawn(async move {
            client.go("Arith.Sum", &Args { a: i, b: 1 }, done).await
        }));
    }
    for sender in senders {
        sender.await.unwrap().unwrap();
    }

    let mut seqs = HashSet::new();
    for _ in 0..32 {
        let call = completed.recv_async().await.unwrap();
        assert!(call.error.is_none(), "call {} failed", call.seq);
        assert!(seqs.insert(call.seq), "seq {} assigned twice", call.seq);
    }
    assert!(!seqs.contains(&0));

    assert_eq!(server.calls_to("Arith.Sum"), 64);
    assert_eq!(client.pending_count(), 0);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replies_arrive_out_of_order() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let (slow_done, slow) = flume::bounded::<Call<u64>>(1);
    let (fast_done, fast) = flume::bounded::<Call<i64>>(1);
    client.go("Arith.Sleep", &300u64, slow_done).await.unwrap();
    client
        .go("Arith.Sum", &Args { a: 1, b: 2 }, fast_done)
        .await
        .unwrap();

    let fast_call = fast.recv_async().await.unwrap();
    assert!(slow.is_empty(), "slow call finished before the fast one");
    assert_eq!(fast_call.into_result().unwrap(), 3);

    let slow_call = slow.recv_async().await.unwrap();
    assert_eq!(slow_call.seq, 1);
    assert_eq!(slow_call.reply, Some(300));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_names_do_not_break_connection() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let err = client
        .call::<_, i64>("Unknown.Method", &Args { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.remote().map(|e| e.code), Some(ErrorCode::ServiceNotFound));

    let err = client
        .call::<_, i64>("Arith.Unknown", &Args { a: 1, b: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.remote().map(|e| e.code), Some(ErrorCode::MethodNotFound));

    let sum: i64 = client.call("Arith.Sum", &Args { a: 5, b: 6 }).await.unwrap();
    assert_eq!(sum, 11);
    assert!(client.is_available());

    server.shutdown().await;
}

#[tokio::test]
async fn test_application_error() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let err = client
        .call::<_, i64>("Arith.Div", &Args { a: 1, b: 0 })
        .await
        .unwrap_err();
    let remote = err.remote().expect("expected a remote error");
    assert_eq!(remote.code, ErrorCode::Application);
    assert_eq!(remote.message, "divide by zero");

    let quotient: i64 = client.call("Arith.Div", &Args { a: 9, b: 3 }).await.unwrap();
    assert_eq!(quotient, 3);

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_collection_reply() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let words: Vec<String> = Vec::new();
    let tally: HashMap<String, u64> = client.call("Arith.Tally", &words).await.unwrap();
    assert!(tally.is_empty());

    let tally: HashMap<String, u64> = client
        .call("Arith.Tally", &["a", "b", "a"])
        .await
        .unwrap();
    assert_eq!(tally.get("a"), Some(&2));

    server.shutdown().await;
}

#[tokio::test]
async fn test_length_prefixed_codec() {
    let server = TestServer::start().await.expect("Failed to start server");
    let config = ClientConfig {
        codec: LENGTH_JSON_CODEC.to_string(),
        ..Default::default()
    };
    let client = server.dial_with(&config).await.expect("Failed to connect");
    assert_eq!(client.handshake().codec_type, LENGTH_JSON_CODEC);

    let sum: i64 = client.call("Arith.Sum", &Args { a: 20, b: 22 }).await.unwrap();
    assert_eq!(sum, 42);

    server.shutdown().await;
}

#[tokio::test]
async fn test_handle_timeout() {
    let server = TestServer::start_with(ServerConfig {
        handle_timeout_ms: 50,
        ..Default::default()
    })
    .await
    .expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    let err = client.call::<_, u64>("Arith.Sleep", &500u64).await.unwrap_err();
    assert_eq!(err.remote().map(|e| e.code), Some(ErrorCode::Timeout));

    let sum: i64 = client.call("Arith.Sum", &Args { a: 1, b: 1 }).await.unwrap();
    assert_eq!(sum, 2);

    server.shutdown().await;
}

#[tokio::test]
async fn test_server_exit_fails_pending_calls() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepting = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = BufReader::new(stream);
        frpc_protocol::read_handshake(&mut stream).await.unwrap();
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        // Connection dropped without answering.
    });

    let client = Client::dial(&addr.to_string(), &ClientConfig::default())
        .await
        .unwrap();
    let err = client
        .call::<_, i64>("Arith.Sum", &Args { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ConnectionLost(_)), "got {:?}", err);
    assert!(!client.is_available());

    accepting.await.unwrap();
    let err = client
        .call::<_, i64>("Arith.Sum", &Args { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(err.is_shutdown());
}

#[tokio::test]
async fn test_close_twice() {
    let server = TestServer::start().await.expect("Failed to start server");
    let client = server.dial().await.expect("Failed to connect");

    client.close().await.unwrap();
    let err = client.close().await.unwrap_err();
    assert!(err.is_shutdown());
    assert_eq!(err.to_string(), "frpc: client is shut down");

    server.shutdown().await;
}

#[tokio::test]
async fn test_bad_magic_gets_no_response() {
    let server = TestServer::start().await.expect("Failed to start server");
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    let bogus = Handshake {
        magic_number: 0xdead_beef,
        ..Handshake::default()
    };
    frpc_protocol::write_handshake(&mut stream, &bogus)
        .await
        .unwrap();
    let request = Header::request("Arith.Sum", 1);
    let frame = format!("{}\n{{\"a\":1,\"b\":2}}\n", serde_json::to_string(&request).unwrap());
    let _ = stream.write_all(frame.as_bytes()).await;

    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
    assert!(rest.is_empty());
    assert_eq!(server.calls_to("Arith.Sum"), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_error_response_body_is_null() {
    let server = TestServer::start().await.expect("Failed to start server");
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut stream = BufReader::new(stream);

    frpc_protocol::write_handshake(stream.get_mut(), &Handshake::default())
        .await
        .unwrap();
    let request = Header::request("Nope.Nothing", 7);
    let frame = format!("{}\n{{}}\n", serde_json::to_string(&request).unwrap());
    stream.get_mut().write_all(frame.as_bytes()).await.unwrap();

    let mut header = String::new();
    stream.read_line(&mut header).await.unwrap();
    let header: Header = serde_json::from_str(&header).unwrap();
    assert_eq!(header.seq, 7);
    assert!(header.is_error());

    let mut body = String::new();
    stream.read_line(&mut body).await.unwrap();
    assert_eq!(body.trim_end(), "null");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = TestServer::start().await.expect("Failed to start server");
    let addr = server.addr;
    server.shutdown().await;

    let config = ClientConfig {
        connect_timeout_ms: 500,
        ..Default::default()
    };
    let result = Client::dial(&addr.to_string(), &config).await;
    assert!(result.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("frpc.sock");

    let server = Server::new(ServerConfig::default());
    server.register(arith_service()).unwrap();
    let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();
    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            let _ = server.accept_unix(listener).await;
        })
    };

    let client = Client::dial_unix(&socket_path, &ClientConfig::default())
        .await
        .unwrap();
    let sum: i64 = client.call("Arith.Sum", &Args { a: 2, b: 2 }).await.unwrap();
    assert_eq!(sum, 4);

    client.close().await.unwrap();
    server.shutdown();
    handle.await.unwrap();
}
