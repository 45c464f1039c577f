//! Actix Web server exposing the multipart stream and a few read-only views of
//! the latest frame.
//!
//! The server runs on a dedicated thread with its own actix system so the
//! producer never shares a runtime with HTTP handling. Binding happens on that
//! thread and the outcome is reported back before `spawn_stream_server`
//! returns, which keeps a bind failure fatal at startup.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc, mpsc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web,
};
use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::vision::{
    data::DetectionsResponse,
    hub::FrameHub,
    session::{SessionRegistry, StreamSession, stream_content_type},
    telemetry::{prometheus_handle, spawn_thread},
};

#[derive(Debug, Error)]
#[error("failed to bind stream server on {addr}")]
pub(crate) struct ServerBindError {
    pub(crate) addr: String,
    #[source]
    pub(crate) source: io::Error,
}

#[derive(Clone, Debug)]
pub(crate) struct ServerOptions {
    pub(crate) host: String,
    pub(crate) port: u16,
    /// Actix worker threads; `None` keeps the actix default.
    pub(crate) workers: Option<usize>,
}

/// Shared state backing HTTP handlers.
#[derive(Clone)]
pub(crate) struct ServerState {
    pub(crate) hub: FrameHub,
    pub(crate) sessions: Arc<SessionRegistry>,
}

/// Handle for the server thread.
pub(crate) struct StreamServer {
    addrs: Vec<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
}

impl StreamServer {
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Whether the server thread has finished, for whatever reason.
    pub(crate) fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Ask actix to stop without waiting for the thread.
    #[cfg(test)]
    pub(crate) fn halt(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Signal the server to stop and block until the thread exits. Open
    /// streams are dropped once the graceful timeout runs out.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Bind the listener and start serving on a dedicated thread.
///
/// `on_exit` is raised when the server thread finishes, so a server that dies
/// after binding also stops whatever it was serving.
pub(crate) fn spawn_stream_server(
    options: &ServerOptions,
    state: ServerState,
    on_exit: Arc<AtomicBool>,
) -> Result<StreamServer> {
    let exited = Arc::new(AtomicBool::new(false));
    let thread_exited = exited.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = mpsc::channel::<Result<Vec<SocketAddr>, ServerBindError>>();
    let options = options.clone();

    let handle = spawn_thread("stream-http-server", move || {
        let result = actix_web::rt::System::new().block_on(async move {
            let app_state = state.clone();
            let mut server = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(app_state.clone()))
                    .route("/", web::get().to(stream_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/detections", web::get().to(detections_handler))
                    .route("/sessions", web::get().to(sessions_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .disable_signals()
            .shutdown_timeout(5);
            if let Some(workers) = options.workers {
                server = server.workers(workers);
            }

            let addr = format!("{}:{}", options.host, options.port);
            let server = match server.bind((options.host.as_str(), options.port)) {
                Ok(server) => server,
                Err(source) => {
                    let _ = bound_tx.send(Err(ServerBindError { addr, source }));
                    return Ok(());
                }
            };
            let _ = bound_tx.send(Ok(server.addrs()));
            let server = server.run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
        thread_exited.store(true, Ordering::SeqCst);
        on_exit.store(true, Ordering::SeqCst);
    })
    .context("Failed to spawn stream server thread")?;

    let addrs = match bound_rx.recv() {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => {
            let _ = handle.join();
            return Err(err.into());
        }
        Err(_) => {
            let _ = handle.join();
            anyhow::bail!("stream server thread exited before binding");
        }
    };
    info!(?addrs, "stream server listening");

    Ok(StreamServer {
        addrs,
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
        exited,
    })
}

/// Stream the annotated feed as `multipart/x-mixed-replace`.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let mut session = StreamSession::accept(state.hub.subscribe(), state.sessions.clone());
    info!(session = session.id(), "viewer connected");

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache, private"))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::CONTENT_TYPE, stream_content_type()))
        .streaming(session.into_body())
}

/// Return the latest encoded frame.
async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.hub.latest() {
        Some(packet) => HttpResponse::Ok()
            .content_type(packet.content_type)
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .body(packet.image.clone()),
        None => HttpResponse::NoContent().finish(),
    }
}

/// Return the most recent detection snapshot as JSON.
async fn detections_handler(state: web::Data<ServerState>) -> HttpResponse {
    match state.hub.latest() {
        Some(packet) => HttpResponse::Ok().json(DetectionsResponse {
            timestamp_ms: packet.timestamp_ms,
            frame_number: packet.frame_number,
            fps: packet.fps,
            detections: &packet.detections,
        }),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn sessions_handler(state: web::Data<ServerState>) -> HttpResponse {
    HttpResponse::Ok().json(state.sessions.stats())
}

async fn metrics_handler() -> HttpResponse {
    match prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::{TcpListener, TcpStream},
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::vision::testing::packet;

    fn options(port: u16) -> ServerOptions {
        ServerOptions {
            host: "127.0.0.1".into(),
            port,
            workers: Some(2),
        }
    }

    fn start() -> (StreamServer, ServerState, SocketAddr) {
        let state = ServerState {
            hub: FrameHub::new(),
            sessions: Arc::new(SessionRegistry::default()),
        };
        let server =
            spawn_stream_server(&options(0), state.clone(), Arc::new(AtomicBool::new(false)))
                .unwrap();
        let addr = server.local_addrs()[0];
        (server, state, addr)
    }

    fn request(addr: SocketAddr, path: &str) -> BufReader<TcpStream> {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(stream, "GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        BufReader::new(stream)
    }

    /// Read the status line and headers, returning (status, lowercase headers).
    fn read_head(reader: &mut BufReader<TcpStream>) -> (u16, Vec<(String, String)>) {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let status = line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let mut headers = Vec::new();
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                break;
            }
            let (name, value) = trimmed.split_once(':').unwrap();
            headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
        }
        (status, headers)
    }

    fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Decodes a chunked response body on demand.
    struct ChunkedBody {
        reader: BufReader<TcpStream>,
        buffered: Vec<u8>,
    }

    impl ChunkedBody {
        fn new(reader: BufReader<TcpStream>) -> Self {
            Self {
                reader,
                buffered: Vec::new(),
            }
        }

        fn fill(&mut self) {
            let mut size_line = String::new();
            self.reader.read_line(&mut size_line).unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            let mut chunk = vec![0; size + 2];
            self.reader.read_exact(&mut chunk).unwrap();
            self.buffered.extend_from_slice(&chunk[..size]);
        }

        fn take(&mut self, n: usize) -> Vec<u8> {
            while self.buffered.len() < n {
                self.fill();
            }
            self.buffered.drain(..n).collect()
        }

        fn line(&mut self) -> String {
            loop {
                if let Some(pos) = self.buffered.windows(2).position(|w| w == b"\r\n") {
                    let line: Vec<u8> = self.buffered.drain(..pos + 2).collect();
                    return String::from_utf8(line[..pos].to_vec()).unwrap();
                }
                self.fill();
            }
        }

        /// True once the terminating zero-length chunk arrives.
        fn at_end(&mut self) -> bool {
            if !self.buffered.is_empty() {
                return false;
            }
            let mut size_line = String::new();
            self.reader.read_line(&mut size_line).unwrap();
            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();
            if size == 0 {
                return true;
            }
            let mut chunk = vec![0; size + 2];
            self.reader.read_exact(&mut chunk).unwrap();
            self.buffered.extend_from_slice(&chunk[..size]);
            false
        }

        /// Parse one multipart part and return its payload.
        fn part(&mut self) -> Vec<u8> {
            assert_eq!(self.line(), "--FRAME");
            assert_eq!(self.line(), "Content-Type: image/jpeg");
            let length: usize = self
                .line()
                .strip_prefix("Content-Length: ")
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(self.line(), "");
            let payload = self.take(length);
            assert_eq!(self.take(2), b"\r\n");
            payload
        }
    }

    fn open_stream(addr: SocketAddr) -> ChunkedBody {
        let mut reader = request(addr, "/stream.mjpg");
        let (status, headers) = read_head(&mut reader);
        assert_eq!(status, 200);
        assert_eq!(
            header(&headers, "content-type"),
            Some("multipart/x-mixed-replace; boundary=FRAME")
        );
        ChunkedBody::new(reader)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn viewers_stream_independently() {
        let (server, state, addr) = start();
        state.hub.publish(packet(1));

        let mut first = open_stream(addr);
        let mut second = open_stream(addr);
        assert_eq!(first.part(), b"jpeg-1");
        assert_eq!(second.part(), b"jpeg-1");

        state.hub.publish(packet(2));
        assert_eq!(first.part(), b"jpeg-2");
        assert_eq!(second.part(), b"jpeg-2");

        drop(first);
        // The server notices the dead socket on its next write.
        let mut n = 3;
        wait_for(|| {
            state.hub.publish(packet(n));
            n += 1;
            assert!(!second.part().is_empty());
            state.sessions.stats().client_gone == 1
        });

        // A newcomer starts from the current frame.
        let mut third = open_stream(addr);
        assert_eq!(third.part(), format!("jpeg-{}", n - 1).into_bytes());
        state.hub.publish(packet(1_000));
        assert_eq!(third.part(), b"jpeg-1000");
        assert_eq!(second.part(), b"jpeg-1000");

        let stats = state.sessions.stats();
        assert_eq!(stats.opened, 3);
        assert_eq!(stats.active, 2);

        state.hub.close();
        wait_for(|| state.sessions.stats().shutdown == 2);
        drop((second, third));
        server.stop();
    }

    #[test]
    fn interruption_ends_streaming_viewers() {
        let (server, state, addr) = start();
        state.hub.publish(packet(1));
        let mut viewer = open_stream(addr);
        assert_eq!(viewer.part(), b"jpeg-1");

        state.hub.interrupt();
        assert!(viewer.at_end());
        wait_for(|| state.sessions.stats().feed_interrupted == 1);
        drop(viewer);
        server.stop();
    }

    #[test]
    fn single_frame_and_detections_follow_the_hub() {
        let (server, state, addr) = start();

        let (status, _) = read_head(&mut request(addr, "/frame.jpg"));
        assert_eq!(status, 204);
        let (status, _) = read_head(&mut request(addr, "/detections"));
        assert_eq!(status, 204);

        state.hub.publish(packet(4));
        let mut reader = request(addr, "/frame.jpg");
        let (status, headers) = read_head(&mut reader);
        assert_eq!(status, 200);
        assert_eq!(header(&headers, "content-type"), Some("image/jpeg"));
        let length: usize = header(&headers, "content-length").unwrap().parse().unwrap();
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();
        assert_eq!(body, b"jpeg-4");

        let mut reader = request(addr, "/detections");
        let (status, headers) = read_head(&mut reader);
        assert_eq!(status, 200);
        let length: usize = header(&headers, "content-length").unwrap().parse().unwrap();
        let mut body = vec![0; length];
        reader.read_exact(&mut body).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["frame_number"], 4);
        assert_eq!(json["detections"][0]["class"], "car");
        assert_eq!(json["detections"][0]["bbox"], serde_json::json!([10, 10, 50, 50]));
        drop(reader);
        server.stop();
    }

    #[test]
    fn bind_conflicts_are_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let state = ServerState {
            hub: FrameHub::new(),
            sessions: Arc::new(SessionRegistry::default()),
        };
        let on_exit = Arc::new(AtomicBool::new(false));
        let err = match spawn_stream_server(&options(port), state, on_exit) {
            Ok(_) => panic!("bind on a taken port succeeded"),
            Err(err) => err,
        };
        let bind = err.downcast_ref::<ServerBindError>().unwrap();
        assert_eq!(bind.addr, format!("127.0.0.1:{port}"));
    }

    #[test]
    fn stopping_releases_the_port() {
        let (server, _state, addr) = start();
        server.stop();
        TcpListener::bind(addr).unwrap();
    }

    #[test]
    fn server_exit_raises_the_exit_flag() {
        let state = ServerState {
            hub: FrameHub::new(),
            sessions: Arc::new(SessionRegistry::default()),
        };
        let on_exit = Arc::new(AtomicBool::new(false));
        let mut server = spawn_stream_server(&options(0), state, on_exit.clone()).unwrap();
        assert!(!server.exited());
        assert!(!on_exit.load(Ordering::SeqCst));

        server.halt();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !on_exit.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "server thread never reported its exit");
            thread::sleep(Duration::from_millis(10));
        }
        assert!(server.exited());
        server.stop();
    }
}
