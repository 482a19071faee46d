use etude_core::{Config, Role, Server, ShutdownHandle, TriggerMode};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<Role>>,
    _root: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn doc_root() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), b"<h1>etude</h1>").unwrap();
    fs::write(dir.path().join("alphabet.txt"), b"abcdefghijklmnopqrstuvwxyz").unwrap();
    fs::write(dir.path().join("login.html"), b"please log in").unwrap();
    fs::write(dir.path().join("welcome.html"), b"welcome back").unwrap();
    fs::write(dir.path().join("login_error.html"), b"wrong password").unwrap();
    fs::write(dir.path().join("register_error.html"), b"name taken").unwrap();
    dir
}

fn start(tweak: impl FnOnce(&mut Config)) -> TestServer {
    let root = doc_root();
    let mut config = Config {
        host: "127.0.0.1".into(),
        port: 0,
        doc_root: root.path().to_path_buf(),
        threads: 2,
        verbose: false,
        ..Config::default()
    };
    tweak(&mut config);

    let server = Server::bind(config).unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve().unwrap());
    TestServer {
        addr,
        handle,
        thread: Some(thread),
        _root: root,
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    /// Send raw bytes and read one response: (status line, headers, body).
    fn exchange(&mut self, raw: &[u8]) -> (String, Vec<String>, Vec<u8>) {
        self.writer.write_all(raw).unwrap();
        let mut status = String::new();
        self.reader.read_line(&mut status).unwrap();
        let mut headers = Vec::new();
        let mut len = 0usize;
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length: ") {
                len = v.parse().unwrap();
            }
            headers.push(line);
        }
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).unwrap();
        (status.trim_end().to_string(), headers, body)
    }

    fn get(&mut self, path: &str) -> (String, Vec<String>, Vec<u8>) {
        let req = format!("GET {} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", path);
        self.exchange(req.as_bytes())
    }
}

#[test]
fn keep_alive_serves_several_requests() {
    let server = start(|_| {});
    let mut client = Client::connect(server.addr);

    let (status, headers, body) = client.get("/");
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert!(headers.contains(&"Connection: keep-alive".to_string()));
    assert_eq!(body, b"<h1>etude</h1>");

    let (status, _, body) = client.get("/alphabet.txt");
    assert_eq!(status, "HTTP/1.1 200 OK");
    assert_eq!(body.len(), 26);

    let (status, _, _) = client.get("/nope.html");
    assert_eq!(status, "HTTP/1.1 404 Not Found");
}

#[test]
fn byte_ranges() {
    let server = start(|_| {});
    let mut client = Client::connect(server.addr);

    let (status, headers, body) = client.exchange(
        b"GET /alphabet.txt HTTP/1.1\r\nConnection: keep-alive\r\nRange: bytes=2-5\r\n\r\n",
    );
    assert_eq!(status, "HTTP/1.1 206 Partial Content");
    assert!(headers.contains(&"Content-Range: bytes 2-5/26".to_string()));
    assert_eq!(body, b"cdef");

    let (status, _, body) = client.exchange(
        b"GET /alphabet.txt HTTP/1.1\r\nConnection: keep-alive\r\nRange: bytes=-3\r\n\r\n",
    );
    assert_eq!(status, "HTTP/1.1 206 Partial Content");
    assert_eq!(body, b"xyz");
}

#[test]
fn malformed_request_closes_connection() {
    let server = start(|_| {});
    let mut client = Client::connect(server.addr);
    let (status, headers, _) = client.exchange(b"GET /index.html HTTP/1.0\r\n\r\n");
    assert_eq!(status, "HTTP/1.1 400 Bad Request");
    assert!(headers.contains(&"Connection: close".to_string()));

    let mut rest = Vec::new();
    let _ = client.reader.read_to_end(&mut rest);
    assert!(rest.is_empty());
}

#[test]
fn level_triggered_mode() {
    let server = start(|c| c.trigger = TriggerMode::Level);
    let mut client = Client::connect(server.addr);
    for _ in 0..3 {
        let (status, _, body) = client.get("/alphabet.txt");
        assert_eq!(status, "HTTP/1.1 200 OK");
        assert_eq!(body, b"abcdefghijklmnopqrstuvwxyz");
    }
}

#[test]
fn register_then_login() {
    let server = start(|_| {});
    let mut client = Client::connect(server.addr);

    let form = b"user=ada&password=lovelace";
    let post = |path: &str, body: &[u8]| {
        let mut raw = format!(
            "POST {} HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: {}\r\n\r\n",
            path,
            body.len()
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    };

    let (_, _, body) = client.exchange(&post("/check-register", form));
    assert_eq!(body, b"please log in");
    let (_, _, body) = client.exchange(&post("/check-register", form));
    assert_eq!(body, b"name taken");
    let (_, _, body) = client.exchange(&post("/check-login", form));
    assert_eq!(body, b"welcome back");
    let (_, _, body) = client.exchange(&post("/check-login", b"user=ada&password=babbage"));
    assert_eq!(body, b"wrong password");
}

#[test]
fn busy_when_connection_limit_reached() {
    let server = start(|c| c.max_connections = 1);
    let mut first = Client::connect(server.addr);
    assert_eq!(first.get("/").0, "HTTP/1.1 200 OK");

    let mut second = TcpStream::connect(server.addr).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 64];
    // The close is abortive, so a reset may follow the message.
    while let Ok(n) = second.read(&mut buf) {
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    assert_eq!(reply, b"Internal server busy");

    assert_eq!(first.get("/").0, "HTTP/1.1 200 OK");
}

#[test]
fn shutdown_handle_stops_server() {
    let mut server = start(|_| {});
    server.handle.shutdown();
    let role = server.thread.take().unwrap().join().unwrap();
    assert_eq!(role, Role::Parent);
}
