//! A small line-protocol forwarding proxy used to drive scenarios in tests.
//!
//! Behaves like the intermediary the mock backend is meant to sit behind:
//! `version` and unknown commands are answered locally, storage and retrieval
//! commands are forwarded to the backend in a single write, backend replies are
//! reassembled into whole lines before reaching the client, and a backend that
//! hangs up mid-request turns into a `SERVER_ERROR` line.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use tracing::debug;

const STORAGE_COMMANDS: &[&str] = &["set", "add", "replace", "append", "prepend", "cas"];
const FORWARDED_COMMANDS: &[&str] = &["get", "gets", "delete", "incr", "decr", "flush_all"];

pub struct TestProxy {
    addr: SocketAddr,
}

impl TestProxy {
    pub fn spawn(backend: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test proxy");
        let addr = listener.local_addr().expect("test proxy address");
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        thread::spawn(move || {
                            if let Err(e) = serve(stream, backend) {
                                debug!(error = %e, "test proxy connection ended");
                            }
                        });
                    }
                    Err(_) => break,
                }
            }
        });
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

struct Backend {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl Backend {
    fn connect(addr: SocketAddr) -> io::Result<Self> {
        let writer = TcpStream::connect(addr)?;
        let reader = BufReader::new(writer.try_clone()?);
        Ok(Self { writer, reader })
    }

    /// Forward one request and read back one complete reply line.
    fn round_trip(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        self.writer.write_all(request)?;
        self.writer.flush()?;
        let mut line = Vec::new();
        self.reader.read_until(b'\n', &mut line)?;
        if !line.ends_with(b"\r\n") {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backend closed mid-reply",
            ));
        }
        Ok(line)
    }
}

fn serve(client: TcpStream, backend_addr: SocketAddr) -> io::Result<()> {
    let mut reader = BufReader::new(client.try_clone()?);
    let mut writer = client;
    let mut backend: Option<Backend> = None;

    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let parts: Vec<&str> = text.split_whitespace().collect();
        let command = parts.first().copied().unwrap_or("");

        let mut request = line.clone();
        if command == "version" {
            writer.write_all(b"VERSION 0.0.0-test\r\n")?;
            continue;
        } else if STORAGE_COMMANDS.contains(&command) {
            let Some(len) = parts.get(4).and_then(|n| n.parse::<usize>().ok()) else {
                writer.write_all(b"CLIENT_ERROR bad command line format\r\n")?;
                continue;
            };
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data)?;
            request.extend_from_slice(&data);
        } else if !FORWARDED_COMMANDS.contains(&command) {
            writer.write_all(b"ERROR\r\n")?;
            continue;
        }

        if backend.is_none() {
            match Backend::connect(backend_addr) {
                Ok(b) => backend = Some(b),
                Err(_) => {
                    writer.write_all(b"SERVER_ERROR backend unavailable\r\n")?;
                    continue;
                }
            }
        }
        let reply = match backend.as_mut() {
            Some(b) => b.round_trip(&request),
            None => continue,
        };
        match reply {
            Ok(reply) => writer.write_all(&reply)?,
            Err(_) => {
                backend = None;
                writer.write_all(b"SERVER_ERROR proxy downstream closed\r\n")?;
            }
        }
    }
}
