//! In-process line responder for scenarios where the package under test
//! ships events to a peer (a monitored TCP endpoint, for example).

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

const FALLBACK_REPLY: &str = "goodbye";
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Companion {
    port: u16,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Companion {
    /// Bind a loopback listener and start answering on a background thread.
    ///
    /// Each connection gets one line read; the reply is `reply` when the
    /// line equals `expect` and `goodbye` otherwise.
    pub fn start(expect: &str, reply: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = stop.clone();
            let expect = expect.to_string();
            let reply = reply.to_string();
            thread::Builder::new()
                .name("kw-companion".to_string())
                .spawn(move || serve(listener, &stop, &expect, &reply))?
        };

        debug!(port, "companion listening");
        Ok(Self {
            port,
            stop,
            handle: Some(handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting, close the listener and join the thread.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        // Unblock accept()
        let _ = TcpStream::connect_timeout(
            &SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.port).into(),
            Duration::from_secs(1),
        );
        let _ = handle.join();
        debug!(port = self.port, "companion stopped");
    }
}

impl Drop for Companion {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(listener: TcpListener, stop: &AtomicBool, expect: &str, reply: &str) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let Ok(stream) = stream else {
            continue;
        };
        if let Err(e) = respond(stream, expect, reply) {
            debug!("companion connection failed: {e}");
        }
    }
}

fn respond(stream: TcpStream, expect: &str, reply: &str) -> io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let answer = if line.trim_end_matches(['\r', '\n']) == expect {
        reply
    } else {
        FALLBACK_REPLY
    };
    let mut stream = stream;
    stream.write_all(answer.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::is_port_free;

    fn exchange(port: u16, line: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream.write_all(line.as_bytes()).unwrap();
        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        reply
    }

    #[test]
    fn replies_to_expected_line() {
        let companion = Companion::start("ping", "pong").unwrap();
        assert_eq!(exchange(companion.port(), "ping\n"), "pong\n");
        assert_eq!(exchange(companion.port(), "ping\r\n"), "pong\n");
    }

    #[test]
    fn anything_else_gets_goodbye() {
        let companion = Companion::start("ping", "pong").unwrap();
        assert_eq!(exchange(companion.port(), "hello\n"), "goodbye\n");
    }

    #[test]
    fn drop_releases_the_port() {
        let companion = Companion::start("ping", "pong").unwrap();
        let port = companion.port();
        assert!(!is_port_free(port));
        drop(companion);
        assert!(is_port_free(port));
    }
}
