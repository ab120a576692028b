//! Shared helpers for end-to-end engine tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Once;
use std::time::Duration;

use taskpump::TaskEngine;

static INIT_LOGGING: Once = Once::new();

/// Enable log output for a test run (`RUST_LOG=debug cargo test -- --nocapture`).
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Spawn a one-shot HTTP server that dribbles `total_bytes` of body out in
/// `chunk` sized writes with `delay` between them. Returns the URL to fetch.
pub fn serve_slow(total_bytes: usize, chunk: usize, delay: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut discard = [0u8; 1024];
            let _ = stream.read(&mut discard);
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {total_bytes}\r\nConnection: close\r\n\r\n"
            );
            if stream.write_all(header.as_bytes()).is_err() {
                return;
            }
            let body = vec![0xabu8; chunk];
            let mut sent = 0;
            while sent < total_bytes {
                let n = chunk.min(total_bytes - sent);
                if stream.write_all(&body[..n]).is_err() {
                    // Client hung up; cancellation path.
                    return;
                }
                let _ = stream.flush();
                sent += n;
                std::thread::sleep(delay);
            }
        }
    });
    format!("http://{addr}/content")
}

/// Tick the engine until every task has been finalized and dispatched.
pub fn drain(engine: &TaskEngine, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        engine.tick();
        if engine.pending_tasks() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    panic!("engine did not drain within {timeout:?}");
}
