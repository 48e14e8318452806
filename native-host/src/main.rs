//! Native Messaging Host - Thin relay to the snip router
//!
//! Chrome talks to this binary over stdin/stdout using length-prefixed
//! frames. Each frame is forwarded as one line to the router's Unix socket
//! and every line the router sends back (responses, runtime requests,
//! broadcast traffic) becomes a frame to the extension. stdout carries
//! frames only; diagnostics go to stderr.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use serde_json::{json, Value};
use snip_router::messaging::native::{read_frame_sync, write_frame_sync};
use snip_router::Config;

/// Overrides the socket path from the router config
const SOCKET_ENV: &str = "SNIP_ROUTER_SOCKET";

fn socket_path() -> PathBuf {
    std::env::var(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| Config::load().server.socket_path)
}

/// Error reply for a frame the router never saw
fn error_response(request: &[u8], message: &str) -> Vec<u8> {
    let id = serde_json::from_slice::<Value>(request)
        .ok()
        .and_then(|v| v.get("id").cloned());
    let mut response = json!({ "success": false, "error": message });
    if let Some(id) = id {
        response["id"] = id;
    }
    response.to_string().into_bytes()
}

/// Extension frames to router lines until the extension hangs up
fn relay_to_service<R: Read, W: Write>(frames: &mut R, service: &mut W) -> io::Result<()> {
    loop {
        match read_frame_sync(frames) {
            Ok(Some(message)) => {
                eprintln!("Received {} bytes from extension", message.len());
                service.write_all(&message)?;
                service.write_all(b"\n")?;
                service.flush()?;
            }
            Ok(None) => {
                eprintln!("Extension closed the connection");
                return Ok(());
            }
            Err(e) => {
                eprintln!("Read error: {}", e);
                return Ok(());
            }
        }
    }
}

/// Router lines to extension frames until the router hangs up
fn relay_to_extension<R: BufRead, W: Write>(service: R, frames: &mut W) -> io::Result<()> {
    for line in service.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = write_frame_sync(frames, line.as_bytes()) {
            // Oversized messages are dropped; the extension will time out
            eprintln!("Failed to write frame: {}", e);
        }
    }
    Ok(())
}

/// Without a router every frame is answered with an error
fn serve_unavailable<R: Read, W: Write>(frames: &mut R, out: &mut W, reason: &str) {
    let message = format!("Service unavailable: {}", reason);
    while let Ok(Some(request)) = read_frame_sync(frames) {
        if let Err(e) = write_frame_sync(out, &error_response(&request, &message)) {
            eprintln!("Failed to write response: {}", e);
            break;
        }
    }
}

fn main() {
    let path = socket_path();
    eprintln!("Native host started, connecting to {:?}", path);

    let mut stdin = io::stdin().lock();
    let stream = match UnixStream::connect(&path) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Service error: {}", e);
            serve_unavailable(&mut stdin, &mut io::stdout().lock(), &e.to_string());
            return;
        }
    };

    let reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            eprintln!("Failed to clone socket: {}", e);
            return;
        }
    };

    let outbound = thread::spawn(move || {
        let mut stdout = io::stdout().lock();
        if let Err(e) = relay_to_extension(BufReader::new(reader), &mut stdout) {
            eprintln!("Service read error: {}", e);
        }
    });

    let mut writer = &stream;
    if let Err(e) = relay_to_service(&mut stdin, &mut writer) {
        eprintln!("Service write error: {}", e);
    }

    let _ = stream.shutdown(Shutdown::Both);
    let _ = outbound.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frames(payloads: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for p in payloads {
            write_frame_sync(&mut buf, p.as_bytes()).unwrap();
        }
        buf
    }

    fn read_all_frames(buf: Vec<u8>) -> Vec<String> {
        let mut cursor = Cursor::new(buf);
        let mut out = Vec::new();
        while let Some(frame) = read_frame_sync(&mut cursor).unwrap() {
            out.push(String::from_utf8(frame).unwrap());
        }
        out
    }

    #[test]
    fn test_frames_become_lines() {
        let mut input = Cursor::new(frames(&[r#"{"method":"ping"}"#, r#"{"id":2}"#]));
        let mut socket = Vec::new();
        relay_to_service(&mut input, &mut socket).unwrap();
        assert_eq!(String::from_utf8(socket).unwrap(), "{\"method\":\"ping\"}\n{\"id\":2}\n");
    }

    #[test]
    fn test_lines_become_frames() {
        let lines = Cursor::new("{\"success\":true}\n\n{\"channel\":\"rs-toast\"}\n");
        let mut out = Vec::new();
        relay_to_extension(lines, &mut out).unwrap();
        assert_eq!(
            read_all_frames(out),
            vec!["{\"success\":true}", "{\"channel\":\"rs-toast\"}"]
        );
    }

    #[test]
    fn test_unavailable_service_answers_with_errors() {
        let mut input = Cursor::new(frames(&[r#"{"id":7,"method":"ping"}"#, "garbage"]));
        let mut out = Vec::new();
        serve_unavailable(&mut input, &mut out, "connection refused");

        let replies: Vec<Value> = read_all_frames(out)
            .iter()
            .map(|s| serde_json::from_str(s).unwrap())
            .collect();
        assert_eq!(replies[0]["id"], json!(7));
        assert_eq!(replies[0]["error"], json!("Service unavailable: connection refused"));
        assert!(replies[1].get("id").is_none());
        assert_eq!(replies[1]["success"], json!(false));
    }
}
