//! Interactive client for the relay.
//!
//! Commands read from stdin:
//! - `send <user> <text>`: deliver `<text>` to `<user>`
//! - `quit`: leave the relay

use crate::config::ClientConfig;
use crate::runtime::protocol::{self, MAX_NAME_LEN};
use bytes::BytesMut;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info};

/// A parsed stdin command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send { recipient: String, text: String },
    Quit,
    Unknown,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.trim_start().splitn(2, char::is_whitespace);
        match parts.next() {
            Some("quit") => Command::Quit,
            Some("send") => {
                let rest = parts.next().unwrap_or("").trim_start();
                let mut rest = rest.splitn(2, char::is_whitespace);
                match rest.next() {
                    Some(recipient) if !recipient.is_empty() => Command::Send {
                        recipient: recipient.to_string(),
                        text: rest.next().unwrap_or("").to_string(),
                    },
                    _ => Command::Unknown,
                }
            }
            _ => Command::Unknown,
        }
    }
}

/// A message delivered by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sender: String,
    pub body: Vec<u8>,
}

/// Read one `<sender>\n<body>\n` frame. Returns `None` on end of stream.
pub fn read_delivery<R: BufRead>(reader: &mut R) -> io::Result<Option<Delivery>> {
    let mut sender = Vec::new();
    if reader.read_until(b'\n', &mut sender)? == 0 {
        return Ok(None);
    }
    let mut body = Vec::new();
    if reader.read_until(b'\n', &mut body)? == 0 {
        return Ok(None);
    }
    strip_newline(&mut sender);
    strip_newline(&mut body);
    Ok(Some(Delivery {
        sender: String::from_utf8_lossy(&sender).into_owned(),
        body,
    }))
}

fn strip_newline(line: &mut Vec<u8>) {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
}

/// Connect, register and run the command loop until `quit` or stdin ends.
pub fn run(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let name = match config.name {
        Some(name) => name,
        None => prompt_name()?,
    };
    check_name(&name)?;

    let mut stream = TcpStream::connect((config.host.as_str(), config.port))?;
    info!(host = %config.host, port = config.port, name = %name, "Connected");

    let mut out = BytesMut::new();
    protocol::encode_registration(name.as_bytes(), &mut out);
    stream.write_all(&out)?;

    // Set before the disconnect frame goes out, so the server closing our
    // socket afterwards is not reported as a lost connection.
    let leaving = Arc::new(AtomicBool::new(false));
    let reader = stream.try_clone()?;
    let reader_leaving = Arc::clone(&leaving);
    thread::Builder::new()
        .name("relay-reader".to_string())
        .spawn(move || {
            let end = print_deliveries(reader, &mut io::stdout(), &reader_leaving);
            if end == ReaderEnd::Lost {
                std::process::exit(1);
            }
        })?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match Command::parse(&line?) {
            Command::Send { recipient, text } => {
                out.clear();
                protocol::encode_message(recipient.as_bytes(), text.as_bytes(), &mut out);
                stream.write_all(&out)?;
            }
            Command::Quit => break,
            Command::Unknown => println!("Command not recognised!"),
        }
    }

    // An empty destination tells the server we are leaving.
    leaving.store(true, Ordering::SeqCst);
    stream.write_all(b" ")?;
    debug!("Disconnected");
    Ok(())
}

fn prompt_name() -> io::Result<String> {
    println!("What's your name?");
    let mut name = String::new();
    io::stdin().read_line(&mut name)?;
    Ok(name.trim().to_string())
}

/// Reject names the relay could not register as sent.
fn check_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(format!("name must be 1 to {MAX_NAME_LEN} bytes"));
    }
    if name.contains('\n') {
        return Err("name must not contain a newline".to_string());
    }
    Ok(())
}

/// Why the delivery printer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderEnd {
    /// The stream ended after we sent the disconnect frame.
    Leaving,
    /// The server went away on its own.
    Lost,
}

fn print_deliveries<R: Read, W: Write>(
    stream: R,
    out: &mut W,
    leaving: &AtomicBool,
) -> ReaderEnd {
    let mut reader = BufReader::new(stream);
    loop {
        match read_delivery(&mut reader) {
            Ok(Some(delivery)) => {
                let _ = writeln!(out, "New message from {}", delivery.sender);
                let _ = writeln!(out, "{}", String::from_utf8_lossy(&delivery.body));
                let _ = out.flush();
            }
            Ok(None) if leaving.load(Ordering::SeqCst) => return ReaderEnd::Leaving,
            Err(_) if leaving.load(Ordering::SeqCst) => return ReaderEnd::Leaving,
            Ok(None) => {
                eprintln!("Server closed the connection");
                return ReaderEnd::Lost;
            }
            Err(e) => {
                eprintln!("Connection lost: {e}");
                return ReaderEnd::Lost;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_send() {
        assert_eq!(
            Command::parse("send bob hello there\n"),
            Command::Send {
                recipient: "bob".to_string(),
                text: "hello there".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_send_without_text() {
        assert_eq!(
            Command::parse("send bob"),
            Command::Send {
                recipient: "bob".to_string(),
                text: String::new(),
            }
        );
    }

    #[test]
    fn test_parse_quit_and_unknown() {
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("  quit\r\n"), Command::Quit);
        assert_eq!(Command::parse("send"), Command::Unknown);
        assert_eq!(Command::parse("shout bob hi"), Command::Unknown);
        assert_eq!(Command::parse(""), Command::Unknown);
    }

    #[test]
    fn test_read_deliveries() {
        let mut input = Cursor::new(b"alice\nhello there\nalice\n\n".to_vec());
        assert_eq!(
            read_delivery(&mut input).unwrap(),
            Some(Delivery {
                sender: "alice".to_string(),
                body: b"hello there".to_vec(),
            })
        );
        assert_eq!(
            read_delivery(&mut input).unwrap(),
            Some(Delivery {
                sender: "alice".to_string(),
                body: Vec::new(),
            })
        );
        assert_eq!(read_delivery(&mut input).unwrap(), None);
    }

    #[test]
    fn test_truncated_delivery() {
        let mut input = Cursor::new(b"alice\n".to_vec());
        assert_eq!(read_delivery(&mut input).unwrap(), None);
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("alice").is_ok());
        assert!(check_name(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert!(check_name("").is_err());
        assert!(check_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
        assert!(check_name("alice\nbob hi").is_err());
        assert!(check_name("alice\n").is_err());
    }

    #[test]
    fn test_stream_end_after_leaving() {
        let leaving = AtomicBool::new(true);
        let mut out = Vec::new();
        let input = Cursor::new(b"alice\nbye\n".to_vec());
        assert_eq!(
            print_deliveries(input, &mut out, &leaving),
            ReaderEnd::Leaving
        );
        assert_eq!(out, b"New message from alice\nbye\n");
    }

    #[test]
    fn test_stream_end_without_leaving() {
        let leaving = AtomicBool::new(false);
        let mut out = Vec::new();
        let input = Cursor::new(b"alice\nhi\n".to_vec());
        assert_eq!(print_deliveries(input, &mut out, &leaving), ReaderEnd::Lost);
        assert_eq!(out, b"New message from alice\nhi\n");
    }
}
