//! `Content-Length` framing shared by the daemon wire and the DAP transports.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, Read, Write};

/// Read one frame; `None` means a clean end of stream.
pub fn read_frame<R: BufRead>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let read_n = reader.read_line(&mut line)?;
        if read_n == 0 {
            if content_length.is_none() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside a frame header",
            ));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(v) = line.strip_prefix("Content-Length:") {
            content_length = Some(v.trim().parse().map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "bad Content-Length header")
            })?);
        }
    }

    let len = content_length.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "missing Content-Length")
    })?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    write!(writer, "Content-Length: {}\r\n\r\n", payload.len())?;
    writer.write_all(payload)?;
    writer.flush()
}

pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> std::io::Result<Option<T>> {
    let Some(buf) = read_frame(reader)? else {
        return Ok(None);
    };
    let msg = serde_json::from_slice(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_frame(writer, &payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::{json, Value};
    use std::io::BufReader;

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, &json!({"method": "launch", "id": 1})).unwrap();
        write_message(&mut buf, &json!({"method": "stop", "id": 2})).unwrap();

        let mut reader = BufReader::new(buf.as_slice());
        let first: Value = read_message(&mut reader).unwrap().unwrap();
        let second: Value = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(first["method"], "launch");
        assert_eq!(second["id"], 2);
        assert!(read_message::<_, Value>(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_frame_ignores_extra_headers() {
        let payload = br#"{"ok":true}"#;
        let raw = format!(
            "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            payload.len(),
            std::str::from_utf8(payload).unwrap()
        );
        let mut reader = BufReader::new(raw.as_bytes());
        let msg: Value = read_message(&mut reader).unwrap().unwrap();
        assert_eq!(msg["ok"], true);
    }

    #[test]
    fn test_missing_content_length_is_error() {
        let mut reader = BufReader::new("X-Nope: 1\r\n\r\n{}".as_bytes());
        assert!(read_frame(&mut reader).is_err());
    }
}
