//! Streaming a volume directly into another worker.

use std::path::Path;

use baggageclaim_common::{ClaimError, ClaimResult};
use reqwest::StatusCode;
use reqwest::blocking::{Body, Client};
use reqwest::header::CONTENT_ENCODING;
use serde::Deserialize;

use super::{Streamer, pipe};

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// PUT an archive of `src` to a peer's stream-in URL.
///
/// Compression runs on a scoped thread feeding a bounded pipe that the HTTP
/// client drains, so memory use does not grow with the volume. Must not be
/// called from inside an async runtime.
///
/// # Errors
///
/// Returns [`ClaimError::Peer`] with the peer's decoded message for any
/// response other than `204 No Content`, otherwise the archiving or
/// transport error.
pub fn stream_to_peer(
    streamer: &dyn Streamer,
    src: &Path,
    privileged: bool,
    url: &str,
) -> ClaimResult<()> {
    let encoding = streamer.encoding();
    let client = Client::builder()
        .build()
        .map_err(|e| ClaimError::Http {
            message: e.to_string(),
        })?;

    tracing::info!(url, src = %src.display(), %encoding, "Streaming to peer");

    let (mut writer, reader) = pipe();

    let (archived, response) = std::thread::scope(|scope| {
        let archiver = scope.spawn(move || {
            match streamer.stream_out(&mut writer, src, privileged) {
                Ok(()) => writer.close().map_err(ClaimError::Io),
                Err(err) => {
                    writer.close_with_error(std::io::Error::other(err.to_string()));
                    Err(err)
                }
            }
        });

        let response = client
            .put(url)
            .header(CONTENT_ENCODING, encoding.as_str())
            .body(Body::new(reader))
            .send();

        let archived = archiver.join().unwrap_or_else(|_| {
            Err(ClaimError::Internal {
                message: "archiver thread panicked".to_string(),
            })
        });
        (archived, response)
    });

    match response {
        Ok(response) if response.status() == StatusCode::NO_CONTENT => {
            archived?;
            tracing::info!(url, "Streamed to peer");
            Ok(())
        }
        Ok(response) => {
            log_archive_failure(url, &archived);
            let status = response.status();
            let body = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or(body);

            Err(ClaimError::Peer {
                status: status.as_u16(),
                message,
            })
        }
        Err(err) => match archived {
            // the archive broke the request, not the other way round
            Err(archived) if !is_broken_pipe(&archived) => Err(archived),
            archived => {
                log_archive_failure(url, &archived);
                Err(ClaimError::Http {
                    message: err.to_string(),
                })
            }
        },
    }
}

fn is_broken_pipe(err: &ClaimError) -> bool {
    matches!(err, ClaimError::Io(io) if io.kind() == std::io::ErrorKind::BrokenPipe)
}

fn log_archive_failure(url: &str, archived: &ClaimResult<()>) {
    if let Err(err) = archived {
        tracing::debug!(url, error = %err, "Archiving stopped with the request");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use super::*;
    use crate::namespace::NoopNamespacer;
    use crate::stream::{Archiver, Encoding, TarStreamer};

    fn streamer(encoding: Encoding) -> TarStreamer {
        TarStreamer::new(
            encoding,
            Archiver::InProcess,
            Arc::new(NoopNamespacer),
            Arc::new(NoopNamespacer),
        )
    }

    #[derive(Debug)]
    struct Received {
        encoding: Option<String>,
        body: Vec<u8>,
    }

    fn read_chunked(reader: &mut impl BufRead) -> Vec<u8> {
        let mut body = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let size = usize::from_str_radix(line.trim(), 16).unwrap();
            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            if size == 0 {
                return body;
            }
            body.extend_from_slice(&chunk[..size]);
        }
    }

    /// Accept one PUT, read it fully, then answer with `response`.
    fn peer(response: String) -> (String, JoinHandle<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/volumes/dest/stream-in", listener.local_addr().unwrap());

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut encoding = None;
            let mut length = 0;
            let mut chunked = false;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    let value = value.trim();
                    match name.to_ascii_lowercase().as_str() {
                        "content-encoding" => encoding = Some(value.to_string()),
                        "content-length" => length = value.parse().unwrap(),
                        "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
                        _ => {}
                    }
                }
            }

            let body = if chunked {
                read_chunked(&mut reader)
            } else {
                let mut body = vec![0u8; length];
                reader.read_exact(&mut body).unwrap();
                body
            };

            let mut stream: TcpStream = stream;
            stream.write_all(response.as_bytes()).unwrap();
            Received { encoding, body }
        });

        (url, handle)
    }

    #[test]
    fn accepted_streams_reach_the_peer_intact() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("dir")).unwrap();
        std::fs::write(src.path().join("dir/file"), vec![7u8; 300 * 1024]).unwrap();

        let (url, received) =
            peer("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n".to_string());
        stream_to_peer(&streamer(Encoding::Gzip), src.path(), false, &url).unwrap();
        let received = received.join().unwrap();

        assert_eq!(received.encoding.as_deref(), Some("gzip"));
        let dest = tempfile::tempdir().unwrap();
        streamer(Encoding::Gzip)
            .stream_in(&mut &received.body[..], dest.path(), false)
            .unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("dir/file")).unwrap(),
            vec![7u8; 300 * 1024]
        );
    }

    #[test]
    fn peer_errors_carry_the_decoded_message() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("file"), b"data").unwrap();

        let body = r#"{"error":"volume does not exist: dest"}"#;
        let (url, received) = peer(format!(
            "HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        ));
        let err = stream_to_peer(&streamer(Encoding::Raw), src.path(), false, &url).unwrap_err();
        received.join().unwrap();

        match err {
            ClaimError::Peer { status, message } => {
                assert_eq!(status, 404);
                assert_eq!(message, "volume does not exist: dest");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unreachable_peers_are_transport_errors() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("big"), vec![1u8; 4 * 1024 * 1024]).unwrap();

        let closed = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/volumes/dest/stream-in", closed.local_addr().unwrap());
        drop(closed);

        let err = stream_to_peer(&streamer(Encoding::Raw), src.path(), false, &url).unwrap_err();
        assert!(matches!(err, ClaimError::Http { .. }), "{err:?}");
    }

    #[test]
    fn archive_failures_outrank_the_aborted_upload() {
        let src = tempfile::tempdir().unwrap();
        let missing = src.path().join("missing");

        // accepted by the kernel backlog, never answered
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/volumes/dest/stream-in", listener.local_addr().unwrap());

        let err = stream_to_peer(&streamer(Encoding::Raw), &missing, false, &url).unwrap_err();
        assert!(
            matches!(&err, ClaimError::Io(io) if io.kind() == std::io::ErrorKind::NotFound),
            "{err:?}"
        );
    }
}
