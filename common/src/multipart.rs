//! Incremental `multipart/form-data` decoding.
//!
//! The ESP-IDF HTTP server hands request bodies over as a byte stream with no
//! form parsing, so uploads are decoded here chunk by chunk and fed into an
//! [`UploadSession`] without buffering the whole file in RAM.

use crate::upload::{UploadError, UploadSession, UploadSink};

const MAX_HEADER_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    Start {
        field: String,
        filename: Option<String>,
    },
    Data(Vec<u8>),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterBoundary,
    Headers,
    Body,
    Done,
}

#[derive(Debug)]
pub struct MultipartParser {
    dash_boundary: Vec<u8>,
    delimiter: Vec<u8>,
    state: State,
    buf: Vec<u8>,
}

pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let (mime, params) = content_type.split_once(';')?;
    if !mime.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }

    params.split(';').find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn disposition_param(header_value: &str, key: &str) -> Option<String> {
    header_value.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case(key) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        let dash_boundary = format!("--{boundary}").into_bytes();
        let delimiter = format!("\r\n--{boundary}").into_bytes();
        Self {
            dash_boundary,
            delimiter,
            state: State::Preamble,
            buf: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<MultipartEvent>, UploadError> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            match self.state {
                State::Preamble => match find(&self.buf, &self.dash_boundary) {
                    Some(pos) => {
                        self.buf.drain(..pos + self.dash_boundary.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        let keep = self.dash_boundary.len().saturating_sub(1);
                        let drop_len = self.buf.len().saturating_sub(keep);
                        self.buf.drain(..drop_len);
                        break;
                    }
                },
                State::AfterBoundary => {
                    if self.buf.len() < 2 {
                        break;
                    }
                    if self.buf.starts_with(b"--") {
                        self.buf.clear();
                        self.state = State::Done;
                    } else if self.buf.starts_with(b"\r\n") {
                        self.buf.drain(..2);
                        self.state = State::Headers;
                    } else {
                        return Err(UploadError::Multipart("unexpected bytes after boundary"));
                    }
                }
                State::Headers => {
                    let Some(pos) = find(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > MAX_HEADER_BYTES {
                            return Err(UploadError::Multipart("part headers too large"));
                        }
                        break;
                    };
                    let headers = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
                    self.buf.drain(..pos + 4);
                    events.push(Self::parse_part_headers(&headers)?);
                    self.state = State::Body;
                }
                State::Body => match find(&self.buf, &self.delimiter) {
                    Some(pos) => {
                        if pos > 0 {
                            events.push(MultipartEvent::Data(self.buf[..pos].to_vec()));
                        }
                        events.push(MultipartEvent::End);
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::AfterBoundary;
                    }
                    None => {
                        // Hold back a possible partial delimiter.
                        let keep = self.delimiter.len() - 1;
                        if self.buf.len() > keep {
                            let emit = self.buf.len() - keep;
                            events.push(MultipartEvent::Data(self.buf.drain(..emit).collect()));
                        }
                        break;
                    }
                },
                State::Done => {
                    self.buf.clear();
                    break;
                }
            }
        }

        Ok(events)
    }

    fn parse_part_headers(headers: &str) -> Result<MultipartEvent, UploadError> {
        for line in headers.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                let field = disposition_param(value, "name").unwrap_or_default();
                let filename = disposition_param(value, "filename");
                return Ok(MultipartEvent::Start { field, filename });
            }
        }
        Err(UploadError::Multipart("part without content-disposition"))
    }
}

/// Feeds a streamed multipart body into an upload session. The first file part
/// is uploaded; plain form fields and additional files are skipped.
pub struct MultipartUpload<S: UploadSink> {
    parser: MultipartParser,
    session: UploadSession<S>,
    in_file: bool,
    output: Option<S::Output>,
}

impl<S: UploadSink> MultipartUpload<S> {
    pub fn new(boundary: &str, sink: S) -> Self {
        Self {
            parser: MultipartParser::new(boundary),
            session: UploadSession::new(sink),
            in_file: false,
            output: None,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        let events = match self.parser.feed(chunk) {
            Ok(events) => events,
            Err(err) => {
                self.session.abort();
                return Err(err);
            }
        };

        for event in events {
            match event {
                MultipartEvent::Start {
                    filename: Some(filename),
                    ..
                } if self.output.is_none() && !filename.is_empty() => {
                    self.session.start(&filename)?;
                    self.in_file = true;
                }
                MultipartEvent::Start { field, filename } => {
                    if filename.is_some() {
                        log::warn!("ignoring extra upload part `{field}`");
                    }
                    self.in_file = false;
                }
                MultipartEvent::Data(data) if self.in_file => self.session.write(&data)?,
                MultipartEvent::Data(_) => {}
                MultipartEvent::End if self.in_file => {
                    self.output = Some(self.session.end()?);
                    self.in_file = false;
                }
                MultipartEvent::End => {}
            }
        }
        Ok(())
    }

    /// Completes the upload once the request body is exhausted. A body that
    /// ended before the closing boundary aborts the partial upload.
    pub fn finish(mut self) -> Result<S::Output, UploadError> {
        if !self.parser.is_done() {
            self.session.abort();
            return Err(UploadError::Aborted);
        }
        self.output
            .take()
            .ok_or_else(|| UploadError::Rejected("no file in upload".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        storage::tests::temp_store,
        upload::{FileUploadSink, StoredFile},
    };

    const BOUNDARY: &str = "----WebKitFormBoundaryX3";

    fn body(filename: &str, contents: &str) -> Vec<u8> {
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"upload\"; filename=\"{filename}\"\r\n\
             Content-Type: text/html\r\n\r\n\
             {contents}\r\n\
             --{BOUNDARY}--\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn extracts_boundary() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc").as_deref(),
            Some("abc")
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; charset=utf-8; boundary=\"q r\"")
                .as_deref(),
            Some("q r")
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
    }

    #[test]
    fn parses_single_part_in_one_chunk() {
        let mut parser = MultipartParser::new(BOUNDARY);
        let events = parser.feed(&body("index.html", "<p>hi</p>")).unwrap();

        assert_eq!(
            events,
            vec![
                MultipartEvent::Start {
                    field: "upload".to_string(),
                    filename: Some("index.html".to_string()),
                },
                MultipartEvent::Data(b"<p>hi</p>".to_vec()),
                MultipartEvent::End,
            ]
        );
        assert!(parser.is_done());
    }

    #[test]
    fn byte_at_a_time_yields_same_payload() {
        let contents = "line one\r\nline two with -- dashes\r\n--not-the-boundary";
        let raw = body("notes.txt", contents);
        let mut parser = MultipartParser::new(BOUNDARY);

        let mut data = Vec::new();
        let mut ends = 0;
        for byte in raw {
            for event in parser.feed(&[byte]).unwrap() {
                match event {
                    MultipartEvent::Data(chunk) => data.extend(chunk),
                    MultipartEvent::End => ends += 1,
                    MultipartEvent::Start { .. } => {}
                }
            }
        }

        assert_eq!(String::from_utf8(data).unwrap(), contents);
        assert_eq!(ends, 1);
        assert!(parser.is_done());
    }

    #[test]
    fn upload_streams_into_flash() {
        let store = temp_store("multipart-ok");
        let raw = body("app.js", "console.log(1);");
        let mut upload = MultipartUpload::new(BOUNDARY, FileUploadSink::new(store.clone()));

        for chunk in raw.chunks(7) {
            upload.feed(chunk).unwrap();
        }

        assert_eq!(
            upload.finish().unwrap(),
            StoredFile {
                path: "/app.js".to_string(),
                size: 15,
            }
        );
        assert_eq!(store.read("/app.js").unwrap(), b"console.log(1);");
    }

    #[test]
    fn truncated_body_aborts_and_cleans_up() {
        let store = temp_store("multipart-cut");
        let raw = body("big.txt", &"x".repeat(500));
        let mut upload = MultipartUpload::new(BOUNDARY, FileUploadSink::new(store.clone()));

        upload.feed(&raw[..300]).unwrap();
        assert!(matches!(upload.finish(), Err(UploadError::Aborted)));
        assert!(!store.exists("/big.txt"));
    }

    #[test]
    fn form_without_file_is_rejected() {
        let store = temp_store("multipart-nofile");
        let raw = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n--{BOUNDARY}--\r\n"
        );
        let mut upload = MultipartUpload::new(BOUNDARY, FileUploadSink::new(store));

        upload.feed(raw.as_bytes()).unwrap();
        assert!(matches!(upload.finish(), Err(UploadError::Rejected(_))));
    }
}
