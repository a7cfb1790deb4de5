use std::io::{self, Read, Write};
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};
use axum::http::HeaderMap;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::middleware::buffer_pool::{GLOBAL_BUFFER_POOL, LARGE_BUFFER_SIZE, SMALL_BUFFER_SIZE};
use crate::observability::metrics;

/// The sentinel tag the script is inserted before. Only the first
/// occurrence is rewritten; matching is textual, so a tag inside a comment
/// or script block is matched too.
const SEARCH_TAG: &[u8] = b"</body>";

/// Ceiling on the encoded inbound body. Larger responses are forwarded
/// unchanged with no injection.
pub const MAX_REWRITE_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum InjectorState {
    Searching,
    InjectingScript,
    InjectingTag,
    Passthrough,
}

/// Pull reader that inserts the script bytes immediately before the first
/// `</body>` in the wrapped stream. Holds a rolling window buffer and always
/// keeps the last `tag_len - 1` bytes back until EOF so a tag straddling a
/// read boundary is still found.
pub struct ScriptInjector<R> {
    upstream: R,
    script: Arc<Vec<u8>>,
    state: InjectorState,
    buffer: Vec<u8>,
    search_pos: usize,
    buffer_end: usize,
    script_read_pos: usize,
    tag_read_pos: usize,
    upstream_eof: bool,
}

impl<R: Read> ScriptInjector<R> {
    pub fn new(upstream: R, script: Arc<Vec<u8>>) -> Self {
        let mut buffer = GLOBAL_BUFFER_POOL.get_small();
        buffer.resize(SMALL_BUFFER_SIZE, 0);
        Self {
            upstream,
            script,
            state: InjectorState::Searching,
            buffer,
            search_pos: 0,
            buffer_end: 0,
            script_read_pos: 0,
            tag_read_pos: 0,
            upstream_eof: false,
        }
    }

    fn emit(&mut self, p: &mut [u8], from: usize, to: usize) -> usize {
        let n = p.len().min(to - from);
        p[..n].copy_from_slice(&self.buffer[from..from + n]);
        self.search_pos = from + n;
        n
    }
}

impl<R: Read> Read for ScriptInjector<R> {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        if p.is_empty() {
            return Ok(0);
        }

        loop {
            match self.state {
                InjectorState::InjectingScript => {
                    if self.script_read_pos >= self.script.len() {
                        self.state = InjectorState::InjectingTag;
                        continue;
                    }
                    let n = p.len().min(self.script.len() - self.script_read_pos);
                    p[..n].copy_from_slice(&self.script[self.script_read_pos..self.script_read_pos + n]);
                    self.script_read_pos += n;
                    return Ok(n);
                }

                InjectorState::InjectingTag => {
                    if self.tag_read_pos >= SEARCH_TAG.len() {
                        self.state = InjectorState::Passthrough;
                        continue;
                    }
                    let n = p.len().min(SEARCH_TAG.len() - self.tag_read_pos);
                    p[..n].copy_from_slice(&SEARCH_TAG[self.tag_read_pos..self.tag_read_pos + n]);
                    self.tag_read_pos += n;
                    return Ok(n);
                }

                InjectorState::Passthrough => {
                    if self.search_pos < self.buffer_end {
                        let n = self.emit(p, self.search_pos, self.buffer_end);
                        return Ok(n);
                    }
                    if self.upstream_eof {
                        return Ok(0);
                    }
                    return self.upstream.read(p);
                }

                InjectorState::Searching => {
                    // Compact the window so the unprocessed tail sits at the
                    // front and the free space is contiguous.
                    if self.search_pos > 0 {
                        self.buffer.copy_within(self.search_pos..self.buffer_end, 0);
                        self.buffer_end -= self.search_pos;
                        self.search_pos = 0;
                    }

                    if !self.upstream_eof && self.buffer_end < self.buffer.len() {
                        let read = self.upstream.read(&mut self.buffer[self.buffer_end..])?;
                        if read == 0 {
                            self.upstream_eof = true;
                            if self.buffer_end == 0 {
                                self.state = InjectorState::Passthrough;
                                continue;
                            }
                        } else {
                            self.buffer_end += read;
                        }
                    }

                    if let Some(idx) =
                        find_subsequence(&self.buffer[self.search_pos..self.buffer_end], SEARCH_TAG)
                    {
                        let absolute = self.search_pos + idx;
                        if absolute > self.search_pos {
                            let n = self.emit(p, self.search_pos, absolute);
                            return Ok(n);
                        }
                        // The tag starts right here; skip over it and switch
                        // to injection. The tag bytes themselves are
                        // re-emitted by InjectingTag.
                        self.search_pos += SEARCH_TAG.len();
                        self.state = InjectorState::InjectingScript;
                        continue;
                    }

                    if self.upstream_eof {
                        if self.search_pos < self.buffer_end {
                            let n = self.emit(p, self.search_pos, self.buffer_end);
                            if self.search_pos >= self.buffer_end {
                                self.state = InjectorState::Passthrough;
                            }
                            return Ok(n);
                        }
                        self.state = InjectorState::Passthrough;
                        continue;
                    }

                    // Emit the safe tail: everything except the last
                    // tag_len - 1 bytes, which may be the head of a
                    // boundary-straddling tag.
                    let holdback = SEARCH_TAG.len() - 1;
                    if self.buffer_end > holdback {
                        let safe_end = self.buffer_end - holdback;
                        if safe_end > self.search_pos {
                            let n = self.emit(p, self.search_pos, safe_end);
                            return Ok(n);
                        }
                    }
                    // Not enough buffered data to decide; refill.
                    continue;
                }
            }
        }
    }
}

impl<R> Drop for ScriptInjector<R> {
    fn drop(&mut self) {
        GLOBAL_BUFFER_POOL.put(std::mem::take(&mut self.buffer));
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Content codecs the rewriter can pass through transparently.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Codec {
    Identity,
    Gzip,
    Brotli,
    Zstd,
    Lz4,
}

impl Codec {
    /// Match a `Content-Encoding` value. `None` means the encoding is not
    /// supported and the body must be forwarded untouched.
    pub fn from_content_encoding(value: &str) -> Option<Codec> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Codec::Identity),
            "gzip" | "x-gzip" => Some(Codec::Gzip),
            "br" => Some(Codec::Brotli),
            "zstd" => Some(Codec::Zstd),
            "lz4" => Some(Codec::Lz4),
            _ => None,
        }
    }

    /// The header value to restore after recompression.
    pub fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Codec::Identity => None,
            Codec::Gzip => Some("gzip"),
            Codec::Brotli => Some("br"),
            Codec::Zstd => Some("zstd"),
            Codec::Lz4 => Some("lz4"),
        }
    }

    fn reader<'a>(&self, source: Box<dyn Read + Send + 'a>) -> io::Result<Box<dyn Read + Send + 'a>> {
        Ok(match self {
            Codec::Identity => source,
            Codec::Gzip => Box::new(flate2::read::MultiGzDecoder::new(source)),
            Codec::Brotli => Box::new(brotli::Decompressor::new(source, 4096)),
            Codec::Zstd => Box::new(zstd::stream::read::Decoder::new(source)?),
            Codec::Lz4 => Box::new(lz4_flex::frame::FrameDecoder::new(source)),
        })
    }
}

/// Compressor with an explicit finish step so every codec's trailer is
/// written before the stream closes.
enum CodecWriter<W: Write> {
    Identity(W),
    Gzip(flate2::write::GzEncoder<W>),
    Brotli(brotli::CompressorWriter<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(Box<lz4_flex::frame::FrameEncoder<W>>),
}

impl<W: Write> CodecWriter<W> {
    fn new(codec: Codec, sink: W) -> io::Result<Self> {
        Ok(match codec {
            Codec::Identity => CodecWriter::Identity(sink),
            Codec::Gzip => CodecWriter::Gzip(flate2::write::GzEncoder::new(
                sink,
                flate2::Compression::default(),
            )),
            Codec::Brotli => CodecWriter::Brotli(brotli::CompressorWriter::new(sink, 4096, 5, 22)),
            Codec::Zstd => CodecWriter::Zstd(zstd::stream::write::Encoder::new(sink, 0)?),
            Codec::Lz4 => CodecWriter::Lz4(Box::new(lz4_flex::frame::FrameEncoder::new(sink))),
        })
    }

    fn finish(self) -> io::Result<()> {
        match self {
            CodecWriter::Identity(mut w) => w.flush(),
            CodecWriter::Gzip(e) => e.finish().map(|_| ()),
            CodecWriter::Brotli(mut e) => {
                e.flush()?;
                // The brotli stream trailer is emitted when the writer drops.
                drop(e);
                Ok(())
            }
            CodecWriter::Zstd(e) => e.finish().map(|_| ()),
            CodecWriter::Lz4(e) => e
                .finish()
                .map(|_| ())
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

impl<W: Write> Write for CodecWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CodecWriter::Identity(w) => w.write(buf),
            CodecWriter::Gzip(w) => w.write(buf),
            CodecWriter::Brotli(w) => w.write(buf),
            CodecWriter::Zstd(w) => w.write(buf),
            CodecWriter::Lz4(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CodecWriter::Identity(w) => w.flush(),
            CodecWriter::Gzip(w) => w.flush(),
            CodecWriter::Brotli(w) => w.flush(),
            CodecWriter::Zstd(w) => w.flush(),
            CodecWriter::Lz4(w) => w.flush(),
        }
    }
}

/// Run decompress -> inject -> recompress over a complete encoded input,
/// writing the re-encoded result to `out`.
fn rewrite_sync(
    codec: Codec,
    input: &[u8],
    script: Arc<Vec<u8>>,
    out: &mut dyn Write,
) -> io::Result<()> {
    let decoder = codec.reader(Box::new(input))?;
    let mut injector = ScriptInjector::new(decoder, script);
    let mut encoder = CodecWriter::new(codec, out)?;

    let mut buf = GLOBAL_BUFFER_POOL.get_large();
    buf.resize(LARGE_BUFFER_SIZE, 0);

    let result = (|| {
        loop {
            let n = injector.read(&mut buf)?;
            if n == 0 {
                break;
            }
            encoder.write_all(&buf[..n])?;
        }
        encoder.finish()
    })();

    GLOBAL_BUFFER_POOL.put(buf);
    result
}

/// Writer that hands compressed chunks to the response body channel. A
/// dropped receiver surfaces as a broken pipe, which tears down the
/// pipeline.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Rewrite an HTML response body: insert the configured script before the
/// first `</body>`, transparently handling the declared content encoding.
/// Mutates `headers` to match the returned body. Oversized bodies and
/// unknown encodings are forwarded unchanged.
pub async fn rewrite_html_body<S>(headers: &mut HeaderMap, mut body: S, script: Arc<Vec<u8>>) -> Body
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
{
    let declared = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let codec = match Codec::from_content_encoding(declared) {
        Some(codec) => codec,
        None => {
            debug!(content_encoding = declared, "unsupported content encoding, skipping injection");
            return Body::from_stream(body);
        }
    };

    // Collect the encoded body up to the budget. The budget bounds gateway
    // memory; anything larger is forwarded untouched.
    let mut collected = BytesMut::new();
    while let Some(frame) = body.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                // Upstream failed mid-body: emit what was read, then the error.
                let prefix = collected.freeze();
                let stream = futures_util::stream::iter([Ok(prefix), Err(e)]);
                return Body::from_stream(stream);
            }
        };
        collected.extend_from_slice(&frame);

        if collected.len() > MAX_REWRITE_BODY_BYTES {
            warn!(
                limit_bytes = MAX_REWRITE_BODY_BYTES,
                "response body exceeds rewrite budget, forwarding without injection"
            );
            metrics::record_rewrite("oversize");
            let prefix = collected.freeze();
            let stream = futures_util::stream::iter([Ok(prefix)]).chain(body);
            return Body::from_stream(stream);
        }
    }

    let input = collected.freeze();

    // The body is now re-streamed; the stale framing headers must go. The
    // codec is preserved across the round trip.
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    headers.remove(TRANSFER_ENCODING);
    if let Some(name) = codec.content_encoding() {
        headers.insert(CONTENT_ENCODING, name.parse().expect("static header value"));
    }

    metrics::record_rewrite("injected");

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);
    tokio::task::spawn_blocking(move || {
        let mut writer = ChannelWriter { tx: tx.clone() };
        if let Err(e) = rewrite_sync(codec, &input, script, &mut writer) {
            if e.kind() != io::ErrorKind::BrokenPipe {
                warn!(error = %e, "html rewrite pipeline failed");
                let _ = tx.blocking_send(Err(e));
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}
