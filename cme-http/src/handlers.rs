//! Smart-HTTP request handlers
//!
//! RPCs are proxied to `git <rpc> --stateless-rpc` running in the type's
//! repository; everything else is served from its git directory the way the
//! dumb protocol expects.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use flate2::write::GzDecoder;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, DATE, EXPIRES, LAST_MODIFIED,
    PRAGMA,
};
use hyper::{Request, Response, StatusCode, Version};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;

use cme_core::{ChangeRecord, Engine, RepoLock};

use crate::HttpError;
use crate::pktline::{packet_flush, packet_write};
use crate::routes::{Service, Target};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const ONE_YEAR_SECS: i64 = 31_536_000;

/// Read size for the backend's stdout.
const RPC_CHUNK: usize = 64 * 1024;
/// Compressed input is inflated this many bytes at a time, so one step can
/// never produce more than about half a megabyte before the cap is checked.
const INFLATE_STEP: usize = 512;

pub type HttpBody = UnsyncBoxBody<Bytes, std::io::Error>;
pub type HttpResponse = Response<HttpBody>;

/// A complete in-memory body.
pub fn full(data: impl Into<Bytes>) -> HttpBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

// ==================== Responses ====================

pub fn text(status: StatusCode, body: &'static str) -> Result<HttpResponse, HttpError> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(Bytes::from_static(body.as_bytes())))?)
}

pub fn not_found() -> Result<HttpResponse, HttpError> {
    tracing::debug!("not found");
    text(StatusCode::NOT_FOUND, "Not Found")
}

pub fn forbidden() -> Result<HttpResponse, HttpError> {
    text(StatusCode::FORBIDDEN, "Forbidden")
}

pub fn payload_too_large() -> Result<HttpResponse, HttpError> {
    text(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large")
}

/// 405 for HTTP/1.1 clients, 400 for anything older.
pub fn method_not_allowed(version: Version) -> Result<HttpResponse, HttpError> {
    if version == Version::HTTP_11 {
        text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
    } else {
        text(StatusCode::BAD_REQUEST, "Bad Request")
    }
}

fn http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE).to_string()
}

fn no_cache(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header(EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT")
        .header(PRAGMA, "no-cache")
        .header(CACHE_CONTROL, "no-cache, max-age=0, must-revalidate")
}

fn cache_forever(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    let now = Utc::now();
    builder
        .header(DATE, http_date(now))
        .header(EXPIRES, http_date(now + Duration::seconds(ONE_YEAR_SECS)))
        .header(CACHE_CONTROL, "public, max-age=31536000")
}

// ==================== Access ====================

/// `service=git-upload-pack` query parameter, without the `git-` prefix.
pub fn service_param(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("service="))
        .and_then(|s| s.strip_prefix("git-"))
}

/// Whether `rpc` may be served. RPC posts must also carry the matching
/// request content type.
pub fn has_access(engine: &Engine, rpc: &str, content_type: Option<&str>) -> bool {
    if let Some(ct) = content_type {
        if ct != format!("application/x-git-{}-request", rpc) {
            return false;
        }
    }
    match rpc {
        "upload-pack" => engine.config().upload_pack,
        "receive-pack" => engine.config().receive_pack,
        _ => false,
    }
}

// ==================== Handlers ====================

/// `GET .../info/refs`: smart ref advertisement, or the dumb `info/refs`
/// file when the service is missing or disabled.
pub async fn info_refs(
    engine: &Engine,
    target: &Target,
    dir: &Path,
    query: Option<&str>,
    file: &str,
) -> Result<HttpResponse, HttpError> {
    let repos = engine.repos();
    let service = service_param(query).unwrap_or_default();
    tracing::debug!("info/refs for {} service {:?}", target.object_type, service);

    let lock = repos.lock(target.object_type).await;
    if !has_access(engine, service, None) {
        repos.git(&lock, &["update-server-info"]).await?;
        drop(lock);
        let builder = no_cache(Response::builder());
        return send_file(builder, "text/plain; charset=utf-8", dir, file).await;
    }

    let refs = repos
        .runner()
        .run(dir, &[service, "--stateless-rpc", "--advertise-refs", "."])
        .await?;
    drop(lock);

    let mut body = packet_write(format!("# service=git-{}\n", service).as_bytes())?;
    body.extend_from_slice(packet_flush());
    body.extend_from_slice(refs.as_bytes());

    Ok(no_cache(Response::builder())
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            format!("application/x-git-{}-advertisement", service),
        )
        .body(full(body))?)
}

/// `POST .../git-upload-pack` and `POST .../git-receive-pack`.
///
/// The request body streams into the backend's stdin and its stdout streams
/// back as the response. A driver task owns the child and the type's lock
/// for the whole exchange; the response only ends once the driver has
/// reaped the child, run the post-receive work and reset the repository,
/// and ends in an error if the input was rejected.
pub async fn service_rpc<B>(
    engine: &Arc<Engine>,
    target: &Target,
    dir: &Path,
    service: Service,
    req: Request<B>,
    max_body_size: usize,
) -> Result<HttpResponse, HttpError>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display + Send,
{
    let Some(rpc) = service.rpc() else {
        return not_found();
    };
    if !has_access(engine, rpc, Some(header(&req, CONTENT_TYPE).unwrap_or_default())) {
        return forbidden();
    }
    let declared = header(&req, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > max_body_size as u64) {
        tracing::warn!(
            "Rejecting {} body of {:?} bytes (limit {})",
            rpc,
            declared,
            max_body_size
        );
        return payload_too_large();
    }
    let gzip = encoding(&req).is_some_and(|enc| enc.eq_ignore_ascii_case("gzip"));

    let lock = engine.repos().lock(target.object_type).await;
    let mut child = engine
        .repos()
        .runner()
        .spawn(dir, &[rpc, "--stateless-rpc", "."])?;
    let (Some(stdin), Some(stdout), Some(stderr)) =
        (child.stdin.take(), child.stdout.take(), child.stderr.take())
    else {
        return Err(HttpError::Internal(format!("{} started without pipes", rpc)));
    };

    let exchange = Exchange {
        engine: Arc::clone(engine),
        target: target.clone(),
        service,
        rpc,
        lock,
    };
    let input = Input {
        body: req.into_body(),
        gzip,
        limit: max_body_size,
    };
    let driver = tokio::spawn(exchange.drive(child, stdin, stderr, input));

    Ok(no_cache(Response::builder())
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, format!("application/x-git-{}-result", rpc))
        .body(rpc_output(stdout, driver))?)
}

/// Everything the driver task owns besides the child's pipes.
struct Exchange {
    engine: Arc<Engine>,
    target: Target,
    service: Service,
    rpc: &'static str,
    lock: RepoLock,
}

struct Input<B> {
    body: B,
    gzip: bool,
    limit: usize,
}

impl Exchange {
    async fn drive<B>(
        self,
        mut child: Child,
        stdin: ChildStdin,
        mut stderr: ChildStderr,
        input: Input<B>,
    ) -> std::io::Result<()>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let rpc = self.rpc;
        let feed = async {
            let fed = feed_body(input, stdin, rpc).await;
            if fed.is_err() {
                // The backend must not act on a truncated request.
                let _ = child.start_kill();
            }
            fed
        };
        let drain = async {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        };
        let (fed, err) = tokio::join!(feed, drain);

        let status = child.wait().await;
        let Exchange {
            engine,
            target,
            service,
            lock,
            ..
        } = self;
        drop(lock);

        match &status {
            Ok(status) if !status.success() => tracing::warn!(
                "{} exited with {}: {}",
                rpc,
                status,
                String::from_utf8_lossy(&err.unwrap_or_default()).trim()
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to reap {}: {}", rpc, e),
        }

        if fed.is_ok() && service == Service::ReceivePack {
            after_receive_pack(&engine, &target).await;
        }
        if let Err(e) = engine.reset(target.object_type).await {
            tracing::warn!("Failed to reset {} after {}: {}", target.object_type, rpc, e);
        }

        fed.map_err(|e| {
            tracing::warn!("{} request rejected: {}", rpc, e);
            std::io::Error::other(e.to_string())
        })
    }
}

/// Copy the request body into the backend, inflating it first when it was
/// sent gzipped. Both the received and the inflated byte counts are capped.
/// A backend that stops reading early is not an error of the request.
async fn feed_body<B>(input: Input<B>, mut stdin: ChildStdin, rpc: &str) -> Result<(), HttpError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let Input {
        mut body,
        gzip,
        limit,
    } = input;
    let mut inflater = gzip.then(|| Inflater::new(limit));
    let mut received = 0usize;
    let mut open = true;

    while let Some(frame) = body.frame().await {
        let frame =
            frame.map_err(|e| HttpError::InvalidRequest(format!("failed to read body: {}", e)))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        received += data.len();
        if received > limit {
            return Err(HttpError::PayloadTooLarge(limit));
        }
        let chunk = match inflater.as_mut() {
            Some(inflater) => inflater.push(&data)?,
            None => data.to_vec(),
        };
        if open {
            open = write_input(&mut stdin, &chunk, rpc).await;
        }
    }

    if let Some(inflater) = inflater {
        let tail = inflater.finish()?;
        if open {
            write_input(&mut stdin, &tail, rpc).await;
        }
    }
    Ok(())
}

/// Returns whether the backend is still reading.
async fn write_input(stdin: &mut ChildStdin, data: &[u8], rpc: &str) -> bool {
    if data.is_empty() {
        return true;
    }
    match stdin.write_all(data).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("{} closed its input early: {}", rpc, e);
            false
        }
    }
}

/// Incremental gzip decoder with a cap on the inflated size.
struct Inflater {
    decoder: GzDecoder<Vec<u8>>,
    limit: usize,
    total: usize,
}

impl Inflater {
    fn new(limit: usize) -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
            limit,
            total: 0,
        }
    }

    fn push(&mut self, input: &[u8]) -> Result<Vec<u8>, HttpError> {
        let mut out = Vec::new();
        for step in input.chunks(INFLATE_STEP) {
            self.decoder.write_all(step).map_err(bad_gzip)?;
            self.take(&mut out)?;
        }
        Ok(out)
    }

    fn finish(mut self) -> Result<Vec<u8>, HttpError> {
        self.decoder.try_finish().map_err(bad_gzip)?;
        let mut out = Vec::new();
        self.take(&mut out)?;
        Ok(out)
    }

    fn take(&mut self, out: &mut Vec<u8>) -> Result<(), HttpError> {
        let produced = self.decoder.get_mut();
        self.total += produced.len();
        if self.total > self.limit {
            return Err(HttpError::PayloadTooLarge(self.limit));
        }
        out.append(produced);
        Ok(())
    }
}

fn bad_gzip(e: std::io::Error) -> HttpError {
    HttpError::InvalidRequest(format!("bad gzip body: {}", e))
}

/// The backend's stdout as a streaming body. At end of output the driver is
/// awaited, and its failure becomes the body's last frame.
fn rpc_output(stdout: ChildStdout, driver: JoinHandle<std::io::Result<()>>) -> HttpBody {
    let chunks = futures::stream::unfold(Some((stdout, driver)), |state| async move {
        let (mut stdout, driver) = state?;
        let mut buf = vec![0u8; RPC_CHUNK];
        match stdout.read(&mut buf).await {
            Ok(0) => {
                let outcome = driver.await.unwrap_or_else(|e| Err(std::io::Error::other(e)));
                outcome.err().map(|e| (Err(e), None))
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Frame::data(Bytes::from(buf))), Some((stdout, driver))))
            }
            Err(e) => Some((Err(e), None)),
        }
    });
    StreamBody::new(chunks).boxed_unsync()
}

async fn after_receive_pack(engine: &Engine, target: &Target) {
    let mut record = ChangeRecord::for_type(target.object_type);
    record.src_node = target.src_node.clone();
    record.transaction_id = target.transaction.clone();

    if let Some(id) = &target.transaction {
        tracing::debug!("Finalizing transaction {}", id);
        if let Err(e) = engine.finalize_transaction(&record).await {
            tracing::warn!("Failed to finalize transaction {}: {}", id, e);
        }
    }
    engine.notify_pack_received(&record).await;
}

/// Dumb-protocol files under the repository's git directory.
pub async fn static_file(service: Service, dir: &Path, file: &str) -> Result<HttpResponse, HttpError> {
    let (builder, content_type) = match service {
        Service::InfoPacks => (cache_forever(Response::builder()), "text/plain; charset=utf-8"),
        Service::LooseObject => (
            cache_forever(Response::builder()),
            "application/x-git-loose-object",
        ),
        Service::PackFile => (
            cache_forever(Response::builder()),
            "application/x-git-packed-objects",
        ),
        Service::IdxFile => (
            cache_forever(Response::builder()),
            "application/x-git-packed-objects-toc",
        ),
        _ => (no_cache(Response::builder()), "text/plain"),
    };
    send_file(builder, content_type, dir, file).await
}

async fn send_file(
    builder: hyper::http::response::Builder,
    content_type: &str,
    dir: &Path,
    file: &str,
) -> Result<HttpResponse, HttpError> {
    let path = dir.join(".git").join(file.trim_start_matches('/'));
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            tracing::warn!("No such file {:?}", path);
            return not_found();
        }
    };
    let data = tokio::fs::read(&path).await?;

    let mut builder = builder
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, content_type);
    if let Ok(modified) = meta.modified() {
        builder = builder.header(LAST_MODIFIED, http_date(DateTime::<Utc>::from(modified)));
    }
    Ok(builder.body(full(data))?)
}

/// Header value as a string, if present and printable.
pub fn header<'a, B>(req: &'a Request<B>, name: hyper::header::HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

pub(crate) fn encoding<B>(req: &Request<B>) -> Option<&str> {
    header(req, CONTENT_ENCODING)
}
