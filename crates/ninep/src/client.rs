//! Client side of the 9P2000 protocol: connects to a server, negotiates a
//! version, and multiplexes concurrent RPCs with tags over one connection.
//!
//! Unlike the reference implementation's thread-per-call design with an
//! elected "muxer" thread, a single spawned task owns the read half of the
//! connection and fans responses out to waiting callers by tag; callers
//! never contend over who gets to read the socket.

use std::{
    collections::HashMap,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    task::{Context, Poll},
};

use log::{error, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UnixStream},
    sync::{Mutex, oneshot},
};

use crate::{
    error::{self, string},
    fcall::*,
    transport::{FramedReader, FramedWriter},
    utils::{self, Result},
};

struct TagPool {
    next: u16,
    free: Vec<u16>,
}

impl TagPool {
    fn new() -> Self {
        // NOTAG is reserved for TVersion; never hand it out.
        TagPool { next: 0, free: Vec::new() }
    }

    fn get(&mut self) -> u16 {
        if let Some(tag) = self.free.pop() {
            return tag;
        }
        loop {
            let tag = self.next;
            self.next = self.next.wrapping_add(1);
            if tag != NOTAG {
                return tag;
            }
        }
    }

    fn put(&mut self, tag: u16) {
        self.free.push(tag);
    }
}

struct FidPool {
    next: u32,
    free: Vec<u32>,
}

impl FidPool {
    fn new() -> Self {
        FidPool { next: 0, free: Vec::new() }
    }

    fn get(&mut self) -> u32 {
        if let Some(fid) = self.free.pop() {
            return fid;
        }
        loop {
            let fid = self.next;
            self.next = self.next.wrapping_add(1);
            if fid != NOFID {
                return fid;
            }
        }
    }

    fn put(&mut self, fid: u32) {
        self.free.push(fid);
    }
}

struct Mux<W> {
    writer: Mutex<FramedWriter<W>>,
    tags: Mutex<TagPool>,
    fids: Mutex<FidPool>,
    waiting: Mutex<HashMap<u16, oneshot::Sender<FCall>>>,
    msize: AtomicU32,
}

impl<W: AsyncWrite + Unpin> Mux<W> {
    async fn rpc(&self, body: FCall) -> Result<FCall> {
        let tag = self.tags.lock().await.get();
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(tag, tx);

        let send_result = {
            let mut w = self.writer.lock().await;
            w.send(&Msg { tag, body }).await
        };
        if let Err(e) = send_result {
            self.waiting.lock().await.remove(&tag);
            self.tags.lock().await.put(tag);
            return Err(e.into());
        }

        let resp = rx.await.map_err(|_| error::Error::Proto(string::ECONNRESET_STR))?;
        self.tags.lock().await.put(tag);

        match resp {
            FCall::RError { ename } => Err(error::Error::Proto(leak(ename))),
            other => Ok(other),
        }
    }
}

/// `Error::Proto` wants a `'static` str; RPC error text is only known at
/// runtime, so it is rendered through `Display`/`Debug` instead of reused
/// verbatim. See [`Error::errstr`](crate::error::Error::errstr) for the
/// server-side mirror of this, which never needs to leak because it owns
/// the literal already.
fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

/// A handle to one 9P connection, shared by every [`CFid`] opened on it.
pub struct Client<W> {
    mux: Arc<Mux<W>>,
}

impl<W> Clone for Client<W> {
    fn clone(&self) -> Self {
        Client { mux: self.mux.clone() }
    }
}

/// A remote fid opened through a [`Client`].
///
/// Carries a sequential read/write cursor (`offset`) alongside the
/// positional `read_at`/`write_at` primitives, mirroring how a Unix file
/// descriptor offers both `pread`/`pwrite` and a stateful cursor.
pub struct CFid<W> {
    client: Client<W>,
    fid: u32,
    iounit: u32,
    offset: Mutex<u64>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> Client<W> {
    /// Wrap an already-connected transport, run the `TVersion` handshake,
    /// and spawn the reader task that demultiplexes responses by tag.
    pub async fn new<R>(reader: R, writer: W, msize: u32) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mux = Arc::new(Mux {
            writer: Mutex::new(FramedWriter::new(writer)),
            tags: Mutex::new(TagPool::new()),
            fids: Mutex::new(FidPool::new()),
            waiting: Mutex::new(HashMap::new()),
            msize: AtomicU32::new(msize),
        });

        spawn_reader(mux.clone(), FramedReader::new(reader));

        let client = Client { mux };
        let negotiated = client.version(msize).await?;
        Ok(negotiated)
    }

    async fn version(self, msize: u32) -> Result<Self> {
        let (tx, rx) = oneshot::channel();
        self.mux.waiting.lock().await.insert(NOTAG, tx);
        {
            let mut w = self.mux.writer.lock().await;
            w.send(&Msg {
                tag: NOTAG,
                body: FCall::TVersion { msize, version: P92000.to_owned() },
            })
            .await?;
        }
        let resp = rx.await.map_err(|_| error::Error::Proto(string::ECONNRESET_STR))?;
        match resp {
            FCall::RVersion { msize: negotiated, version } if version == P92000 => {
                self.mux.msize.store(negotiated, Ordering::SeqCst);
                Ok(self)
            }
            FCall::RVersion { .. } => Err(error::Error::Proto("unsupported 9P version")),
            _ => Err(error::Error::Proto("unexpected response to TVersion")),
        }
    }

    /// Negotiated maximum message size.
    pub fn msize(&self) -> u32 {
        self.mux.msize.load(Ordering::SeqCst)
    }

    /// Attach to the filesystem root, returning the fid for `/`.
    pub async fn attach(&self, uname: &str, aname: &str) -> Result<CFid<W>> {
        let fid = self.mux.fids.lock().await.get();
        let resp = self
            .mux
            .rpc(FCall::TAttach {
                fid,
                afid: NOFID,
                uname: uname.to_owned(),
                aname: aname.to_owned(),
            })
            .await;
        match resp {
            Ok(FCall::RAttach { .. }) => {
                Ok(CFid { client: self.clone(), fid, iounit: 0, offset: Mutex::new(0) })
            }
            Ok(_) => Err(error::Error::Proto("unexpected response to TAttach")),
            Err(e) => {
                self.mux.fids.lock().await.put(fid);
                Err(e)
            }
        }
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> CFid<W> {
    /// The numeric fid on the wire.
    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Walk from this fid through `wnames`, yielding a new fid. Walks longer
    /// than [`MAXWELEM`] elements are split into chained `TWalk`s, each fed
    /// from the fid the previous chunk landed on.
    pub async fn walk(&self, wnames: &[&str]) -> Result<CFid<W>> {
        if wnames.len() <= MAXWELEM {
            return self.walk_once(wnames).await;
        }
        let mut chunks = wnames.chunks(MAXWELEM);
        let mut cur = self.walk_once(chunks.next().unwrap()).await?;
        for chunk in chunks {
            let next = cur.walk_once(chunk).await;
            let _ = cur.clunk().await;
            cur = next?;
        }
        Ok(cur)
    }

    async fn walk_once(&self, wnames: &[&str]) -> Result<CFid<W>> {
        let newfid = self.client.mux.fids.lock().await.get();
        let resp = self
            .client
            .mux
            .rpc(FCall::TWalk {
                fid: self.fid,
                newfid,
                wnames: wnames.iter().map(|s| s.to_string()).collect(),
            })
            .await;
        match resp {
            Ok(FCall::RWalk { wqids }) if wqids.len() == wnames.len() => Ok(CFid {
                client: self.client.clone(),
                fid: newfid,
                iounit: 0,
                offset: Mutex::new(0),
            }),
            Ok(FCall::RWalk { .. }) => {
                self.client.mux.fids.lock().await.put(newfid);
                Err(error::Error::Proto(string::ENOENT_FILE2))
            }
            Ok(_) => {
                self.client.mux.fids.lock().await.put(newfid);
                Err(error::Error::Proto("unexpected response to TWalk"))
            }
            Err(e) => {
                self.client.mux.fids.lock().await.put(newfid);
                Err(e)
            }
        }
    }

    /// Open this fid for I/O.
    pub async fn open(&mut self, mode: u8) -> Result<QId> {
        match self.client.mux.rpc(FCall::TOpen { fid: self.fid, mode }).await? {
            FCall::ROpen { qid, iounit } => {
                self.iounit = if iounit == 0 { self.client.msize() - IOHDRSZ } else { iounit };
                Ok(qid)
            }
            _ => Err(error::Error::Proto("unexpected response to TOpen")),
        }
    }

    /// Create `name` in the directory this fid refers to, and open it.
    pub async fn create(&mut self, name: &str, perm: u32, mode: u8) -> Result<QId> {
        match self
            .client
            .mux
            .rpc(FCall::TCreate { fid: self.fid, name: name.to_owned(), perm, mode })
            .await?
        {
            FCall::RCreate { qid, iounit } => {
                self.iounit = if iounit == 0 { self.client.msize() - IOHDRSZ } else { iounit };
                Ok(qid)
            }
            _ => Err(error::Error::Proto("unexpected response to TCreate")),
        }
    }

    fn cap(&self) -> u32 {
        if self.iounit == 0 { self.client.msize() - IOHDRSZ } else { self.iounit }
    }

    /// Issue a single `TRead`, capped to the negotiated `iounit`.
    async fn read_once(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self
            .client
            .mux
            .rpc(FCall::TRead { fid: self.fid, offset, count: count.min(self.cap()) })
            .await?
        {
            FCall::RRead { data } => Ok(data.0),
            _ => Err(error::Error::Proto("unexpected response to TRead")),
        }
    }

    /// Issue a single `TWrite`, capped to the negotiated `iounit`.
    async fn write_once(&self, offset: u64, buf: &[u8]) -> Result<u32> {
        let cap = self.cap() as usize;
        let chunk = &buf[..buf.len().min(cap)];
        match self
            .client
            .mux
            .rpc(FCall::TWrite { fid: self.fid, offset, data: Data(chunk.to_vec()) })
            .await?
        {
            FCall::RWrite { count } => Ok(count),
            _ => Err(error::Error::Proto("unexpected response to TWrite")),
        }
    }

    /// Read up to `count` bytes at `offset`, issuing as many `TRead`s as the
    /// negotiated `iounit` requires and stopping early on a short read (EOF).
    pub async fn read_at(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(count as usize);
        let mut pos = offset;
        let mut remaining = count;
        while remaining > 0 {
            let want = remaining.min(self.cap());
            let chunk = self.read_once(pos, want).await?;
            if chunk.is_empty() {
                break;
            }
            let got = chunk.len() as u32;
            out.extend_from_slice(&chunk);
            pos += got as u64;
            remaining -= got.min(remaining);
            if got < want {
                break;
            }
        }
        Ok(out)
    }

    /// Write the whole of `buf` at `offset`, issuing as many `TWrite`s as
    /// the negotiated `iounit` requires. Returns the total bytes accepted,
    /// which is shorter than `buf.len()` only on a short write.
    pub async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<u32> {
        let mut pos = offset;
        let mut total = 0u32;
        let mut rest = buf;
        while !rest.is_empty() {
            let n = self.write_once(pos, rest).await?;
            if n == 0 {
                break;
            }
            total += n;
            pos += n as u64;
            rest = &rest[(n as usize).min(rest.len())..];
        }
        Ok(total)
    }

    /// Read up to `count` bytes from this fid's current cursor, advancing it
    /// by the number of bytes actually read.
    pub async fn read(&self, count: u32) -> Result<Vec<u8>> {
        let mut offset = self.offset.lock().await;
        let data = self.read_at(*offset, count).await?;
        *offset += data.len() as u64;
        Ok(data)
    }

    /// Write `buf` at this fid's current cursor, advancing it by the number
    /// of bytes actually written.
    pub async fn write(&self, buf: &[u8]) -> Result<u32> {
        let mut offset = self.offset.lock().await;
        let n = self.write_at(*offset, buf).await?;
        *offset += n as u64;
        Ok(n)
    }

    /// Reposition this fid's sequential read/write cursor.
    pub async fn seek(&self, offset: u64) {
        *self.offset.lock().await = offset;
    }

    /// This fid's current sequential read/write cursor.
    pub async fn tell(&self) -> u64 {
        *self.offset.lock().await
    }

    /// Fetch this fid's stat.
    pub async fn stat(&self) -> Result<Stat> {
        match self.client.mux.rpc(FCall::TStat { fid: self.fid }).await? {
            FCall::RStat { stat } => Ok(stat),
            _ => Err(error::Error::Proto("unexpected response to TStat")),
        }
    }

    /// Apply a stat change to this fid.
    pub async fn wstat(&self, stat: Stat) -> Result<()> {
        match self.client.mux.rpc(FCall::TWStat { fid: self.fid, stat }).await? {
            FCall::RWStat => Ok(()),
            _ => Err(error::Error::Proto("unexpected response to TWStat")),
        }
    }

    /// Remove the file this fid refers to. The fid is invalid afterward,
    /// whether or not the remove succeeded, matching TRemove semantics.
    pub async fn remove(self) -> Result<()> {
        let resp = self.client.mux.rpc(FCall::TRemove { fid: self.fid }).await;
        self.client.mux.fids.lock().await.put(self.fid);
        match resp? {
            FCall::RRemove => Ok(()),
            _ => Err(error::Error::Proto("unexpected response to TRemove")),
        }
    }

    /// Release this fid, returning its number to the client's free pool.
    pub async fn clunk(self) -> Result<()> {
        let resp = self.client.mux.rpc(FCall::TClunk { fid: self.fid }).await;
        self.client.mux.fids.lock().await.put(self.fid);
        match resp? {
            FCall::RClunk => Ok(()),
            _ => Err(error::Error::Proto("unexpected response to TClunk")),
        }
    }
}

fn spawn_reader<W>(mux: Arc<Mux<W>>, mut reader: FramedReader<impl AsyncRead + Unpin + Send + 'static>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => {
                    trace!("\t<- tag={} {:?}", msg.tag, msg.body);
                    if let Some(tx) = mux.waiting.lock().await.remove(&msg.tag) {
                        let _ = tx.send(msg.body);
                    }
                }
                Ok(None) => {
                    trace!("connection closed by peer");
                    break;
                }
                Err(e) => {
                    error!("framing error on client connection: {:?}", e);
                    break;
                }
            }
        }
        // Any caller still waiting on a response will never get one; drop
        // every sender so their `rx.await` resolves to an error instead of
        // hanging forever.
        mux.waiting.lock().await.clear();
    });
}

/// Either half of a TCP or Unix-domain connection, so [`nsmount`] can return
/// one concrete type regardless of which transport the address selects.
pub enum AnyRead {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Unix(tokio::net::unix::OwnedReadHalf),
}

/// See [`AnyRead`].
pub enum AnyWrite {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Unix(tokio::net::unix::OwnedWriteHalf),
}

impl AsyncRead for AnyRead {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyRead::Tcp(r) => Pin::new(r).poll_read(cx, buf),
            AnyRead::Unix(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AnyWrite {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AnyWrite::Tcp(w) => Pin::new(w).poll_write(cx, buf),
            AnyWrite::Unix(w) => Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyWrite::Tcp(w) => Pin::new(w).poll_flush(cx),
            AnyWrite::Unix(w) => Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AnyWrite::Tcp(w) => Pin::new(w).poll_shutdown(cx),
            AnyWrite::Unix(w) => Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Resolve the canonical 9P namespace directory: `$NAMESPACE` if set, else
/// `/tmp/ns.$USER.$DISPLAY` (a trailing `.0` on `$DISPLAY` is stripped),
/// created with `0700` permissions if it doesn't already exist.
fn namespace_dir() -> Result<PathBuf> {
    if let Ok(ns) = std::env::var("NAMESPACE") {
        if !ns.is_empty() {
            return Ok(PathBuf::from(ns));
        }
    }
    let user = std::env::var("USER").map_err(|_| error::Error::Proto("$USER is unset"))?;
    let display = std::env::var("DISPLAY").map_err(|_| error::Error::Proto("$DISPLAY is unset"))?;
    let display = display.strip_suffix(".0").unwrap_or(&display);
    let dir = PathBuf::from(format!("/tmp/ns.{}.{}", user, display));
    std::fs::create_dir_all(&dir)?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    Ok(dir)
}

/// Connect to a 9P address of the form `proto!host[!port]` and attach to
/// the filesystem root as `uname`/`aname`. An empty `uname` defaults to
/// `$USER`. For the `unix` transport, a bare socket name (no leading `/`)
/// is resolved against the namespace directory (see [`namespace_dir`])
/// rather than treated as a path relative to the current directory.
pub async fn nsmount(addr: &str, uname: &str, aname: &str) -> Result<CFid<AnyWrite>> {
    let (proto, host, port) = utils::parse_proto(addr)
        .ok_or_else(|| crate::io_err!(InvalidInput, "invalid address: expected proto!host[!port]"))?;

    let uname = if uname.is_empty() {
        std::env::var("USER").unwrap_or_else(|_| "none".to_owned())
    } else {
        uname.to_owned()
    };

    match proto {
        "tcp" => {
            let port = port.ok_or_else(|| crate::io_err!(InvalidInput, "tcp requires a port"))?;
            let stream = TcpStream::connect(format!("{}:{}", host, port)).await?;
            let (readhalf, writehalf) = stream.into_split();
            let client =
                Client::new(AnyRead::Tcp(readhalf), AnyWrite::Tcp(writehalf), DEFAULT_MSIZE).await?;
            client.attach(&uname, aname).await
        }
        "unix" => {
            let path = if host.starts_with('/') {
                PathBuf::from(host)
            } else {
                namespace_dir()?.join(host)
            };
            let stream = UnixStream::connect(&path).await?;
            let (readhalf, writehalf) = stream.into_split();
            let client =
                Client::new(AnyRead::Unix(readhalf), AnyWrite::Unix(writehalf), DEFAULT_MSIZE).await?;
            client.attach(&uname, aname).await
        }
        other => Err(error::Error::Proto(leak(format!("unsupported transport: {}", other)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_pool_recycles_released_tags_before_minting_new_ones() {
        let mut pool = TagPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_ne!(a, b);
        pool.put(a);
        assert_eq!(pool.get(), a);
        // `b` is still checked out; the pool must not hand it out again.
        assert_ne!(pool.get(), b);
    }

    #[test]
    fn tag_pool_never_hands_out_notag() {
        let mut pool = TagPool { next: NOTAG, free: Vec::new() };
        assert_ne!(pool.get(), NOTAG);
    }

    #[test]
    fn fid_pool_recycles_released_fids_before_minting_new_ones() {
        let mut pool = FidPool::new();
        let a = pool.get();
        let b = pool.get();
        assert_ne!(a, b);
        pool.put(b);
        assert_eq!(pool.get(), b);
    }

    #[test]
    fn fid_pool_never_hands_out_nofid() {
        let mut pool = FidPool { next: NOFID, free: Vec::new() };
        assert_ne!(pool.get(), NOFID);
    }
}
