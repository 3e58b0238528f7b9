//! Asynchronous server side of the 9P2000 protocol: request validation,
//! dispatch to a user-supplied [`Filesystem`], and connection teardown.
//!
//! # Protocol
//! 9P2000

use {
    crate::{
        error::{self, string},
        fcall::*,
        io_err,
        transport::{FramedReader, FramedWriter},
        utils::{self, Result},
    },
    async_trait::async_trait,
    log::{error, info, trace},
    std::{
        collections::HashMap,
        path::{Path, PathBuf},
        sync::Arc,
        sync::atomic::{AtomicU32, Ordering},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
        sync::{Mutex, Notify, RwLock, oneshot},
    },
};

/// Represents one client fid, holding the server-tracked open state plus
/// whatever the [`Filesystem`] implementor wants to associate with it.
#[derive(Debug)]
pub struct FId<T> {
    fid: u32,
    pub qid: RwLock<QId>,
    /// `None` means not yet open; `Some(mode)` is the mode passed to `TOpen`/`TCreate`.
    pub omode: RwLock<Option<u8>>,
    pub iounit: RwLock<u32>,
    pub aux: T,
}

impl<T: Default> FId<T> {
    fn new(fid: u32) -> Self {
        FId {
            fid,
            qid: RwLock::new(QId::default()),
            omode: RwLock::new(None),
            iounit: RwLock::new(0),
            aux: T::default(),
        }
    }
}

impl<T> FId<T> {
    /// The raw client-assigned fid.
    pub fn fid(&self) -> u32 {
        self.fid
    }
}

/// The main trait for implementing a 9P2000 filesystem server.
///
/// Every method but [`rattach`](Self::rattach) has a default. Most default to
/// "function not implemented"; `rclunk` defaults to success (an absent clunk
/// handler is fine — the dispatcher still destroys the fid), matching the
/// long-standing behavior of 9P servers that don't need per-fid cleanup.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// User defined fid type to be associated with a client's fid.
    type FId: Send + Sync + Default;

    /// Attach to the filesystem root. The first operation a client performs;
    /// mandatory, unlike every other handler.
    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        afid: Option<&FId<Self::FId>>,
        uname: &str,
        aname: &str,
    ) -> Result<FCall>;

    /// Authenticate a user. The auth path is reserved and never implemented
    /// by this crate; overriding it is only useful for servers that want to
    /// speak to clients expecting a real auth handshake.
    async fn rauth(&self, _afid: &FId<Self::FId>, _uname: &str, _aname: &str) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Walk the directory tree from `fid` to `newfid` via `wnames`.
    async fn rwalk(
        &self,
        _fid: &FId<Self::FId>,
        _newfid: &FId<Self::FId>,
        _wnames: &[String],
    ) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Open a fid for I/O.
    async fn ropen(&self, _fid: &FId<Self::FId>, _mode: u8) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Create a new file in the directory `fid` and open it.
    async fn rcreate(
        &self,
        _fid: &FId<Self::FId>,
        _name: &str,
        _perm: u32,
        _mode: u8,
    ) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Read from an open fid.
    async fn rread(&self, _fid: &FId<Self::FId>, _offset: u64, _count: u32) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Write to an open fid.
    async fn rwrite(&self, _fid: &FId<Self::FId>, _offset: u64, _data: &Data) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Release a fid. The dispatcher destroys the fid regardless of the
    /// return value; the default does no extra work.
    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }

    /// Remove the file referenced by `fid`; the fid is clunked either way.
    async fn rremove(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Fetch the stat of a fid.
    async fn rstat(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Apply a stat change to a fid; the dispatcher has already checked the
    /// wire-level "don't touch" sentinels before calling this.
    async fn rwstat(&self, _fid: &FId<Self::FId>, _stat: &Stat) -> Result<FCall> {
        Err(error::Error::Proto(string::ENOTIMPL))
    }

    /// Negotiate protocol version and message size. The default accepts
    /// exactly `"9P2000"` and reports `"unknown"` for anything else.
    async fn rversion(&self, msize: u32, ver: &str) -> Result<FCall> {
        Ok(FCall::RVersion {
            msize,
            version: match ver {
                P92000 => ver.to_owned(),
                "9P" => "9P".to_owned(),
                _ => VERSION_UNKNOWN.to_owned(),
            },
        })
    }

    /// Called once a fid has been fully destroyed (after `TClunk`/`TRemove`,
    /// or synthesized on hangup), to let the filesystem release any
    /// resources tied to `Self::FId`.
    async fn freefid(&self, _fid: &FId<Self::FId>) {}
}

/// A request still in flight, tracked so `TFlush` can interrupt it.
struct PendingReq {
    cancel: oneshot::Sender<()>,
}

struct Conn9<Fs: Filesystem, W> {
    fs: Fs,
    fidmap: RwLock<HashMap<u32, Arc<FId<Fs::FId>>>>,
    tagmap: RwLock<HashMap<u16, PendingReq>>,
    writer: Mutex<FramedWriter<W>>,
    msize: AtomicU32,
    alive: std::sync::atomic::AtomicBool,
}

impl<Fs: Filesystem, W: AsyncWrite + Unpin> Conn9<Fs, W> {
    async fn send(&self, msg: &Msg) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        let mut w = self.writer.lock().await;
        if let Err(e) = w.send(msg).await {
            error!("failed to send response for tag {}: {:?}", msg.tag, e);
            self.alive.store(false, Ordering::SeqCst);
        } else {
            trace!("\t-> {:?}", msg);
        }
    }

    async fn create_fid(&self, fid: u32) -> std::result::Result<Arc<FId<Fs::FId>>, ()> {
        let mut fids = self.fidmap.write().await;
        if fids.contains_key(&fid) {
            return Err(());
        }
        let entry = Arc::new(FId::new(fid));
        fids.insert(fid, entry.clone());
        Ok(entry)
    }

    async fn get_fid(&self, fid: u32) -> Option<Arc<FId<Fs::FId>>> {
        self.fidmap.read().await.get(&fid).cloned()
    }

    async fn destroy_fid(&self, fid: u32) {
        let removed = self.fidmap.write().await.remove(&fid);
        if let Some(f) = removed {
            self.fs.freefid(&f).await;
        }
    }
}

/// Run the per-message-type validation table, invoke the matching handler,
/// and return the wire-ready response (always `Ok` — a handler failure is
/// folded into an `RError` by the caller).
async fn handle<Fs, W>(conn: &Conn9<Fs, W>, tag: u16, ifcall: FCall) -> FCall
where
    Fs: Filesystem,
    W: AsyncWrite + Unpin,
{
    use FCall::*;

    let result: Result<FCall> = async {
        match ifcall {
            TVersion { msize, ref version } => {
                let resp = conn.fs.rversion(msize.min(DEFAULT_MSIZE), version).await?;
                if let RVersion { msize, .. } = &resp {
                    let capped = (*msize).min(DEFAULT_MSIZE);
                    conn.msize.store(capped, Ordering::SeqCst);
                }
                Ok(resp)
            }
            TAttach { fid, afid, ref uname, ref aname } => {
                let f = conn
                    .create_fid(fid)
                    .await
                    .map_err(|_| error::Error::Proto(string::EBADF4))?;
                let aux_fid = if afid == NOFID {
                    None
                } else {
                    conn.get_fid(afid).await
                };
                match conn.fs.rattach(&f, aux_fid.as_deref(), uname, aname).await {
                    Ok(RAttach { qid }) => {
                        *f.qid.write().await = qid;
                        Ok(RAttach { qid })
                    }
                    Ok(other) => Ok(other),
                    Err(e) => {
                        conn.destroy_fid(fid).await;
                        Err(e)
                    }
                }
            }
            TAuth { ref uname, ref aname, .. } => {
                // No real auth fid exists to hand the handler; reserved path.
                let dummy = FId::new(NOFID);
                conn.fs.rauth(&dummy, uname, aname).await
            }
            TWalk { fid, newfid, ref wnames } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                if f.omode.read().await.is_some() {
                    return Err(error::Error::Proto(string::EOPENWALK));
                }
                if !wnames.is_empty() && !f.qid.read().await.typ.contains(QIdType::DIR) {
                    return Err(error::Error::Proto(string::ENOTDIR_STR));
                }
                let (new_f, created) = if newfid == fid {
                    (f.clone(), false)
                } else {
                    (
                        conn.create_fid(newfid)
                            .await
                            .map_err(|_| error::Error::Proto(string::EBADF4))?,
                        true,
                    )
                };
                let res = conn.fs.rwalk(&f, &new_f, wnames).await;
                match res {
                    Ok(RWalk { wqids }) => {
                        if wqids.len() < wnames.len() {
                            if created {
                                conn.destroy_fid(newfid).await;
                            }
                            if wqids.is_empty() && !wnames.is_empty() {
                                return Err(error::Error::Proto(string::ENOENT_FILE2));
                            }
                        } else if wqids.is_empty() {
                            *new_f.qid.write().await = *f.qid.read().await;
                        } else {
                            *new_f.qid.write().await = *wqids.last().unwrap();
                        }
                        Ok(RWalk { wqids })
                    }
                    Ok(other) => Ok(other),
                    Err(e) => {
                        if created {
                            conn.destroy_fid(newfid).await;
                        }
                        Err(e)
                    }
                }
            }
            TOpen { fid, mode } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                let is_dir = f.qid.read().await.typ.contains(QIdType::DIR);
                if is_dir && (mode | om::RCLOSE) != (om::READ | om::RCLOSE) {
                    return Err(error::Error::Proto(string::EISDIR_STR));
                }
                match conn.fs.ropen(&f, mode).await {
                    Ok(ROpen { qid, .. }) => {
                        let iounit = conn.msize.load(Ordering::SeqCst).saturating_sub(IOHDRSZ);
                        *f.omode.write().await = Some(mode);
                        *f.iounit.write().await = iounit;
                        *f.qid.write().await = qid;
                        Ok(ROpen { qid, iounit })
                    }
                    other => other,
                }
            }
            TCreate { fid, ref name, perm, mode } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                if f.omode.read().await.is_some() {
                    return Err(error::Error::Proto(string::EFIDOPEN));
                }
                if !f.qid.read().await.typ.contains(QIdType::DIR) {
                    return Err(error::Error::Proto(string::ENOTDIR_STR));
                }
                match conn.fs.rcreate(&f, name, perm, mode).await {
                    Ok(RCreate { qid, .. }) => {
                        let iounit = conn.msize.load(Ordering::SeqCst).saturating_sub(IOHDRSZ);
                        *f.omode.write().await = Some(mode);
                        *f.iounit.write().await = iounit;
                        *f.qid.write().await = qid;
                        Ok(RCreate { qid, iounit })
                    }
                    other => other,
                }
            }
            TRead { fid, offset, count } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                let not_readable = match *f.omode.read().await {
                    None => true,
                    Some(m) => m & 3 == om::WRITE,
                };
                if not_readable {
                    return Err(error::Error::Proto(string::ENOTOPEN_READ));
                }
                conn.fs.rread(&f, offset, count).await
            }
            TWrite { fid, offset, ref data } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                let writable = matches!(*f.omode.read().await, Some(m) if m & 3 == om::WRITE || m & 3 == om::RDWR);
                if !writable {
                    return Err(error::Error::Proto(string::ENOTOPEN_WRITE));
                }
                conn.fs.rwrite(&f, offset, data).await
            }
            TClunk { fid } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                let res = conn.fs.rclunk(&f).await;
                conn.destroy_fid(fid).await;
                res.or(Ok(FCall::RClunk))
            }
            TRemove { fid } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                let res = conn.fs.rremove(&f).await;
                conn.destroy_fid(fid).await;
                res
            }
            TStat { fid } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                conn.fs.rstat(&f).await
            }
            TWStat { fid, ref stat } => {
                let f = conn.get_fid(fid).await.ok_or(error::Error::Proto(string::EBADF2))?;
                if stat.typ != !0u16 {
                    return Err(error::Error::Proto("wstat of type"));
                }
                if stat.dev != !0u32 {
                    return Err(error::Error::Proto("wstat of dev"));
                }
                if stat.qid.typ != QIdType::from_bits_truncate(!0)
                    || stat.qid.version != !0u32
                    || stat.qid.path != !0u64
                {
                    return Err(error::Error::Proto("wstat of qid"));
                }
                if !stat.muid.is_empty() {
                    return Err(error::Error::Proto("wstat of muid"));
                }
                if stat.mode != !0u32 {
                    let wants_dir = stat.mode & dm::DIR != 0;
                    let is_dir = f.qid.read().await.typ.contains(QIdType::DIR);
                    if wants_dir != is_dir {
                        return Err(error::Error::Proto("wstat on DMDIR bit"));
                    }
                }
                conn.fs.rwstat(&f, stat).await
            }
            TFlush { .. } | RError { .. } | RVersion { .. } | RAuth { .. } | RAttach { .. }
            | RFlush | RWalk { .. } | ROpen { .. } | RCreate { .. } | RRead { .. }
            | RWrite { .. } | RClunk | RRemove | RStat { .. } | RWStat => {
                unreachable!("handle() is never called for R-messages or TFlush")
            }
        }
    }
    .await;

    result.unwrap_or_else(|e| FCall::RError { ename: e.errstr() })
}

/// Cancel the in-flight request tagged `oldtag`, if any. Returns whether a
/// request was actually found and cancelled.
async fn handle_flush<Fs, W>(conn: &Arc<Conn9<Fs, W>>, oldtag: u16) -> bool
where
    Fs: Filesystem + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let cancel = conn.tagmap.write().await.remove(&oldtag);
    if let Some(pending) = cancel {
        let _ = pending.cancel.send(());
        true
    } else {
        false
    }
}

/// Process one received message: validate/dispatch/respond, racing a
/// possible `TFlush` against the handler so a flushed request is answered
/// with `"interrupted"` instead of its real result.
async fn process<Fs, W>(conn: Arc<Conn9<Fs, W>>, tag: u16, ifcall: FCall)
where
    Fs: Filesystem + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    trace!("\t<- tag={} {:?}", tag, ifcall);

    if let FCall::TFlush { oldtag } = ifcall {
        let body = if handle_flush(&conn, oldtag).await {
            FCall::RFlush
        } else {
            FCall::RError { ename: string::ENOTAG.to_owned() }
        };
        conn.send(&Msg { tag, body }).await;
        return;
    }

    let (cancel_tx, cancel_rx) = oneshot::channel();
    {
        let mut tags = conn.tagmap.write().await;
        if tags.contains_key(&tag) {
            conn.send(&Msg {
                tag,
                body: FCall::RError { ename: string::ETAG.to_owned() },
            })
            .await;
            return;
        }
        tags.insert(tag, PendingReq { cancel: cancel_tx });
    }

    let body = tokio::select! {
        biased;
        _ = cancel_rx => FCall::RError { ename: string::EINTERRUPTED.to_owned() },
        body = handle(&conn, tag, ifcall) => body,
    };

    conn.tagmap.write().await.remove(&tag);

    conn.send(&Msg { tag, body }).await;
}

/// Drive one accepted connection until EOF or a fatal I/O error, then
/// synthesize TFlush/TClunk for every request/fid still outstanding so
/// handlers get a chance to clean up.
async fn dispatch<Fs, R, W>(filesystem: Fs, reader: R, writer: W) -> Result<()>
where
    Fs: 'static + Filesystem,
    R: 'static + AsyncRead + Send + Unpin,
    W: 'static + AsyncWrite + Send + Unpin,
{
    let conn = Arc::new(Conn9 {
        fs: filesystem,
        fidmap: RwLock::new(HashMap::new()),
        tagmap: RwLock::new(HashMap::new()),
        writer: Mutex::new(FramedWriter::new(writer)),
        msize: AtomicU32::new(DEFAULT_MSIZE),
        alive: std::sync::atomic::AtomicBool::new(true),
    });

    let mut reader = FramedReader::new(reader);

    loop {
        let msg = match reader.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                error!("framing error, hanging up: {:?}", e);
                break;
            }
        };

        let conn = conn.clone();
        tokio::spawn(async move {
            process(conn, msg.tag, msg.body).await;
        });
    }

    conn.alive.store(false, Ordering::SeqCst);

    // Synthesize TFlush for every still-outstanding request, then TClunk for
    // every still-open fid, so handlers observe a clean shutdown.
    let outstanding: Vec<u16> = conn.tagmap.read().await.keys().copied().collect();
    for tag in outstanding {
        let _ = handle_flush(&conn, tag).await;
    }
    let open_fids: Vec<u32> = conn.fidmap.read().await.keys().copied().collect();
    for fid in open_fids {
        conn.destroy_fid(fid).await;
    }

    Ok(())
}

async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on tcp!{}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                error!("connection error: {:?}", e);
            }
        });
    }
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

/// A one-shot timer registered with the server loop.
struct Timer {
    deadline: tokio::time::Instant,
    fired: Arc<Notify>,
}

/// Minimal timer wheel: the server loop's `tokio::select!` races the
/// soonest-registered deadline against socket readiness.
#[derive(Default)]
pub struct TimerWheel {
    timers: Mutex<Vec<Timer>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel { timers: Mutex::new(Vec::new()) }
    }

    /// Register a timer that fires `ms` milliseconds from now. Returns a
    /// `Notify` the caller can await; dropping it has no effect on the wheel.
    pub async fn settimer(&self, ms: u64) -> Arc<Notify> {
        let fired = Arc::new(Notify::new());
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(ms);
        self.timers.lock().await.push(Timer { deadline, fired: fired.clone() });
        fired
    }

    /// Milliseconds until the next deadline, or `None` if no timers are armed.
    pub async fn next_deadline(&self) -> Option<tokio::time::Instant> {
        self.timers.lock().await.iter().map(|t| t.deadline).min()
    }

    /// Fire (and remove) every timer whose deadline has passed.
    pub async fn fire_due(&self) {
        let now = tokio::time::Instant::now();
        let mut timers = self.timers.lock().await;
        let mut i = 0;
        while i < timers.len() {
            if timers[i].deadline <= now {
                let t = timers.swap_remove(i);
                t.fired.notify_waiters();
            } else {
                i += 1;
            }
        }
    }
}

pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    use tokio::signal::unix::{SignalKind, signal};

    let listener = DeleteOnDrop::bind(addr)?;
    info!("listening on unix socket");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let timers = TimerWheel::new();
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                timers.fire_due().await;
            }
            result = listener.accept() => {
                let (stream, peer) = result?;
                info!("accepted: {:?}", peer);

                let fs = filesystem.clone();
                tokio::spawn(async move {
                    let (readhalf, writehalf) = tokio::io::split(stream);
                    if let Err(e) = dispatch(fs, readhalf, writehalf).await {
                        error!("connection error: {:?}", e);
                    }
                });
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Serve `filesystem` at `addr` (`"tcp!host!port"` or `"unix!/path"`) until
/// the process receives a termination signal (Unix transport only; the TCP
/// transport runs until the listener itself fails).
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    let (proto, host, port) = utils::parse_proto(addr)
        .ok_or_else(|| io_err!(InvalidInput, "invalid address: expected proto!host[!port]"))?;

    match proto {
        "tcp" => {
            let listen_addr = format!("{}:{}", host, port.ok_or_else(|| io_err!(InvalidInput, "tcp requires a port"))?);
            srv_async_tcp(filesystem, &listen_addr).await
        }
        "unix" => srv_async_unix(filesystem, host).await,
        _ => Err(io_err!(InvalidInput, "protocol not supported").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct TestFs;

    #[async_trait]
    impl Filesystem for TestFs {
        type FId = ();

        async fn rattach(
            &self,
            _fid: &FId<()>,
            _afid: Option<&FId<()>>,
            _uname: &str,
            _aname: &str,
        ) -> Result<FCall> {
            Ok(FCall::RAttach { qid: QId { typ: QIdType::DIR, version: 0, path: 0 } })
        }

        async fn rwalk(
            &self,
            _fid: &FId<()>,
            _newfid: &FId<()>,
            _wnames: &[String],
        ) -> Result<FCall> {
            // No matter what's asked, nothing matches: exercises the
            // dispatcher's own "file does not exist" short-walk handling.
            Ok(FCall::RWalk { wqids: Vec::new() })
        }
    }

    fn new_conn(writer: tokio::io::DuplexStream) -> Arc<Conn9<TestFs, tokio::io::DuplexStream>> {
        Arc::new(Conn9 {
            fs: TestFs,
            fidmap: RwLock::new(HashMap::new()),
            tagmap: RwLock::new(HashMap::new()),
            writer: Mutex::new(FramedWriter::new(writer)),
            msize: AtomicU32::new(DEFAULT_MSIZE),
            alive: std::sync::atomic::AtomicBool::new(true),
        })
    }

    #[tokio::test]
    async fn flush_of_unknown_tag_is_rejected() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let conn = new_conn(server_side);
        let mut reader = FramedReader::new(client_side);

        process(conn, 5, FCall::TFlush { oldtag: 999 }).await;

        let got = reader.recv().await.unwrap().unwrap();
        assert_eq!(got.tag, 5);
        assert_eq!(got.body, FCall::RError { ename: string::ENOTAG.to_owned() });
    }

    #[tokio::test]
    async fn duplicate_tag_is_rejected() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let conn = new_conn(server_side);
        let mut reader = FramedReader::new(client_side);

        // Simulate a request already in flight under tag 7.
        let (cancel_tx, _cancel_rx) = oneshot::channel();
        conn.tagmap.write().await.insert(7, PendingReq { cancel: cancel_tx });

        process(
            conn.clone(),
            7,
            FCall::TAttach { fid: 0, afid: NOFID, uname: "none".to_owned(), aname: String::new() },
        )
        .await;

        let got = reader.recv().await.unwrap().unwrap();
        assert_eq!(got.tag, 7);
        assert_eq!(got.body, FCall::RError { ename: string::ETAG.to_owned() });
        // The pre-existing pending request is left untouched by the rejection.
        assert!(conn.tagmap.read().await.contains_key(&7));
    }

    #[tokio::test]
    async fn walk_with_no_matching_elements_reports_file_does_not_exist() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let conn = new_conn(server_side);
        let mut reader = FramedReader::new(client_side);

        process(
            conn.clone(),
            1,
            FCall::TAttach { fid: 0, afid: NOFID, uname: "none".to_owned(), aname: String::new() },
        )
        .await;
        let attach_resp = reader.recv().await.unwrap().unwrap();
        assert!(matches!(attach_resp.body, FCall::RAttach { .. }));

        process(
            conn,
            2,
            FCall::TWalk { fid: 0, newfid: 1, wnames: vec!["missing".to_owned()] },
        )
        .await;
        let walk_resp = reader.recv().await.unwrap().unwrap();
        assert_eq!(walk_resp.body, FCall::RError { ename: string::ENOENT_FILE2.to_owned() });
    }
}
