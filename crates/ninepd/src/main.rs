use {
    async_trait::async_trait,
    clap::Parser,
    filetime::FileTime,
    ninep::{
        Result,
        fcall::*,
        io_err,
        res,
        serialize::Encodable,
        srv::{FId, Filesystem, srv_async},
    },
    std::{
        io::SeekFrom,
        os::unix::fs::{OpenOptionsExt, PermissionsExt},
        path::PathBuf,
    },
    tokio::{
        fs,
        io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
        sync::{Mutex, RwLock},
    },
    tokio_stream::{StreamExt, wrappers::ReadDirStream},
};

mod utils;
use crate::utils::*;

// Maximum depth protection:
// Without a depth limit, it's possible to create infinite recursion by mounting
// the 9P filesystem inside its own export directory. For example:
//   - Export directory: /home/user/export
//   - Mount point: /home/user/export/mnt
// Accessing /home/user/export/mnt/mnt/mnt/... would recurse infinitely.
// The max_depth option prevents this by tracking how deep we've traversed
// from the root and returning ELOOP (too many levels of symbolic links) when
// the limit is exceeded.

#[derive(Default)]
struct UnpfsFId {
    realpath: RwLock<PathBuf>,
    file: Mutex<Option<fs::File>>,
    depth: RwLock<usize>,
    /// Snapshot of a directory's packed stat listing, built on the first
    /// `TRead` at offset 0 and sliced by byte range on subsequent reads.
    dirbuf: Mutex<Option<Vec<u8>>>,
}

#[derive(Clone)]
struct Unpfs {
    realroot: PathBuf,
    max_depth: usize,
}

#[async_trait]
impl Filesystem for Unpfs {
    type FId = UnpfsFId;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
    ) -> Result<FCall> {
        *fid.aux.realpath.write().await = self.realroot.clone();
        *fid.aux.depth.write().await = 0;

        Ok(FCall::RAttach {
            qid: get_qid(&self.realroot).await?,
        })
    }

    async fn rwalk(
        &self,
        fid: &FId<Self::FId>,
        newfid: &FId<Self::FId>,
        wnames: &[String],
    ) -> Result<FCall> {
        let mut wqids = Vec::new();
        let mut path = fid.aux.realpath.read().await.clone();
        let mut depth = *fid.aux.depth.read().await;

        for (i, name) in wnames.iter().enumerate() {
            if name == ".." {
                depth = depth.saturating_sub(1);
            } else if name != "." {
                depth += 1;
                if depth > self.max_depth {
                    return Err(ninep::Error::No(ninep::errno::ELOOP));
                }
            }

            path.push(name);

            match get_qid(&path).await {
                Ok(qid) => wqids.push(qid),
                Err(e) if i == 0 => return Err(e),
                Err(_) => break,
            }
        }

        *newfid.aux.realpath.write().await = path;
        *newfid.aux.depth.write().await = depth;

        Ok(FCall::RWalk { wqids })
    }

    async fn ropen(&self, fid: &FId<Self::FId>, mode: u8) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.clone();
        let qid = get_qid(&path).await?;

        if !qid.typ.contains(QIdType::DIR) {
            let mut opts = fs::OpenOptions::new();
            match mode & 3 {
                om::WRITE => opts.write(true),
                om::RDWR => opts.read(true).write(true),
                _ => opts.read(true),
            };
            if mode & om::TRUNC != 0 {
                opts.truncate(true);
            }
            let file = opts.open(&path).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        Ok(FCall::ROpen { qid, iounit: 0 })
    }

    async fn rcreate(
        &self,
        fid: &FId<Self::FId>,
        name: &str,
        perm: u32,
        mode: u8,
    ) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.join(name);

        if perm & dm::DIR != 0 {
            fs::create_dir(&path).await?;
            fs::set_permissions(&path, PermissionsExt::from_mode(perm & 0o777)).await?;
        } else {
            let mut opts = fs::OpenOptions::new();
            opts.create(true).mode(perm & 0o777);
            match mode & 3 {
                om::WRITE => opts.write(true),
                om::RDWR => opts.read(true).write(true),
                _ => opts.read(true).write(true),
            };
            let file = opts.open(&path).await?;
            *fid.aux.file.lock().await = Some(file);
        }

        let qid = get_qid(&path).await?;
        *fid.aux.realpath.write().await = path;
        Ok(FCall::RCreate { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.clone();
        if get_qid(&path).await?.typ.contains(QIdType::DIR) {
            return self.read_dir(fid, &path, offset, count).await;
        }

        let mut file = fid.aux.file.lock().await;
        let file = file.as_mut().ok_or_else(|| INVALID_FID!())?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0; count as usize];
        let bytes = file.read(&mut buf[..]).await?;
        buf.truncate(bytes);
        Ok(FCall::RRead { data: Data(buf) })
    }

    async fn rwrite(&self, fid: &FId<Self::FId>, offset: u64, data: &Data) -> Result<FCall> {
        let mut file = fid.aux.file.lock().await;
        let file = file.as_mut().ok_or_else(|| INVALID_FID!())?;
        file.seek(SeekFrom::Start(offset)).await?;
        let count = file.write(&data.0).await? as u32;
        Ok(FCall::RWrite { count })
    }

    async fn rremove(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.clone();
        if fs::symlink_metadata(&path).await?.is_dir() {
            fs::remove_dir(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(FCall::RRemove)
    }

    async fn rstat(&self, fid: &FId<Self::FId>) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.clone();
        Ok(FCall::RStat { stat: stat_at(&path).await? })
    }

    async fn rwstat(&self, fid: &FId<Self::FId>, stat: &Stat) -> Result<FCall> {
        let path = fid.aux.realpath.read().await.clone();

        if stat.mode != !0u32 {
            fs::set_permissions(&path, PermissionsExt::from_mode(stat.mode & 0o777)).await?;
        }

        if stat.length != !0u64 {
            fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await?
                .set_len(stat.length)
                .await?;
        }

        if stat.atime != !0u32 || stat.mtime != !0u32 {
            let attr = fs::metadata(&path).await?;
            let atime = if stat.atime != !0u32 {
                FileTime::from_unix_time(stat.atime as i64, 0)
            } else {
                FileTime::from_last_access_time(&attr)
            };
            let mtime = if stat.mtime != !0u32 {
                FileTime::from_unix_time(stat.mtime as i64, 0)
            } else {
                FileTime::from_last_modification_time(&attr)
            };
            let path = path.clone();
            let _ = tokio::task::spawn_blocking(move || filetime::set_file_times(path, atime, mtime)).await;
        }

        if !stat.name.is_empty() && stat.name != path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default() {
            let newpath = path.with_file_name(&stat.name);
            fs::rename(&path, &newpath).await?;
            *fid.aux.realpath.write().await = newpath;
        }

        Ok(FCall::RWStat)
    }

    async fn rclunk(&self, _fid: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }
}

impl Unpfs {
    async fn read_dir(
        &self,
        fid: &FId<UnpfsFId>,
        path: &PathBuf,
        offset: u64,
        count: u32,
    ) -> Result<FCall> {
        let mut dirbuf = fid.aux.dirbuf.lock().await;

        if offset == 0 || dirbuf.is_none() {
            let mut buf = Vec::new();
            let mut entries = ReadDirStream::new(fs::read_dir(path).await?);
            while let Some(entry) = entries.next().await {
                let entry = entry?;
                let entry_path = entry.path();
                let attr = entry.metadata().await?;
                let stat = stat_from_attr(&entry_path, &attr);
                stat.encode(&mut buf)?;
            }
            *dirbuf = Some(buf);
        }

        let buf = dirbuf.as_ref().unwrap();
        let start = (offset as usize).min(buf.len());
        let end = (start + count as usize).min(buf.len());
        Ok(FCall::RRead { data: Data(buf[start..end].to_vec()) })
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    address: String,

    /// Directory to export
    exportdir: PathBuf,

    /// Maximum directory depth to traverse
    #[arg(long, default_value_t = 200)]
    max_depth: usize,
}

async fn unpfs_main(
    Cli { address, exportdir, max_depth }: Cli,
) -> ninep::Result<i32> {
    if !fs::try_exists(&exportdir).await? {
        fs::create_dir_all(&exportdir).await?;
    }
    if !fs::metadata(&exportdir).await?.is_dir() {
        return res!(io_err!(Other, "mount point must be a directory"));
    }

    println!("[*] Maximum depth limit: {}", max_depth);
    println!("[*] Ready to accept clients: {}", address);
    srv_async(Unpfs { realroot: exportdir, max_depth }, &address)
        .await
        .and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = unpfs_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_depth_tracking() {
        let mut depth: usize = 0;
        for name in ["a", "b", "c"] {
            if name != "." {
                depth += 1;
            }
        }
        assert_eq!(depth, 3);

        depth = depth.saturating_sub(1);
        assert_eq!(depth, 2);

        depth = depth.saturating_sub(1);
        depth = depth.saturating_sub(1);
        assert_eq!(depth, 0);

        depth = depth.saturating_sub(1);
        assert_eq!(depth, 0);
    }

    #[test]
    fn test_max_depth_logic() {
        let max_depth = 5_usize;
        let mut current_depth: usize = 3;

        current_depth += 1;
        assert!(current_depth <= max_depth);
        current_depth += 1;
        assert!(current_depth <= max_depth);
        current_depth += 1;
        assert!(current_depth > max_depth);
    }
}
