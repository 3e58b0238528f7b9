use {
    ninep::fcall::*,
    std::{fs::Metadata, os::unix::prelude::*, path::Path},
    tokio::fs,
};

#[macro_export]
macro_rules! INVALID_FID {
    () => {
        io_err!(InvalidInput, "Invalid fid")
    };
}

pub async fn get_qid<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<QId> {
    Ok(qid_from_attr(&fs::symlink_metadata(path.as_ref()).await?))
}

pub fn qid_from_attr(attr: &Metadata) -> QId {
    QId {
        typ: From::from(attr.file_type()),
        version: 0,
        path: attr.ino(),
    }
}

/// Build a [`Stat`] for `path`'s metadata, using its file name as `name`.
/// Owner/group are reported as decimal uid/gid strings rather than resolved
/// account names, since this exporter has no notion of a user database.
pub fn stat_from_attr(path: &Path, attr: &Metadata) -> Stat {
    let mut mode = (attr.permissions().mode() & 0o777) as u32;
    if attr.is_dir() {
        mode |= dm::DIR;
    }

    Stat {
        typ: 0,
        dev: 0,
        qid: qid_from_attr(attr),
        mode,
        atime: attr.atime().max(0) as u32,
        mtime: attr.mtime().max(0) as u32,
        length: if attr.is_dir() { 0 } else { attr.len() },
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        uid: attr.uid().to_string(),
        gid: attr.gid().to_string(),
        muid: String::new(),
    }
}

pub async fn stat_at<T: AsRef<Path> + ?Sized>(path: &T) -> ninep::Result<Stat> {
    let path = path.as_ref();
    let attr = fs::symlink_metadata(path).await?;
    Ok(stat_from_attr(path, &attr))
}
