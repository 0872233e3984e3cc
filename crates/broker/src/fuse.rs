//! On-demand socket directory: a read-only user-space filesystem whose
//! entries are unix socket mounts created lazily the first time a client
//! looks up an instance name.
//!
//! The directory contains a static `README` and one symlink per active
//! instance, each pointing at the real socket inside a private temporary
//! directory. Looking up a fresh `project:region:name` resolves the
//! instance's engine flavor, binds a unix mount for it, and starts its
//! accept loop.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEntry, Request,
};
use tokio_util::sync::CancellationToken;

use crate::accept::{accept_loop, RefuseNotify};
use crate::counter::ConnCount;
use crate::dial::{DialOpts, Dialer};
use crate::errors::{Error, MultiError};
use crate::instance::InstanceName;
use crate::mount::Mount;

const ROOT_INO: u64 = 1;
const README_INO: u64 = 2;
const FIRST_INSTANCE_INO: u64 = 3;

const ATTR_TTL: Duration = Duration::from_secs(1);

const README_TEXT: &str = "\
When applications attempt to open files in this directory, a socket will
be created for the instance whose name matches the filename, provided the
instance exists and this process may connect to it.

For example, connecting a Postgres client to

    <dir>/my-project:us-central1:my-instance

creates a unix socket of that name, proxied to the instance.

Socket files are removed when this process stops.
";

/// The on-demand socket directory, mounted while the broker serves.
pub struct FuseDir {
    mount_dir: PathBuf,
    inner: Arc<DirInner>,
    session: Mutex<Option<fuser::BackgroundSession>>,
    done: CancellationToken,
    // Owns the private socket directory; removed again on drop.
    _tmp: tempfile::TempDir,
}

impl FuseDir {
    pub fn new(
        mount_dir: PathBuf,
        tmp_base: PathBuf,
        dialer: Arc<dyn Dialer>,
        count: Arc<ConnCount>,
        dial_opts: DialOpts,
        on_refuse: Option<RefuseNotify>,
    ) -> Result<FuseDir, Error> {
        std::fs::create_dir_all(&tmp_base)
            .map_err(|err| Error::FuseMount(tmp_base.clone(), err))?;
        let tmp = tempfile::Builder::new()
            .prefix("csql-proxy")
            .tempdir_in(&tmp_base)
            .map_err(|err| Error::FuseMount(tmp_base.clone(), err))?;

        // Entries are owned by the proxy process itself.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        Ok(FuseDir {
            mount_dir,
            inner: Arc::new(DirInner {
                dialer,
                count,
                dial_opts,
                on_refuse,
                tmp_dir: tmp.path().to_path_buf(),
                handle: tokio::runtime::Handle::current(),
                uid,
                gid,
                state: Mutex::new(DirState {
                    mounts: HashMap::new(),
                    next_ino: FIRST_INSTANCE_INO,
                    tasks: Vec::new(),
                }),
            }),
            session: Mutex::new(None),
            done: CancellationToken::new(),
            _tmp: tmp,
        })
    }

    /// Mount the filesystem and serve lookups until [`FuseDir::unmount`].
    pub async fn serve(&self, on_started: impl FnOnce() + Send) -> Result<(), Error> {
        let shim = FuseShim(Arc::clone(&self.inner));
        let options = [
            MountOption::RO,
            MountOption::FSName("csql-proxy".to_string()),
            MountOption::DefaultPermissions,
        ];
        let session = fuser::spawn_mount2(shim, &self.mount_dir, &options)
            .map_err(|err| Error::FuseMount(self.mount_dir.clone(), err))?;
        *self.session.lock().unwrap() = Some(session);

        tracing::info!(dir = %self.mount_dir.display(), "mounted socket directory");
        on_started();

        self.done.cancelled().await;
        Ok(())
    }

    /// Unmount the filesystem. New lookups stop; existing sockets keep
    /// serving until their mounts are closed.
    pub fn unmount(&self) {
        if let Some(session) = self.session.lock().unwrap().take() {
            drop(session);
            tracing::info!(dir = %self.mount_dir.display(), "unmounted socket directory");
        }
        self.done.cancel();
    }

    /// Close every remaining on-demand mount and wait for the accept
    /// tasks they spawned.
    pub(crate) async fn shutdown(&self, errs: &mut MultiError) {
        let (mounts, tasks) = {
            let mut state = self.inner.state.lock().unwrap();
            let mounts: Vec<DirEntry> = state.mounts.drain().map(|(_, e)| e).collect();
            (mounts, std::mem::take(&mut state.tasks))
        };
        for entry in &mounts {
            if let Err(err) = entry.mount.close() {
                errs.push(err.for_instance(entry.mount.instance().clone()));
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

struct DirInner {
    dialer: Arc<dyn Dialer>,
    count: Arc<ConnCount>,
    dial_opts: DialOpts,
    on_refuse: Option<RefuseNotify>,
    tmp_dir: PathBuf,
    handle: tokio::runtime::Handle,
    uid: u32,
    gid: u32,
    state: Mutex<DirState>,
}

struct DirState {
    mounts: HashMap<String, DirEntry>,
    next_ino: u64,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct DirEntry {
    ino: u64,
    target: PathBuf,
    mount: Arc<Mount>,
}

impl DirInner {
    /// Resolve a directory entry, creating the mount on first lookup.
    /// Runs on a filesystem callback thread, never on the runtime.
    fn lookup_instance(this: &Arc<DirInner>, raw: &str) -> Option<FileAttr> {
        let instance: InstanceName = raw.parse().ok()?;

        // Fast path: already mounted.
        {
            let state = this.state.lock().unwrap();
            if let Some(entry) = state.mounts.get(raw) {
                return Some(this.symlink_attr(entry));
            }
        }

        // Slow path, outside the lock: resolve the flavor and bind.
        let flavor = match this.handle.block_on(this.dialer.engine_version(&instance)) {
            Ok(flavor) => flavor,
            Err(err) => {
                tracing::error!(instance = %instance, %err, "instance lookup failed");
                return None;
            }
        };

        let base = this.tmp_dir.join(raw);
        let postgres = flavor.starts_with("POSTGRES");
        let mount = match this
            .handle
            .block_on(Mount::bind_unix(instance.clone(), this.dial_opts, &base, postgres))
        {
            Ok(mount) => Arc::new(mount),
            Err(err) => {
                // A concurrent lookup may have bound the socket first; if
                // so its entry wins.
                let state = this.state.lock().unwrap();
                if let Some(entry) = state.mounts.get(raw) {
                    return Some(this.symlink_attr(entry));
                }
                tracing::error!(instance = %instance, %err, "failed to create socket");
                return None;
            }
        };
        tracing::info!(instance = %instance, address = %mount.addr(), "listening");

        let mut state = this.state.lock().unwrap();
        if let Some(entry) = state.mounts.get(raw) {
            let _ = mount.close();
            return Some(this.symlink_attr(entry));
        }

        let ino = state.next_ino;
        state.next_ino += 1;

        let entry = DirEntry {
            ino,
            target: base,
            mount: Arc::clone(&mount),
        };
        let attr = this.symlink_attr(&entry);
        state.mounts.insert(raw.to_string(), entry);

        // The accept loop removes its own entry when it exits, e.g. when
        // the mount is closed out from under it.
        let inner = Arc::clone(this);
        let key = raw.to_string();
        let task = this.handle.spawn(async move {
            let err = accept_loop(
                mount,
                Arc::clone(&inner.dialer),
                Arc::clone(&inner.count),
                inner.on_refuse.clone(),
            )
            .await;
            tracing::debug!(instance = %key, %err, "socket accept loop finished");

            let mut state = inner.state.lock().unwrap();
            if state.mounts.get(&key).map(|e| e.ino) == Some(ino) {
                state.mounts.remove(&key);
            }
        });
        state.tasks.push(task);

        Some(attr)
    }

    /// Directory listing: `README` plus every active mount, reported as
    /// socket-type entries in creation order.
    fn entries(&self) -> Vec<(u64, FileType, String)> {
        let mut entries = vec![
            (ROOT_INO, FileType::Directory, ".".to_string()),
            (ROOT_INO, FileType::Directory, "..".to_string()),
            (README_INO, FileType::RegularFile, "README".to_string()),
        ];
        let state = self.state.lock().unwrap();
        let mut mounts: Vec<_> = state.mounts.iter().collect();
        mounts.sort_by_key(|(_, entry)| entry.ino);
        entries.extend(
            mounts
                .into_iter()
                .map(|(name, entry)| (entry.ino, FileType::Socket, name.clone())),
        );
        entries
    }

    fn attr_for(&self, ino: u64) -> Option<FileAttr> {
        match ino {
            ROOT_INO => Some(self.attr(ROOT_INO, FileType::Directory, 0o555, 0)),
            README_INO => Some(self.attr(
                README_INO,
                FileType::RegularFile,
                0o444,
                README_TEXT.len() as u64,
            )),
            _ => {
                let state = self.state.lock().unwrap();
                let entry = state.mounts.values().find(|e| e.ino == ino)?;
                Some(self.symlink_attr(entry))
            }
        }
    }

    fn link_target(&self, ino: u64) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .mounts
            .values()
            .find(|e| e.ino == ino)
            .map(|e| e.target.clone())
    }

    fn symlink_attr(&self, entry: &DirEntry) -> FileAttr {
        self.attr(
            entry.ino,
            FileType::Symlink,
            0o777,
            entry.target.as_os_str().len() as u64,
        )
    }

    fn attr(&self, ino: u64, kind: FileType, perm: u16, size: u64) -> FileAttr {
        let now = SystemTime::now();
        FileAttr {
            ino,
            size,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

/// Thin adapter between the kernel-facing trait and [`DirInner`].
struct FuseShim(Arc<DirInner>);

impl Filesystem for FuseShim {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        if name == "README" {
            match self.0.attr_for(README_INO) {
                Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
                None => reply.error(libc::ENOENT),
            }
            return;
        }
        match DirInner::lookup_instance(&self.0, name) {
            Some(attr) => reply.entry(&ATTR_TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.0.attr_for(ino) {
            Some(attr) => reply.attr(&ATTR_TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.0.link_target(ino) {
            Some(target) => reply.data(target.as_os_str().as_bytes()),
            None => reply.error(libc::EINVAL),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino != README_INO {
            reply.error(libc::ENOENT);
            return;
        }
        let text = README_TEXT.as_bytes();
        let start = (offset as usize).min(text.len());
        let end = (start + size as usize).min(text.len());
        reply.data(&text[start..end]);
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INO {
            reply.error(libc::ENOTDIR);
            return;
        }
        for (i, (ino, kind, name)) in self
            .0
            .entries()
            .into_iter()
            .enumerate()
            .skip(offset as usize)
        {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dial::{BoxedStream, DialError};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct EchoDialer;

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(
            &self,
            instance: &InstanceName,
            _opts: &DialOpts,
        ) -> Result<BoxedStream, DialError> {
            if instance.name() == "unknown" {
                return Err(DialError::NotFound(instance.clone()));
            }
            let (near, mut far) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = far.read(&mut buf).await {
                    if n == 0 || far.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
            Ok(Box::new(near))
        }

        async fn engine_version(&self, instance: &InstanceName) -> Result<String, DialError> {
            match instance.name() {
                "unknown" => Err(DialError::NotFound(instance.clone())),
                name if name.starts_with("pg") => Ok("POSTGRES_16".to_string()),
                _ => Ok("MYSQL_8_0".to_string()),
            }
        }

        async fn close(&self) -> Result<(), DialError> {
            Ok(())
        }
    }

    fn fuse_dir(mount_dir: &std::path::Path, tmp: &std::path::Path) -> FuseDir {
        FuseDir::new(
            mount_dir.to_path_buf(),
            tmp.to_path_buf(),
            Arc::new(EchoDialer),
            ConnCount::new(0),
            DialOpts::default(),
            None,
        )
        .unwrap()
    }

    /// Filesystem callbacks run on fuser's own threads; mimic that so
    /// `block_on` is legal.
    fn on_fs_thread<T: Send + 'static>(
        inner: &Arc<DirInner>,
        f: impl FnOnce(Arc<DirInner>) -> T + Send + 'static,
    ) -> T {
        let inner = Arc::clone(inner);
        std::thread::spawn(move || f(inner)).join().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lookup_creates_socket_and_lists_it() {
        let mount_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = fuse_dir(mount_dir.path(), tmp.path());

        let attr =
            on_fs_thread(&dir.inner, |inner| DirInner::lookup_instance(&inner, "p:r:mydb").unwrap());
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.ino, FIRST_INSTANCE_INO);

        let target = dir.inner.link_target(attr.ino).unwrap();
        assert!(target.exists());

        let names: Vec<String> = dir.inner.entries().into_iter().map(|(_, _, n)| n).collect();
        assert_eq!(names, vec![".", "..", "README", "p:r:mydb"]);

        // The lazily-created socket proxies for real.
        let mut client = tokio::net::UnixStream::connect(&target).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client);

        let mut errs = MultiError::default();
        dir.shutdown(&mut errs).await;
        assert!(errs.is_empty(), "{errs}");
        assert!(!target.exists());
        assert!(dir.inner.entries().len() == 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_lookup_reuses_the_mount() {
        let mount_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = fuse_dir(mount_dir.path(), tmp.path());

        let first =
            on_fs_thread(&dir.inner, |inner| DirInner::lookup_instance(&inner, "p:r:mydb").unwrap());
        let second =
            on_fs_thread(&dir.inner, |inner| DirInner::lookup_instance(&inner, "p:r:mydb").unwrap());
        assert_eq!(first.ino, second.ino);
        assert_eq!(dir.inner.entries().len(), 4);

        let mut errs = MultiError::default();
        dir.shutdown(&mut errs).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn postgres_lookup_builds_socket_directory() {
        let mount_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = fuse_dir(mount_dir.path(), tmp.path());

        let attr =
            on_fs_thread(&dir.inner, |inner| DirInner::lookup_instance(&inner, "p:r:pgdb").unwrap());

        // The symlink names the directory; the socket sits inside under
        // the client's expected filename.
        let target = dir.inner.link_target(attr.ino).unwrap();
        assert!(target.is_dir());
        assert!(target.join(crate::mount::PG_SOCKET_NAME).exists());

        let mut errs = MultiError::default();
        dir.shutdown(&mut errs).await;
        assert!(errs.is_empty(), "{errs}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_names_and_unknown_instances_are_not_found() {
        let mount_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = fuse_dir(mount_dir.path(), tmp.path());

        assert!(on_fs_thread(&dir.inner, |inner| {
            DirInner::lookup_instance(&inner, "not-an-instance").is_none()
        }));
        assert!(on_fs_thread(&dir.inner, |inner| {
            DirInner::lookup_instance(&inner, "p:r:unknown").is_none()
        }));
        assert_eq!(dir.inner.entries().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn accept_loop_exit_removes_the_entry() {
        let mount_dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = fuse_dir(mount_dir.path(), tmp.path());

        let attr =
            on_fs_thread(&dir.inner, |inner| DirInner::lookup_instance(&inner, "p:r:mydb").unwrap());

        // Closing the mount makes its accept loop exit, which deletes the
        // map entry.
        {
            let state = dir.inner.state.lock().unwrap();
            state.mounts.get("p:r:mydb").unwrap().mount.close().unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while dir.inner.attr_for(attr.ino).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(dir.inner.entries().len(), 3);
    }
}
