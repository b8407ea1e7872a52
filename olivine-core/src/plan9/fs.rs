//! The file-system backend consumed by the 9P server, plus a host implementation over
//! `std::fs`.

use log::debug;
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// A path below the exported root, as a list of name segments.
pub type FsPath = [String];

/// How a file is opened.
#[derive(Debug, Copy, Clone, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub truncate: bool,
}

/// File metadata as the 9P server needs it.
#[derive(Debug, Clone, Default)]
pub struct FileAttributes {
    pub directory: bool,
    pub symlink: bool,
    /// Permission bits plus the file-type bits (S_IFDIR / S_IFREG / S_IFLNK).
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub unique_id: u64,
    pub atime_sec: u64,
    pub mtime_sec: u64,
    pub ctime_sec: u64,
}

/// File-system level statistics for `statfs`.
#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub max_name_length: u32,
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub directory: bool,
    pub unique_id: u64,
}

/// Errors a backend operation can produce; each maps to one errno on the wire.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum FsError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("operation not supported")]
    Unsupported,
    #[error("i/o error")]
    Io,
}

pub type FsResult<T> = Result<T, FsError>;

/// The file-system backend interface of the 9P transport.
///
/// Implementations are free to be backed by the host file system, an archive, or an in-memory
/// tree; the server only ever addresses files by segment paths below the exported root.
pub trait FileSystem: std::fmt::Debug {
    fn statfs(&self) -> FsResult<StatFs>;
    fn exists(&self, path: &FsPath) -> bool;
    fn is_directory(&self, path: &FsPath) -> bool;
    fn is_readable(&self, path: &FsPath) -> bool;
    fn is_writable(&self, path: &FsPath) -> bool;
    fn is_executable(&self, path: &FsPath) -> bool;
    fn attributes(&self, path: &FsPath) -> FsResult<FileAttributes>;
    /// A stable identity for the file, used as the QID path.
    fn unique_id(&self, path: &FsPath) -> FsResult<u64>;
    fn open(&mut self, path: &FsPath, flags: OpenFlags) -> FsResult<Box<dyn FileHandle>>;
    /// Create and open a regular file.
    fn create(&mut self, path: &FsPath, flags: OpenFlags) -> FsResult<Box<dyn FileHandle>>;
    fn readdir(&self, path: &FsPath) -> FsResult<Vec<DirEntry>>;
    fn mkdir(&mut self, path: &FsPath) -> FsResult<()>;
    fn rename(&mut self, from: &FsPath, to: &FsPath) -> FsResult<()>;
    /// Remove a file or an empty directory.
    fn unlink(&mut self, path: &FsPath) -> FsResult<()>;
}

/// An open file.
pub trait FileHandle: std::fmt::Debug {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, offset: u64, buf: &[u8]) -> FsResult<usize>;
    fn sync(&mut self) -> FsResult<()> {
        Ok(())
    }
}

/// Host-backed file system exporting a directory tree.
///
/// Paths are resolved strictly below the exported root; any attempt to escape it (via `..` or
/// absolute segments) is a [`FsError::PermissionDenied`].
#[derive(Debug)]
pub struct HostFileSystem {
    root: PathBuf,
    read_only: bool,
}

impl HostFileSystem {
    pub fn new(root: impl Into<PathBuf>, read_only: bool) -> Self {
        Self {
            root: root.into(),
            read_only,
        }
    }

    fn resolve(&self, path: &FsPath) -> FsResult<PathBuf> {
        let mut resolved = self.root.clone();
        for segment in path {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => resolved.push(name),
                _ => {
                    debug!(segment = segment.as_str(); "Rejecting path segment");
                    return Err(FsError::PermissionDenied);
                }
            }
        }
        Ok(resolved)
    }

    fn check_writable(&self) -> FsResult<()> {
        match self.read_only {
            true => Err(FsError::PermissionDenied),
            false => Ok(()),
        }
    }

    fn metadata(&self, path: &FsPath) -> FsResult<fs::Metadata> {
        fs::symlink_metadata(self.resolve(path)?).map_err(io_error)
    }
}

fn io_error(error: std::io::Error) -> FsError {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::NotFound => FsError::NotFound,
        ErrorKind::PermissionDenied => FsError::PermissionDenied,
        ErrorKind::AlreadyExists => FsError::AlreadyExists,
        _ => FsError::Io,
    }
}

fn stable_id(path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    hasher.finish()
}

fn unix_seconds(time: std::io::Result<std::time::SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl FileSystem for HostFileSystem {
    fn statfs(&self) -> FsResult<StatFs> {
        // The host's real figures are not portably available; report a roomy synthetic fs.
        Ok(StatFs {
            block_size: 4096,
            blocks: 1 << 24,
            blocks_free: 1 << 23,
            blocks_available: 1 << 23,
            files: 1 << 20,
            files_free: 1 << 19,
            max_name_length: 255,
        })
    }

    fn exists(&self, path: &FsPath) -> bool {
        self.resolve(path).is_ok_and(|p| p.symlink_metadata().is_ok())
    }

    fn is_directory(&self, path: &FsPath) -> bool {
        self.metadata(path).is_ok_and(|m| m.is_dir())
    }

    fn is_readable(&self, path: &FsPath) -> bool {
        self.exists(path)
    }

    fn is_writable(&self, path: &FsPath) -> bool {
        !self.read_only && self.metadata(path).is_ok_and(|m| !m.permissions().readonly())
    }

    fn is_executable(&self, path: &FsPath) -> bool {
        self.is_directory(path)
    }

    fn attributes(&self, path: &FsPath) -> FsResult<FileAttributes> {
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved).map_err(io_error)?;
        let file_type = metadata.file_type();
        let type_bits = match (file_type.is_dir(), file_type.is_symlink()) {
            (true, _) => 0o040000,
            (_, true) => 0o120000,
            _ => 0o100000,
        };
        let permissions = match metadata.permissions().readonly() || self.read_only {
            true => 0o555,
            false => 0o755,
        };
        Ok(FileAttributes {
            directory: file_type.is_dir(),
            symlink: file_type.is_symlink(),
            mode: type_bits | permissions,
            nlink: 1,
            size: metadata.len(),
            unique_id: stable_id(&resolved),
            atime_sec: unix_seconds(metadata.accessed()),
            mtime_sec: unix_seconds(metadata.modified()),
            ctime_sec: unix_seconds(metadata.modified()),
        })
    }

    fn unique_id(&self, path: &FsPath) -> FsResult<u64> {
        Ok(stable_id(&self.resolve(path)?))
    }

    fn open(&mut self, path: &FsPath, flags: OpenFlags) -> FsResult<Box<dyn FileHandle>> {
        if flags.write || flags.truncate {
            self.check_writable()?;
        }
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            // Directories are read through readdir, not file handles.
            return Ok(Box::new(DirHandle));
        }
        let file = fs::OpenOptions::new()
            .read(flags.read)
            .write(flags.write)
            .truncate(flags.truncate)
            .open(resolved)
            .map_err(io_error)?;
        Ok(Box::new(HostFileHandle { file }))
    }

    fn create(&mut self, path: &FsPath, flags: OpenFlags) -> FsResult<Box<dyn FileHandle>> {
        self.check_writable()?;
        let resolved = self.resolve(path)?;
        let file = fs::OpenOptions::new()
            .read(flags.read)
            .write(true)
            .create_new(true)
            .open(resolved)
            .map_err(io_error)?;
        Ok(Box::new(HostFileHandle { file }))
    }

    fn readdir(&self, path: &FsPath) -> FsResult<Vec<DirEntry>> {
        let resolved = self.resolve(path)?;
        if !resolved.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&resolved).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let directory = entry.file_type().map_err(io_error)?.is_dir();
            let unique_id = stable_id(&resolved.join(entry.file_name()));
            entries.push(DirEntry {
                name,
                directory,
                unique_id,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn mkdir(&mut self, path: &FsPath) -> FsResult<()> {
        self.check_writable()?;
        fs::create_dir(self.resolve(path)?).map_err(io_error)
    }

    fn rename(&mut self, from: &FsPath, to: &FsPath) -> FsResult<()> {
        self.check_writable()?;
        fs::rename(self.resolve(from)?, self.resolve(to)?).map_err(io_error)
    }

    fn unlink(&mut self, path: &FsPath) -> FsResult<()> {
        self.check_writable()?;
        let resolved = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&resolved).map_err(io_error)?;
        match metadata.is_dir() {
            true => fs::remove_dir(&resolved).map_err(|error| {
                match error.raw_os_error() == Some(39) {
                    true => FsError::NotEmpty,
                    false => io_error(error),
                }
            }),
            false => fs::remove_file(&resolved).map_err(io_error),
        }
    }
}

#[derive(Debug)]
struct HostFileHandle {
    file: fs::File,
}

impl FileHandle for HostFileHandle {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_error)?;
        self.file.read(buf).map_err(io_error)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> FsResult<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_error)?;
        self.file.write(buf).map_err(io_error)
    }

    fn sync(&mut self) -> FsResult<()> {
        self.file.sync_all().map_err(io_error)
    }
}

/// Placeholder handle for opened directories; reads go through `readdir`.
#[derive(Debug)]
struct DirHandle;

impl FileHandle for DirHandle {
    fn read(&mut self, _offset: u64, _buf: &mut [u8]) -> FsResult<usize> {
        Err(FsError::Unsupported)
    }

    fn write(&mut self, _offset: u64, _buf: &[u8]) -> FsResult<usize> {
        Err(FsError::Unsupported)
    }
}
