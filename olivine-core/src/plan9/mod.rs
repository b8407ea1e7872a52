//! Plan 9 (9P2000.L) file-system transport over virtio.

pub mod fs;
pub mod protocol;

use crate::system_bus::{Device, MemoryAccessError, SystemBus};
use crate::virtio::{self, VirtioMmio};
use fs::{FileHandle, FileSystem, FsError, OpenFlags};
use log::{debug, trace, warn};
use protocol::{errno, msg, qid_type, Qid, Reader, Writer, HEADER_SIZE};
use std::collections::HashMap;

/// Virtio device type of a 9P transport.
pub const DEVICE_ID_9P: u32 = 0x9;

/// Feature bit 0: the configuration space carries a mount tag.
const F_MOUNT_TAG: u64 = 1 << 0;

/// Upper bound on the negotiated message size.
const MAX_MSIZE: u32 = 8192;

/// Header overhead reserved per read/write/readdir reply.
const IO_HEADER_SIZE: u32 = 34;

/// Bytes of transfer budget granted per thousand cycles.
const BUDGET_PER_KCYCLE: u64 = 32;

/// A 9P2000.L server over a virtio-MMIO transport.
///
/// The device owns one request virtqueue. Each step converts the granted cycle budget into a
/// byte budget and drains descriptor chains until it is exhausted or the queue empties; replies
/// reuse the chain they arrived on.
#[derive(Debug)]
pub struct NinePDevice {
    transport: VirtioMmio,
    server: NinePServer,
}

impl NinePDevice {
    /// Create a 9P device exporting `file_system` under `mount_tag`.
    pub fn new(
        mount_tag: &str,
        file_system: Box<dyn FileSystem>,
        irq: Option<crate::devices::plic::PlicSource>,
    ) -> Self {
        let mut config = Vec::with_capacity(2 + mount_tag.len());
        config.extend_from_slice(&(mount_tag.len() as u16).to_le_bytes());
        config.extend_from_slice(mount_tag.as_bytes());
        Self {
            transport: VirtioMmio::new(DEVICE_ID_9P, F_MOUNT_TAG, 1, config, irq),
            server: NinePServer::new(file_system),
        }
    }

    /// Direct access to the protocol server, mainly for tests and host tooling.
    pub fn server_mut(&mut self) -> &mut NinePServer {
        &mut self.server
    }

    fn service_queue(&mut self, bus: &mut SystemBus, mut budget: u64) {
        loop {
            let chain = match self.transport.queue_mut(0).pop_chain(bus) {
                Ok(Some(chain)) => chain,
                Ok(None) => return,
                Err(error) => {
                    warn!("9p transport error: {error}");
                    self.transport.fail();
                    return;
                }
            };
            let request_len = chain.readable_len().min(MAX_MSIZE as u64) as usize;
            let request = match virtio::read_segments(bus, &chain.readable, request_len) {
                Ok(request) => request,
                Err(error) => {
                    warn!("9p transport error: {error}");
                    self.transport.fail();
                    return;
                }
            };
            let reply = self.server.handle_message(&request);
            let written = match virtio::write_segments(bus, &chain.writable, &reply) {
                Ok(written) => written,
                Err(error) => {
                    warn!("9p transport error: {error}");
                    self.transport.fail();
                    return;
                }
            };
            let used = self.transport.queue_mut(0).push_used(bus, chain.head, written);
            if let Err(error) = used {
                warn!("9p transport error: {error}");
                self.transport.fail();
                return;
            }
            self.transport.interrupt_used();
            budget = budget.saturating_sub(request.len() as u64 + reply.len() as u64);
            if budget == 0 {
                // Out of budget with work possibly left; pick the queue back up next step.
                self.transport.renotify();
                return;
            }
        }
    }
}

impl Device for NinePDevice {
    fn size(&self) -> u64 {
        0x1000
    }

    fn load(&mut self, offset: u64, size_log2: u32) -> Result<u64, MemoryAccessError> {
        self.transport.load(offset, size_log2)
    }

    fn store(&mut self, offset: u64, value: u64, size_log2: u32) -> Result<(), MemoryAccessError> {
        self.transport.store(offset, value, size_log2)
    }

    fn needs_step(&self) -> bool {
        true
    }

    fn step(&mut self, bus: &mut SystemBus, cycles: u64) {
        if !self.transport.is_running() || !self.transport.take_notification() {
            return;
        }
        let budget = (cycles * BUDGET_PER_KCYCLE / 1000).max(1);
        self.service_queue(bus, budget);
    }

    fn reset(&mut self) {
        self.transport.reset();
        self.server.reset();
    }
}

/// Server-side state of one fid.
#[derive(Debug)]
struct Fid {
    path: Vec<String>,
    handle: Option<Box<dyn FileHandle>>,
    open_directory: bool,
}

/// The protocol engine: fid table, message dispatch, and file-system-backed operations.
#[derive(Debug)]
pub struct NinePServer {
    file_system: Box<dyn FileSystem>,
    fids: HashMap<u32, Fid>,
    msize: u32,
}

impl NinePServer {
    pub fn new(file_system: Box<dyn FileSystem>) -> Self {
        Self {
            file_system,
            fids: HashMap::new(),
            msize: MAX_MSIZE,
        }
    }

    /// Drop all session state, as a transport reset does.
    pub fn reset(&mut self) {
        self.fids.clear();
        self.msize = MAX_MSIZE;
    }

    /// Handle one complete request message, returning the complete reply message.
    pub fn handle_message(&mut self, request: &[u8]) -> Vec<u8> {
        let mut reader = Reader::new(request);
        let (Some(_size), Some(id), Some(tag)) = (reader.u32(), reader.u8(), reader.u16())
        else {
            // Too short to carry a header; reply to tag 0 as an I/O error.
            return error_reply(0, errno::EIO);
        };
        trace!(id, tag; "9p request");
        let result = match id {
            msg::TVERSION => self.version(tag, &mut reader),
            msg::TATTACH => self.attach(tag, &mut reader),
            msg::TFLUSH => self.flush(tag, &mut reader),
            msg::TWALK => self.walk(tag, &mut reader),
            msg::TLOPEN => self.lopen(tag, &mut reader),
            msg::TLCREATE => self.lcreate(tag, &mut reader),
            msg::TREAD => self.read(tag, &mut reader),
            msg::TWRITE => self.write(tag, &mut reader),
            msg::TCLUNK => self.clunk(tag, &mut reader),
            msg::TSTATFS => self.statfs(tag, &mut reader),
            msg::TGETATTR => self.getattr(tag, &mut reader),
            msg::TREADDIR => self.readdir(tag, &mut reader),
            msg::TFSYNC => self.fsync(tag, &mut reader),
            msg::TMKDIR => self.mkdir(tag, &mut reader),
            msg::TRENAMEAT => self.renameat(tag, &mut reader),
            msg::TUNLINKAT => self.unlinkat(tag, &mut reader),
            other => {
                debug!(id = other; "Unsupported 9p message");
                Err(errno::ENOTSUPP)
            }
        };
        match result {
            Ok(reply) => reply,
            Err(ecode) => error_reply(tag, ecode),
        }
    }

    fn version(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let msize = reader.u32().ok_or(errno::EIO)?;
        let version = reader.string().ok_or(errno::EIO)?;
        // Starting a new session invalidates every fid of the old one.
        self.fids.clear();
        self.msize = msize.min(MAX_MSIZE);
        let mut writer = Writer::reply(msg::TVERSION + 1, tag);
        writer.u32(self.msize);
        match version.as_str() {
            "9P2000.L" => writer.string(&version),
            _ => writer.string("unknown"),
        }
        Ok(writer.finish())
    }

    fn attach(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let _afid = reader.u32().ok_or(errno::EIO)?;
        let _uname = reader.string().ok_or(errno::EIO)?;
        let _aname = reader.string().ok_or(errno::EIO)?;
        let _n_uname = reader.u32().ok_or(errno::EIO)?;
        let root: Vec<String> = Vec::new();
        let qid = self.qid_of(&root)?;
        self.fids.insert(
            fid,
            Fid {
                path: root,
                handle: None,
                open_directory: false,
            },
        );
        let mut writer = Writer::reply(msg::TATTACH + 1, tag);
        writer.qid(qid);
        Ok(writer.finish())
    }

    fn flush(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let _oldtag = reader.u16().ok_or(errno::EIO)?;
        // All requests complete synchronously, so there is never anything in flight to abort.
        Ok(Writer::reply(msg::TFLUSH + 1, tag).finish())
    }

    fn walk(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let newfid = reader.u32().ok_or(errno::EIO)?;
        let count = reader.u16().ok_or(errno::EIO)? as usize;
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            names.push(reader.string().ok_or(errno::EIO)?);
        }
        let source = self.fids.get(&fid).ok_or(errno::ENOENT)?;
        if source.handle.is_some() || source.open_directory {
            // Walking from an opened fid is not allowed.
            return Err(errno::EIO);
        }
        if newfid != fid && self.fids.contains_key(&newfid) {
            return Err(errno::EEXIST);
        }
        let mut path = source.path.clone();
        let mut qids = Vec::with_capacity(count);
        for name in &names {
            let mut next = path.clone();
            match name.as_str() {
                ".." => {
                    next.pop();
                }
                "." => {}
                _ => next.push(name.clone()),
            }
            if !self.file_system.exists(&next) {
                break;
            }
            qids.push(self.qid_of(&next)?);
            path = next;
        }
        if qids.is_empty() && count > 0 {
            // At least one segment must resolve.
            return Err(errno::ENOENT);
        }
        if qids.len() == count {
            self.fids.insert(
                newfid,
                Fid {
                    path,
                    handle: None,
                    open_directory: false,
                },
            );
        }
        let mut writer = Writer::reply(msg::TWALK + 1, tag);
        writer.u16(qids.len() as u16);
        for qid in qids {
            writer.qid(qid);
        }
        Ok(writer.finish())
    }

    fn lopen(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let flags = reader.u32().ok_or(errno::EIO)?;
        let entry = self.fids.get(&fid).ok_or(errno::ENOENT)?;
        let path = entry.path.clone();
        let qid = self.qid_of(&path)?;
        if self.file_system.is_directory(&path) {
            let entry = self.fids.get_mut(&fid).unwrap();
            entry.open_directory = true;
        } else {
            let handle = self
                .file_system
                .open(&path, translate_flags(flags))
                .map_err(fs_errno)?;
            let entry = self.fids.get_mut(&fid).unwrap();
            entry.handle = Some(handle);
        }
        let mut writer = Writer::reply(msg::TLOPEN + 1, tag);
        writer.qid(qid);
        writer.u32(0); // iounit: let the client pick
        Ok(writer.finish())
    }

    fn lcreate(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let name = reader.string().ok_or(errno::EIO)?;
        let flags = reader.u32().ok_or(errno::EIO)?;
        let _mode = reader.u32().ok_or(errno::EIO)?;
        let _gid = reader.u32().ok_or(errno::EIO)?;
        let entry = self.fids.get(&fid).ok_or(errno::ENOENT)?;
        let mut path = entry.path.clone();
        path.push(name);
        let handle = self
            .file_system
            .create(&path, translate_flags(flags))
            .map_err(fs_errno)?;
        let qid = self.qid_of(&path)?;
        // The fid now refers to the newly created, opened file.
        let entry = self.fids.get_mut(&fid).unwrap();
        entry.path = path;
        entry.handle = Some(handle);
        let mut writer = Writer::reply(msg::TLCREATE + 1, tag);
        writer.qid(qid);
        writer.u32(0);
        Ok(writer.finish())
    }

    fn read(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let offset = reader.u64().ok_or(errno::EIO)?;
        let count = reader.u32().ok_or(errno::EIO)?;
        // Clamp silently to the reply capacity, as common 9p servers do.
        let count = count.min(self.msize.saturating_sub(IO_HEADER_SIZE));
        let entry = self.fids.get_mut(&fid).ok_or(errno::ENOENT)?;
        let handle = entry.handle.as_mut().ok_or(errno::EIO)?;
        let mut buf = vec![0u8; count as usize];
        let n = handle.read(offset, &mut buf).map_err(fs_errno)?;
        let mut writer = Writer::reply(msg::TREAD + 1, tag);
        writer.u32(n as u32);
        writer.bytes(&buf[..n]);
        Ok(writer.finish())
    }

    fn write(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let offset = reader.u64().ok_or(errno::EIO)?;
        let count = reader.u32().ok_or(errno::EIO)?;
        let count = count.min(self.msize.saturating_sub(IO_HEADER_SIZE));
        let data = reader.bytes(count as usize).ok_or(errno::EIO)?.to_vec();
        let entry = self.fids.get_mut(&fid).ok_or(errno::ENOENT)?;
        let handle = entry.handle.as_mut().ok_or(errno::EIO)?;
        let n = handle.write(offset, &data).map_err(fs_errno)?;
        let mut writer = Writer::reply(msg::TWRITE + 1, tag);
        writer.u32(n as u32);
        Ok(writer.finish())
    }

    fn clunk(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        // Dropping the entry closes any open handle.
        self.fids.remove(&fid).ok_or(errno::ENOENT)?;
        Ok(Writer::reply(msg::TCLUNK + 1, tag).finish())
    }

    fn statfs(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let _fid = reader.u32().ok_or(errno::EIO)?;
        let stat = self.file_system.statfs().map_err(fs_errno)?;
        let mut writer = Writer::reply(msg::TSTATFS + 1, tag);
        writer.u32(0x0100_0000); // fs type magic: "V9FS"
        writer.u32(stat.block_size);
        writer.u64(stat.blocks);
        writer.u64(stat.blocks_free);
        writer.u64(stat.blocks_available);
        writer.u64(stat.files);
        writer.u64(stat.files_free);
        writer.u64(0); // fsid
        writer.u32(stat.max_name_length);
        Ok(writer.finish())
    }

    fn getattr(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let _request_mask = reader.u64().ok_or(errno::EIO)?;
        let entry = self.fids.get(&fid).ok_or(errno::ENOENT)?;
        let path = entry.path.clone();
        let attributes = self.file_system.attributes(&path).map_err(fs_errno)?;
        let qid = qid_from_attributes(&attributes);
        let mut writer = Writer::reply(msg::TGETATTR + 1, tag);
        writer.u64(0x0000_07FF); // valid: the basic fields
        writer.qid(qid);
        writer.u32(attributes.mode);
        writer.u32(0); // uid
        writer.u32(0); // gid
        writer.u64(attributes.nlink);
        writer.u64(0); // rdev
        writer.u64(attributes.size);
        writer.u64(4096); // blksize
        writer.u64(attributes.size.div_ceil(512)); // blocks
        writer.u64(attributes.atime_sec);
        writer.u64(0);
        writer.u64(attributes.mtime_sec);
        writer.u64(0);
        writer.u64(attributes.ctime_sec);
        writer.u64(0);
        writer.u64(0); // btime sec/nsec
        writer.u64(0);
        writer.u64(0); // gen
        writer.u64(0); // data_version
        Ok(writer.finish())
    }

    fn readdir(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let offset = reader.u64().ok_or(errno::EIO)?;
        let count = reader.u32().ok_or(errno::EIO)?;
        let count = count.min(self.msize.saturating_sub(IO_HEADER_SIZE));
        let entry = self.fids.get(&fid).ok_or(errno::ENOENT)?;
        if !entry.open_directory {
            return Err(errno::EIO);
        }
        let path = entry.path.clone();
        let entries = self.file_system.readdir(&path).map_err(fs_errno)?;
        let mut writer = Writer::reply(msg::TREADDIR + 1, tag);
        writer.u32(0); // patched below
        let data_start = writer.len();
        for (index, dir_entry) in entries.iter().enumerate().skip(offset as usize) {
            // {qid, offset, type, name}; offset is the position of the *next* entry.
            let entry_size = 13 + 8 + 1 + 2 + dir_entry.name.len();
            if writer.len() - data_start + entry_size > count as usize {
                break;
            }
            let (kind, dirent_type) = match dir_entry.directory {
                true => (qid_type::DIRECTORY, 4), // DT_DIR
                false => (qid_type::FILE, 8),     // DT_REG
            };
            writer.qid(Qid {
                kind,
                version: 0,
                path: dir_entry.unique_id,
            });
            writer.u64(index as u64 + 1);
            writer.u8(dirent_type);
            writer.string(&dir_entry.name);
        }
        let data_len = (writer.len() - data_start) as u32;
        let mut reply = writer.finish();
        reply[HEADER_SIZE as usize..HEADER_SIZE as usize + 4]
            .copy_from_slice(&data_len.to_le_bytes());
        Ok(reply)
    }

    fn fsync(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let fid = reader.u32().ok_or(errno::EIO)?;
        let entry = self.fids.get_mut(&fid).ok_or(errno::ENOENT)?;
        if let Some(handle) = entry.handle.as_mut() {
            handle.sync().map_err(fs_errno)?;
        }
        Ok(Writer::reply(msg::TFSYNC + 1, tag).finish())
    }

    fn mkdir(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let dfid = reader.u32().ok_or(errno::EIO)?;
        let name = reader.string().ok_or(errno::EIO)?;
        let _mode = reader.u32().ok_or(errno::EIO)?;
        let _gid = reader.u32().ok_or(errno::EIO)?;
        let entry = self.fids.get(&dfid).ok_or(errno::ENOENT)?;
        let mut path = entry.path.clone();
        path.push(name);
        self.file_system.mkdir(&path).map_err(fs_errno)?;
        let qid = self.qid_of(&path)?;
        let mut writer = Writer::reply(msg::TMKDIR + 1, tag);
        writer.qid(qid);
        Ok(writer.finish())
    }

    fn renameat(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let olddirfid = reader.u32().ok_or(errno::EIO)?;
        let oldname = reader.string().ok_or(errno::EIO)?;
        let newdirfid = reader.u32().ok_or(errno::EIO)?;
        let newname = reader.string().ok_or(errno::EIO)?;
        let mut from = self.fids.get(&olddirfid).ok_or(errno::ENOENT)?.path.clone();
        from.push(oldname);
        let mut to = self.fids.get(&newdirfid).ok_or(errno::ENOENT)?.path.clone();
        to.push(newname);
        self.file_system.rename(&from, &to).map_err(fs_errno)?;
        Ok(Writer::reply(msg::TRENAMEAT + 1, tag).finish())
    }

    fn unlinkat(&mut self, tag: u16, reader: &mut Reader) -> Result<Vec<u8>, u32> {
        let dirfid = reader.u32().ok_or(errno::EIO)?;
        let name = reader.string().ok_or(errno::EIO)?;
        let _flags = reader.u32().ok_or(errno::EIO)?;
        let mut path = self.fids.get(&dirfid).ok_or(errno::ENOENT)?.path.clone();
        path.push(name);
        self.file_system.unlink(&path).map_err(fs_errno)?;
        Ok(Writer::reply(msg::TUNLINKAT + 1, tag).finish())
    }

    fn qid_of(&self, path: &[String]) -> Result<Qid, u32> {
        let attributes = self.file_system.attributes(path).map_err(fs_errno)?;
        Ok(qid_from_attributes(&attributes))
    }
}

fn qid_from_attributes(attributes: &fs::FileAttributes) -> Qid {
    let kind = match (attributes.directory, attributes.symlink) {
        (true, _) => qid_type::DIRECTORY,
        (_, true) => qid_type::SYMLINK,
        _ => qid_type::FILE,
    };
    Qid {
        kind,
        version: 0,
        path: attributes.unique_id,
    }
}

/// Translate Linux open(2) flags to backend flags: write-only means write, read-write means
/// read and write, truncate requires write, anything else reads.
fn translate_flags(flags: u32) -> OpenFlags {
    let (read, write) = match flags & 0b11 {
        1 => (false, true),
        2 => (true, true),
        _ => (true, false),
    };
    OpenFlags {
        read,
        write,
        truncate: write && flags & 0x200 != 0,
    }
}

fn fs_errno(error: FsError) -> u32 {
    match error {
        FsError::PermissionDenied => errno::EPERM,
        FsError::NotFound => errno::ENOENT,
        FsError::AlreadyExists => errno::EEXIST,
        FsError::NotADirectory => errno::ENOTDIR,
        FsError::NotEmpty => errno::ENOTEMPTY,
        FsError::Unsupported => errno::ENOTSUPP,
        FsError::Io => errno::EIO,
    }
}

fn error_reply(tag: u16, ecode: u32) -> Vec<u8> {
    let mut writer = Writer::reply(msg::RLERROR, tag);
    writer.u32(ecode);
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::fs::{
        DirEntry, FileAttributes, FileHandle, FileSystem, FsError, FsPath, FsResult, OpenFlags,
        StatFs,
    };
    use super::*;

    /// In-memory file-system fake: a flat set of files plus directories.
    #[derive(Debug, Default)]
    struct MockFs {
        files: HashMap<String, Vec<u8>>,
        directories: Vec<String>,
    }

    impl MockFs {
        fn with_file(name: &str, content: &[u8]) -> Self {
            let mut fs = Self::default();
            fs.files.insert(name.to_owned(), content.to_vec());
            fs
        }

        fn key(path: &FsPath) -> String {
            path.join("/")
        }
    }

    #[derive(Debug)]
    struct MockHandle {
        content: Vec<u8>,
    }

    impl FileHandle for MockHandle {
        fn read(&mut self, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
            let start = (offset as usize).min(self.content.len());
            let n = buf.len().min(self.content.len() - start);
            buf[..n].copy_from_slice(&self.content[start..start + n]);
            Ok(n)
        }

        fn write(&mut self, offset: u64, buf: &[u8]) -> FsResult<usize> {
            let end = offset as usize + buf.len();
            if self.content.len() < end {
                self.content.resize(end, 0);
            }
            self.content[offset as usize..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    impl FileSystem for MockFs {
        fn statfs(&self) -> FsResult<StatFs> {
            Ok(StatFs {
                block_size: 512,
                blocks: 100,
                blocks_free: 50,
                blocks_available: 50,
                files: 10,
                files_free: 5,
                max_name_length: 255,
            })
        }

        fn exists(&self, path: &FsPath) -> bool {
            path.is_empty()
                || self.files.contains_key(&Self::key(path))
                || self.directories.contains(&Self::key(path))
        }

        fn is_directory(&self, path: &FsPath) -> bool {
            path.is_empty() || self.directories.contains(&Self::key(path))
        }

        fn is_readable(&self, path: &FsPath) -> bool {
            self.exists(path)
        }

        fn is_writable(&self, path: &FsPath) -> bool {
            self.exists(path)
        }

        fn is_executable(&self, path: &FsPath) -> bool {
            self.is_directory(path)
        }

        fn attributes(&self, path: &FsPath) -> FsResult<FileAttributes> {
            if !self.exists(path) {
                return Err(FsError::NotFound);
            }
            let directory = self.is_directory(path);
            Ok(FileAttributes {
                directory,
                symlink: false,
                mode: if directory { 0o040755 } else { 0o100644 },
                nlink: 1,
                size: self
                    .files
                    .get(&Self::key(path))
                    .map(|c| c.len() as u64)
                    .unwrap_or(0),
                unique_id: self.unique_id(path)?,
                atime_sec: 0,
                mtime_sec: 0,
                ctime_sec: 0,
            })
        }

        fn unique_id(&self, path: &FsPath) -> FsResult<u64> {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            Self::key(path).hash(&mut hasher);
            Ok(hasher.finish())
        }

        fn open(&mut self, path: &FsPath, _flags: OpenFlags) -> FsResult<Box<dyn FileHandle>> {
            let content = self
                .files
                .get(&Self::key(path))
                .ok_or(FsError::NotFound)?
                .clone();
            Ok(Box::new(MockHandle { content }))
        }

        fn create(&mut self, path: &FsPath, _flags: OpenFlags) -> FsResult<Box<dyn FileHandle>> {
            let key = Self::key(path);
            if self.files.contains_key(&key) {
                return Err(FsError::AlreadyExists);
            }
            self.files.insert(key, Vec::new());
            Ok(Box::new(MockHandle {
                content: Vec::new(),
            }))
        }

        fn readdir(&self, path: &FsPath) -> FsResult<Vec<DirEntry>> {
            if !self.is_directory(path) {
                return Err(FsError::NotADirectory);
            }
            let mut entries: Vec<DirEntry> = self
                .files
                .keys()
                .map(|name| DirEntry {
                    name: name.clone(),
                    directory: false,
                    unique_id: 1,
                })
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        }

        fn mkdir(&mut self, path: &FsPath) -> FsResult<()> {
            self.directories.push(Self::key(path));
            Ok(())
        }

        fn rename(&mut self, from: &FsPath, to: &FsPath) -> FsResult<()> {
            let content = self
                .files
                .remove(&Self::key(from))
                .ok_or(FsError::NotFound)?;
            self.files.insert(Self::key(to), content);
            Ok(())
        }

        fn unlink(&mut self, path: &FsPath) -> FsResult<()> {
            self.files
                .remove(&Self::key(path))
                .map(|_| ())
                .ok_or(FsError::NotFound)
        }
    }

    fn request(id: u8, tag: u16, payload: impl FnOnce(&mut Writer)) -> Vec<u8> {
        let mut writer = Writer::reply(id, tag);
        payload(&mut writer);
        writer.finish()
    }

    fn server_with_file() -> NinePServer {
        NinePServer::new(Box::new(MockFs::with_file("hello.txt", b"hello world")))
    }

    fn attach(server: &mut NinePServer, fid: u32) {
        let reply = server.handle_message(&request(msg::TATTACH, 1, |w| {
            w.u32(fid);
            w.u32(u32::MAX);
            w.string("root");
            w.string("");
            w.u32(0);
        }));
        assert_eq!(msg::TATTACH + 1, reply[4]);
    }

    #[test]
    fn test_version_handshake() {
        let mut server = server_with_file();
        let reply = server.handle_message(&request(msg::TVERSION, 0xFFFF, |w| {
            w.u32(8192);
            w.string("9P2000.L");
        }));
        // {size=19, id=101, tag=0xFFFF, msize=8192, version="9P2000.L"}
        assert_eq!(19, u32::from_le_bytes(reply[..4].try_into().unwrap()));
        assert_eq!(msg::TVERSION + 1, reply[4]);
        assert_eq!([0xFF, 0xFF], reply[5..7]);
        assert_eq!(8192, u32::from_le_bytes(reply[7..11].try_into().unwrap()));
        assert_eq!(b"9P2000.L", &reply[13..21]);
    }

    #[test]
    fn test_version_clamps_msize_and_clunks_fids() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        assert!(server.fids.contains_key(&0));
        let reply = server.handle_message(&request(msg::TVERSION, 0, |w| {
            w.u32(1 << 20);
            w.string("9P2000.L");
        }));
        assert_eq!(8192, u32::from_le_bytes(reply[7..11].try_into().unwrap()));
        assert!(server.fids.is_empty());
    }

    #[test]
    fn test_walk_read_clunk() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        let reply = server.handle_message(&request(msg::TWALK, 2, |w| {
            w.u32(0);
            w.u32(1);
            w.u16(1);
            w.string("hello.txt");
        }));
        assert_eq!(msg::TWALK + 1, reply[4]);
        assert_eq!(1, u16::from_le_bytes(reply[7..9].try_into().unwrap()));

        let reply = server.handle_message(&request(msg::TLOPEN, 3, |w| {
            w.u32(1);
            w.u32(0); // O_RDONLY
        }));
        assert_eq!(msg::TLOPEN + 1, reply[4]);

        let reply = server.handle_message(&request(msg::TREAD, 4, |w| {
            w.u32(1);
            w.u64(6);
            w.u32(100);
        }));
        assert_eq!(msg::TREAD + 1, reply[4]);
        assert_eq!(5, u32::from_le_bytes(reply[7..11].try_into().unwrap()));
        assert_eq!(b"world", &reply[11..16]);

        let reply = server.handle_message(&request(msg::TCLUNK, 5, |w| {
            w.u32(1);
        }));
        assert_eq!(msg::TCLUNK + 1, reply[4]);
        assert!(!server.fids.contains_key(&1));
    }

    #[test]
    fn test_walk_rejects_open_fid_and_taken_newfid() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        attach(&mut server, 7);
        // newfid already in use
        let reply = server.handle_message(&request(msg::TWALK, 2, |w| {
            w.u32(0);
            w.u32(7);
            w.u16(0);
        }));
        assert_eq!(msg::RLERROR, reply[4]);
        // source fid opened
        server.handle_message(&request(msg::TLOPEN, 3, |w| {
            w.u32(0);
            w.u32(0);
        }));
        let reply = server.handle_message(&request(msg::TWALK, 4, |w| {
            w.u32(0);
            w.u32(9);
            w.u16(0);
        }));
        assert_eq!(msg::RLERROR, reply[4]);
    }

    #[test]
    fn test_walk_partial_success() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        let reply = server.handle_message(&request(msg::TWALK, 2, |w| {
            w.u32(0);
            w.u32(1);
            w.u16(2);
            w.string("hello.txt");
            w.string("nope");
        }));
        assert_eq!(msg::TWALK + 1, reply[4]);
        // Only one of the two segments resolved; the new fid is not bound.
        assert_eq!(1, u16::from_le_bytes(reply[7..9].try_into().unwrap()));
        assert!(!server.fids.contains_key(&1));

        let reply = server.handle_message(&request(msg::TWALK, 3, |w| {
            w.u32(0);
            w.u32(1);
            w.u16(1);
            w.string("nope");
        }));
        assert_eq!(msg::RLERROR, reply[4]);
        assert_eq!(
            errno::ENOENT,
            u32::from_le_bytes(reply[7..11].try_into().unwrap())
        );
    }

    #[test]
    fn test_write_and_create() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        let reply = server.handle_message(&request(msg::TLCREATE, 2, |w| {
            w.u32(0);
            w.string("new.txt");
            w.u32(0x241); // O_WRONLY | O_CREAT | O_TRUNC
            w.u32(0o644);
            w.u32(0);
        }));
        assert_eq!(msg::TLCREATE + 1, reply[4]);
        let reply = server.handle_message(&request(msg::TWRITE, 3, |w| {
            w.u32(0);
            w.u64(0);
            w.u32(3);
            w.bytes(b"abc");
        }));
        assert_eq!(msg::TWRITE + 1, reply[4]);
        assert_eq!(3, u32::from_le_bytes(reply[7..11].try_into().unwrap()));
    }

    #[test]
    fn test_unsupported_message() {
        let mut server = server_with_file();
        let reply = server.handle_message(&request(16 /* TSYMLINK */, 9, |w| {
            w.u32(0);
        }));
        assert_eq!(msg::RLERROR, reply[4]);
        assert_eq!(
            errno::ENOTSUPP,
            u32::from_le_bytes(reply[7..11].try_into().unwrap())
        );
    }

    #[test]
    fn test_reply_id_is_request_plus_one() {
        let mut server = server_with_file();
        for (id, build) in [
            (msg::TVERSION, {
                let f: fn(&mut Writer) = |w| {
                    w.u32(8192);
                    w.string("9P2000.L");
                };
                f
            }),
            (msg::TSTATFS, {
                let f: fn(&mut Writer) = |w| w.u32(0);
                f
            }),
        ] {
            attach(&mut server, 0);
            let reply = server.handle_message(&request(id, 42, build));
            assert_eq!(id + 1, reply[4]);
            assert_eq!(42, u16::from_le_bytes(reply[5..7].try_into().unwrap()));
        }
    }

    #[test]
    fn test_transport_round_trip() {
        use crate::devices::memory::Memory;

        const MMIO: u64 = 0x1000_0000;
        const RAM: u64 = 0x8000_0000;
        const DESC: u64 = RAM;
        const AVAIL: u64 = RAM + 0x1000;
        const USED: u64 = RAM + 0x2000;
        const REQUEST: u64 = RAM + 0x3000;
        const REPLY: u64 = RAM + 0x4000;

        let mut bus = SystemBus::new();
        bus.add_device(RAM, Box::new(Memory::new(0x1_0000))).unwrap();
        let device = NinePDevice::new("share", Box::new(MockFs::default()), None);
        bus.add_device(MMIO, Box::new(device)).unwrap();

        // Magic and device type are readable before initialization.
        assert_eq!(0x7472_6976, bus.load(MMIO, 2).unwrap());
        assert_eq!(DEVICE_ID_9P as u64, bus.load(MMIO + 0x8, 2).unwrap());
        // Mount tag in the config space: {tag_len, tag}.
        assert_eq!(5, bus.load(MMIO + 0x100, 1).unwrap());
        assert_eq!(b's' as u64, bus.load(MMIO + 0x102, 0).unwrap());

        // Driver setup: queue 0 with an 8-entry ring.
        bus.store(MMIO + 0x30, 0, 2).unwrap(); // QueueSel
        bus.store(MMIO + 0x38, 8, 2).unwrap(); // QueueNum
        bus.store(MMIO + 0x80, DESC, 2).unwrap();
        bus.store(MMIO + 0x90, AVAIL, 2).unwrap();
        bus.store(MMIO + 0xA0, USED, 2).unwrap();
        bus.store(MMIO + 0x44, 1, 2).unwrap(); // QueueReady
        bus.store(MMIO + 0x70, 4, 2).unwrap(); // Status = DRIVER_OK

        // The version request in guest memory.
        let message = request(msg::TVERSION, 0xFFFF, |w| {
            w.u32(8192);
            w.string("9P2000.L");
        });
        for (i, &byte) in message.iter().enumerate() {
            bus.store(REQUEST + i as u64, byte as u64, 0).unwrap();
        }
        // Descriptor chain: readable request, then a writable reply buffer.
        bus.store(DESC, REQUEST, 3).unwrap();
        bus.store(DESC + 8, message.len() as u64, 2).unwrap();
        bus.store(DESC + 12, 1, 1).unwrap(); // NEXT
        bus.store(DESC + 14, 1, 1).unwrap();
        bus.store(DESC + 16, REPLY, 3).unwrap();
        bus.store(DESC + 24, 64, 2).unwrap();
        bus.store(DESC + 28, 2, 1).unwrap(); // WRITE
        // Publish the chain and notify.
        bus.store(AVAIL + 4, 0, 1).unwrap();
        bus.store(AVAIL + 2, 1, 1).unwrap();
        bus.store(MMIO + 0x50, 0, 2).unwrap(); // QueueNotify

        bus.step_devices(1000);

        // The chain was consumed and the reply written back in place.
        assert_eq!(1, bus.load(USED + 2, 1).unwrap());
        assert_eq!(19, bus.load(USED + 8, 2).unwrap());
        assert_eq!(19, bus.load(REPLY, 2).unwrap());
        assert_eq!((msg::TVERSION + 1) as u64, bus.load(REPLY + 4, 0).unwrap());
        assert_eq!(0xFFFF, bus.load(REPLY + 5, 1).unwrap());
        assert_eq!(8192, bus.load(REPLY + 7, 2).unwrap());
        // The used-buffer interrupt is visible in the status register.
        assert_eq!(1, bus.load(MMIO + 0x60, 2).unwrap());
    }

    #[test]
    fn test_readdir() {
        let mut server = server_with_file();
        attach(&mut server, 0);
        server.handle_message(&request(msg::TLOPEN, 2, |w| {
            w.u32(0);
            w.u32(0);
        }));
        let reply = server.handle_message(&request(msg::TREADDIR, 3, |w| {
            w.u32(0);
            w.u64(0);
            w.u32(1024);
        }));
        assert_eq!(msg::TREADDIR + 1, reply[4]);
        let count = u32::from_le_bytes(reply[7..11].try_into().unwrap());
        assert!(count > 0);
        // Entry: qid(13) + offset(8) + type(1) + name; check the name round-trips.
        let name_len = u16::from_le_bytes(reply[33..35].try_into().unwrap()) as usize;
        assert_eq!(b"hello.txt", &reply[35..35 + name_len]);
    }
}
