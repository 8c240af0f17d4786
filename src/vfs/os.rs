//! vfs/os — производственная реализация VFS поверх std::fs + fs2.
//!
//! Блокировки: advisory-локи fs2.
//! - Shared/Exclusive — flock на самом файле базы;
//! - Reserved — эксклюзивный flock на sidecar-файле `<path>-reserved`
//!   (его наличие проверяет check_reserved_lock других процессов);
//! - Pending отдельного слота не имеет: ОС ставит эксклюзивный запрос
//!   в очередь при переходе Shared → Exclusive.
//!
//! Все захваты неблокирующие (try_*); занято — `Error::Busy`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::consts::DEFAULT_SECTOR_SIZE;
use crate::error::{from_io, Error, Result};
use crate::util::now_local;

use super::{LockLevel, OpenMode, SyncMode, Vfs, VfsFile};

const RESERVED_SUFFIX: &str = "-reserved";

#[derive(Debug, Default)]
pub struct OsVfs;

pub struct OsFile {
    file: File,
    path: PathBuf,
    level: LockLevel,
    // Дескриптор sidecar-файла Reserved; держится, пока мы писатель.
    reserved: Option<File>,
}

fn reserved_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(RESERVED_SUFFIX);
    PathBuf::from(s)
}

fn open_reserved(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(reserved_path(path))
        .map_err(from_io)
}

fn busy_or_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_eagain()) {
        Error::Busy
    } else {
        from_io(e)
    }
}

// fs2 сообщает о занятой блокировке EWOULDBLOCK/EAGAIN
#[cfg(unix)]
fn libc_eagain() -> i32 {
    11
}
#[cfg(not(unix))]
fn libc_eagain() -> i32 {
    -1
}

impl OsFile {
    fn lock_shared_file(&mut self) -> Result<()> {
        fs2::FileExt::try_lock_shared(&self.file).map_err(busy_or_io)
    }

    fn lock_exclusive_file(&mut self) -> Result<()> {
        fs2::FileExt::try_lock_exclusive(&self.file).map_err(busy_or_io)
    }

    fn take_reserved(&mut self) -> Result<()> {
        if self.reserved.is_some() {
            return Ok(());
        }
        let f = open_reserved(&self.path)?;
        fs2::FileExt::try_lock_exclusive(&f).map_err(busy_or_io)?;
        self.reserved = Some(f);
        Ok(())
    }

    fn drop_reserved(&mut self) {
        if let Some(f) = self.reserved.take() {
            let _ = f.unlock();
        }
    }
}

impl VfsFile for OsFile {
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize> {
        self.file.seek(SeekFrom::Start(off)).map_err(from_io)?;
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(from_io(e)),
            }
        }
        Ok(done)
    }

    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(off)).map_err(from_io)?;
        self.file.write_all(buf).map_err(from_io)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size).map_err(from_io)
    }

    fn sync(&mut self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::DataOnly => self.file.sync_data().map_err(from_io),
            SyncMode::Normal | SyncMode::Full => self.file.sync_all().map_err(from_io),
        }
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata().map_err(from_io)?.len())
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        if level <= self.level {
            return Ok(());
        }
        match level {
            LockLevel::Shared => {
                self.lock_shared_file()?;
            }
            LockLevel::Reserved => {
                if self.level < LockLevel::Shared {
                    self.lock_shared_file()?;
                }
                self.take_reserved()?;
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if self.reserved.is_none() {
                    self.take_reserved()?;
                }
                self.lock_exclusive_file()?;
                self.level = LockLevel::Exclusive;
                return Ok(());
            }
            LockLevel::None => {}
        }
        self.level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        if level >= self.level {
            return Ok(());
        }
        match level {
            LockLevel::None => {
                self.drop_reserved();
                let _ = self.file.unlock();
            }
            LockLevel::Shared => {
                self.drop_reserved();
                if self.level >= LockLevel::Exclusive {
                    // flock позволяет конвертацию Exclusive -> Shared
                    fs2::FileExt::try_lock_shared(&self.file).map_err(busy_or_io)?;
                }
            }
            _ => return Err(Error::Invalid("unlock target must be None or Shared")),
        }
        self.level = level;
        Ok(())
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        if self.reserved.is_some() {
            return Ok(true);
        }
        let f = open_reserved(&self.path)?;
        match fs2::FileExt::try_lock_exclusive(&f) {
            Ok(()) => {
                let _ = f.unlock();
                Ok(false)
            }
            Err(e) => match busy_or_io(e) {
                Error::Busy => Ok(true),
                other => Err(other),
            },
        }
    }

    fn lock_level(&self) -> LockLevel {
        self.level
    }

    fn sector_size(&self) -> usize {
        DEFAULT_SECTOR_SIZE
    }
}

impl Vfs for OsVfs {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn VfsFile>> {
        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::ReadOnly => {
                opts.read(true);
            }
            OpenMode::ReadWrite => {
                opts.read(true).write(true);
            }
            OpenMode::Create => {
                opts.read(true).write(true).create(true);
            }
        }
        let file = opts.open(path).map_err(from_io)?;
        Ok(Box::new(OsFile {
            file,
            path: path.to_path_buf(),
            level: LockLevel::None,
            reserved: None,
        }))
    }

    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(from_io(e)),
        }
        if sync_dir {
            let _ = fsync_parent_dir(path);
        }
        Ok(())
    }

    fn access(&self, path: &Path) -> bool {
        path.exists()
    }

    fn full_path(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        let cwd = std::env::current_dir().map_err(from_io)?;
        Ok(cwd.join(path))
    }

    fn sleep(&self, micros: u64) {
        std::thread::sleep(std::time::Duration::from_micros(micros));
    }

    fn current_time(&self) -> NaiveDateTime {
        now_local()
    }

    fn mmap(&self, path: &Path) -> Result<Option<memmap2::Mmap>> {
        let f = File::open(path).map_err(from_io)?;
        // Safety: отображение read-only; файл под Shared-блокировкой,
        // писатель мутирует его только под Exclusive.
        let map = unsafe { memmap2::Mmap::map(&f) }.map_err(from_io)?;
        Ok(Some(map))
    }
}

// Best-effort fsync каталога после unlink (Unix). На прочих платформах — no-op.
#[cfg(unix)]
fn fsync_parent_dir(p: &Path) -> std::io::Result<()> {
    if let Some(parent) = p.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_parent_dir(_p: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn unique_path(prefix: &str) -> PathBuf {
        let pid = std::process::id();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("quill-vfs-{}-{}-{}", prefix, pid, t))
    }

    #[test]
    fn rw_roundtrip_and_size() {
        let path = unique_path("rw");
        let vfs = OsVfs;
        let mut f = vfs.open(&path, OpenMode::Create).unwrap();
        f.write_at(b"hello", 0).unwrap();
        f.write_at(b"world", 100).unwrap();
        assert_eq!(f.size().unwrap(), 105);

        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&mut buf, 100).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // Короткое чтение на конце файла
        let mut big = [0u8; 32];
        assert_eq!(f.read_at(&mut big, 100).unwrap(), 5);

        f.truncate(5).unwrap();
        assert_eq!(f.size().unwrap(), 5);

        drop(f);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reserved_lock_visible_to_second_handle() {
        let path = unique_path("lock");
        let vfs = OsVfs;
        let mut w = vfs.open(&path, OpenMode::Create).unwrap();
        w.lock(LockLevel::Shared).unwrap();
        w.lock(LockLevel::Reserved).unwrap();

        let mut r = vfs.open(&path, OpenMode::ReadWrite).unwrap();
        assert!(r.check_reserved_lock().unwrap());
        // Второй писатель не проходит
        assert!(matches!(r.lock(LockLevel::Reserved), Err(Error::Busy)));
        // А читатель — да
        r.lock(LockLevel::Shared).unwrap();

        w.unlock(LockLevel::Shared).unwrap();
        assert!(!r.check_reserved_lock().unwrap());

        drop(w);
        drop(r);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(reserved_path(&path));
    }
}
