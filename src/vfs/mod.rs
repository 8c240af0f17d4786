//! vfs — абстракция файловой системы, потребляемая pager'ом.
//!
//! Контракт:
//! - байтовый ввод/вывод по смещению (read_at/write_at/truncate/sync/size);
//! - лестница блокировок None < Shared < Reserved < Pending < Exclusive
//!   (Shared совместим между процессами; Exclusive обязателен для записи
//!   в файл базы; Reserved помечает единственного писателя);
//! - размер сектора, существование/удаление файлов, канонизация пути,
//!   sleep и текущее время.
//!
//! Захват блокировки не ждёт: недоступная блокировка — это `Error::Busy`,
//! повтор организует busy-handler уровнем выше.

pub mod os;

pub use os::OsVfs;

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::consts::DEFAULT_SECTOR_SIZE;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Normal,
    Full,
    DataOnly,
}

/// Уровни блокировки файла базы, по возрастанию.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

/// Режим открытия файла.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// ReadWrite + создать при отсутствии.
    Create,
}

/// Открытый файл: байтовый I/O + блокировки.
pub trait VfsFile {
    /// Прочитать до buf.len() байт со смещения off. Возвращает число
    /// прочитанных байт (меньше запрошенного только на конце файла).
    fn read_at(&mut self, buf: &mut [u8], off: u64) -> Result<usize>;

    fn write_at(&mut self, buf: &[u8], off: u64) -> Result<()>;

    fn truncate(&mut self, size: u64) -> Result<()>;

    fn sync(&mut self, mode: SyncMode) -> Result<()>;

    fn size(&self) -> Result<u64>;

    /// Поднять блокировку до уровня `level`. Никогда не ждёт: если
    /// блокировка занята — `Error::Busy`.
    fn lock(&mut self, level: LockLevel) -> Result<()>;

    /// Опустить блокировку до уровня `level` (None или Shared).
    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    /// Держит ли кто-либо (включая нас) блокировку Reserved или выше.
    fn check_reserved_lock(&mut self) -> Result<bool>;

    fn lock_level(&self) -> LockLevel;

    fn sector_size(&self) -> usize {
        DEFAULT_SECTOR_SIZE
    }
}

/// Файловая система.
pub trait Vfs {
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn VfsFile>>;

    /// Удалить файл; sync_dir — зафиксировать удаление в каталоге.
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<()>;

    fn access(&self, path: &Path) -> bool;

    fn full_path(&self, path: &Path) -> Result<PathBuf>;

    fn sleep(&self, micros: u64);

    fn current_time(&self) -> NaiveDateTime;

    /// Read-only отображение файла в память, если реализация умеет.
    fn mmap(&self, _path: &Path) -> Result<Option<memmap2::Mmap>> {
        Ok(None)
    }
}
