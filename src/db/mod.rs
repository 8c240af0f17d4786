//! db — хэндл базы: флаги открытия, конфигурация, жизненный цикл,
//! транзакции и словарь коллекций.
//!
//! Хэндл владеет pager'ом и KV-движком; коллекции кэшируются по имени
//! на всё время жизни хэндла. Скриптовой машине (внешнему координатору)
//! отдаётся фиксированный набор операций над коллекциями — см. collections.rs.
//!
//! Каждая восстановимая ошибка дополнительно пишется строкой в журнал
//! ошибок хэндла (err_log).

pub mod collections;
pub mod doctor;
pub mod kv;

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::collection::Collection;
use crate::consts::{
    DEFAULT_PAGE_SIZE, DEFAULT_SPILL_THRESHOLD, KV_NAME_LHASH, KV_NAME_MEM, MEMORY_DB_PATH,
    MIN_PAGE_CACHE,
};
use crate::error::{Error, Result};
use crate::kv::lhash::LhashKv;
use crate::kv::mem::MemKv;
use crate::kv::KvEngine;
use crate::pager::{BusyHandler, Pager, PagerOpts};
use crate::util::now_local;
use crate::vfs::{OsVfs, Vfs};

// ---- Флаги открытия ----

pub const OPEN_READONLY: u32 = 0x0001;
pub const OPEN_READWRITE: u32 = 0x0002;
pub const OPEN_CREATE: u32 = 0x0004;
pub const OPEN_EXCLUSIVE: u32 = 0x0008; // зарезервирован
pub const OPEN_TEMP_DB: u32 = 0x0010;
pub const OPEN_NOMUTEX: u32 = 0x0020;
pub const OPEN_OMIT_JOURNALING: u32 = 0x0040;
pub const OPEN_IN_MEMORY: u32 = 0x0080;
pub const OPEN_MMAP: u32 = 0x0100;

/// Санитизация флагов открытия.
pub fn sanitize_open_flags(mut flags: u32) -> u32 {
    flags &= !OPEN_EXCLUSIVE;
    if flags & OPEN_TEMP_DB != 0 {
        flags |= OPEN_OMIT_JOURNALING | OPEN_CREATE;
    }
    if flags & (OPEN_READONLY | OPEN_READWRITE) == 0 {
        flags |= OPEN_READWRITE;
    }
    if flags & OPEN_CREATE != 0 {
        flags &= !(OPEN_MMAP | OPEN_READONLY);
        flags |= OPEN_READWRITE;
    } else if flags & OPEN_READONLY != 0 {
        flags &= !OPEN_READWRITE;
    } else if flags & OPEN_READWRITE != 0 {
        flags &= !OPEN_MMAP;
    }
    flags
}

/// Встроенные KV-движки.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Линейное хеширование на страницах (дисковый, по умолчанию).
    Hash,
    /// Хеш-таблица в памяти.
    Mem,
}

/// Параметры открытия; собираются builder-цепочкой и передаются в
/// Db::open_with.
pub struct DbOptions {
    flags: u32,
    page_size: usize,
    engine: Option<EngineKind>,
    custom_engine: Option<Box<dyn KvEngine>>,
    vfs: Option<Box<dyn Vfs>>,
    max_page_cache: usize,
    spill_threshold: usize,
    disable_auto_commit: bool,
    busy_handler: Option<BusyHandler>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            flags: OPEN_CREATE,
            page_size: DEFAULT_PAGE_SIZE,
            engine: None,
            custom_engine: None,
            vfs: None,
            max_page_cache: MIN_PAGE_CACHE,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            disable_auto_commit: false,
            busy_handler: None,
        }
    }
}

impl DbOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn page_size(mut self, ps: usize) -> Self {
        self.page_size = ps;
        self
    }

    /// Принудительный выбор встроенного движка (для существующей базы
    /// решает её заголовок).
    pub fn kv_engine(mut self, kind: EngineKind) -> Self {
        self.engine = Some(kind);
        self
    }

    /// Внешний KV-движок; имеет приоритет над kv_engine().
    pub fn custom_engine(mut self, engine: Box<dyn KvEngine>) -> Self {
        self.custom_engine = Some(engine);
        self
    }

    pub fn vfs(mut self, vfs: Box<dyn Vfs>) -> Self {
        self.vfs = Some(vfs);
        self
    }

    /// Ёмкость кэша страниц (не меньше 256).
    pub fn max_page_cache(mut self, pages: usize) -> Self {
        self.max_page_cache = pages.max(MIN_PAGE_CACHE);
        self
    }

    /// Порог hot-dirty страниц до спила.
    pub fn spill_threshold(mut self, pages: usize) -> Self {
        self.spill_threshold = pages.max(1);
        self
    }

    pub fn disable_auto_commit(mut self, on: bool) -> Self {
        self.disable_auto_commit = on;
        self
    }

    /// Обработчик занятых блокировок: true — повторить захват.
    pub fn busy_handler(mut self, h: BusyHandler) -> Self {
        self.busy_handler = Some(h);
        self
    }
}

pub struct Db {
    pub(crate) pager: Pager,
    pub(crate) engine: Box<dyn KvEngine>,
    pub(crate) collections: HashMap<String, Collection>,
    err_log: Vec<String>,
    disable_auto_commit: bool,
    pub(crate) read_only: bool,
}

impl Db {
    /// Открыть базу с флагами по умолчанию для остальных параметров.
    pub fn open<P: AsRef<Path>>(path: P, flags: u32) -> Result<Self> {
        Self::open_with(path, DbOptions::new().flags(flags))
    }

    pub fn open_with<P: AsRef<Path>>(path: P, mut opts: DbOptions) -> Result<Self> {
        let path = path.as_ref();
        let flags = sanitize_open_flags(opts.flags);
        let in_memory = flags & (OPEN_IN_MEMORY | OPEN_TEMP_DB) != 0
            || path.as_os_str() == MEMORY_DB_PATH;
        let read_only = flags & OPEN_READONLY != 0;

        let pager_opts = PagerOpts {
            page_size: opts.page_size,
            read_only,
            create: flags & OPEN_CREATE != 0,
            omit_journaling: flags & OPEN_OMIT_JOURNALING != 0,
            in_memory,
            use_mmap: flags & OPEN_MMAP != 0,
            max_page_cache: opts.max_page_cache,
            spill_threshold: opts.spill_threshold,
        };
        let vfs = opts.vfs.take().unwrap_or_else(|| Box::new(OsVfs));
        let mut pager = Pager::new(vfs, path, pager_opts)?;
        if let Some(h) = opts.busy_handler.take() {
            pager.set_busy_handler(Some(h));
        }

        // Заголовок базы (если она есть) читается под shared-блокировкой
        pager.shared_lock()?;

        let mut engine: Box<dyn KvEngine> = if let Some(custom) = opts.custom_engine.take() {
            custom
        } else if pager.db_pages() > 0 {
            // Существующая база: движок выбирает её заголовок
            let stored = pager.kv_name().to_owned();
            match stored.as_str() {
                KV_NAME_LHASH => Box::new(LhashKv::new(pager.page_size())),
                KV_NAME_MEM => Box::new(MemKv::new()),
                other => {
                    warn!("unknown storage engine '{other}' in the database header");
                    pager.drop_to_open();
                    return Err(Error::NotImplemented);
                }
            }
        } else {
            let kind = opts.engine.unwrap_or(if in_memory {
                EngineKind::Mem
            } else {
                EngineKind::Hash
            });
            match kind {
                EngineKind::Hash => Box::new(LhashKv::new(pager.page_size())),
                EngineKind::Mem => Box::new(MemKv::new()),
            }
        };
        pager.set_kv_name(engine.name());

        engine.init(pager.page_size())?;
        let db_pages = pager.db_pages();
        if let Err(e) = engine.open(&mut pager, db_pages) {
            // Движок не открылся: снять блокировку, вернуть pager в Open
            pager.drop_to_open();
            return Err(e);
        }

        Ok(Self {
            pager,
            engine,
            collections: HashMap::new(),
            err_log: Vec::new(),
            disable_auto_commit: opts.disable_auto_commit,
            read_only,
        })
    }

    // ---------------- журнал ошибок ----------------

    pub(crate) fn log_err(&mut self, msg: String) {
        self.err_log.push(msg);
    }

    pub fn err_log(&self) -> &[String] {
        &self.err_log
    }

    pub fn clear_err_log(&mut self) {
        self.err_log.clear();
    }

    // ---------------- общее состояние ----------------

    pub fn kv_engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_busy_handler(&mut self, h: Option<BusyHandler>) {
        self.pager.set_busy_handler(h);
    }

    pub fn set_disable_auto_commit(&mut self, on: bool) {
        self.disable_auto_commit = on;
    }

    /// Проверка «мутатор допустим»: read-only базе — отказ с записью в
    /// журнал ошибок.
    pub(crate) fn ensure_writable(&mut self, what: &str) -> Result<()> {
        if self.read_only {
            self.log_err(format!("{what}: database handle is read-only"));
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Залипший сбой коммита: перед любой следующей операцией — откат.
    pub(crate) fn maybe_forced_rollback(&mut self) -> Result<()> {
        if self.pager.commit_err() {
            self.log_err("previous commit failed, rolling the transaction back".to_owned());
            self.rollback()?;
        }
        Ok(())
    }

    // ---------------- транзакции ----------------

    /// Открыть транзакцию записи явно (иначе её откроет первая запись).
    pub fn begin(&mut self) -> Result<()> {
        self.ensure_writable("begin")?;
        self.maybe_forced_rollback()?;
        self.pager.begin()
    }

    pub fn commit(&mut self) -> Result<()> {
        self.ensure_writable("commit")?;
        match self.pager.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.log_err(format!("commit failed: {e}"));
                Err(e)
            }
        }
    }

    /// Откатить открытую транзакцию. Движок и словарь коллекций
    /// перечитываются: их состояние в памяти выведено из отменённых
    /// страниц.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_writable("rollback")?;
        self.pager.rollback()?;
        if !self.pager.is_mem() {
            self.reset_derived_state()?;
        }
        Ok(())
    }

    fn reset_derived_state(&mut self) -> Result<()> {
        for (_, col) in self.collections.iter_mut() {
            col.release(&mut *self.engine);
        }
        self.collections.clear();
        self.engine.init(self.pager.page_size())?;
        let pages = self.pager.db_pages();
        self.engine.open(&mut self.pager, pages)
    }

    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        let rc = if self.read_only {
            Ok(())
        } else if self.pager.commit_err() || self.disable_auto_commit {
            self.pager.rollback()
        } else {
            self.pager.commit()
        };
        for (_, col) in self.collections.iter_mut() {
            col.release(&mut *self.engine);
        }
        self.collections.clear();
        self.pager.close();
        rc
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        // Авто-коммит при закрытии; ошибки в Drop только логируются
        if let Err(e) = self.close_inner() {
            warn!("error while closing the database: {e}");
        }
    }
}

// Повторное закрытие через close() + Drop безопасно: pager.close()
// идемпотентен, а commit/rollback на Reader-состоянии — no-op.

pub(crate) fn collection_now() -> chrono::NaiveDateTime {
    now_local()
}
