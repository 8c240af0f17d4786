//! pager — транзакционный кэш страниц поверх VFS.
//!
//! Обязанности:
//! - кэш страниц со счётчиком ссылок и списком hot-dirty (спил при
//!   давлении записи);
//! - журнал отката: прообраз каждой изменяемой страницы пишется в
//!   `<db>-journal` до первой модификации;
//! - конечный автомат транзакции:
//!   Open → Reader → WriterLocked → WriterCacheMod → WriterDbMod → WriterFinished,
//!   из любого writer-состояния возврат в Reader коммитом или откатом;
//! - восстановление «горячего» журнала при открытии.
//!
//! Протокол коммита: EXCLUSIVE берётся до синка журнала (повтор после),
//! журнал синкается NORMAL до записи страниц в базу, база синкается FULL
//! до удаления журнала. Нарушение порядка ломает crash-гарантии.
//!
//! Контракт page_write: Pager::write(&page) вызывается ДО модификации
//! байтов страницы — в журнал должен попасть прообраз.

pub mod bitvec;
pub mod journal;
pub mod page;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, warn};
use rand::Rng;

use crate::consts::{
    DB_HDR_FIXED_SZ, DB_MAGIC, DB_SIG, DEFAULT_PAGE_SIZE, DEFAULT_SECTOR_SIZE,
    DEFAULT_SPILL_THRESHOLD, JOURNAL_SUFFIX, KV_NAME_LHASH, MAX_PAGE_SIZE, MAX_SECTOR_SIZE,
    MIN_PAGE_CACHE, MIN_PAGE_SIZE, MIN_SECTOR_SIZE,
};
use crate::error::{Error, Result};
use crate::util::{dos_pack_time, dos_unpack_time, is_power_of_two};
use crate::vfs::{LockLevel, OpenMode, SyncMode, Vfs, VfsFile};

use bitvec::Bitvec;
use journal::{
    append_journal_record, finalize_journal_nrec, read_journal_header, read_journal_record,
    write_journal_header,
};
use page::{
    Page, PageRef, PAGE_DIRTY, PAGE_DONT_MAKE_HOT, PAGE_DONT_WRITE, PAGE_HOT_DIRTY,
    PAGE_IN_JOURNAL, PAGE_NEED_SYNC,
};

use byteorder::{BigEndian, ByteOrder};

/// Состояния pager'а; ровно одно в каждый момент.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PagerState {
    Open,
    Reader,
    WriterLocked,
    WriterCacheMod,
    WriterDbMod,
    WriterFinished,
}

// Флаги управления
const CTRL_COMMIT_ERR: u8 = 0x01;
const CTRL_DIRTY_COMMIT: u8 = 0x02;

pub type BusyHandler = Box<dyn FnMut() -> bool>;

/// Параметры создания pager'а (заполняет Db по open-флагам и DbOptions).
pub struct PagerOpts {
    pub page_size: usize,
    pub read_only: bool,
    pub create: bool,
    pub omit_journaling: bool,
    pub in_memory: bool,
    pub use_mmap: bool,
    pub max_page_cache: usize,
    pub spill_threshold: usize,
}

impl Default for PagerOpts {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            create: true,
            omit_journaling: false,
            in_memory: false,
            use_mmap: false,
            max_page_cache: MIN_PAGE_CACHE,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
        }
    }
}

pub struct Pager {
    vfs: Box<dyn Vfs>,
    path: PathBuf,
    jpath: PathBuf,
    fd: Option<Box<dyn VfsFile>>,
    jfd: Option<Box<dyn VfsFile>>,
    mmap: Option<memmap2::Mmap>,

    state: PagerState,
    ctrl: u8,

    is_mem: bool,
    no_jrnl: bool,
    rdonly: bool,
    create: bool,
    use_mmap: bool,

    page_size: usize,
    sector_size: usize,
    /// Страниц в базе, включая страницу 0 (заголовок).
    db_size: u64,
    db_orig_size: u64,

    journal_off: u64,
    n_rec: u32,
    cksum_seed: u32,
    bitvec: Option<Bitvec>,

    cache: HashMap<u64, PageRef>,
    hot: Vec<u64>,
    spill_threshold: usize,
    max_page_cache: usize,

    busy_handler: Option<BusyHandler>,

    /// Имя KV-движка: из заголовка существующей базы либо выбранное для новой.
    kv_name: String,
    create_time: NaiveDateTime,
}

impl Pager {
    pub fn new(vfs: Box<dyn Vfs>, path: &Path, opts: PagerOpts) -> Result<Self> {
        if !is_power_of_two(opts.page_size)
            || opts.page_size < MIN_PAGE_SIZE
            || opts.page_size > MAX_PAGE_SIZE
        {
            return Err(Error::Invalid("page_size must be a power of two in [512, 65536]"));
        }
        let full = if opts.in_memory {
            path.to_path_buf()
        } else {
            vfs.full_path(path)?
        };
        let mut jpath = full.as_os_str().to_os_string();
        jpath.push(JOURNAL_SUFFIX);
        let create_time = vfs.current_time();
        Ok(Self {
            vfs,
            path: full,
            jpath: PathBuf::from(jpath),
            fd: None,
            jfd: None,
            mmap: None,
            state: PagerState::Open,
            ctrl: 0,
            is_mem: opts.in_memory,
            no_jrnl: opts.omit_journaling || opts.in_memory,
            rdonly: opts.read_only,
            create: opts.create,
            use_mmap: opts.use_mmap,
            page_size: opts.page_size,
            sector_size: DEFAULT_SECTOR_SIZE,
            db_size: 0,
            db_orig_size: 0,
            journal_off: 0,
            n_rec: 0,
            cksum_seed: 0,
            bitvec: None,
            cache: HashMap::new(),
            hot: Vec::new(),
            spill_threshold: opts.spill_threshold,
            max_page_cache: opts.max_page_cache.max(MIN_PAGE_CACHE),
            busy_handler: None,
            kv_name: KV_NAME_LHASH.to_string(),
            create_time,
        })
    }

    // ---------------- доступ к состоянию ----------------

    #[inline]
    pub fn state(&self) -> PagerState {
        self.state
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn db_pages(&self) -> u64 {
        self.db_size
    }

    #[inline]
    pub fn is_mem(&self) -> bool {
        self.is_mem
    }

    #[inline]
    pub fn read_only(&self) -> bool {
        self.rdonly
    }

    #[inline]
    pub fn kv_name(&self) -> &str {
        &self.kv_name
    }

    pub fn set_kv_name(&mut self, name: &str) {
        self.kv_name = name.to_string();
    }

    #[inline]
    pub fn commit_err(&self) -> bool {
        self.ctrl & CTRL_COMMIT_ERR != 0
    }

    #[inline]
    pub fn create_time(&self) -> NaiveDateTime {
        self.create_time
    }

    pub fn set_busy_handler(&mut self, h: Option<BusyHandler>) {
        self.busy_handler = h;
    }

    pub fn set_spill_threshold(&mut self, n: usize) {
        self.spill_threshold = n.max(1);
    }

    // ---------------- блокировки ----------------

    fn lock_db(&mut self, level: LockLevel) -> Result<()> {
        if self.is_mem {
            return Ok(());
        }
        let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
        if fd.lock_level() >= level {
            return Ok(());
        }
        fd.lock(level)
    }

    fn unlock_db(&mut self, level: LockLevel) -> Result<()> {
        if self.is_mem {
            return Ok(());
        }
        if let Some(fd) = self.fd.as_mut() {
            fd.unlock(level)?;
        }
        Ok(())
    }

    /// Захват с повторами через busy-handler.
    fn wait_on_lock(&mut self, level: LockLevel) -> Result<()> {
        loop {
            match self.lock_db(level) {
                Err(Error::Busy) => {
                    let retry = match self.busy_handler.as_mut() {
                        Some(h) => h(),
                        None => false,
                    };
                    if !retry {
                        return Err(Error::Busy);
                    }
                }
                other => return other,
            }
        }
    }

    // ---------------- открытие и заголовок базы ----------------

    /// Open → Reader: shared-блокировка, откат горячего журнала,
    /// чтение заголовка базы. Идемпотентно.
    pub fn shared_lock(&mut self) -> Result<()> {
        if self.state != PagerState::Open {
            return Ok(());
        }
        if self.is_mem {
            self.state = PagerState::Reader;
            return Ok(());
        }
        if self.fd.is_none() {
            let mode = if self.rdonly {
                OpenMode::ReadOnly
            } else if self.create {
                OpenMode::Create
            } else {
                OpenMode::ReadWrite
            };
            self.fd = Some(self.vfs.open(&self.path, mode)?);
        }
        self.wait_on_lock(LockLevel::Shared)?;

        if self.fd.as_ref().map(|f| f.lock_level() <= LockLevel::Shared).unwrap_or(false) {
            if let Err(e) = self.journal_rollback(true) {
                let _ = self.unlock_db(LockLevel::None);
                return Err(e);
            }
        }
        if let Err(e) = self.read_db_header() {
            let _ = self.unlock_db(LockLevel::None);
            return Err(e);
        }
        if self.use_mmap && self.db_size > 0 {
            match self.vfs.mmap(&self.path) {
                Ok(m) => self.mmap = m,
                Err(e) => {
                    warn!("cannot map database read-only: {e}; falling back to file reads");
                    self.use_mmap = false;
                }
            }
        }
        self.state = PagerState::Reader;
        Ok(())
    }

    /// Движок не смог открыться после перехода в Reader: откат в Open
    /// со снятием блокировки (поведение источника).
    pub fn drop_to_open(&mut self) {
        let _ = self.unlock_db(LockLevel::None);
        self.state = PagerState::Open;
    }

    fn read_db_header(&mut self) -> Result<()> {
        let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
        let n = fd.size()?;
        if n == 0 {
            self.sector_size = fd.sector_size();
            self.db_size = 0;
            return Ok(());
        }
        if n < MIN_PAGE_SIZE as u64 {
            return Err(Error::Corrupt("database file shorter than the minimum page"));
        }
        let mut raw = [0u8; MIN_PAGE_SIZE];
        fd.read_at(&mut raw, 0)?;

        if &raw[..7] != DB_SIG {
            return Err(Error::Corrupt("bad database signature"));
        }
        let magic = BigEndian::read_u32(&raw[7..11]);
        if magic != DB_MAGIC {
            return Err(Error::Corrupt("bad database magic"));
        }
        let dos = BigEndian::read_u32(&raw[11..15]);
        self.create_time = dos_unpack_time(dos);
        let sector = BigEndian::read_u32(&raw[15..19]) as usize;
        let page = BigEndian::read_u32(&raw[19..23]) as usize;
        if !is_power_of_two(page)
            || page < MIN_PAGE_SIZE
            || page > MAX_PAGE_SIZE
            || !is_power_of_two(sector)
            || sector < MIN_SECTOR_SIZE
            || sector > MAX_SECTOR_SIZE
        {
            return Err(Error::Corrupt("page or sector size out of range"));
        }
        self.sector_size = sector;
        self.page_size = page;

        let name_len = BigEndian::read_u16(&raw[23..25]) as usize;
        let name_len = name_len.min(raw.len() - DB_HDR_FIXED_SZ);
        self.kv_name = String::from_utf8_lossy(&raw[25..25 + name_len]).into_owned();

        let mut pages = n / self.page_size as u64;
        if pages == 0 {
            pages = 1;
        }
        self.db_size = pages;
        Ok(())
    }

    /// Собрать страницу 0 (заголовок базы) для новой базы.
    fn create_header(&mut self) -> Result<()> {
        let p = self.acquire(0, true)?;
        {
            let mut pg = p.borrow_mut();
            let raw = &mut pg.data;
            raw[..7].copy_from_slice(DB_SIG);
            BigEndian::write_u32(&mut raw[7..11], DB_MAGIC);
            self.create_time = self.vfs.current_time();
            BigEndian::write_u32(&mut raw[11..15], dos_pack_time(&self.create_time));
            BigEndian::write_u32(&mut raw[15..19], self.sector_size as u32);
            BigEndian::write_u32(&mut raw[19..23], self.page_size as u32);
            let name = self.kv_name.as_bytes();
            BigEndian::write_u16(&mut raw[23..25], name.len() as u16);
            raw[25..25 + name.len()].copy_from_slice(name);
            pg.set(PAGE_DIRTY | PAGE_NEED_SYNC);
        }
        self.db_size = 1;
        self.unref(&p);
        Ok(())
    }

    // ---------------- транзакция записи ----------------

    /// Открыть транзакцию записи (идемпотентно).
    pub fn begin(&mut self) -> Result<()> {
        self.shared_lock()?;
        if self.state >= PagerState::WriterLocked {
            return Ok(());
        }
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        self.wait_on_lock(LockLevel::Reserved)?;
        self.bitvec = Some(Bitvec::with_capacity(self.db_size));
        self.state = PagerState::WriterLocked;
        self.db_orig_size = self.db_size;
        self.journal_off = 0;
        self.n_rec = 0;
        if self.db_size < 1 {
            if let Err(e) = self.create_header() {
                let _ = self.unlock_db(LockLevel::Shared);
                self.state = PagerState::Reader;
                self.bitvec = None;
                return Err(e);
            }
        }
        Ok(())
    }

    fn open_journal(&mut self) -> Result<()> {
        if self.is_mem || self.no_jrnl {
            self.state = PagerState::WriterCacheMod;
            return Ok(());
        }
        if self.state >= PagerState::WriterCacheMod {
            return Ok(());
        }
        // Устаревший журнал с тем же именем мешает восстановлению
        self.vfs.delete(&self.jpath, true)?;
        let mut jfd = self.vfs.open(&self.jpath, OpenMode::Create)?;
        self.cksum_seed = rand::thread_rng().gen();
        let res = write_journal_header(
            &mut *jfd,
            self.sector_size,
            self.page_size,
            self.cksum_seed,
            self.db_orig_size,
        );
        match res {
            Ok(()) => {
                self.journal_off = self.sector_size as u64;
                self.jfd = Some(jfd);
                self.state = PagerState::WriterCacheMod;
                Ok(())
            }
            Err(e) => {
                drop(jfd);
                let _ = self.vfs.delete(&self.jpath, false);
                Err(e)
            }
        }
    }

    /// Сделать страницу записываемой: прообраз в журнал (однократно),
    /// страница — в грязные. Вызывается до модификации байтов.
    pub fn write(&mut self, page: &PageRef) -> Result<()> {
        self.begin()?;
        if self.state == PagerState::WriterLocked {
            self.open_journal()?;
        }
        if !self.is_mem && self.hot.len() > self.spill_threshold {
            self.dirty_commit()?;
        }
        let pgno = page.borrow().pgno;
        if !self.is_mem && !self.no_jrnl {
            let journaled = self
                .bitvec
                .as_ref()
                .map(|v| v.test(pgno))
                .unwrap_or(false);
            if pgno < self.db_orig_size && !journaled {
                if self.n_rec == u32::MAX {
                    return Err(Error::Limit("journal record counter saturated, commit your changes"));
                }
                let jfd = self.jfd.as_mut().ok_or(Error::Invalid("journal file is not open"))?;
                let len = {
                    let pg = page.borrow();
                    append_journal_record(&mut **jfd, self.journal_off, pgno, &pg.data, self.cksum_seed)?
                };
                self.journal_off += len;
                self.n_rec += 1;
                if let Some(v) = self.bitvec.as_mut() {
                    v.set(pgno);
                }
                page.borrow_mut().set(PAGE_IN_JOURNAL);
            }
        }
        page.borrow_mut().set(PAGE_DIRTY | PAGE_NEED_SYNC);
        if pgno + 1 > self.db_size {
            self.db_size = pgno + 1;
            if self.db_size == u64::MAX {
                return Err(Error::Limit("database page counter saturated"));
            }
        }
        Ok(())
    }

    /// Пометить страницу как уже «журналированную»: тело будет целиком
    /// переписано, прообраз не нужен (повторное использование free-страниц).
    pub fn dont_journal(&mut self, page: &PageRef) {
        if self.state >= PagerState::WriterLocked && !self.no_jrnl {
            let pgno = page.borrow().pgno;
            if let Some(v) = self.bitvec.as_mut() {
                if !v.test(pgno) {
                    v.set(pgno);
                }
            }
        }
    }

    /// Страница не пишется в базу при коммите (страница 0 пишется всегда).
    pub fn dont_write(&mut self, page: &PageRef) {
        let mut pg = page.borrow_mut();
        if pg.pgno > 0 {
            pg.set(PAGE_DONT_WRITE);
        }
    }

    /// Не добавлять страницу в hot-dirty список при снятии ссылок.
    pub fn dont_mkhot(&mut self, page: &PageRef) {
        let mut pg = page.borrow_mut();
        pg.set(PAGE_DONT_MAKE_HOT);
        if pg.has(PAGE_HOT_DIRTY) {
            pg.clear(PAGE_HOT_DIRTY);
            let pgno = pg.pgno;
            drop(pg);
            self.hot.retain(|&p| p != pgno);
        }
    }

    // ---------------- кэш страниц ----------------

    /// Получить страницу (создав при необходимости); ссылка учитывается.
    pub fn get(&mut self, pgno: u64) -> Result<PageRef> {
        self.shared_lock()?;
        self.acquire(pgno, false)
    }

    /// Только поиск в кэше, без чтения с диска.
    pub fn lookup(&mut self, pgno: u64) -> Option<PageRef> {
        let p = self.cache.get(&pgno)?.clone();
        p.borrow_mut().nref += 1;
        Some(p)
    }

    /// Новая страница в конце базы. Номер закрепляется первой записью
    /// через write(); до неё повторный вызов вернёт тот же номер.
    pub fn new_page(&mut self) -> Result<PageRef> {
        self.shared_lock()?;
        let pgno = if self.db_size == 0 { 1 } else { self.db_size };
        self.acquire(pgno, true)
    }

    fn acquire(&mut self, pgno: u64, no_content: bool) -> Result<PageRef> {
        if let Some(p) = self.cache.get(&pgno) {
            let p = p.clone();
            p.borrow_mut().nref += 1;
            return Ok(p);
        }
        let p = Page::new(pgno, self.page_size);
        if !(self.is_mem || no_content || pgno >= self.db_size) {
            let mut pg = p.borrow_mut();
            let off = pgno * self.page_size as u64;
            let mut served = false;
            if let Some(map) = self.mmap.as_ref() {
                let end = off as usize + self.page_size;
                if end <= map.len() {
                    pg.data.copy_from_slice(&map[off as usize..end]);
                    served = true;
                }
            }
            if !served {
                let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
                // Короткое чтение на конце файла оставляет хвост нулевым
                let _ = fd.read_at(&mut pg.data, off)?;
            }
        }
        self.cache.insert(pgno, p.clone());
        self.maybe_evict();
        Ok(p)
    }

    pub fn ref_page(&mut self, page: &PageRef) {
        page.borrow_mut().nref += 1;
    }

    /// Снять ссылку. Чистая страница без ссылок покидает кэш; грязная
    /// попадает в hot-dirty список (кандидат на спил).
    pub fn unref(&mut self, page: &PageRef) {
        let (pgno, nref, dirty, hot_ok, already_hot) = {
            let mut pg = page.borrow_mut();
            if pg.nref > 0 {
                pg.nref -= 1;
            }
            (
                pg.pgno,
                pg.nref,
                pg.is_dirty(),
                !pg.has(PAGE_DONT_MAKE_HOT),
                pg.has(PAGE_HOT_DIRTY),
            )
        };
        if nref > 0 {
            return;
        }
        if !dirty {
            self.cache.remove(&pgno);
        } else if hot_ok && !already_hot {
            page.borrow_mut().set(PAGE_HOT_DIRTY);
            self.hot.push(pgno);
        }
    }

    /// Мягкое вытеснение чистых несвязанных страниц при переполнении кэша.
    fn maybe_evict(&mut self) {
        if self.cache.len() <= self.max_page_cache {
            return;
        }
        let victims: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, p)| {
                let pg = p.borrow();
                pg.nref == 0 && !pg.is_dirty()
            })
            .map(|(&pgno, _)| pgno)
            .collect();
        for pgno in victims {
            self.cache.remove(&pgno);
            if self.cache.len() <= self.max_page_cache {
                break;
            }
        }
    }

    fn dirty_pages_sorted(&self) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .cache
            .iter()
            .filter(|(_, p)| p.borrow().is_dirty())
            .map(|(&pgno, _)| pgno)
            .collect();
        v.sort_unstable();
        v
    }

    // ---------------- журнал: финализация и спил ----------------

    /// Прописать nRec, синкнуть журнал (NORMAL); EXCLUSIVE берётся до
    /// синка. Возвращает true, если EXCLUSIVE ещё предстоит дождаться.
    fn finalize_journal(&mut self, close_jrnl: bool) -> Result<bool> {
        let mut retry = false;
        match self.lock_db(LockLevel::Exclusive) {
            Ok(()) => {}
            Err(Error::Busy) => retry = true,
            Err(e) => return Err(e),
        }
        if !self.no_jrnl {
            if let Some(jfd) = self.jfd.as_mut() {
                finalize_journal_nrec(&mut **jfd, self.n_rec)?;
                jfd.sync(SyncMode::Normal)?;
            }
            if close_jrnl {
                self.jfd = None;
            }
        }
        if retry {
            if self.lock_db(LockLevel::Exclusive).is_ok() {
                retry = false;
            }
        }
        Ok(retry)
    }

    /// «Грязный» коммит: спил hot-dirty страниц в базу без завершения
    /// транзакции, чтобы ограничить память. Прообразы в журнале остаются
    /// авторитетными — последующий откат всё восстановит.
    fn dirty_commit(&mut self) -> Result<()> {
        let retry = match self.finalize_journal(false) {
            Ok(r) => r,
            // Не финальный коммит: неудача не фатальна, попробуем позже
            Err(_) => return Ok(()),
        };
        let mut hot: Vec<u64> = std::mem::take(&mut self.hot);
        if hot.is_empty() {
            return Ok(());
        }
        hot.sort_unstable();
        if retry && self.wait_on_lock(LockLevel::Exclusive).is_err() {
            self.hot = hot;
            return Ok(());
        }
        self.ctrl |= CTRL_DIRTY_COMMIT;
        self.state = PagerState::WriterDbMod;
        debug!("dirty commit: spilling {} hot page(s)", hot.len());
        let mut requeued = Vec::new();
        for pgno in hot {
            let Some(p) = self.cache.get(&pgno).cloned() else { continue };
            if p.borrow().nref > 0 {
                // Страницу успели снова взять: спилить её сейчас нельзя
                requeued.push(pgno);
                continue;
            }
            let need_write = !p.borrow().has(PAGE_DONT_WRITE);
            if need_write {
                let off = pgno * self.page_size as u64;
                let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
                let rc = fd.write_at(&p.borrow().data, off);
                if let Err(e) = rc {
                    self.ctrl |= CTRL_COMMIT_ERR;
                    return Err(e);
                }
            }
            p.borrow_mut().clear(
                PAGE_DIRTY | PAGE_DONT_WRITE | PAGE_NEED_SYNC | PAGE_IN_JOURNAL | PAGE_HOT_DIRTY,
            );
            self.cache.remove(&pgno);
        }
        self.hot = requeued;
        // База не синкается: журнал уже durable, это не финальный коммит
        Ok(())
    }

    // ---------------- коммит ----------------

    fn commit_phase1(&mut self) -> Result<()> {
        if self.state < PagerState::WriterCacheMod {
            return Ok(());
        }
        if self.is_mem {
            return Ok(());
        }
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        let retry = self.finalize_journal(true)?;
        let dirty = self.dirty_pages_sorted();
        if retry {
            self.wait_on_lock(LockLevel::Exclusive)?;
        }
        if self.ctrl & CTRL_DIRTY_COMMIT != 0 {
            if let Some(fd) = self.fd.as_mut() {
                fd.sync(SyncMode::Normal)?;
            }
        }
        self.state = PagerState::WriterDbMod;
        for pgno in dirty {
            let Some(p) = self.cache.get(&pgno).cloned() else { continue };
            let pg = p.borrow();
            if !pg.has(PAGE_DONT_WRITE) {
                let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
                if let Err(e) = fd.write_at(&pg.data, pgno * self.page_size as u64) {
                    self.ctrl |= CTRL_COMMIT_ERR;
                    return Err(e);
                }
            }
        }
        // Кэш целиком сбрасывается: следующая транзакция читает с диска
        self.cache.clear();
        self.hot.clear();
        if self.db_size != self.db_orig_size {
            if let Some(fd) = self.fd.as_mut() {
                fd.truncate(self.db_size * self.page_size as u64)?;
            }
        }
        if let Some(fd) = self.fd.as_mut() {
            fd.sync(SyncMode::Full)?;
        }
        self.journal_off = 0;
        self.n_rec = 0;
        self.state = PagerState::WriterFinished;
        Ok(())
    }

    fn commit_phase2(&mut self) -> Result<()> {
        if self.is_mem {
            return Ok(());
        }
        if self.state == PagerState::Open || self.state == PagerState::Reader {
            return Ok(());
        }
        if !self.no_jrnl {
            self.vfs.delete(&self.jpath, true)?;
        }
        self.unlock_db(LockLevel::Shared)?;
        self.state = PagerState::Reader;
        self.bitvec = None;
        self.ctrl &= !CTRL_DIRTY_COMMIT;
        Ok(())
    }

    /// Зафиксировать транзакцию: журнал durable до записи страниц,
    /// страницы durable до удаления журнала.
    pub fn commit(&mut self) -> Result<()> {
        self.commit_phase1().map_err(|e| {
            self.ctrl |= CTRL_COMMIT_ERR;
            e
        })?;
        self.commit_phase2()?;
        self.ctrl &= !CTRL_COMMIT_ERR;
        Ok(())
    }

    // ---------------- откат ----------------

    /// Откатить открытую транзакцию записи. Возвращает pager в Reader.
    /// Сброс состояния KV-движка — обязанность владельца (Db).
    pub fn rollback(&mut self) -> Result<()> {
        if self.state < PagerState::WriterLocked {
            return Ok(());
        }
        if self.is_mem {
            // Транзакции для базы в памяти не поддерживаются
            return Ok(());
        }
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        if self.state >= PagerState::WriterCacheMod {
            if !self.no_jrnl {
                if let Some(jfd) = self.jfd.as_mut() {
                    let _ = jfd.sync(SyncMode::Normal);
                }
                self.jfd = None;
                if self.ctrl & (CTRL_COMMIT_ERR | CTRL_DIRTY_COMMIT) != 0 {
                    // В базу уже писали: восстановление по журналу
                    self.journal_rollback(false)?;
                }
            }
            self.vfs.delete(&self.jpath, true)?;
            self.reset_state();
        } else {
            self.unlock_db(LockLevel::Shared)?;
            self.state = PagerState::Reader;
            self.bitvec = None;
        }
        Ok(())
    }

    fn reset_state(&mut self) {
        self.ctrl &= !(CTRL_COMMIT_ERR | CTRL_DIRTY_COMMIT);
        self.journal_off = 0;
        self.n_rec = 0;
        self.db_size = self.db_orig_size;
        for p in self.cache.values() {
            let mut pg = p.borrow_mut();
            pg.clear(PAGE_DIRTY | PAGE_DONT_WRITE | PAGE_NEED_SYNC | PAGE_IN_JOURNAL | PAGE_HOT_DIRTY);
        }
        self.cache.clear();
        self.hot.clear();
        self.bitvec = None;
        let _ = self.unlock_db(LockLevel::Shared);
        self.state = PagerState::Reader;
    }

    // ---------------- восстановление по журналу ----------------

    /// Проиграть журнал. check_hot=true — путь открытия базы: журнал
    /// считается «горячим» только если существует, никто не держит
    /// Reserved и файл базы непуст.
    fn journal_rollback(&mut self, check_hot: bool) -> Result<()> {
        if check_hot {
            if !self.vfs.access(&self.jpath) {
                return Ok(());
            }
            let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
            if fd.check_reserved_lock()? {
                // Журнал живого писателя, не горячий
                return Ok(());
            }
            let n = fd.size()?;
            if n < 1 {
                // База пуста — журнал остался от прежней базы с тем же именем
                if self.lock_db(LockLevel::Reserved).is_ok() {
                    let _ = self.vfs.delete(&self.jpath, false);
                    let _ = self.unlock_db(LockLevel::Shared);
                }
                return Ok(());
            }
        }
        if self.rdonly {
            return Err(Error::ReadOnly);
        }
        let mut jfd = self.vfs.open(&self.jpath, OpenMode::ReadWrite)?;
        self.wait_on_lock(LockLevel::Exclusive)?;
        let _ = jfd.sync(SyncMode::Normal);
        let rc = self.playback(&mut *jfd);
        let _ = self.unlock_db(LockLevel::Shared);
        drop(jfd);
        if rc.is_ok() {
            self.vfs.delete(&self.jpath, true)?;
        }
        rc
    }

    fn playback(&mut self, jfd: &mut dyn VfsFile) -> Result<()> {
        let Some(hdr) = read_journal_header(jfd)? else {
            // Битый или чужой заголовок: журнала как бы нет
            debug!("malformed journal header, discarding journal");
            return Ok(());
        };
        if hdr.page_size != self.page_size {
            debug!("journal page size mismatch, discarding journal");
            return Ok(());
        }
        self.db_size = hdr.orig_pages;
        {
            let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
            fd.truncate(hdr.orig_pages * self.page_size as u64)?;
        }
        let mut off = hdr.sector_size as u64;
        let mut replayed = 0u32;
        for _ in 0..hdr.n_rec {
            let Some(rec) = read_journal_record(jfd, off, self.page_size, hdr.cksum_seed)? else {
                break; // усечённый хвост
            };
            off += 8 + self.page_size as u64 + 4;
            if !rec.cksum_ok {
                // Повреждённая запись пропускается, проигрывание продолжается
                continue;
            }
            if rec.pgno >= self.db_size {
                continue;
            }
            {
                let fd = self.fd.as_mut().ok_or(Error::Invalid("database file is not open"))?;
                fd.write_at(&rec.data, rec.pgno * self.page_size as u64)?;
            }
            if let Some(p) = self.cache.get(&rec.pgno) {
                p.borrow_mut().data.copy_from_slice(&rec.data);
            }
            replayed += 1;
        }
        if let Some(fd) = self.fd.as_mut() {
            fd.sync(SyncMode::Full)?;
        }
        debug!("journal playback: {replayed} page(s) restored");
        Ok(())
    }

    // ---------------- закрытие ----------------

    /// Снять блокировки и закрыть файлы. Открытая транзакция должна быть
    /// завершена (commit/rollback) до вызова.
    pub fn close(&mut self) {
        self.jfd = None;
        if let Some(fd) = self.fd.as_mut() {
            let _ = fd.unlock(LockLevel::None);
        }
        self.fd = None;
        self.mmap = None;
        self.cache.clear();
        self.hot.clear();
        self.state = PagerState::Open;
    }

    // ---------------- диагностика ----------------

    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    pub fn hot_pages(&self) -> usize {
        self.hot.len()
    }

    pub fn journal_records(&self) -> u32 {
        self.n_rec
    }

    pub fn journal_path(&self) -> &Path {
        &self.jpath
    }

    pub fn db_path(&self) -> &Path {
        &self.path
    }

    // Хуки для тестов восстановления: раздельные фазы коммита.
    #[doc(hidden)]
    pub fn commit_phase1_only(&mut self) -> Result<()> {
        self.commit_phase1()
    }

    #[doc(hidden)]
    pub fn commit_phase2_only(&mut self) -> Result<()> {
        self.commit_phase2()
    }
}
