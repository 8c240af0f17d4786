//! kv/lhash — дисковый KV-движок: линейное хеширование поверх страниц
//! pager'а (транзакционность/ACID наследуются автоматически).
//!
//! Ключ → бакет:
//!   b = hash & (2*max_split - 1); если b >= split + max_split,
//!   то b = hash & (max_split - 1).
//! Сплит идёт по одному бакету: split_bucket расщепляется, по достижении
//! max_split поколение удваивается (split=0, max*=2).
//!
//! Бакет — master-страница с цепочкой slave-страниц; payload, не
//! влезающий локально, уходит в overflow-цепочку.

pub mod cursor;
pub mod header;
pub mod map;
pub mod overflow;
pub mod page;

use log::debug;

use crate::consts::{LHASH_CELL_SZ, LHASH_HDR_SZ, LHASH_LARGE_KEY};
use crate::error::{Error, Result};
use crate::kv::{
    default_cmp, default_hash, CmpFn, Consumer, CursorId, HashFn, KvConfig, KvEngine, SeekMode,
    StreamCmp,
};
use crate::pager::Pager;

use cursor::LhCursor;
use header::{header_read, header_set_map_next, header_set_map_nrec, header_set_split, header_write, LhashHeader};
use map::{map_load_page, BucketMap, MapPageState};
use page::{
    defragment, init_empty, parse_page, restore_space, set_cell_dlen, set_cell_next, set_cell_ovfl,
    set_first_cell, set_slave, write_cell_header, carve_free_block, Cell, LhPage,
};

use byteorder::{BigEndian, ByteOrder};

/// Master-страница бакета вместе с цепочкой slave-страниц.
pub(crate) struct PageGroup {
    pub pages: Vec<LhPage>,
}

/// Найти ячейку заново по ключу: после дефрагментации смещения и
/// порядок вектора меняются.
fn refind_cell(page: &LhPage, hash: u32, key: &[u8]) -> Option<usize> {
    page.cells.iter().position(|c| {
        c.hash == hash && c.klen as usize == key.len() && c.key.as_deref() == Some(key)
    })
}

impl PageGroup {
    #[inline]
    fn master_pgno(&self) -> u64 {
        self.pages[0].pgno
    }
}

pub struct LhashKv {
    pub(crate) page_size: usize,
    hash: HashFn,
    cmp: CmpFn,
    pub(crate) free_list: u64,
    split_bucket: u64,
    max_split: u64,
    /// Следующее поколение: max_split << 1 (в памяти).
    nmax_split: u64,
    pub(crate) map: BucketMap,
    map_page: MapPageState,
    cursors: Vec<Option<LhCursor>>,
}

impl LhashKv {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            hash: default_hash,
            cmp: default_cmp,
            free_list: 0,
            split_bucket: 0,
            max_split: 1,
            nmax_split: 2,
            map: BucketMap::default(),
            map_page: MapPageState {
                num: 1,
                ptr: LHASH_HDR_SZ as u32,
                nrec: 0,
                next: 0,
            },
            cursors: Vec::new(),
        }
    }

    // ---------------- диагностика ----------------

    pub fn split_bucket(&self) -> u64 {
        self.split_bucket
    }

    pub fn max_split_bucket(&self) -> u64 {
        self.max_split
    }

    pub fn free_list_head(&self) -> u64 {
        self.free_list
    }

    pub fn bucket_count(&self) -> usize {
        self.map.len()
    }

    /// Где лежит payload записи: Some(головная overflow-страница) —
    /// в overflow-цепочке, None — локально в ячейке.
    pub fn record_overflow_page(&mut self, pager: &mut Pager, key: &[u8]) -> Result<Option<u64>> {
        let hash = (self.hash)(key);
        let (group, pi, ci) = match self.lookup(pager, key, hash)? {
            Some(v) => v,
            None => return Err(Error::NotFound),
        };
        let cell = &group.pages[pi].cells[ci];
        Ok(if cell.ovfl != 0 { Some(cell.ovfl) } else { None })
    }

    // ---------------- бакеты и загрузка страниц ----------------

    #[inline]
    fn bucket_of(&self, hash: u32) -> u64 {
        let mut b = hash as u64 & (self.nmax_split - 1);
        if b >= self.split_bucket + self.max_split {
            b = hash as u64 & (self.max_split - 1);
        }
        b
    }

    /// Загрузить master + slave-цепочку в разобранном виде.
    /// insert_path помечает master как не-hot (страница бакета горячая
    /// по определению, спил ей не помощник).
    pub(crate) fn load_group(
        &self,
        pager: &mut Pager,
        pgno: u64,
        insert_path: bool,
    ) -> Result<PageGroup> {
        let mut pages = Vec::new();
        let mut cur = pgno;
        let mut nest = 0;
        while cur != 0 && nest < 128 {
            let p = pager.get(cur)?;
            if insert_path && nest == 0 {
                pager.dont_mkhot(&p);
            }
            let parsed = {
                let pg = p.borrow();
                parse_page(&pg.data, cur)?
            };
            pager.unref(&p);
            let slave = parsed.hdr.slave;
            pages.push(parsed);
            cur = slave;
            nest += 1;
        }
        if pages.is_empty() {
            return Err(Error::Corrupt("bucket page chain is empty"));
        }
        let mut group = PageGroup { pages };
        // Дозаполнить overflow-ячейки: точка данных + ключ, если он мал
        for page in &mut group.pages {
            for cell in &mut page.cells {
                if cell.ovfl != 0 {
                    let want_key = (cell.klen as usize) <= LHASH_LARGE_KEY;
                    let (dp, doff, key) =
                        self.ovfl_read_key(pager, cell.ovfl, cell.klen as usize, want_key)?;
                    cell.data_page = dp;
                    cell.data_off = doff;
                    cell.key = key;
                }
            }
        }
        Ok(group)
    }

    /// Найти ячейку с данным ключом в группе.
    fn find_cell_in(
        &self,
        pager: &mut Pager,
        group: &PageGroup,
        key: &[u8],
        hash: u32,
    ) -> Result<Option<(usize, usize)>> {
        for (pi, page) in group.pages.iter().enumerate() {
            for (ci, cell) in page.cells.iter().enumerate() {
                if cell.hash != hash || cell.klen as usize != key.len() {
                    continue;
                }
                match &cell.key {
                    Some(k) => {
                        if (self.cmp)(k, key) == std::cmp::Ordering::Equal {
                            return Ok(Some((pi, ci)));
                        }
                    }
                    None => {
                        // Гигантский ключ: потоковое сравнение без материализации
                        let mut sc = StreamCmp::new(key, self.cmp);
                        match self.consume_cell_key(pager, cell, &mut sc) {
                            Ok(()) if sc.matched() => return Ok(Some((pi, ci))),
                            Ok(()) => {}
                            Err(Error::Abort) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn lookup(
        &mut self,
        pager: &mut Pager,
        key: &[u8],
        hash: u32,
    ) -> Result<Option<(PageGroup, usize, usize)>> {
        let bucket = self.bucket_of(hash);
        let Some(real) = self.map.get(bucket) else {
            return Ok(None);
        };
        let group = self.load_group(pager, real, false)?;
        match self.find_cell_in(pager, &group, key, hash)? {
            Some((pi, ci)) => Ok(Some((group, pi, ci))),
            None => Ok(None),
        }
    }

    // ---------------- аллокация на странице ----------------

    /// Выделить amount байт на странице; при фрагментации — дефраг и
    /// повтор. Err(Full) — места нет (сплит или slave — забота выше).
    fn page_alloc(&self, raw: &mut [u8], page: &mut LhPage, amount: u64) -> Result<u16> {
        if (page.nfree as u64) < amount {
            return Err(Error::Full);
        }
        // Крупному payload'у — overflow-цепочка, пока страница не набита
        if page.cells.len() < 10 && amount >= (self.page_size / 2) as u64 {
            return Err(Error::Full);
        }
        let amt = amount as u16;
        if let Some(off) = carve_free_block(raw, &mut page.hdr, &mut page.nfree, amt) {
            return Ok(off);
        }
        defragment(raw, page);
        if page.nfree >= amt {
            carve_free_block(raw, &mut page.hdr, &mut page.nfree, amt)
                .ok_or(Error::Corrupt("no contiguous block after defragmentation"))
        } else {
            Err(Error::Full)
        }
    }

    // ---------------- запись ячеек ----------------

    /// Разместить ячейку на странице группы; auto_append разрешает
    /// уходить в slave-страницы при нехватке места.
    fn store_cell(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        key: &[u8],
        data: &[u8],
        hash: u32,
        auto_append: bool,
    ) -> Result<()> {
        let pgno = group.pages[page_idx].pgno;
        let p = pager.get(pgno)?;
        pager.write(&p)?;

        let amount = (LHASH_CELL_SZ + key.len() + data.len()) as u64;
        let mut need_ovfl = false;
        let alloc = {
            let mut pg = p.borrow_mut();
            match self.page_alloc(&mut pg.data, &mut group.pages[page_idx], amount) {
                Ok(off) => Ok(off),
                Err(Error::Full) => {
                    match self.page_alloc(&mut pg.data, &mut group.pages[page_idx], LHASH_CELL_SZ as u64)
                    {
                        Ok(off) => {
                            need_ovfl = true;
                            Ok(off)
                        }
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            }
        };
        let off = match alloc {
            Ok(off) => off,
            Err(Error::Full) => {
                pager.unref(&p);
                if !auto_append {
                    return Err(Error::Full);
                }
                return self.slave_store(pager, group, key, data, hash);
            }
            Err(e) => {
                pager.unref(&p);
                return Err(e);
            }
        };

        let mut cell = Cell {
            hash,
            klen: key.len() as u32,
            dlen: data.len() as u64,
            next: 0,
            ovfl: 0,
            start: off,
            pgno,
            data_page: 0,
            data_off: 0,
            key: if key.len() <= LHASH_LARGE_KEY {
                Some(key.to_vec())
            } else {
                None
            },
        };

        if need_ovfl {
            let (ovfl, dp, doff) = self.write_ovfl_payload(pager, key, &[data])?;
            cell.ovfl = ovfl;
            cell.data_page = dp;
            cell.data_off = doff;
        } else {
            let mut pg = p.borrow_mut();
            let s = off as usize + LHASH_CELL_SZ;
            pg.data[s..s + key.len()].copy_from_slice(key);
            pg.data[s + key.len()..s + key.len() + data.len()].copy_from_slice(data);
        }

        {
            let mut pg = p.borrow_mut();
            cell.next = group.pages[page_idx].hdr.first_cell;
            write_cell_header(&mut pg.data, &cell);
            group.pages[page_idx].hdr.first_cell = cell.start;
            set_first_cell(&mut pg.data, cell.start);
        }
        group.pages[page_idx].cells.insert(0, cell);
        pager.unref(&p);
        Ok(())
    }

    /// Поместится ли на странице блок под amount с учётом дефрага.
    fn page_fits(&self, page: &LhPage, amount: u64) -> bool {
        if (page.nfree as u64) < amount {
            return false;
        }
        !(page.cells.len() < 10 && amount >= (self.page_size / 2) as u64)
    }

    /// Найти (или создать) slave-страницу под payload размера amount.
    fn find_slave_page(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        amount: u64,
    ) -> Result<usize> {
        for idx in 1..group.pages.len() {
            let page = &group.pages[idx];
            if self.page_fits(page, LHASH_CELL_SZ as u64 + amount)
                || self.page_fits(page, LHASH_CELL_SZ as u64)
            {
                return Ok(idx);
            }
        }
        // Новая slave-страница в хвост цепочки
        let raw = self.acquire_page(pager)?;
        pager.write(&raw)?;
        pager.dont_mkhot(&raw);
        let new_pgno = raw.borrow().pgno;
        let parsed = {
            let mut pg = raw.borrow_mut();
            init_empty(&mut pg.data, new_pgno)
        };
        let tail_pgno = group.pages.last().map(|pg| pg.pgno).ok_or(Error::Corrupt("empty page group"))?;
        let tail = pager.get(tail_pgno)?;
        pager.write(&tail)?;
        set_slave(&mut tail.borrow_mut().data, new_pgno);
        if let Some(last) = group.pages.last_mut() {
            last.hdr.slave = new_pgno;
        }
        pager.unref(&tail);
        pager.unref(&raw);
        group.pages.push(parsed);
        Ok(group.pages.len() - 1)
    }

    fn slave_store(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        key: &[u8],
        data: &[u8],
        hash: u32,
    ) -> Result<()> {
        let idx = self.find_slave_page(pager, group, (key.len() + data.len()) as u64)?;
        self.store_cell(pager, group, idx, key, data, hash, true)
    }

    /// Перенести ячейку (только заголовок: overflow-цепочка остаётся на
    /// месте) в другую группу.
    fn transfer_cell(
        &mut self,
        pager: &mut Pager,
        src: &Cell,
        group: &mut PageGroup,
    ) -> Result<()> {
        let mut idx = 0;
        let pgno = group.pages[idx].pgno;
        let p = pager.get(pgno)?;
        pager.write(&p)?;
        let alloc = {
            let mut pg = p.borrow_mut();
            self.page_alloc(&mut pg.data, &mut group.pages[idx], LHASH_CELL_SZ as u64)
        };
        let off = match alloc {
            Ok(off) => {
                pager.unref(&p);
                off
            }
            Err(Error::Full) => {
                pager.unref(&p);
                idx = self.find_slave_page(pager, group, LHASH_CELL_SZ as u64)?;
                let q = pager.get(group.pages[idx].pgno)?;
                pager.write(&q)?;
                let off = {
                    let mut pg = q.borrow_mut();
                    self.page_alloc(&mut pg.data, &mut group.pages[idx], LHASH_CELL_SZ as u64)?
                };
                pager.unref(&q);
                off
            }
            Err(e) => {
                pager.unref(&p);
                return Err(e);
            }
        };

        let target_pgno = group.pages[idx].pgno;
        let q = pager.get(target_pgno)?;
        pager.write(&q)?;
        let mut cell = src.clone();
        cell.start = off;
        cell.pgno = target_pgno;
        {
            let mut pg = q.borrow_mut();
            cell.next = group.pages[idx].hdr.first_cell;
            write_cell_header(&mut pg.data, &cell);
            group.pages[idx].hdr.first_cell = cell.start;
            set_first_cell(&mut pg.data, cell.start);
        }
        group.pages[idx].cells.insert(0, cell);
        pager.unref(&q);
        Ok(())
    }

    /// Выбросить ячейку из цепочки страницы, вернув её байты в свободные
    /// блоки. Overflow-цепочку не трогает.
    pub(crate) fn unlink_cell(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        cell_idx: usize,
    ) -> Result<()> {
        let pgno = group.pages[page_idx].pgno;
        let p = pager.get(pgno)?;
        pager.write(&p)?;
        let cell = group.pages[page_idx].cells[cell_idx].clone();
        {
            let mut pg = p.borrow_mut();
            if cell_idx == 0 {
                group.pages[page_idx].hdr.first_cell = cell.next;
                set_first_cell(&mut pg.data, cell.next);
            } else {
                let prev_start = group.pages[page_idx].cells[cell_idx - 1].start;
                group.pages[page_idx].cells[cell_idx - 1].next = cell.next;
                set_cell_next(&mut pg.data, prev_start, cell.next);
            }
            let mut span = LHASH_CELL_SZ as u16;
            if cell.ovfl == 0 {
                span += cell.klen as u16 + cell.dlen as u16;
            }
            let page = &mut group.pages[page_idx];
            restore_space(&mut pg.data, &mut page.hdr, &mut page.nfree, cell.start, span);
        }
        group.pages[page_idx].cells.remove(cell_idx);
        pager.unref(&p);
        Ok(())
    }

    /// Удалить запись целиком: overflow-цепочка — в свободный список,
    /// ячейка — из страницы.
    pub(crate) fn record_remove(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        cell_idx: usize,
    ) -> Result<()> {
        let ovfl = group.pages[page_idx].cells[cell_idx].ovfl;
        if ovfl != 0 {
            self.free_ovfl_chain(pager, ovfl)?;
        }
        self.unlink_cell(pager, group, page_idx, cell_idx)
    }

    // ---------------- перезапись и дозапись ----------------

    /// Переместить локальную ячейку в новый блок той же страницы с новыми
    /// данными; ячейка встаёт в голову цепочки.
    fn move_local_cell(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        cell_idx: usize,
        new_off: u16,
        data: &[u8],
    ) -> Result<()> {
        let pgno = group.pages[page_idx].pgno;
        let p = pager.get(pgno)?;
        let mut cell = group.pages[page_idx].cells[cell_idx].clone();
        let key = {
            let pg = p.borrow();
            let s = cell.start as usize + LHASH_CELL_SZ;
            pg.data[s..s + cell.klen as usize].to_vec()
        };
        {
            let mut pg = p.borrow_mut();
            // Выщёлкнуть со старой позиции
            if cell_idx == 0 {
                group.pages[page_idx].hdr.first_cell = cell.next;
                set_first_cell(&mut pg.data, cell.next);
            } else {
                let prev_start = group.pages[page_idx].cells[cell_idx - 1].start;
                group.pages[page_idx].cells[cell_idx - 1].next = cell.next;
                set_cell_next(&mut pg.data, prev_start, cell.next);
            }
            // Записать на новом месте
            cell.start = new_off;
            cell.dlen = data.len() as u64;
            let s = new_off as usize + LHASH_CELL_SZ;
            pg.data[s..s + key.len()].copy_from_slice(&key);
            pg.data[s + key.len()..s + key.len() + data.len()].copy_from_slice(data);
            cell.next = group.pages[page_idx].hdr.first_cell;
            write_cell_header(&mut pg.data, &cell);
            group.pages[page_idx].hdr.first_cell = cell.start;
            set_first_cell(&mut pg.data, cell.start);
        }
        pager.unref(&p);
        group.pages[page_idx].cells.remove(cell_idx);
        group.pages[page_idx].cells.insert(0, cell);
        Ok(())
    }

    fn record_overwrite(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        cell_idx: usize,
        data: &[u8],
    ) -> Result<()> {
        let pgno = group.pages[page_idx].pgno;
        let p = pager.get(pgno)?;
        pager.write(&p)?;
        let cell = group.pages[page_idx].cells[cell_idx].clone();

        if cell.ovfl == 0 {
            let old = cell.dlen as usize;
            let payload = cell.start as usize + LHASH_CELL_SZ + cell.klen as usize;
            if old == data.len() {
                p.borrow_mut().data[payload..payload + old].copy_from_slice(data);
                pager.unref(&p);
                return Ok(());
            }
            if data.len() < old {
                {
                    let mut pg = p.borrow_mut();
                    pg.data[payload..payload + data.len()].copy_from_slice(data);
                    set_cell_dlen(&mut pg.data, cell.start, data.len() as u64);
                    let page = &mut group.pages[page_idx];
                    restore_space(
                        &mut pg.data,
                        &mut page.hdr,
                        &mut page.nfree,
                        (payload + data.len()) as u16,
                        (old - data.len()) as u16,
                    );
                }
                group.pages[page_idx].cells[cell_idx].dlen = data.len() as u64;
                pager.unref(&p);
                return Ok(());
            }
            // Данные длиннее: другой блок на этой же странице либо overflow.
            // page_alloc может дефрагментировать страницу — после него
            // индекс и смещение ячейки ищутся заново по ключу.
            let okey = cell.key.clone().ok_or(Error::Corrupt("local cell lost its key"))?;
            let amount = (LHASH_CELL_SZ + cell.klen as usize + data.len()) as u64;
            let alloc = {
                let mut pg = p.borrow_mut();
                self.page_alloc(&mut pg.data, &mut group.pages[page_idx], amount)
            };
            match alloc {
                Ok(off) => {
                    let cell_idx = refind_cell(&group.pages[page_idx], cell.hash, &okey)
                        .ok_or(Error::Corrupt("cell vanished during defragmentation"))?;
                    let old_start = group.pages[page_idx].cells[cell_idx].start;
                    self.move_local_cell(pager, group, page_idx, cell_idx, off, data)?;
                    let mut pg = p.borrow_mut();
                    let page = &mut group.pages[page_idx];
                    restore_space(
                        &mut pg.data,
                        &mut page.hdr,
                        &mut page.nfree,
                        old_start,
                        (LHASH_CELL_SZ + cell.klen as usize + old) as u16,
                    );
                }
                Err(Error::Full) => {
                    let cell_idx = refind_cell(&group.pages[page_idx], cell.hash, &okey)
                        .ok_or(Error::Corrupt("cell vanished during defragmentation"))?;
                    let start = group.pages[page_idx].cells[cell_idx].start;
                    let (ovfl, dp, doff) = self.write_ovfl_payload(pager, &okey, &[data])?;
                    {
                        let mut pg = p.borrow_mut();
                        set_cell_dlen(&mut pg.data, start, data.len() as u64);
                        set_cell_ovfl(&mut pg.data, start, ovfl);
                        let page = &mut group.pages[page_idx];
                        restore_space(
                            &mut pg.data,
                            &mut page.hdr,
                            &mut page.nfree,
                            (start as usize + LHASH_CELL_SZ) as u16,
                            (cell.klen as usize + old) as u16,
                        );
                    }
                    let c = &mut group.pages[page_idx].cells[cell_idx];
                    c.dlen = data.len() as u64;
                    c.ovfl = ovfl;
                    c.data_page = dp;
                    c.data_off = doff;
                }
                Err(e) => {
                    pager.unref(&p);
                    return Err(e);
                }
            }
            pager.unref(&p);
            return Ok(());
        }

        // Payload в overflow: хвост цепочки за страницей данных — в
        // свободный список, данные переписываются с прежней точки
        let dp = pager.get(cell.data_page)?;
        let mut tail = BigEndian::read_u64(&dp.borrow().data[0..8]);
        while tail != 0 {
            let q = pager.get(tail)?;
            let next = BigEndian::read_u64(&q.borrow().data[0..8]);
            self.release_page(pager, &q)?;
            pager.unref(&q);
            tail = next;
        }
        pager.write(&dp)?;
        BigEndian::write_u64(&mut dp.borrow_mut().data[0..8], 0);
        self.ovfl_write_from(pager, &dp, cell.data_off as usize, data)?;
        pager.unref(&dp);
        {
            let mut pg = p.borrow_mut();
            set_cell_dlen(&mut pg.data, cell.start, data.len() as u64);
        }
        group.pages[page_idx].cells[cell_idx].dlen = data.len() as u64;
        pager.unref(&p);
        Ok(())
    }

    fn record_append(
        &mut self,
        pager: &mut Pager,
        group: &mut PageGroup,
        page_idx: usize,
        cell_idx: usize,
        data: &[u8],
    ) -> Result<()> {
        let pgno = group.pages[page_idx].pgno;
        let cell = group.pages[page_idx].cells[cell_idx].clone();
        if cell.dlen.checked_add(data.len() as u64).is_none() {
            return Err(Error::Limit("append would overflow the record size"));
        }
        let p = pager.get(pgno)?;
        pager.write(&p)?;

        if cell.ovfl == 0 {
            let old = cell.dlen as usize;
            let okey = cell.key.clone().ok_or(Error::Corrupt("local cell lost its key"))?;
            let amount = (LHASH_CELL_SZ + cell.klen as usize + old + data.len()) as u64;
            // page_alloc может дефрагментировать страницу: ячейка после
            // него переискивается по ключу
            let alloc = {
                let mut pg = p.borrow_mut();
                self.page_alloc(&mut pg.data, &mut group.pages[page_idx], amount)
            };
            match alloc {
                Ok(off) => {
                    let cell_idx = refind_cell(&group.pages[page_idx], cell.hash, &okey)
                        .ok_or(Error::Corrupt("cell vanished during defragmentation"))?;
                    let old_start = group.pages[page_idx].cells[cell_idx].start;
                    let mut worker = {
                        let pg = p.borrow();
                        let s = old_start as usize + LHASH_CELL_SZ + cell.klen as usize;
                        pg.data[s..s + old].to_vec()
                    };
                    worker.extend_from_slice(data);
                    self.move_local_cell(pager, group, page_idx, cell_idx, off, &worker)?;
                    let mut pg = p.borrow_mut();
                    let page = &mut group.pages[page_idx];
                    restore_space(
                        &mut pg.data,
                        &mut page.hdr,
                        &mut page.nfree,
                        old_start,
                        (LHASH_CELL_SZ + cell.klen as usize + old) as u16,
                    );
                }
                Err(Error::Full) => {
                    let cell_idx = refind_cell(&group.pages[page_idx], cell.hash, &okey)
                        .ok_or(Error::Corrupt("cell vanished during defragmentation"))?;
                    let start = group.pages[page_idx].cells[cell_idx].start;
                    let old_data = {
                        let pg = p.borrow();
                        let s = start as usize + LHASH_CELL_SZ + cell.klen as usize;
                        pg.data[s..s + old].to_vec()
                    };
                    let (ovfl, dp, doff) =
                        self.write_ovfl_payload(pager, &okey, &[&old_data, data])?;
                    {
                        let mut pg = p.borrow_mut();
                        set_cell_dlen(&mut pg.data, start, (old + data.len()) as u64);
                        set_cell_ovfl(&mut pg.data, start, ovfl);
                        let page = &mut group.pages[page_idx];
                        restore_space(
                            &mut pg.data,
                            &mut page.hdr,
                            &mut page.nfree,
                            (start as usize + LHASH_CELL_SZ) as u16,
                            (cell.klen as usize + old) as u16,
                        );
                    }
                    let c = &mut group.pages[page_idx].cells[cell_idx];
                    c.dlen = (old + data.len()) as u64;
                    c.ovfl = ovfl;
                    c.data_page = dp;
                    c.data_off = doff;
                }
                Err(e) => {
                    pager.unref(&p);
                    return Err(e);
                }
            }
            pager.unref(&p);
            return Ok(());
        }

        // Дойти до конца данных по цепочке
        let ps = self.page_size;
        let mut cur = pager.get(cell.data_page)?;
        let mut off = cell.data_off as usize;
        let mut left = cell.dlen;
        loop {
            let avail = (ps - off.min(ps)) as u64;
            if avail >= left {
                off += left as usize;
                break;
            }
            left -= avail;
            let next = BigEndian::read_u64(&cur.borrow().data[0..8]);
            if next == 0 {
                pager.unref(&cur);
                pager.unref(&p);
                return Err(Error::Corrupt("overflow chain shorter than the record data"));
            }
            let q = pager.get(next)?;
            pager.unref(&cur);
            cur = q;
            off = crate::consts::LHASH_OVFL_HDR_SZ;
        }
        pager.write(&cur)?;
        self.ovfl_write_from(pager, &cur, off, data)?;
        pager.unref(&cur);
        {
            let mut pg = p.borrow_mut();
            set_cell_dlen(&mut pg.data, cell.start, cell.dlen + data.len() as u64);
        }
        group.pages[page_idx].cells[cell_idx].dlen = cell.dlen + data.len() as u64;
        pager.unref(&p);
        Ok(())
    }

    // ---------------- карта бакетов ----------------

    /// Записать пару (logical, real) в текущую страницу карты; полная
    /// страница сменяется новой, пришитой к цепочке.
    fn map_write_record(&mut self, pager: &mut Pager, logical: u64, real: u64) -> Result<()> {
        if self.map_page.ptr as usize > self.page_size - 16 {
            let old_num = self.map_page.num;
            let old = pager.get(old_num)?;
            let newp = self.acquire_page(pager)?;
            let new_pgno = newp.borrow().pgno;

            pager.write(&old)?;
            if old_num == 1 {
                header_set_map_next(&mut old.borrow_mut().data, new_pgno);
            } else {
                BigEndian::write_u64(&mut old.borrow_mut().data[0..8], new_pgno);
            }
            pager.unref(&old);

            pager.write(&newp)?;
            {
                let mut pg = newp.borrow_mut();
                BigEndian::write_u64(&mut pg.data[0..8], 0);
                BigEndian::write_u32(&mut pg.data[8..12], 0);
            }
            pager.unref(&newp);

            self.map_page = MapPageState {
                num: new_pgno,
                ptr: 12,
                nrec: 0,
                next: 0,
            };
        }

        let p = pager.get(self.map_page.num)?;
        pager.write(&p)?;
        {
            let mut pg = p.borrow_mut();
            let off = self.map_page.ptr as usize;
            BigEndian::write_u64(&mut pg.data[off..off + 8], logical);
            BigEndian::write_u64(&mut pg.data[off + 8..off + 16], real);
            self.map_page.ptr += 16;
            self.map_page.nrec += 1;
            if self.map_page.num == 1 {
                header_set_map_nrec(&mut pg.data, self.map_page.nrec);
            } else {
                BigEndian::write_u32(&mut pg.data[8..12], self.map_page.nrec);
            }
        }
        self.map.insert(logical, real);
        pager.unref(&p);
        Ok(())
    }

    // ---------------- сплит ----------------

    /// Расщепить split_bucket. Возвращает true, если пострадала страница,
    /// в которую шла текущая вставка: вызывающий обязан пересчитать бакет.
    fn split(&mut self, pager: &mut Pager, target_master: u64) -> Result<bool> {
        let real = self
            .map
            .get(self.split_bucket)
            .ok_or(Error::Corrupt("split bucket is missing from the map"))?;
        let mut old = self.load_group(pager, real, false)?;

        let raw = self.acquire_page(pager)?;
        pager.write(&raw)?;
        pager.dont_mkhot(&raw);
        let new_pgno = raw.borrow().pgno;
        let parsed = {
            let mut pg = raw.borrow_mut();
            init_empty(&mut pg.data, new_pgno)
        };
        pager.unref(&raw);
        let mut fresh = PageGroup {
            pages: vec![parsed],
        };

        self.map_write_record(pager, self.split_bucket + self.max_split, new_pgno)?;
        let retry = target_master == real;
        let high_mask = self.nmax_split - 1;
        debug!(
            "split: bucket {} -> {} (generation {})",
            self.split_bucket,
            self.split_bucket + self.max_split,
            self.max_split
        );

        // Перенос ячеек, чей новый бакет отличается от расщепляемого
        loop {
            let mut found: Option<(usize, usize)> = None;
            'scan: for (pi, page) in old.pages.iter().enumerate() {
                for (ci, cell) in page.cells.iter().enumerate() {
                    if (cell.hash as u64) & high_mask != self.split_bucket {
                        found = Some((pi, ci));
                        break 'scan;
                    }
                }
            }
            let Some((pi, ci)) = found else { break };
            let cell = old.pages[pi].cells[ci].clone();
            if cell.ovfl != 0 {
                self.transfer_cell(pager, &cell, &mut fresh)?;
            } else {
                let key = cell.key.clone().ok_or(Error::Corrupt("local cell lost its key"))?;
                let mut data = Vec::with_capacity(cell.dlen as usize);
                self.consume_cell_data(pager, &cell, &mut data)?;
                self.store_cell(pager, &mut fresh, 0, &key, &data, cell.hash, true)?;
            }
            self.unlink_cell(pager, &mut old, pi, ci)?;
        }

        self.split_bucket += 1;
        let h = pager.get(1)?;
        pager.write(&h)?;
        if self.split_bucket >= self.max_split {
            // Поколение закрыто
            self.split_bucket = 0;
            self.max_split = self.nmax_split;
            self.nmax_split <<= 1;
            if self.nmax_split == 0 {
                pager.unref(&h);
                return Err(Error::Limit("bucket generation exceeds the 64-bit space"));
            }
        }
        header_set_split(&mut h.borrow_mut().data, self.split_bucket, self.max_split);
        pager.unref(&h);
        Ok(retry)
    }

    // ---------------- вставка ----------------

    fn record_insert(
        &mut self,
        pager: &mut Pager,
        key: &[u8],
        data: &[u8],
        is_append: bool,
    ) -> Result<()> {
        if key.len() > u32::MAX as usize {
            return Err(Error::Limit("key length exceeds 32 bits"));
        }
        let hash = (self.hash)(key);
        let mut cnt = 0;
        loop {
            let bucket = self.bucket_of(hash);
            let Some(real) = self.map.get(bucket) else {
                // Первый житель бакета: новая страница + запись в карту
                let raw = self.acquire_page(pager)?;
                pager.write(&raw)?;
                pager.dont_mkhot(&raw);
                let pgno = raw.borrow().pgno;
                let parsed = {
                    let mut pg = raw.borrow_mut();
                    init_empty(&mut pg.data, pgno)
                };
                let mut group = PageGroup {
                    pages: vec![parsed],
                };
                self.store_cell(pager, &mut group, 0, key, data, hash, true)?;
                self.map_write_record(pager, bucket, pgno)?;
                pager.unref(&raw);
                return Ok(());
            };

            let mut group = self.load_group(pager, real, true)?;
            if let Some((pi, ci)) = self.find_cell_in(pager, &group, key, hash)? {
                return if is_append {
                    self.record_append(pager, &mut group, pi, ci, data)
                } else {
                    self.record_overwrite(pager, &mut group, pi, ci, data)
                };
            }

            match self.store_cell(pager, &mut group, 0, key, data, hash, false) {
                Ok(()) => return Ok(()),
                Err(Error::Full) => {
                    let retry = self.split(pager, group.master_pgno())?;
                    if retry && cnt < 2 {
                        // Сплит задел целевую страницу: бакет пересчитывается
                        cnt += 1;
                        continue;
                    }
                    // После сплита содержимое могло перераспределиться
                    let mut group = self.load_group(pager, real, true)?;
                    return self.store_cell(pager, &mut group, 0, key, data, hash, true);
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---------------- открытие ----------------

    fn open_impl(&mut self, pager: &mut Pager, db_pages: u64) -> Result<()> {
        if db_pages < 1 {
            // Свежая база: страница 1 — заголовок движка
            let p = pager.new_page()?;
            pager.write(&p)?;
            let hdr = LhashHeader {
                free_list: 0,
                split_bucket: 0,
                max_split_bucket: 1,
                map_next: 0,
                map_nrec: 0,
            };
            header_write(&mut p.borrow_mut().data, &hdr, self.hash);
            pager.unref(&p);
            self.free_list = 0;
            self.split_bucket = 0;
            self.max_split = 1;
            self.nmax_split = 2;
            self.map_page = MapPageState {
                num: 1,
                ptr: LHASH_HDR_SZ as u32,
                nrec: 0,
                next: 0,
            };
            return Ok(());
        }

        let p = pager.get(1)?;
        let hdr = {
            let pg = p.borrow();
            header_read(&pg.data, self.hash)?
        };
        self.free_list = hdr.free_list;
        self.split_bucket = hdr.split_bucket;
        self.max_split = hdr.max_split_bucket.max(1);
        self.nmax_split = self.max_split << 1;
        self.map.clear();
        let mut state = MapPageState {
            num: 1,
            ptr: LHASH_HDR_SZ as u32,
            nrec: hdr.map_nrec,
            next: hdr.map_next,
        };
        {
            let pg = p.borrow();
            map_load_page(&pg.data, &mut state, &mut self.map)?;
        }
        pager.unref(&p);

        while state.next != 0 {
            let num = state.next;
            let q = pager.get(num)?;
            state.num = num;
            state.ptr = 0;
            {
                let pg = q.borrow();
                map_load_page(&pg.data, &mut state, &mut self.map)?;
            }
            pager.unref(&q);
        }
        self.map_page = state;
        Ok(())
    }
}

impl KvEngine for LhashKv {
    fn name(&self) -> &'static str {
        crate::consts::KV_NAME_LHASH
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, page_size: usize) -> Result<()> {
        let hash = self.hash;
        let cmp = self.cmp;
        *self = LhashKv::new(page_size);
        self.hash = hash;
        self.cmp = cmp;
        Ok(())
    }

    fn open(&mut self, pager: &mut Pager, db_pages: u64) -> Result<()> {
        self.open_impl(pager, db_pages)
    }

    fn config(&mut self, cmd: KvConfig) -> Result<()> {
        match cmd {
            KvConfig::HashFunc(f) => {
                if !self.map.is_empty() {
                    return Err(Error::Locked("hash function can only change on an empty store"));
                }
                self.hash = f;
            }
            KvConfig::CmpFunc(f) => self.cmp = f,
        }
        Ok(())
    }

    fn replace(&mut self, pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()> {
        self.record_insert(pager, key, data, false)
    }

    fn append(&mut self, pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()> {
        self.record_insert(pager, key, data, true)
    }

    fn cursor_open(&mut self) -> CursorId {
        cursor::cursor_open(self)
    }

    fn cursor_close(&mut self, cur: CursorId) {
        cursor::cursor_close(self, cur)
    }

    fn cursor_seek(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        key: &[u8],
        mode: SeekMode,
    ) -> Result<()> {
        cursor::cursor_seek(self, pager, cur, key, mode)
    }

    fn cursor_first(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        cursor::cursor_first(self, pager, cur)
    }

    fn cursor_last(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        cursor::cursor_last(self, pager, cur)
    }

    fn cursor_valid(&self, cur: CursorId) -> bool {
        cursor::cursor_valid(self, cur)
    }

    fn cursor_next(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        cursor::cursor_next(self, pager, cur)
    }

    fn cursor_prev(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        cursor::cursor_prev(self, pager, cur)
    }

    fn cursor_key_len(&mut self, pager: &mut Pager, cur: CursorId) -> Result<usize> {
        cursor::cursor_key_len(self, pager, cur)
    }

    fn cursor_data_len(&mut self, pager: &mut Pager, cur: CursorId) -> Result<u64> {
        cursor::cursor_data_len(self, pager, cur)
    }

    fn cursor_key(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        cursor::cursor_key(self, pager, cur, sink)
    }

    fn cursor_data(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        cursor::cursor_data(self, pager, cur, sink)
    }

    fn cursor_delete(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        cursor::cursor_delete(self, pager, cur)
    }
}
