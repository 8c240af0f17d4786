//! kv/lhash/overflow — overflow-цепочки и свободный список страниц.
//!
//! Страница цепочки: [next u64][payload]. Первая страница цепочки ячейки
//! дополнительно несёт [data page u64][data off u16] перед байтами
//! ключа: данные находятся без повторного сканирования ключа.
//!
//! Свободный список — односвязный через первые 8 байт страницы, якорь в
//! заголовке движка. Повторно используемая страница переписывается
//! целиком, поэтому её прообраз в журнале не нужен (dont_journal).

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::consts::{LHASH_OVFL_FIRST_HDR_SZ, LHASH_OVFL_HDR_SZ};
use crate::error::{Error, Result};
use crate::kv::Consumer;
use crate::pager::page::PageRef;
use crate::pager::Pager;

use super::header::header_set_free_list;
use super::page::Cell;
use super::LhashKv;

impl LhashKv {
    /// Страница из свободного списка либо новая от pager'а.
    pub(crate) fn acquire_page(&mut self, pager: &mut Pager) -> Result<PageRef> {
        if self.free_list != 0 {
            let p = pager.get(self.free_list)?;
            let next = BigEndian::read_u64(&p.borrow().data[0..8]);
            let h = pager.get(1)?;
            pager.write(&h)?;
            self.free_list = next;
            header_set_free_list(&mut h.borrow_mut().data, next);
            pager.unref(&h);
            // Тело будет переписано целиком: прообраз в журнале не нужен
            pager.dont_journal(&p);
            debug!("reusing free page {}", p.borrow().pgno);
            return Ok(p);
        }
        pager.new_page()
    }

    /// Вернуть страницу в голову свободного списка.
    pub(crate) fn release_page(&mut self, pager: &mut Pager, page: &PageRef) -> Result<()> {
        let h = pager.get(1)?;
        pager.write(&h)?;
        pager.write(page)?;
        BigEndian::write_u64(&mut page.borrow_mut().data[0..8], self.free_list);
        self.free_list = page.borrow().pgno;
        header_set_free_list(&mut h.borrow_mut().data, self.free_list);
        pager.unref(&h);
        Ok(())
    }

    /// Вернуть всю overflow-цепочку в свободный список.
    pub(crate) fn free_ovfl_chain(&mut self, pager: &mut Pager, head: u64) -> Result<()> {
        let mut cur = head;
        while cur != 0 {
            let p = pager.get(cur)?;
            let next = BigEndian::read_u64(&p.borrow().data[0..8]);
            self.release_page(pager, &p)?;
            pager.unref(&p);
            cur = next;
        }
        Ok(())
    }

    /// Выложить payload ячейки в overflow-цепочку: сначала ключ, затем
    /// куски данных. Возвращает (головная страница, страница данных,
    /// смещение данных).
    pub(crate) fn write_ovfl_payload(
        &mut self,
        pager: &mut Pager,
        key: &[u8],
        chunks: &[&[u8]],
    ) -> Result<(u64, u64, u16)> {
        let ps = self.page_size;
        let first = self.acquire_page(pager)?;
        pager.write(&first)?;
        let head_pgno = first.borrow().pgno;
        BigEndian::write_u64(&mut first.borrow_mut().data[0..8], 0);

        let mut cur = first.clone();
        let mut off = LHASH_OVFL_FIRST_HDR_SZ;

        // Ключ
        let mut rest = key;
        while !rest.is_empty() {
            if off >= ps {
                cur = self.ovfl_append_page(pager, &cur, head_pgno)?;
                off = LHASH_OVFL_HDR_SZ;
            }
            let n = rest.len().min(ps - off);
            cur.borrow_mut().data[off..off + n].copy_from_slice(&rest[..n]);
            off += n;
            rest = &rest[n..];
        }

        // Точка начала данных — в заголовок первой страницы
        let data_page = cur.borrow().pgno;
        let data_off = off as u16;
        {
            let mut f = first.borrow_mut();
            BigEndian::write_u64(&mut f.data[8..16], data_page);
            BigEndian::write_u16(&mut f.data[16..18], data_off);
        }

        // Данные
        for chunk in chunks {
            let mut rest = *chunk;
            while !rest.is_empty() {
                if off >= ps {
                    cur = self.ovfl_append_page(pager, &cur, head_pgno)?;
                    off = LHASH_OVFL_HDR_SZ;
                }
                let n = rest.len().min(ps - off);
                cur.borrow_mut().data[off..off + n].copy_from_slice(&rest[..n]);
                off += n;
                rest = &rest[n..];
            }
        }

        let last = cur.borrow().pgno;
        if last != head_pgno {
            pager.unref(&cur);
        }
        pager.unref(&first);
        Ok((head_pgno, data_page, data_off))
    }

    /// Нарастить цепочку: новая страница, ссылка из текущей.
    fn ovfl_append_page(
        &mut self,
        pager: &mut Pager,
        cur: &PageRef,
        head_pgno: u64,
    ) -> Result<PageRef> {
        let newp = self.acquire_page(pager)?;
        pager.write(&newp)?;
        BigEndian::write_u64(&mut cur.borrow_mut().data[0..8], newp.borrow().pgno);
        if cur.borrow().pgno != head_pgno {
            pager.unref(cur);
        }
        BigEndian::write_u64(&mut newp.borrow_mut().data[0..8], 0);
        Ok(newp)
    }

    /// Дописать/переписать байты данных начиная с (page, off); цепочка
    /// продолжается новыми страницами по мере надобности.
    pub(crate) fn ovfl_write_from(
        &mut self,
        pager: &mut Pager,
        start: &PageRef,
        start_off: usize,
        data: &[u8],
    ) -> Result<()> {
        let ps = self.page_size;
        let head = start.borrow().pgno;
        let mut cur = start.clone();
        let mut off = start_off;
        let mut rest = data;
        while !rest.is_empty() {
            if off >= ps {
                cur = self.ovfl_append_page(pager, &cur, head)?;
                off = LHASH_OVFL_HDR_SZ;
            }
            let n = rest.len().min(ps - off);
            cur.borrow_mut().data[off..off + n].copy_from_slice(&rest[..n]);
            off += n;
            rest = &rest[n..];
        }
        if cur.borrow().pgno != head {
            pager.unref(&cur);
        }
        Ok(())
    }

    /// Прочитать заголовок первой overflow-страницы ячейки: (страница
    /// данных, смещение); заодно, если ключ умещается в памяти, собрать
    /// его байты по цепочке.
    pub(crate) fn ovfl_read_key(
        &self,
        pager: &mut Pager,
        ovfl: u64,
        klen: usize,
        want_key: bool,
    ) -> Result<(u64, u16, Option<Vec<u8>>)> {
        let ps = self.page_size;
        let p = pager.get(ovfl)?;
        let (mut next, data_page, data_off) = {
            let pg = p.borrow();
            (
                BigEndian::read_u64(&pg.data[0..8]),
                BigEndian::read_u64(&pg.data[8..16]),
                BigEndian::read_u16(&pg.data[16..18]),
            )
        };
        if !want_key {
            pager.unref(&p);
            return Ok((data_page, data_off, None));
        }
        let mut key = Vec::with_capacity(klen);
        let mut left = klen;
        {
            let pg = p.borrow();
            let n = left.min(ps - LHASH_OVFL_FIRST_HDR_SZ);
            key.extend_from_slice(&pg.data[LHASH_OVFL_FIRST_HDR_SZ..LHASH_OVFL_FIRST_HDR_SZ + n]);
            left -= n;
        }
        pager.unref(&p);
        while left > 0 {
            if next == 0 {
                return Err(Error::Corrupt("overflow chain ends inside the key"));
            }
            let q = pager.get(next)?;
            {
                let pg = q.borrow();
                let n = left.min(ps - LHASH_OVFL_HDR_SZ);
                key.extend_from_slice(&pg.data[LHASH_OVFL_HDR_SZ..LHASH_OVFL_HDR_SZ + n]);
                left -= n;
                next = BigEndian::read_u64(&pg.data[0..8]);
            }
            pager.unref(&q);
        }
        Ok((data_page, data_off, Some(key)))
    }

    /// Потоковая выдача ключа ячейки.
    pub(crate) fn consume_cell_key(
        &self,
        pager: &mut Pager,
        cell: &Cell,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        if let Some(k) = &cell.key {
            return sink.chunk(k).map_err(|_| Error::Abort);
        }
        if cell.ovfl == 0 {
            // Локальный ключ без копии в памяти: читаем со страницы
            let p = pager.get(cell.pgno)?;
            let rc = {
                let pg = p.borrow();
                let s = cell.start as usize + crate::consts::LHASH_CELL_SZ;
                sink.chunk(&pg.data[s..s + cell.klen as usize])
            };
            pager.unref(&p);
            return rc.map_err(|_| Error::Abort);
        }
        let ps = self.page_size;
        let mut cur = cell.ovfl;
        let mut left = cell.klen as usize;
        let mut first = true;
        while left > 0 {
            if cur == 0 {
                return Err(Error::Corrupt("overflow chain ends inside the key"));
            }
            let p = pager.get(cur)?;
            let rc = {
                let pg = p.borrow();
                let skip = if first {
                    LHASH_OVFL_FIRST_HDR_SZ
                } else {
                    LHASH_OVFL_HDR_SZ
                };
                let n = left.min(ps - skip);
                let rc = sink.chunk(&pg.data[skip..skip + n]);
                if rc.is_ok() {
                    left -= n;
                }
                cur = BigEndian::read_u64(&pg.data[0..8]);
                rc
            };
            pager.unref(&p);
            rc.map_err(|_| Error::Abort)?;
            first = false;
        }
        Ok(())
    }

    /// Потоковая выдача данных ячейки.
    pub(crate) fn consume_cell_data(
        &self,
        pager: &mut Pager,
        cell: &Cell,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        if cell.ovfl == 0 {
            let p = pager.get(cell.pgno)?;
            let rc = {
                let pg = p.borrow();
                let s = cell.start as usize + crate::consts::LHASH_CELL_SZ + cell.klen as usize;
                sink.chunk(&pg.data[s..s + cell.dlen as usize])
            };
            pager.unref(&p);
            return rc.map_err(|_| Error::Abort);
        }
        let ps = self.page_size;
        let mut cur = cell.data_page;
        let mut off = cell.data_off as usize;
        let mut left = cell.dlen;
        while left > 0 {
            if cur == 0 {
                return Err(Error::Corrupt("overflow chain ends inside the data"));
            }
            let p = pager.get(cur)?;
            let rc = {
                let pg = p.borrow();
                let avail = ps.saturating_sub(off);
                let n = (left.min(avail as u64)) as usize;
                let rc = if n > 0 {
                    sink.chunk(&pg.data[off..off + n])
                } else {
                    Ok(())
                };
                if rc.is_ok() {
                    left -= n as u64;
                }
                cur = BigEndian::read_u64(&pg.data[0..8]);
                rc
            };
            pager.unref(&p);
            rc.map_err(|_| Error::Abort)?;
            off = LHASH_OVFL_HDR_SZ;
        }
        Ok(())
    }
}
