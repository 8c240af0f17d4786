//! kv/lhash/page — байтовая раскладка первичной KV-страницы.
//!
//! [first cell u16][first free u16][slave u64], дальше вперемешку ячейки
//! и свободные блоки. Ячейка: [hash u32][klen u32][dlen u64][next u16]
//! [ovfl u64] + локальный payload (ключ, затем данные), если ovfl == 0.
//! Свободный блок: [next u16][len u16]; блоки короче 4 байт
//! выбрасываются из учёта.
//!
//! Цепочка ячеек растёт с головы: first_cell указывает на самую свежую.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::{LHASH_CELL_SZ, LHASH_MIN_FREE_BLOCK, LHASH_PAGE_HDR_SZ};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct PageHdr {
    pub first_cell: u16,
    pub first_free: u16,
    pub slave: u64,
}

/// Ячейка, разобранная в память. Для локального payload'а ключ
/// загружается сразу; для overflow-ячеек key/data_page/data_off
/// дозаполняет движок чтением первой overflow-страницы.
#[derive(Debug, Clone)]
pub struct Cell {
    pub hash: u32,
    pub klen: u32,
    pub dlen: u64,
    pub next: u16,
    pub ovfl: u64,
    pub start: u16,
    /// Страница, на которой лежит ячейка.
    pub pgno: u64,
    pub data_page: u64,
    pub data_off: u16,
    /// None — ключ слишком велик для памяти (сравнение потоковое).
    pub key: Option<Vec<u8>>,
}

/// Первичная страница в разобранном виде: заголовок, ячейки в порядке
/// цепочки (свежие впереди), свободное место.
#[derive(Debug)]
pub struct LhPage {
    pub pgno: u64,
    pub hdr: PageHdr,
    pub cells: Vec<Cell>,
    pub nfree: u16,
}

#[inline]
pub fn read_hdr(raw: &[u8]) -> PageHdr {
    PageHdr {
        first_cell: BigEndian::read_u16(&raw[0..2]),
        first_free: BigEndian::read_u16(&raw[2..4]),
        slave: BigEndian::read_u64(&raw[4..12]),
    }
}

#[inline]
pub fn set_first_cell(raw: &mut [u8], v: u16) {
    BigEndian::write_u16(&mut raw[0..2], v);
}

#[inline]
pub fn set_first_free(raw: &mut [u8], v: u16) {
    BigEndian::write_u16(&mut raw[2..4], v);
}

#[inline]
pub fn set_slave(raw: &mut [u8], v: u64) {
    BigEndian::write_u64(&mut raw[4..12], v);
}

/// Разметить страницу пустой: один свободный блок во весь payload.
pub fn init_empty(raw: &mut [u8], pgno: u64) -> LhPage {
    let ps = raw.len();
    set_first_cell(raw, 0);
    set_first_free(raw, LHASH_PAGE_HDR_SZ as u16);
    set_slave(raw, 0);
    let nfree = (ps - LHASH_PAGE_HDR_SZ) as u16;
    BigEndian::write_u16(&mut raw[LHASH_PAGE_HDR_SZ..LHASH_PAGE_HDR_SZ + 2], 0);
    BigEndian::write_u16(&mut raw[LHASH_PAGE_HDR_SZ + 2..LHASH_PAGE_HDR_SZ + 4], nfree);
    LhPage {
        pgno,
        hdr: PageHdr {
            first_cell: 0,
            first_free: LHASH_PAGE_HDR_SZ as u16,
            slave: 0,
        },
        cells: Vec::new(),
        nfree,
    }
}

/// Суммарное свободное место по цепочке блоков.
pub fn compute_free(raw: &[u8], hdr: &PageHdr) -> Result<u16> {
    let ps = raw.len();
    if hdr.first_free == 0 {
        return Ok(0);
    }
    let mut off = hdr.first_free as usize;
    let mut nfree: u32 = 0;
    loop {
        if off + 4 > ps {
            return Err(Error::Corrupt("free block beyond the page end"));
        }
        let next = BigEndian::read_u16(&raw[off..off + 2]);
        let len = BigEndian::read_u16(&raw[off + 2..off + 4]);
        nfree += len as u32;
        if next == 0 {
            break;
        }
        off = next as usize;
    }
    if nfree as usize > ps {
        return Err(Error::Corrupt("free space exceeds the page size"));
    }
    Ok(nfree as u16)
}

/// Разобрать одну ячейку по смещению.
pub fn parse_one_cell(raw: &[u8], off: usize, pgno: u64) -> Result<Cell> {
    let ps = raw.len();
    if off + LHASH_CELL_SZ > ps {
        return Err(Error::Corrupt("cell header beyond the page end"));
    }
    let hash = BigEndian::read_u32(&raw[off..off + 4]);
    let klen = BigEndian::read_u32(&raw[off + 4..off + 8]);
    let dlen = BigEndian::read_u64(&raw[off + 8..off + 16]);
    let next = BigEndian::read_u16(&raw[off + 16..off + 18]);
    let ovfl = BigEndian::read_u64(&raw[off + 18..off + 26]);
    if next as usize >= ps {
        return Err(Error::Corrupt("next-cell offset beyond the page end"));
    }
    let key = if ovfl == 0 {
        let kstart = off + LHASH_CELL_SZ;
        let kend = kstart + klen as usize;
        let dend = kend.checked_add(dlen as usize).ok_or(Error::Corrupt("cell payload overflow"))?;
        if dend > ps {
            return Err(Error::Corrupt("local cell payload beyond the page end"));
        }
        Some(raw[kstart..kend].to_vec())
    } else {
        None
    };
    Ok(Cell {
        hash,
        klen,
        dlen,
        next,
        ovfl,
        start: off as u16,
        pgno,
        data_page: 0,
        data_off: 0,
        key,
    })
}

/// Разобрать страницу: заголовок, свободное место, цепочка ячеек.
pub fn parse_page(raw: &[u8], pgno: u64) -> Result<LhPage> {
    let hdr = read_hdr(raw);
    let nfree = compute_free(raw, &hdr)?;
    let mut cells = Vec::new();
    if hdr.first_cell != 0 {
        let ps = raw.len();
        let mut off = hdr.first_cell as usize;
        loop {
            let cell = parse_one_cell(raw, off, pgno)?;
            let next = cell.next;
            cells.push(cell);
            if next == 0 {
                break;
            }
            off = next as usize;
            if off >= ps || cells.len() > ps / LHASH_CELL_SZ {
                return Err(Error::Corrupt("cell chain does not terminate"));
            }
        }
    }
    Ok(LhPage {
        pgno,
        hdr,
        cells,
        nfree,
    })
}

/// Записать заголовок ячейки по cell.start (страница уже записываемая).
pub fn write_cell_header(raw: &mut [u8], cell: &Cell) {
    let off = cell.start as usize;
    BigEndian::write_u32(&mut raw[off..off + 4], cell.hash);
    BigEndian::write_u32(&mut raw[off + 4..off + 8], cell.klen);
    BigEndian::write_u64(&mut raw[off + 8..off + 16], cell.dlen);
    BigEndian::write_u16(&mut raw[off + 16..off + 18], cell.next);
    BigEndian::write_u64(&mut raw[off + 18..off + 26], cell.ovfl);
}

#[inline]
pub fn set_cell_dlen(raw: &mut [u8], start: u16, dlen: u64) {
    let off = start as usize;
    BigEndian::write_u64(&mut raw[off + 8..off + 16], dlen);
}

#[inline]
pub fn set_cell_next(raw: &mut [u8], start: u16, next: u16) {
    let off = start as usize;
    BigEndian::write_u16(&mut raw[off + 16..off + 18], next);
}

#[inline]
pub fn set_cell_ovfl(raw: &mut [u8], start: u16, ovfl: u64) {
    let off = start as usize;
    BigEndian::write_u64(&mut raw[off + 18..off + 26], ovfl);
}

/// Вырезать блок >= amount из цепочки свободных. None — сплошного куска
/// нет (дефрагментация — забота вызывающего).
pub fn carve_free_block(
    raw: &mut [u8],
    hdr: &mut PageHdr,
    nfree: &mut u16,
    amount: u16,
) -> Option<u16> {
    let ps = raw.len();
    let mut prev: Option<usize> = None;
    let mut off = hdr.first_free as usize;
    loop {
        if off == 0 || off + 4 > ps {
            return None;
        }
        let mut next = BigEndian::read_u16(&raw[off..off + 2]);
        let blksz = BigEndian::read_u16(&raw[off + 2..off + 4]);
        if blksz >= amount {
            let mut carved = blksz;
            if blksz - amount > (LHASH_MIN_FREE_BLOCK as u16 - 1) {
                // Остаток образует новый блок
                let nb = off + amount as usize;
                BigEndian::write_u16(&mut raw[nb..nb + 2], next);
                BigEndian::write_u16(&mut raw[nb + 2..nb + 4], blksz - amount);
                next = nb as u16;
                carved = amount;
            }
            match prev {
                Some(p) => BigEndian::write_u16(&mut raw[p..p + 2], next),
                None => {
                    hdr.first_free = next;
                    set_first_free(raw, next);
                }
            }
            *nfree -= carved;
            return Some(off as u16);
        }
        prev = Some(off);
        if next == 0 {
            return None;
        }
        off = next as usize;
    }
}

/// Вернуть диапазон в свободные блоки. Куски короче 4 байт пропадают.
pub fn restore_space(raw: &mut [u8], hdr: &mut PageHdr, nfree: &mut u16, off: u16, len: u16) {
    if (len as usize) < LHASH_MIN_FREE_BLOCK {
        return;
    }
    let o = off as usize;
    BigEndian::write_u16(&mut raw[o..o + 2], hdr.first_free);
    BigEndian::write_u16(&mut raw[o + 2..o + 4], len);
    hdr.first_free = off;
    set_first_free(raw, off);
    *nfree += len;
}

/// Дефрагментация: живые ячейки переносятся в начало, свободное место
/// слипается в один блок. Цепочка ячеек после переноса идёт от старых
/// к свежим (порядок vec разворачивается).
pub fn defragment(raw: &mut [u8], page: &mut LhPage) {
    let ps = raw.len();
    let mut scratch = vec![0u8; ps];
    BigEndian::write_u64(&mut scratch[4..12], page.hdr.slave);

    let mut ptr = LHASH_PAGE_HDR_SZ;
    let mut head: u16 = 0;
    for cell in page.cells.iter_mut() {
        let payload: Option<(usize, usize)> = if cell.ovfl == 0 {
            let s = cell.start as usize + LHASH_CELL_SZ;
            Some((s, s + cell.klen as usize + cell.dlen as usize))
        } else {
            None
        };
        cell.next = head;
        cell.start = ptr as u16;
        head = cell.start;

        BigEndian::write_u32(&mut scratch[ptr..ptr + 4], cell.hash);
        BigEndian::write_u32(&mut scratch[ptr + 4..ptr + 8], cell.klen);
        BigEndian::write_u64(&mut scratch[ptr + 8..ptr + 16], cell.dlen);
        BigEndian::write_u16(&mut scratch[ptr + 16..ptr + 18], cell.next);
        BigEndian::write_u64(&mut scratch[ptr + 18..ptr + 26], cell.ovfl);
        ptr += LHASH_CELL_SZ;
        if let Some((s, e)) = payload {
            scratch[ptr..ptr + (e - s)].copy_from_slice(&raw[s..e]);
            ptr += e - s;
        }
    }
    page.hdr.first_cell = head;

    let tail = ps - ptr;
    if tail >= LHASH_MIN_FREE_BLOCK {
        page.hdr.first_free = ptr as u16;
        page.nfree = tail as u16;
        BigEndian::write_u16(&mut scratch[ptr..ptr + 2], 0);
        BigEndian::write_u16(&mut scratch[ptr + 2..ptr + 4], tail as u16);
    } else {
        page.hdr.first_free = 0;
        page.nfree = 0;
    }
    BigEndian::write_u16(&mut scratch[0..2], page.hdr.first_cell);
    BigEndian::write_u16(&mut scratch[2..4], page.hdr.first_free);
    raw.copy_from_slice(&scratch);
    // Вектор ячеек отражает новую цепочку: свежие впереди
    page.cells.reverse();
}
