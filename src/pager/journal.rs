//! pager/journal — формат журнала отката.
//!
//! Header (один сектор, BE):
//!   [magic8][nRec u32][cksum seed u32][orig pages u64][sector u32][page u32][нули до сектора]
//! Запись:
//!   [pgno u64][page bytes][cksum u32]
//!
//! Контрольная сумма записи — не настоящая: seed + каждый 200-й байт
//! страницы, начиная с конца. При сбое питания страдает обычно хвост
//! записи, и такая выборка его ловит; смена формулы ломает совместимость
//! формата журнала.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::{
    JOURNAL_CKSUM_STEP, JOURNAL_HDR_FIXED_SZ, JOURNAL_MAGIC, JOURNAL_OFF_NREC, MAX_PAGE_SIZE,
    MAX_SECTOR_SIZE, MIN_PAGE_SIZE, MIN_SECTOR_SIZE,
};
use crate::error::Result;
use crate::util::is_power_of_two;
use crate::vfs::VfsFile;

#[derive(Debug, Clone, Copy)]
pub struct JournalHeader {
    pub n_rec: u32,
    pub cksum_seed: u32,
    pub orig_pages: u64,
    pub sector_size: usize,
    pub page_size: usize,
}

/// Контрольная сумма страницы журнала.
#[inline]
pub fn journal_cksum(seed: u32, page: &[u8]) -> u32 {
    let mut cksum = seed;
    let mut i = page.len() as isize - JOURNAL_CKSUM_STEP as isize;
    while i > 0 {
        cksum = cksum.wrapping_add(page[i as usize] as u32);
        i -= JOURNAL_CKSUM_STEP as isize;
    }
    cksum
}

/// Записать заголовок журнала (nRec=0) в начало файла, дополнив до сектора.
pub fn write_journal_header(
    jfd: &mut dyn VfsFile,
    sector_size: usize,
    page_size: usize,
    cksum_seed: u32,
    orig_pages: u64,
) -> Result<()> {
    let mut buf = vec![0u8; sector_size.max(JOURNAL_HDR_FIXED_SZ)];
    buf[0..8].copy_from_slice(&JOURNAL_MAGIC);
    BigEndian::write_u32(&mut buf[8..12], 0); // nRec, финализируется при коммите
    BigEndian::write_u32(&mut buf[12..16], cksum_seed);
    BigEndian::write_u64(&mut buf[16..24], orig_pages);
    BigEndian::write_u32(&mut buf[24..28], sector_size as u32);
    BigEndian::write_u32(&mut buf[28..32], page_size as u32);
    jfd.write_at(&buf, 0)
}

/// Прописать итоговое число записей в заголовке.
pub fn finalize_journal_nrec(jfd: &mut dyn VfsFile, n_rec: u32) -> Result<()> {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, n_rec);
    jfd.write_at(&buf, JOURNAL_OFF_NREC)
}

/// Прочитать и проверить заголовок журнала. `Ok(None)` — заголовок
/// битый или чужой: журнал не «горячий», его следует удалить.
pub fn read_journal_header(jfd: &mut dyn VfsFile) -> Result<Option<JournalHeader>> {
    let mut buf = [0u8; JOURNAL_HDR_FIXED_SZ];
    let n = jfd.read_at(&mut buf, 0)?;
    if n < JOURNAL_HDR_FIXED_SZ || buf[0..8] != JOURNAL_MAGIC {
        return Ok(None);
    }
    let n_rec = BigEndian::read_u32(&buf[8..12]);
    let cksum_seed = BigEndian::read_u32(&buf[12..16]);
    let orig_pages = BigEndian::read_u64(&buf[16..24]);
    let sector_size = BigEndian::read_u32(&buf[24..28]) as usize;
    let page_size = BigEndian::read_u32(&buf[28..32]) as usize;

    if !is_power_of_two(page_size)
        || page_size < MIN_PAGE_SIZE
        || page_size > MAX_PAGE_SIZE
        || !is_power_of_two(sector_size)
        || sector_size < MIN_SECTOR_SIZE
        || sector_size > MAX_SECTOR_SIZE
    {
        return Ok(None);
    }

    Ok(Some(JournalHeader {
        n_rec,
        cksum_seed,
        orig_pages,
        sector_size,
        page_size,
    }))
}

/// Дописать одну запись (pgno + образ страницы + cksum) по смещению off.
/// Возвращает длину записи.
pub fn append_journal_record(
    jfd: &mut dyn VfsFile,
    off: u64,
    pgno: u64,
    page: &[u8],
    cksum_seed: u32,
) -> Result<u64> {
    let mut rec = Vec::with_capacity(8 + page.len() + 4);
    let mut b8 = [0u8; 8];
    BigEndian::write_u64(&mut b8, pgno);
    rec.extend_from_slice(&b8);
    rec.extend_from_slice(page);
    let mut b4 = [0u8; 4];
    BigEndian::write_u32(&mut b4, journal_cksum(cksum_seed, page));
    rec.extend_from_slice(&b4);
    jfd.write_at(&rec, off)?;
    Ok(rec.len() as u64)
}

/// Одна запись журнала, прочитанная при проигрывании.
pub struct JournalRecord {
    pub pgno: u64,
    pub data: Vec<u8>,
    pub cksum_ok: bool,
}

/// Прочитать запись по смещению off. `Ok(None)` — усечённый хвост.
pub fn read_journal_record(
    jfd: &mut dyn VfsFile,
    off: u64,
    page_size: usize,
    cksum_seed: u32,
) -> Result<Option<JournalRecord>> {
    let mut hdr = [0u8; 8];
    if jfd.read_at(&mut hdr, off)? < 8 {
        return Ok(None);
    }
    let pgno = BigEndian::read_u64(&hdr);
    let mut data = vec![0u8; page_size];
    if jfd.read_at(&mut data, off + 8)? < page_size {
        return Ok(None);
    }
    let mut ck = [0u8; 4];
    if jfd.read_at(&mut ck, off + 8 + page_size as u64)? < 4 {
        return Ok(None);
    }
    let stored = BigEndian::read_u32(&ck);
    let cksum_ok = stored == journal_cksum(cksum_seed, &data);
    Ok(Some(JournalRecord {
        pgno,
        data,
        cksum_ok,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cksum_samples_every_200th_byte_from_tail() {
        let mut page = vec![0u8; 1024];
        // выборка: 1024-200=824, 624, 424, 224, 24
        for off in [824usize, 624, 424, 224, 24] {
            page[off] = 1;
        }
        assert_eq!(journal_cksum(7, &page), 7 + 5);
        // байт вне выборки суммы не меняет
        page[100] = 0xFF;
        assert_eq!(journal_cksum(7, &page), 7 + 5);
        // байт из выборки — меняет
        page[424] = 3;
        assert_eq!(journal_cksum(7, &page), 7 + 4 + 3);
    }

    #[test]
    fn cksum_small_page() {
        let page = vec![0xAAu8; 100];
        // len-200 < 0: только seed
        assert_eq!(journal_cksum(42, &page), 42);
    }
}
