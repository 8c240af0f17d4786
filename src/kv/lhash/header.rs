//! kv/lhash/header — заголовок движка на его первой странице (pgno 1, BE):
//! [magic u32][hash fp u32][free list u64][split u64][max_split u64]
//! [map next u64][map nrec u32], далее — записи карты бакетов.
//!
//! Отпечаток хеш-функции — hash(пробного слова): база, созданная с
//! другой функцией, отвергается при открытии.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::{
    LHASH_HASH_PROBE, LHASH_HDR_SZ, LHASH_MAGIC, LHASH_OFF_FREE, LHASH_OFF_MAP_NEXT,
    LHASH_OFF_MAP_NREC, LHASH_OFF_MAX_SPLIT, LHASH_OFF_SPLIT,
};
use crate::error::{Error, Result};
use crate::kv::HashFn;

#[derive(Debug, Clone, Copy)]
pub struct LhashHeader {
    pub free_list: u64,
    pub split_bucket: u64,
    pub max_split_bucket: u64,
    pub map_next: u64,
    pub map_nrec: u32,
}

#[inline]
pub fn hash_fingerprint(hash: HashFn) -> u32 {
    hash(LHASH_HASH_PROBE)
}

/// Прочитать и проверить заголовок движка.
pub fn header_read(raw: &[u8], hash: HashFn) -> Result<LhashHeader> {
    if raw.len() < LHASH_HDR_SZ {
        return Err(Error::Corrupt("page too small for the engine header"));
    }
    let magic = BigEndian::read_u32(&raw[0..4]);
    if magic != LHASH_MAGIC {
        return Err(Error::Corrupt("bad linear-hash magic"));
    }
    let fp = BigEndian::read_u32(&raw[4..8]);
    if fp != hash_fingerprint(hash) {
        return Err(Error::Invalid("database was created with a different hash function"));
    }
    Ok(LhashHeader {
        free_list: BigEndian::read_u64(&raw[LHASH_OFF_FREE..LHASH_OFF_FREE + 8]),
        split_bucket: BigEndian::read_u64(&raw[LHASH_OFF_SPLIT..LHASH_OFF_SPLIT + 8]),
        max_split_bucket: BigEndian::read_u64(&raw[LHASH_OFF_MAX_SPLIT..LHASH_OFF_MAX_SPLIT + 8]),
        map_next: BigEndian::read_u64(&raw[LHASH_OFF_MAP_NEXT..LHASH_OFF_MAP_NEXT + 8]),
        map_nrec: BigEndian::read_u32(&raw[LHASH_OFF_MAP_NREC..LHASH_OFF_MAP_NREC + 4]),
    })
}

/// Записать заголовок целиком (свежая база).
pub fn header_write(raw: &mut [u8], h: &LhashHeader, hash: HashFn) {
    BigEndian::write_u32(&mut raw[0..4], LHASH_MAGIC);
    BigEndian::write_u32(&mut raw[4..8], hash_fingerprint(hash));
    BigEndian::write_u64(&mut raw[LHASH_OFF_FREE..LHASH_OFF_FREE + 8], h.free_list);
    BigEndian::write_u64(&mut raw[LHASH_OFF_SPLIT..LHASH_OFF_SPLIT + 8], h.split_bucket);
    BigEndian::write_u64(
        &mut raw[LHASH_OFF_MAX_SPLIT..LHASH_OFF_MAX_SPLIT + 8],
        h.max_split_bucket,
    );
    BigEndian::write_u64(&mut raw[LHASH_OFF_MAP_NEXT..LHASH_OFF_MAP_NEXT + 8], h.map_next);
    BigEndian::write_u32(&mut raw[LHASH_OFF_MAP_NREC..LHASH_OFF_MAP_NREC + 4], h.map_nrec);
}

// Точечные обновления полей (страница уже помечена записываемой).

#[inline]
pub fn header_set_free_list(raw: &mut [u8], v: u64) {
    BigEndian::write_u64(&mut raw[LHASH_OFF_FREE..LHASH_OFF_FREE + 8], v);
}

#[inline]
pub fn header_set_split(raw: &mut [u8], split: u64, max_split: u64) {
    BigEndian::write_u64(&mut raw[LHASH_OFF_SPLIT..LHASH_OFF_SPLIT + 8], split);
    BigEndian::write_u64(&mut raw[LHASH_OFF_MAX_SPLIT..LHASH_OFF_MAX_SPLIT + 8], max_split);
}

#[inline]
pub fn header_set_map_next(raw: &mut [u8], v: u64) {
    BigEndian::write_u64(&mut raw[LHASH_OFF_MAP_NEXT..LHASH_OFF_MAP_NEXT + 8], v);
}

#[inline]
pub fn header_set_map_nrec(raw: &mut [u8], v: u32) {
    BigEndian::write_u32(&mut raw[LHASH_OFF_MAP_NREC..LHASH_OFF_MAP_NREC + 4], v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::default_hash;

    #[test]
    fn header_roundtrip() {
        let mut raw = vec![0u8; 512];
        let h = LhashHeader {
            free_list: 7,
            split_bucket: 3,
            max_split_bucket: 8,
            map_next: 0,
            map_nrec: 11,
        };
        header_write(&mut raw, &h, default_hash);
        let back = header_read(&raw, default_hash).unwrap();
        assert_eq!(back.free_list, 7);
        assert_eq!(back.split_bucket, 3);
        assert_eq!(back.max_split_bucket, 8);
        assert_eq!(back.map_nrec, 11);
    }

    #[test]
    fn rejects_foreign_hash() {
        fn other(_k: &[u8]) -> u32 {
            0xDEAD
        }
        let mut raw = vec![0u8; 512];
        let h = LhashHeader {
            free_list: 0,
            split_bucket: 0,
            max_split_bucket: 1,
            map_next: 0,
            map_nrec: 0,
        };
        header_write(&mut raw, &h, default_hash);
        assert!(matches!(header_read(&raw, other), Err(Error::Invalid(_))));
    }

    #[test]
    fn rejects_bad_magic() {
        let raw = vec![0u8; 512];
        assert!(matches!(header_read(&raw, default_hash), Err(Error::Corrupt(_))));
    }
}
