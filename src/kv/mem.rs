//! kv/mem — движок в памяти: хеш-таблица с цепочками + сквозной
//! порядок вставки для курсоров.
//!
//! Используется для баз `:memory:` и как всегда доступный запасной
//! движок. Записи лежат в арене со свободным списком слотов; порядок
//! вставки — двусвязные индексы prev/next (никаких владеющих ссылок).
//! Таблица растёт удвоением при факторе заполнения 4, до 100 000 корзин.

use crate::consts::{MEM_BUCKET_INIT, MEM_FILL_FACTOR, TABLE_GROW_CAP};
use crate::error::{Error, Result};
use crate::kv::{
    default_cmp, default_hash, CmpFn, Consumer, CursorId, HashFn, KvConfig, KvEngine, SeekMode,
};
use crate::pager::Pager;

struct MemRecord {
    hash: u32,
    key: Vec<u8>,
    data: Vec<u8>,
    // Порядок вставки
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum MemCursorPos {
    /// Курсор никуда не указывает.
    Done,
    /// Курсор на записи (индекс арены).
    At(usize),
}

pub struct MemKv {
    buckets: Vec<Vec<usize>>,
    records: Vec<Option<MemRecord>>,
    free_slots: Vec<usize>,
    n_record: usize,
    head: Option<usize>,
    tail: Option<usize>,
    hash: HashFn,
    cmp: CmpFn,
    cursors: Vec<Option<MemCursorPos>>,
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self {
            buckets: vec![Vec::new(); MEM_BUCKET_INIT],
            records: Vec::new(),
            free_slots: Vec::new(),
            n_record: 0,
            head: None,
            tail: None,
            hash: default_hash,
            cmp: default_cmp,
            cursors: Vec::new(),
        }
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: &[u8], hash: u32) -> Option<usize> {
        let b = self.bucket_of(hash);
        for &idx in &self.buckets[b] {
            let Some(rec) = self.records[idx].as_ref() else {
                continue;
            };
            if rec.hash == hash
                && rec.key.len() == key.len()
                && (self.cmp)(&rec.key, key) == std::cmp::Ordering::Equal
            {
                return Some(idx);
            }
        }
        None
    }

    fn insert_record(&mut self, key: &[u8], hash: u32, data: &[u8]) {
        let rec = MemRecord {
            hash,
            key: key.to_vec(),
            data: data.to_vec(),
            prev: self.tail,
            next: None,
        };
        let idx = match self.free_slots.pop() {
            Some(i) => {
                self.records[i] = Some(rec);
                i
            }
            None => {
                self.records.push(Some(rec));
                self.records.len() - 1
            }
        };
        if let Some(t) = self.tail {
            if let Some(r) = self.records[t].as_mut() {
                r.next = Some(idx);
            }
        }
        self.tail = Some(idx);
        if self.head.is_none() {
            self.head = Some(idx);
        }
        let b = self.bucket_of(hash);
        self.buckets[b].push(idx);
        self.n_record += 1;
        self.maybe_grow();
    }

    fn maybe_grow(&mut self) {
        if self.n_record < self.buckets.len() * MEM_FILL_FACTOR
            || self.buckets.len() >= TABLE_GROW_CAP
        {
            return;
        }
        let new_size = self.buckets.len() << 1;
        let mut fresh: Vec<Vec<usize>> = vec![Vec::new(); new_size];
        for (idx, slot) in self.records.iter().enumerate() {
            if let Some(rec) = slot {
                fresh[(rec.hash as usize) & (new_size - 1)].push(idx);
            }
        }
        self.buckets = fresh;
    }

    fn remove_record(&mut self, idx: usize) {
        let Some(rec) = self.records[idx].take() else {
            return;
        };
        let b = (rec.hash as usize) & (self.buckets.len() - 1);
        self.buckets[b].retain(|&i| i != idx);
        match rec.prev {
            Some(p) => {
                if let Some(r) = self.records[p].as_mut() {
                    r.next = rec.next;
                }
            }
            None => self.head = rec.next,
        }
        match rec.next {
            Some(n) => {
                if let Some(r) = self.records[n].as_mut() {
                    r.prev = rec.prev;
                }
            }
            None => self.tail = rec.prev,
        }
        self.free_slots.push(idx);
        self.n_record -= 1;
        // Курсоры, смотревшие на запись, становятся недействительными
        for c in self.cursors.iter_mut().flatten() {
            if let MemCursorPos::At(i) = *c {
                if i == idx {
                    *c = MemCursorPos::Done;
                }
            }
        }
    }

    fn cursor_slot(&self, cur: CursorId) -> Result<MemCursorPos> {
        self.cursors
            .get(cur.0)
            .and_then(|c| *c)
            .ok_or(Error::Invalid("unknown cursor"))
    }

    fn cursor_record(&self, cur: CursorId) -> Result<usize> {
        match self.cursor_slot(cur)? {
            MemCursorPos::At(idx) if self.records[idx].is_some() => Ok(idx),
            _ => Err(Error::Invalid("cursor does not point to a record")),
        }
    }

    fn set_cursor(&mut self, cur: CursorId, pos: MemCursorPos) {
        if let Some(slot) = self.cursors.get_mut(cur.0) {
            if slot.is_some() {
                *slot = Some(pos);
            }
        }
    }

    pub fn record_count(&self) -> usize {
        self.n_record
    }
}

impl KvEngine for MemKv {
    fn name(&self) -> &'static str {
        crate::consts::KV_NAME_MEM
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self, _page_size: usize) -> Result<()> {
        let hash = self.hash;
        let cmp = self.cmp;
        *self = MemKv::new();
        self.hash = hash;
        self.cmp = cmp;
        Ok(())
    }

    fn open(&mut self, _pager: &mut Pager, _db_pages: u64) -> Result<()> {
        Ok(())
    }

    fn config(&mut self, cmd: KvConfig) -> Result<()> {
        match cmd {
            KvConfig::HashFunc(f) => {
                if self.n_record > 0 {
                    return Err(Error::Locked("hash function can only change on an empty store"));
                }
                self.hash = f;
            }
            KvConfig::CmpFunc(f) => self.cmp = f,
        }
        Ok(())
    }

    fn replace(&mut self, _pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()> {
        let hash = (self.hash)(key);
        match self.find(key, hash) {
            Some(idx) => {
                if let Some(rec) = self.records[idx].as_mut() {
                    rec.data.clear();
                    rec.data.extend_from_slice(data);
                }
            }
            None => self.insert_record(key, hash, data),
        }
        Ok(())
    }

    fn append(&mut self, _pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()> {
        let hash = (self.hash)(key);
        match self.find(key, hash) {
            Some(idx) => {
                if let Some(rec) = self.records[idx].as_mut() {
                    if rec.data.len() as u64 + data.len() as u64 > i64::MAX as u64 {
                        return Err(Error::Limit("append would overflow the record size"));
                    }
                    rec.data.extend_from_slice(data);
                }
            }
            None => self.insert_record(key, hash, data),
        }
        Ok(())
    }

    fn cursor_open(&mut self) -> CursorId {
        for (i, slot) in self.cursors.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(MemCursorPos::Done);
                return CursorId(i);
            }
        }
        self.cursors.push(Some(MemCursorPos::Done));
        CursorId(self.cursors.len() - 1)
    }

    fn cursor_close(&mut self, cur: CursorId) {
        if let Some(slot) = self.cursors.get_mut(cur.0) {
            *slot = None;
        }
    }

    fn cursor_seek(
        &mut self,
        _pager: &mut Pager,
        cur: CursorId,
        key: &[u8],
        mode: SeekMode,
    ) -> Result<()> {
        self.cursor_slot(cur)?;
        if mode != SeekMode::Exact {
            // Хеш-таблица не упорядочена
            return Err(Error::NotImplemented);
        }
        let hash = (self.hash)(key);
        match self.find(key, hash) {
            Some(idx) => {
                self.set_cursor(cur, MemCursorPos::At(idx));
                Ok(())
            }
            None => {
                self.set_cursor(cur, MemCursorPos::Done);
                Err(Error::NotFound)
            }
        }
    }

    fn cursor_first(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<()> {
        self.cursor_slot(cur)?;
        match self.head {
            Some(idx) => {
                self.set_cursor(cur, MemCursorPos::At(idx));
                Ok(())
            }
            None => {
                self.set_cursor(cur, MemCursorPos::Done);
                Err(Error::Eof)
            }
        }
    }

    fn cursor_last(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<()> {
        self.cursor_slot(cur)?;
        match self.tail {
            Some(idx) => {
                self.set_cursor(cur, MemCursorPos::At(idx));
                Ok(())
            }
            None => {
                self.set_cursor(cur, MemCursorPos::Done);
                Err(Error::Eof)
            }
        }
    }

    fn cursor_valid(&self, cur: CursorId) -> bool {
        matches!(
            self.cursors.get(cur.0).and_then(|c| *c),
            Some(MemCursorPos::At(idx)) if self.records.get(idx).map(|r| r.is_some()).unwrap_or(false)
        )
    }

    fn cursor_next(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<()> {
        let idx = self.cursor_record(cur)?;
        let next = self.records[idx].as_ref().and_then(|r| r.next);
        match next {
            Some(n) => {
                self.set_cursor(cur, MemCursorPos::At(n));
                Ok(())
            }
            None => {
                self.set_cursor(cur, MemCursorPos::Done);
                Err(Error::Eof)
            }
        }
    }

    fn cursor_prev(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<()> {
        let idx = self.cursor_record(cur)?;
        let prev = self.records[idx].as_ref().and_then(|r| r.prev);
        match prev {
            Some(p) => {
                self.set_cursor(cur, MemCursorPos::At(p));
                Ok(())
            }
            None => {
                self.set_cursor(cur, MemCursorPos::Done);
                Err(Error::Eof)
            }
        }
    }

    fn cursor_key_len(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<usize> {
        let idx = self.cursor_record(cur)?;
        Ok(self.records[idx].as_ref().map(|r| r.key.len()).unwrap_or(0))
    }

    fn cursor_data_len(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<u64> {
        let idx = self.cursor_record(cur)?;
        Ok(self.records[idx].as_ref().map(|r| r.data.len() as u64).unwrap_or(0))
    }

    fn cursor_key(
        &mut self,
        _pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        let idx = self.cursor_record(cur)?;
        let key = self.records[idx].as_ref().map(|r| r.key.clone()).unwrap_or_default();
        sink.chunk(&key).map_err(|_| Error::Abort)
    }

    fn cursor_data(
        &mut self,
        _pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()> {
        let idx = self.cursor_record(cur)?;
        let data = self.records[idx].as_ref().map(|r| r.data.clone()).unwrap_or_default();
        sink.chunk(&data).map_err(|_| Error::Abort)
    }

    fn cursor_delete(&mut self, _pager: &mut Pager, cur: CursorId) -> Result<()> {
        let idx = self.cursor_record(cur)?;
        let next = self.records[idx].as_ref().and_then(|r| r.next);
        self.remove_record(idx);
        self.set_cursor(
            cur,
            match next {
                Some(n) => MemCursorPos::At(n),
                None => MemCursorPos::Done,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::{Pager, PagerOpts};
    use crate::vfs::OsVfs;
    use std::path::Path;

    fn mem_pager() -> Pager {
        let opts = PagerOpts {
            in_memory: true,
            ..Default::default()
        };
        Pager::new(Box::new(OsVfs), Path::new(":memory:"), opts).unwrap()
    }

    #[test]
    fn replace_seek_delete() {
        let mut pager = mem_pager();
        let mut kv = MemKv::new();
        kv.replace(&mut pager, b"a", b"1").unwrap();
        kv.replace(&mut pager, b"b", b"2").unwrap();
        kv.replace(&mut pager, b"a", b"one").unwrap();
        assert_eq!(kv.record_count(), 2);

        let cur = kv.cursor_open();
        kv.cursor_seek(&mut pager, cur, b"a", SeekMode::Exact).unwrap();
        let mut out = Vec::new();
        kv.cursor_data(&mut pager, cur, &mut out).unwrap();
        assert_eq!(out, b"one");

        kv.cursor_delete(&mut pager, cur).unwrap();
        assert_eq!(kv.record_count(), 1);
        assert!(matches!(
            kv.cursor_seek(&mut pager, cur, b"a", SeekMode::Exact),
            Err(Error::NotFound)
        ));
        kv.cursor_close(cur);
    }

    #[test]
    fn append_concatenates() {
        let mut pager = mem_pager();
        let mut kv = MemKv::new();
        kv.append(&mut pager, b"log", b"one,").unwrap();
        kv.append(&mut pager, b"log", b"two").unwrap();
        let cur = kv.cursor_open();
        kv.cursor_seek(&mut pager, cur, b"log", SeekMode::Exact).unwrap();
        let mut out = Vec::new();
        kv.cursor_data(&mut pager, cur, &mut out).unwrap();
        assert_eq!(out, b"one,two");
    }

    #[test]
    fn insertion_order_iteration() {
        let mut pager = mem_pager();
        let mut kv = MemKv::new();
        for i in 0..100u32 {
            kv.replace(&mut pager, format!("k{i}").as_bytes(), b"v").unwrap();
        }
        let cur = kv.cursor_open();
        kv.cursor_first(&mut pager, cur).unwrap();
        let mut seen = 0u32;
        loop {
            let mut key = Vec::new();
            kv.cursor_key(&mut pager, cur, &mut key).unwrap();
            assert_eq!(key, format!("k{seen}").as_bytes());
            seen += 1;
            match kv.cursor_next(&mut pager, cur) {
                Ok(()) => {}
                Err(Error::Eof) => break,
                Err(e) => panic!("{e}"),
            }
        }
        assert_eq!(seen, 100);
    }

    #[test]
    fn grows_past_fill_factor() {
        let mut pager = mem_pager();
        let mut kv = MemKv::new();
        // 64 * 4 = 256: этого достаточно для двух удвоений
        for i in 0..1000u32 {
            kv.replace(&mut pager, format!("key-{i}").as_bytes(), format!("val-{i}").as_bytes())
                .unwrap();
        }
        assert!(kv.buckets.len() > MEM_BUCKET_INIT);
        let cur = kv.cursor_open();
        for i in (0..1000u32).step_by(97) {
            kv.cursor_seek(&mut pager, cur, format!("key-{i}").as_bytes(), SeekMode::Exact)
                .unwrap();
            let mut out = Vec::new();
            kv.cursor_data(&mut pager, cur, &mut out).unwrap();
            assert_eq!(out, format!("val-{i}").as_bytes());
        }
    }

    #[test]
    fn hash_config_locked_after_first_record() {
        let mut pager = mem_pager();
        let mut kv = MemKv::new();
        fn h(_k: &[u8]) -> u32 {
            7
        }
        kv.config(KvConfig::HashFunc(h)).unwrap();
        kv.replace(&mut pager, b"x", b"y").unwrap();
        assert!(matches!(
            kv.config(KvConfig::HashFunc(h)),
            Err(Error::Locked(_))
        ));
    }
}
