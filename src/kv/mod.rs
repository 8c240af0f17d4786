//! kv — единый контракт KV-движков.
//!
//! Движок выбирается при открытии базы и принадлежит хэндлу; страницы
//! он получает через pager, который передаётся в каждый вызов явно
//! (движок одалживает страничный API, но не владеет pager'ом).
//!
//! Курсоры принадлежат движку и адресуются типизированным CursorId.
//! Ключ и данные отдаются потоково через Consumer — значение любого
//! размера не обязано материализоваться в памяти.
//!
//! Необязательные методы по умолчанию возвращают NotImplemented:
//! контракт курсора допускает это для каждого метода в отдельности
//! (например, seek Le/Ge на неупорядоченном движке).

pub mod lhash;
pub mod mem;

use crate::error::{Error, Result};
use crate::pager::Pager;

/// Пользовательская хеш-функция ключей (настраивается до первой записи).
pub type HashFn = fn(&[u8]) -> u32;
/// Пользовательская функция сравнения ключей.
pub type CmpFn = fn(&[u8], &[u8]) -> std::cmp::Ordering;

/// Типизированные команды конфигурации движка (вместо вариадического op).
pub enum KvConfig {
    /// Заменить хеш-функцию ключей. Отклоняется (`Locked`), когда в
    /// хранилище уже есть записи.
    HashFunc(HashFn),
    /// Заменить функцию сравнения ключей.
    CmpFunc(CmpFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Exact,
    /// Наибольший ключ <= искомого (упорядоченные движки).
    Le,
    /// Наименьший ключ >= искомого (упорядоченные движки).
    Ge,
}

/// Идентификатор курсора внутри движка.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub(crate) usize);

/// Потоковый приёмник ключа/данных. Ошибка прерывает выдачу и
/// поднимается наружу как `Abort`.
pub trait Consumer {
    fn chunk(&mut self, bytes: &[u8]) -> Result<()>;
}

impl Consumer for Vec<u8> {
    fn chunk(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Потоковый компаратор: сверяет выдаваемые куски с ожидаемым ключом и
/// обрывает выдачу на первом расхождении. Ключи крупнее порога не
/// держатся в памяти, сравнение идёт только через него.
pub struct StreamCmp<'a> {
    rest: &'a [u8],
    cmp: CmpFn,
}

impl<'a> StreamCmp<'a> {
    pub fn new(expected: &'a [u8], cmp: CmpFn) -> Self {
        Self {
            rest: expected,
            cmp,
        }
    }

    /// Совпадение состоялось: весь ожидаемый ключ покрыт без расхождений.
    pub fn matched(&self) -> bool {
        self.rest.is_empty()
    }
}

impl Consumer for StreamCmp<'_> {
    fn chunk(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.rest.len() {
            return Err(Error::Abort);
        }
        let (head, tail) = self.rest.split_at(bytes.len());
        if (self.cmp)(head, bytes) != std::cmp::Ordering::Equal {
            return Err(Error::Abort);
        }
        self.rest = tail;
        Ok(())
    }
}

/// Контракт KV-движка.
pub trait KvEngine {
    /// Имя движка; пишется в заголовок базы.
    fn name(&self) -> &'static str;

    /// Доступ к конкретному типу (диагностика, тестовые хуки).
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Привести движок к начальному состоянию (вызывается и при откате).
    fn init(&mut self, page_size: usize) -> Result<()>;

    /// Открыть хранилище: db_pages — текущий размер базы в страницах.
    fn open(&mut self, pager: &mut Pager, db_pages: u64) -> Result<()>;

    fn config(&mut self, cmd: KvConfig) -> Result<()>;

    /// Вставить или перезаписать запись.
    fn replace(&mut self, pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()>;

    /// Дописать данные к записи (создаёт её при отсутствии).
    fn append(&mut self, pager: &mut Pager, key: &[u8], data: &[u8]) -> Result<()> {
        let _ = (pager, key, data);
        Err(Error::NotImplemented)
    }

    // ---- курсоры ----

    fn cursor_open(&mut self) -> CursorId;

    fn cursor_close(&mut self, cur: CursorId);

    fn cursor_seek(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        key: &[u8],
        mode: SeekMode,
    ) -> Result<()>;

    fn cursor_first(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()>;

    fn cursor_last(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()>;

    fn cursor_valid(&self, cur: CursorId) -> bool;

    fn cursor_next(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()>;

    fn cursor_prev(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()>;

    fn cursor_reset(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        self.cursor_first(pager, cur)
    }

    fn cursor_key_len(&mut self, pager: &mut Pager, cur: CursorId) -> Result<usize>;

    fn cursor_data_len(&mut self, pager: &mut Pager, cur: CursorId) -> Result<u64>;

    fn cursor_key(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()>;

    fn cursor_data(
        &mut self,
        pager: &mut Pager,
        cur: CursorId,
        sink: &mut dyn Consumer,
    ) -> Result<()>;

    /// Удалить запись под курсором; курсор переходит к следующей.
    fn cursor_delete(&mut self, pager: &mut Pager, cur: CursorId) -> Result<()> {
        let _ = (pager, cur);
        Err(Error::NotImplemented)
    }
}

/// Сравнение ключей по умолчанию: побайтовое.
pub fn default_cmp(a: &[u8], b: &[u8]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Хеш ключей по умолчанию: xxhash (seed 0), усечённый до 32 бит.
pub fn default_hash(key: &[u8]) -> u32 {
    use std::hash::Hasher;
    let mut h = twox_hash::XxHash32::with_seed(0);
    h.write(key);
    h.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_cmp_matches_in_chunks() {
        let mut c = StreamCmp::new(b"hello world", default_cmp);
        c.chunk(b"hello ").unwrap();
        c.chunk(b"world").unwrap();
        assert!(c.matched());
    }

    #[test]
    fn stream_cmp_aborts_on_mismatch() {
        let mut c = StreamCmp::new(b"hello", default_cmp);
        assert!(matches!(c.chunk(b"help!"), Err(Error::Abort)));
    }

    #[test]
    fn stream_cmp_aborts_on_overrun() {
        let mut c = StreamCmp::new(b"hi", default_cmp);
        assert!(matches!(c.chunk(b"hi there"), Err(Error::Abort)));
        let mut c2 = StreamCmp::new(b"hi there", default_cmp);
        c2.chunk(b"hi").unwrap();
        assert!(!c2.matched());
    }

    #[test]
    fn default_hash_is_stable() {
        // Одинаковые ключи — одинаковый хеш, на разных длинах
        assert_eq!(default_hash(b"alpha"), default_hash(b"alpha"));
        assert_ne!(default_hash(b"alpha"), default_hash(b"beta"));
    }
}
