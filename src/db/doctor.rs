//! db/doctor — диагностика хэндла: состояние хеш-движка, расположение
//! записей, счётчики pager'а. Используется тестами и админ-скриптами.

use crate::error::Result;
use crate::kv::lhash::LhashKv;
use crate::pager::PagerState;

use super::Db;

/// Срез состояния линейного хеширования.
#[derive(Debug, Clone, Copy)]
pub struct HashEngineState {
    pub split_bucket: u64,
    pub max_split_bucket: u64,
    pub free_list_head: u64,
    pub bucket_count: usize,
}

/// Счётчики pager'а.
#[derive(Debug, Clone, Copy)]
pub struct PagerStatus {
    pub state: PagerState,
    pub db_pages: u64,
    pub cached_pages: usize,
    pub hot_pages: usize,
    pub journal_records: u32,
}

impl Db {
    /// Состояние движка линейного хеширования; None — активен другой движок.
    pub fn hash_state(&self) -> Option<HashEngineState> {
        let eng = self.engine.as_any().downcast_ref::<LhashKv>()?;
        Some(HashEngineState {
            split_bucket: eng.split_bucket(),
            max_split_bucket: eng.max_split_bucket(),
            free_list_head: eng.free_list_head(),
            bucket_count: eng.bucket_count(),
        })
    }

    /// Головная overflow-страница записи: Some — payload в цепочке,
    /// None — лежит локально в ячейке. Err(NotFound) — ключа нет.
    pub fn record_overflow_page(&mut self, key: &[u8]) -> Result<Option<u64>> {
        let Db { pager, engine, .. } = self;
        match engine.as_any_mut().downcast_mut::<LhashKv>() {
            Some(eng) => eng.record_overflow_page(pager, key),
            None => Ok(None),
        }
    }

    pub fn pager_status(&self) -> PagerStatus {
        PagerStatus {
            state: self.pager.state(),
            db_pages: self.pager.db_pages(),
            cached_pages: self.pager.cached_pages(),
            hot_pages: self.pager.hot_pages(),
            journal_records: self.pager.journal_records(),
        }
    }

    /// Хук тестов восстановления: выполнить только первую фазу коммита
    /// (журнал финализирован и синкнут, страницы записаны, журнал НЕ
    /// удалён) — момент «падения» между фазами.
    #[doc(hidden)]
    pub fn commit_phase1_only(&mut self) -> crate::error::Result<()> {
        self.pager.commit_phase1_only()
    }

    /// Хук тестов восстановления: вторая фаза (удаление журнала,
    /// возврат в Reader).
    #[doc(hidden)]
    pub fn commit_phase2_only(&mut self) -> crate::error::Result<()> {
        self.pager.commit_phase2_only()
    }
}
