//! db/kv — прямые KV-операции хэндла (мимо слоя коллекций).

use crate::error::{Error, Result};
use crate::kv::{Consumer, KvConfig, SeekMode};

use super::Db;

impl Db {
    /// Вставить или перезаписать запись.
    pub fn kv_store(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable("kv_store")?;
        self.maybe_forced_rollback()?;
        self.engine.replace(&mut self.pager, key, value)
    }

    /// Дописать байты к записи (создаёт её при отсутствии).
    pub fn kv_append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ensure_writable("kv_append")?;
        self.maybe_forced_rollback()?;
        self.engine.append(&mut self.pager, key, value)
    }

    /// Достать значение целиком. None — ключа нет.
    pub fn kv_fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.maybe_forced_rollback()?;
        let cur = self.engine.cursor_open();
        let rc = (|| -> Result<Option<Vec<u8>>> {
            match self.engine.cursor_seek(&mut self.pager, cur, key, SeekMode::Exact) {
                Ok(()) => {}
                Err(Error::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            }
            let mut out = Vec::new();
            self.engine.cursor_data(&mut self.pager, cur, &mut out)?;
            Ok(Some(out))
        })();
        self.engine.cursor_close(cur);
        rc
    }

    /// Потоковая выдача значения в приёмник. Err(NotFound) — ключа нет.
    pub fn kv_fetch_callback(&mut self, key: &[u8], sink: &mut dyn Consumer) -> Result<()> {
        self.maybe_forced_rollback()?;
        let cur = self.engine.cursor_open();
        let rc = (|| -> Result<()> {
            self.engine.cursor_seek(&mut self.pager, cur, key, SeekMode::Exact)?;
            self.engine.cursor_data(&mut self.pager, cur, sink)
        })();
        self.engine.cursor_close(cur);
        rc
    }

    /// Длина значения. None — ключа нет.
    pub fn kv_fetch_len(&mut self, key: &[u8]) -> Result<Option<u64>> {
        self.maybe_forced_rollback()?;
        let cur = self.engine.cursor_open();
        let rc = (|| -> Result<Option<u64>> {
            match self.engine.cursor_seek(&mut self.pager, cur, key, SeekMode::Exact) {
                Ok(()) => Ok(Some(self.engine.cursor_data_len(&mut self.pager, cur)?)),
                Err(Error::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })();
        self.engine.cursor_close(cur);
        rc
    }

    pub fn kv_exists(&mut self, key: &[u8]) -> Result<bool> {
        Ok(self.kv_fetch_len(key)?.is_some())
    }

    /// Удалить запись. Ok(false) — её и не было.
    pub fn kv_delete(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_writable("kv_delete")?;
        self.maybe_forced_rollback()?;
        let cur = self.engine.cursor_open();
        let rc = (|| -> Result<bool> {
            match self.engine.cursor_seek(&mut self.pager, cur, key, SeekMode::Exact) {
                Ok(()) => {}
                Err(Error::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            }
            self.engine.cursor_delete(&mut self.pager, cur)?;
            Ok(true)
        })();
        self.engine.cursor_close(cur);
        rc
    }

    /// Конфигурация движка (hash_func/cmp_func); хеш меняется только на
    /// пустом хранилище.
    pub fn kv_config(&mut self, cmd: KvConfig) -> Result<()> {
        self.engine.config(cmd)
    }
}
