//! db/collections — операции над коллекциями, которые хэндл отдаёт
//! внешнему скриптовому координатору (и обычным вызывающим).
//!
//! Мутаторы на read-only базе возвращают ReadOnly и пишут строку в
//! журнал ошибок хэндла.

use serde_json::Value;

use crate::collection::Collection;
use crate::error::{Error, Result};

use super::{collection_now, Db};

impl Db {
    /// Загрузить коллекцию в словарь хэндла (однократно).
    fn load_collection(&mut self, name: &str, create: bool) -> Result<()> {
        if self.collections.contains_key(name) {
            return Ok(());
        }
        match Collection::load(&mut *self.engine, &mut self.pager, name) {
            Ok(col) => {
                self.collections.insert(name.to_owned(), col);
                Ok(())
            }
            Err(Error::NotFound) if create => {
                self.ensure_writable("collection_create")?;
                let col =
                    Collection::create(&mut *self.engine, &mut self.pager, name, collection_now())?;
                self.collections.insert(name.to_owned(), col);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn collection_exists(&mut self, name: &str) -> Result<bool> {
        self.maybe_forced_rollback()?;
        match self.load_collection(name, false) {
            Ok(()) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Создать коллекцию; существующая — благополучный no-op.
    pub fn collection_create(&mut self, name: &str) -> Result<()> {
        self.ensure_writable("collection_create")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, true)
    }

    /// Сохранить значение: массив раскладывается почленно, объект или
    /// скаляр — одной записью. Возвращает id последней записи.
    pub fn put(&mut self, name: &str, mut value: Value) -> Result<i64> {
        self.ensure_writable("put")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, false).map_err(|e| {
            if matches!(e, Error::NotFound) {
                self.log_err(format!("collection '{name}' is not defined in this database"));
            }
            e
        })?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        match value {
            Value::Array(ref mut items) => {
                let mut last = 0;
                for item in items.iter_mut() {
                    last = col.store(&mut *self.engine, &mut self.pager, item)?;
                }
                Ok(last)
            }
            ref mut single => col.store(&mut *self.engine, &mut self.pager, single),
        }
    }

    /// Следующая запись последовательного обхода. None — конец (курсор
    /// сброшен в начало).
    pub fn fetch(&mut self, name: &str) -> Result<Option<Value>> {
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.fetch_next(&mut *self.engine, &mut self.pager)
    }

    pub fn fetch_by_id(&mut self, name: &str, id: i64) -> Result<Option<Value>> {
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.fetch_by_id(&mut *self.engine, &mut self.pager, id)
    }

    /// Все живые записи; фильтр отбрасывает неподходящие.
    pub fn fetch_all(
        &mut self,
        name: &str,
        filter: Option<&dyn Fn(&Value) -> bool>,
    ) -> Result<Vec<Value>> {
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.reset_record_cursor();
        let mut out = Vec::new();
        while let Some(v) = col.fetch_next(&mut *self.engine, &mut self.pager)? {
            if filter.map(|f| f(&v)).unwrap_or(true) {
                out.push(v);
            }
        }
        Ok(out)
    }

    /// Переписать запись по id (запись должна существовать).
    pub fn update_record(&mut self, name: &str, id: i64, mut value: Value) -> Result<()> {
        self.ensure_writable("update_record")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.update_record(&mut *self.engine, &mut self.pager, id, &mut value)
    }

    pub fn last_record_id(&mut self, name: &str) -> Result<i64> {
        self.load_collection(name, false)?;
        Ok(self.collections[name].last_record_id())
    }

    pub fn current_record_id(&mut self, name: &str) -> Result<i64> {
        self.load_collection(name, false)?;
        Ok(self.collections[name].current_record_id())
    }

    pub fn total_records(&mut self, name: &str) -> Result<i64> {
        self.load_collection(name, false)?;
        Ok(self.collections[name].total_records())
    }

    pub fn reset_record_cursor(&mut self, name: &str) -> Result<()> {
        self.load_collection(name, false)?;
        if let Some(col) = self.collections.get_mut(name) {
            col.reset_record_cursor();
        }
        Ok(())
    }

    /// Дата создания коллекции.
    pub fn creation_date(&mut self, name: &str) -> Result<chrono::NaiveDateTime> {
        self.load_collection(name, false)?;
        Ok(self.collections[name].creation_time())
    }

    /// Удалить запись по id. Ok(false) — записи не было.
    pub fn drop_record(&mut self, name: &str, id: i64) -> Result<bool> {
        self.ensure_writable("drop_record")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.drop_record(&mut *self.engine, &mut self.pager, id, true)
    }

    /// Снести коллекцию вместе с записями.
    pub fn drop_collection(&mut self, name: &str) -> Result<()> {
        self.ensure_writable("drop_collection")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let mut col = self.collections.remove(name).ok_or(Error::NotFound)?;
        let rc = col.drop_all(&mut *self.engine, &mut self.pager);
        col.release(&mut *self.engine);
        rc
    }

    pub fn set_schema(&mut self, name: &str, schema: &Value) -> Result<()> {
        self.ensure_writable("set_schema")?;
        self.maybe_forced_rollback()?;
        self.load_collection(name, false)?;
        let col = self.collections.get_mut(name).ok_or(Error::NotFound)?;
        col.set_schema(&mut *self.engine, &mut self.pager, schema)
    }

    pub fn get_schema(&mut self, name: &str) -> Result<Value> {
        self.load_collection(name, false)?;
        Ok(self.collections[name].schema().clone())
    }
}
