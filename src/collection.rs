//! collection — слой документов поверх KV-интерфейса.
//!
//! Для коллекции C в KV лежит запись с ключом "C" — её заголовок:
//! [magic u16][last_id u64][total u64][ctime u32 DOS][fast-JSON схема...].
//! Каждая запись коллекции — ключ "C_<id>" со значением в fast-JSON.
//! Объектам при записи прошивается поле __id.
//!
//! Внутри хэндла коллекция грузится один раз и кэшируется по имени;
//! повторные выборки по id идут через локальный кэш раскодированных
//! значений, минуя обход KV.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use chrono::NaiveDateTime;
use serde_json::Value;

use crate::consts::{COLLECTION_HDR_FIXED_SZ, COLLECTION_MAGIC};
use crate::error::{Error, Result};
use crate::fastjson::{fastjson_decode, fastjson_encode};
use crate::kv::{CursorId, KvEngine, SeekMode};
use crate::pager::Pager;
use crate::util::{dos_pack_time, dos_unpack_time};

pub struct Collection {
    name: String,
    last_id: i64,
    tot_rec: i64,
    creation: NaiveDateTime,
    schema: Value,
    /// Смещение схемы внутри заголовка.
    schema_off: usize,
    header: Vec<u8>,
    cursor: CursorId,
    /// Курсор последовательной выборки (id следующей записи).
    cur_id: i64,
    cache: HashMap<i64, Value>,
}

/// Ключ записи: "<имя>_<десятичный id>".
pub fn record_key(name: &str, id: i64) -> Vec<u8> {
    format!("{name}_{id}").into_bytes()
}

fn build_header(now: NaiveDateTime) -> Vec<u8> {
    let mut h = vec![0u8; COLLECTION_HDR_FIXED_SZ];
    BigEndian::write_u16(&mut h[0..2], COLLECTION_MAGIC);
    BigEndian::write_u64(&mut h[2..10], 0);
    BigEndian::write_u64(&mut h[10..18], 0);
    BigEndian::write_u32(&mut h[18..22], dos_pack_time(&now));
    h
}

impl Collection {
    /// Создать коллекцию: свежий заголовок уходит в KV под именем.
    pub fn create(
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        name: &str,
        now: NaiveDateTime,
    ) -> Result<Self> {
        let header = build_header(now);
        engine.replace(pager, name.as_bytes(), &header)?;
        let cursor = engine.cursor_open();
        Ok(Self {
            name: name.to_owned(),
            last_id: 0,
            tot_rec: 0,
            creation: now,
            schema: Value::Null,
            schema_off: COLLECTION_HDR_FIXED_SZ,
            header,
            cursor,
            cur_id: 0,
            cache: HashMap::new(),
        })
    }

    /// Загрузить существующую коллекцию. `Err(NotFound)` — такой нет.
    pub fn load(engine: &mut dyn KvEngine, pager: &mut Pager, name: &str) -> Result<Self> {
        let cursor = engine.cursor_open();
        if let Err(e) = engine.cursor_seek(pager, cursor, name.as_bytes(), SeekMode::Exact) {
            engine.cursor_close(cursor);
            return Err(e);
        }
        let mut header = Vec::new();
        engine.cursor_data(pager, cursor, &mut header)?;
        if header.len() < COLLECTION_HDR_FIXED_SZ
            || BigEndian::read_u16(&header[0..2]) != COLLECTION_MAGIC
        {
            engine.cursor_close(cursor);
            return Err(Error::Corrupt("bad collection header"));
        }
        let last_id = BigEndian::read_u64(&header[2..10]) as i64;
        let tot_rec = BigEndian::read_u64(&header[10..18]) as i64;
        let creation = dos_unpack_time(BigEndian::read_u32(&header[18..22]));
        let schema = if header.len() > COLLECTION_HDR_FIXED_SZ {
            fastjson_decode(&header[COLLECTION_HDR_FIXED_SZ..]).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        Ok(Self {
            name: name.to_owned(),
            last_id,
            tot_rec,
            creation,
            schema,
            schema_off: COLLECTION_HDR_FIXED_SZ,
            header,
            cursor,
            cur_id: 0,
            cache: HashMap::new(),
        })
    }

    pub fn release(&mut self, engine: &mut dyn KvEngine) {
        engine.cursor_close(self.cursor);
        self.cache.clear();
    }

    // ---------------- геттеры ----------------

    pub fn name(&self) -> &str {
        &self.name
    }

    /// id последней вставленной записи (0, если вставок не было).
    pub fn last_record_id(&self) -> i64 {
        if self.last_id == 0 {
            0
        } else {
            self.last_id - 1
        }
    }

    pub fn current_record_id(&self) -> i64 {
        self.cur_id
    }

    pub fn total_records(&self) -> i64 {
        self.tot_rec
    }

    pub fn creation_time(&self) -> NaiveDateTime {
        self.creation
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn reset_record_cursor(&mut self) {
        self.cur_id = 0;
    }

    // ---------------- заголовок ----------------

    fn write_header(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        last_id: Option<i64>,
        total: Option<i64>,
        schema: Option<&Value>,
    ) -> Result<()> {
        if let Some(v) = last_id {
            BigEndian::write_u64(&mut self.header[2..10], v as u64);
        }
        if let Some(v) = total {
            BigEndian::write_u64(&mut self.header[10..18], v as u64);
        }
        if let Some(s) = schema {
            self.header.truncate(self.schema_off);
            fastjson_encode(s, &mut self.header)?;
            self.schema = s.clone();
        }
        engine.replace(pager, self.name.as_bytes(), &self.header)
    }

    /// Схема коллекции: только JSON-объект.
    pub fn set_schema(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        schema: &Value,
    ) -> Result<()> {
        if !schema.is_object() {
            return Err(Error::Invalid("collection schema must be a JSON object"));
        }
        self.write_header(engine, pager, None, None, Some(schema))
    }

    // ---------------- записи ----------------

    /// Сохранить одну запись; объекту прошивается __id. Возвращает id.
    pub fn store(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        value: &mut Value,
    ) -> Result<i64> {
        if self.tot_rec >= i64::MAX - 1 || self.last_id >= i64::MAX - 1 {
            return Err(Error::Limit("collection record counter saturated"));
        }
        let id = self.last_id;
        if let Value::Object(map) = value {
            map.insert("__id".to_owned(), Value::from(id));
        }
        let key = record_key(&self.name, id);
        let mut encoded = Vec::new();
        fastjson_encode(value, &mut encoded)?;
        engine.replace(pager, &key, &encoded)?;
        self.cache.insert(id, value.clone());
        self.last_id += 1;
        self.tot_rec += 1;
        self.write_header(engine, pager, Some(self.last_id), Some(self.tot_rec), None)?;
        Ok(id)
    }

    /// Переписать существующую запись по id.
    pub fn update_record(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        id: i64,
        value: &mut Value,
    ) -> Result<()> {
        let key = record_key(&self.name, id);
        engine.cursor_reset(pager, self.cursor).ok();
        engine.cursor_seek(pager, self.cursor, &key, SeekMode::Exact)?;
        if let Value::Object(map) = value {
            map.insert("__id".to_owned(), Value::from(id));
        }
        let mut encoded = Vec::new();
        fastjson_encode(value, &mut encoded)?;
        engine.replace(pager, &key, &encoded)?;
        self.cache.insert(id, value.clone());
        Ok(())
    }

    /// Достать запись по id; None — записи нет.
    pub fn fetch_by_id(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        id: i64,
    ) -> Result<Option<Value>> {
        if let Some(v) = self.cache.get(&id) {
            return Ok(Some(v.clone()));
        }
        let key = record_key(&self.name, id);
        match engine.cursor_seek(pager, self.cursor, &key, SeekMode::Exact) {
            Ok(()) => {}
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        }
        let mut raw = Vec::new();
        engine.cursor_data(pager, self.cursor, &mut raw)?;
        if raw.is_empty() {
            return Ok(Some(Value::Null));
        }
        let value = fastjson_decode(&raw)?;
        self.cache.insert(id, value.clone());
        Ok(Some(value))
    }

    /// Следующая живая запись; пропуски id перешагиваются. None — конец
    /// обхода, курсор сброшен в начало.
    pub fn fetch_next(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
    ) -> Result<Option<Value>> {
        loop {
            if self.cur_id >= self.last_id {
                self.cur_id = 0;
                return Ok(None);
            }
            let id = self.cur_id;
            self.cur_id += 1;
            if let Some(v) = self.fetch_by_id(engine, pager, id)? {
                return Ok(Some(v));
            }
        }
    }

    /// Удалить запись по id. Ok(false) — записи не было.
    pub fn drop_record(
        &mut self,
        engine: &mut dyn KvEngine,
        pager: &mut Pager,
        id: i64,
        write_header: bool,
    ) -> Result<bool> {
        let key = record_key(&self.name, id);
        match engine.cursor_seek(pager, self.cursor, &key, SeekMode::Exact) {
            Ok(()) => {}
            Err(Error::NotFound) => return Ok(false),
            Err(e) => return Err(e),
        }
        engine.cursor_delete(pager, self.cursor)?;
        self.cache.remove(&id);
        self.tot_rec -= 1;
        if write_header {
            self.write_header(engine, pager, None, Some(self.tot_rec), None)?;
        }
        Ok(true)
    }

    /// Снести коллекцию: заголовок и все записи 0..last_id синхронно.
    pub fn drop_all(&mut self, engine: &mut dyn KvEngine, pager: &mut Pager) -> Result<()> {
        engine.cursor_seek(pager, self.cursor, self.name.as_bytes(), SeekMode::Exact)?;
        engine.cursor_delete(pager, self.cursor)?;
        for id in 0..self.last_id {
            let _ = self.drop_record(engine, pager, id, false)?;
        }
        self.cache.clear();
        Ok(())
    }
}
