#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod util;

// Модульная раскладка (папки с mod.rs)
pub mod db; // src/db/{mod,collections,kv,doctor}.rs
pub mod fastjson;
pub mod kv; // src/kv/{mod,mem}.rs + src/kv/lhash/{mod,header,map,page,overflow}.rs
pub mod pager; // src/pager/{mod,page,bitvec,journal}.rs
pub mod vfs; // src/vfs/{mod,os}.rs

pub mod collection;

// Удобные реэкспорты
pub use db::{
    sanitize_open_flags, Db, DbOptions, EngineKind, OPEN_CREATE, OPEN_EXCLUSIVE, OPEN_IN_MEMORY,
    OPEN_MMAP, OPEN_NOMUTEX, OPEN_OMIT_JOURNALING, OPEN_READONLY, OPEN_READWRITE, OPEN_TEMP_DB,
};
pub use error::{Error, Result};
pub use fastjson::{fastjson_decode, fastjson_encode};
pub use kv::{Consumer, CursorId, KvConfig, KvEngine, SeekMode};
pub use vfs::{LockLevel, OsVfs, SyncMode, Vfs, VfsFile};
