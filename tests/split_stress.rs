//! Сплиты линейного хеширования: содержимое переживает любое число
//! расщеплений, свободные страницы возвращаются в оборот.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use QuillDB::{Db, DbOptions, EngineKind, OPEN_CREATE, OPEN_READWRITE};

// S4: 10 000 записей в :memory: с принудительным дисковым движком;
// сплиты идут, всё находится.
#[test]
fn split_preserves_contents_in_memory() -> Result<()> {
    let mut db = Db::open_with(
        ":memory:",
        DbOptions::new().flags(OPEN_CREATE).kv_engine(EngineKind::Hash),
    )?;
    assert_eq!(db.kv_engine_name(), "hash");

    let before = db.hash_state().expect("hash engine must be active");
    assert_eq!(before.max_split_bucket, 1);

    for i in 0..10_000u32 {
        let key = format!("k_{i:04}");
        db.kv_store(key.as_bytes(), key.as_bytes())?;
    }

    let after = db.hash_state().unwrap();
    assert!(
        after.max_split_bucket > before.max_split_bucket || after.split_bucket > 0,
        "splits must have advanced: {after:?}"
    );
    assert!(after.bucket_count > 1);

    for i in 0..10_000u32 {
        let key = format!("k_{i:04}");
        let got = db.kv_fetch(key.as_bytes())?.unwrap_or_else(|| panic!("missing {key}"));
        assert_eq!(got, key.as_bytes(), "value mismatch for {key}");
    }
    Ok(())
}

// То же на диске, с коммитом и переоткрытием.
#[test]
fn split_survives_reopen_on_disk() -> Result<()> {
    let path = unique_path("disk");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        for i in 0..2000u32 {
            let key = format!("key-{i}");
            let val = format!("value-{i}");
            db.kv_store(key.as_bytes(), val.as_bytes())?;
        }
        let st = db.hash_state().unwrap();
        assert!(st.max_split_bucket > 1 || st.split_bucket > 0);
        db.commit()?;
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        for i in (0..2000u32).step_by(7) {
            let key = format!("key-{i}");
            let want = format!("value-{i}");
            assert_eq!(db.kv_fetch(key.as_bytes())?.unwrap(), want.as_bytes());
        }
    }
    cleanup(&path);
    Ok(())
}

// Перезаписи под сплитами: победить должно последнее значение.
#[test]
fn overwrites_survive_splits() -> Result<()> {
    let mut db = Db::open_with(
        ":memory:",
        DbOptions::new().flags(OPEN_CREATE).kv_engine(EngineKind::Hash),
    )?;
    let mut rng = oorandom::Rand32::new(0xBADC0FFE);
    for round in 0..5u32 {
        for i in 0..800u32 {
            let key = format!("k{i}");
            let val = format!("r{round}-{i}-{}", rng.rand_u32());
            db.kv_store(key.as_bytes(), val.as_bytes())?;
            if round == 4 {
                assert_eq!(db.kv_fetch(key.as_bytes())?.unwrap(), val.as_bytes());
            }
        }
    }
    // Последний раунд виден целиком
    for i in 0..800u32 {
        let key = format!("k{i}");
        let got = db.kv_fetch(key.as_bytes())?.unwrap();
        assert!(got.starts_with(format!("r4-{i}-").as_bytes()));
    }
    Ok(())
}

// Инвариант 7 (консервация страниц): удаления возвращают overflow-цепочки
// в свободный список, и он используется раньше новых страниц.
#[test]
fn free_list_reuse_bounds_file_growth() -> Result<()> {
    let path = unique_path("free");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        let big = vec![0x42u8; 64 * 1024]; // ~16 overflow-страниц на запись
        for i in 0..8u32 {
            db.kv_store(format!("big-{i}").as_bytes(), &big)?;
        }
        db.commit()?;
        let grown = db.pager_status().db_pages;

        for i in 0..8u32 {
            assert!(db.kv_delete(format!("big-{i}").as_bytes())?);
        }
        let st = db.hash_state().unwrap();
        assert_ne!(st.free_list_head, 0, "deletes must feed the free list");

        // Повторная волна того же объёма обязана жить в освобождённых
        // страницах: файл не растёт
        for i in 0..8u32 {
            db.kv_store(format!("big2-{i}").as_bytes(), &big)?;
        }
        db.commit()?;
        let regrown = db.pager_status().db_pages;
        assert!(
            regrown <= grown + 2,
            "file must not grow past the freed pages: {grown} -> {regrown}"
        );
    }
    cleanup(&path);
    Ok(())
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("quill-split-{prefix}-{pid}-{t}.db"))
}

fn cleanup(path: &PathBuf) {
    let _ = fs::remove_file(path);
    for suffix in ["-journal", "-reserved"] {
        let mut p = path.as_os_str().to_os_string();
        p.push(suffix);
        let _ = fs::remove_file(p);
    }
}
