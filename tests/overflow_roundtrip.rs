//! Overflow-цепочки: большие payload'ы, точка начала данных, возврат
//! цепочек в свободный список.

use anyhow::Result;
use serde_json::json;
use std::fs;
use std::path::PathBuf;

use QuillDB::{Db, OPEN_CREATE, OPEN_READWRITE};

// S6: значение в 256 KiB через слой коллекций; ячейка обязана иметь
// ненулевой overflow-указатель.
#[test]
fn large_value_roundtrips_through_overflow() -> Result<()> {
    let path = unique_path("s6");
    let blob: String = {
        // 256 KiB печатаемых байт
        let mut s = String::with_capacity(256 * 1024);
        let alphabet = b"abcdefghijklmnopqrstuvwxyz0123456789";
        for i in 0..256 * 1024 {
            s.push(alphabet[i % alphabet.len()] as char);
        }
        s
    };

    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.collection_create("big")?;
        let id = db.put("big", json!({"blob": blob}))?;
        assert_eq!(id, 0);

        // Запись физически лежит в overflow-цепочке
        let key = b"big_0";
        let ovfl = db.record_overflow_page(key)?;
        assert!(ovfl.is_some(), "payload must live in an overflow chain");
        db.commit()?;
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        let rec = db.fetch_by_id("big", 0)?.expect("record must exist");
        let got = rec["blob"].as_str().unwrap();
        assert_eq!(got.len(), blob.len());
        assert_eq!(got, blob, "blob must round-trip byte for byte");
        assert_eq!(rec["__id"], 0);
    }
    cleanup(&path);
    Ok(())
}

// Маленькое значение остаётся локальным.
#[test]
fn small_value_stays_local() -> Result<()> {
    let path = unique_path("local");
    let mut db = Db::open(&path, OPEN_CREATE)?;
    db.kv_store(b"small", b"payload")?;
    assert_eq!(db.record_overflow_page(b"small")?, None);
    drop(db);
    cleanup(&path);
    Ok(())
}

// Перезапись: локальное -> overflow -> короче -> снова локального размера.
#[test]
fn overwrite_moves_between_local_and_overflow() -> Result<()> {
    let path = unique_path("move");
    let mut db = Db::open(&path, OPEN_CREATE)?;

    db.kv_store(b"k", b"tiny")?;
    assert_eq!(db.record_overflow_page(b"k")?, None);

    let big = vec![0x5Au8; 32 * 1024];
    db.kv_store(b"k", &big)?;
    assert!(db.record_overflow_page(b"k")?.is_some());
    assert_eq!(db.kv_fetch(b"k")?.unwrap(), big);

    // Короче, но всё ещё в цепочке (перезапись по месту данных)
    let mid = vec![0x33u8; 10 * 1024];
    db.kv_store(b"k", &mid)?;
    assert_eq!(db.kv_fetch(b"k")?.unwrap(), mid);

    db.commit()?;
    drop(db);

    let mut db = Db::open(&path, OPEN_READWRITE)?;
    assert_eq!(db.kv_fetch(b"k")?.unwrap(), mid);
    drop(db);
    cleanup(&path);
    Ok(())
}

// Дозапись, выталкивающая локальный payload в overflow.
#[test]
fn append_pushes_local_payload_to_overflow() -> Result<()> {
    let path = unique_path("appovf");
    let mut db = Db::open(&path, OPEN_CREATE)?;

    db.kv_store(b"k", &vec![0x11u8; 1000])?;
    assert_eq!(db.record_overflow_page(b"k")?, None);

    // Несколько дозаписей: суммарный размер превышает страницу
    for _ in 0..8 {
        db.kv_append(b"k", &vec![0x22u8; 1000])?;
    }
    let got = db.kv_fetch(b"k")?.unwrap();
    assert_eq!(got.len(), 9000);
    assert!(got[..1000].iter().all(|&b| b == 0x11));
    assert!(got[1000..].iter().all(|&b| b == 0x22));
    assert!(db.record_overflow_page(b"k")?.is_some());

    // И дозапись уже в overflow-хвост
    db.kv_append(b"k", &vec![0x33u8; 5000])?;
    let got = db.kv_fetch(b"k")?.unwrap();
    assert_eq!(got.len(), 14_000);
    assert!(got[9000..].iter().all(|&b| b == 0x33));

    db.commit()?;
    drop(db);
    let mut db = Db::open(&path, OPEN_READWRITE)?;
    assert_eq!(db.kv_fetch(b"k")?.unwrap().len(), 14_000);
    drop(db);
    cleanup(&path);
    Ok(())
}

// Удаление большой записи возвращает цепочку в свободный список.
#[test]
fn delete_returns_chain_to_free_list() -> Result<()> {
    let path = unique_path("freechain");
    let mut db = Db::open(&path, OPEN_CREATE)?;
    db.kv_store(b"big", &vec![0xEEu8; 100 * 1024])?;
    let st = db.hash_state().unwrap();
    assert_eq!(st.free_list_head, 0);

    assert!(db.kv_delete(b"big")?);
    let st = db.hash_state().unwrap();
    assert_ne!(st.free_list_head, 0, "overflow chain must be on the free list");
    assert!(db.kv_fetch(b"big")?.is_none());
    drop(db);
    cleanup(&path);
    Ok(())
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("quill-ovf-{prefix}-{pid}-{t}.db"))
}

fn cleanup(path: &PathBuf) {
    let _ = fs::remove_file(path);
    for suffix in ["-journal", "-reserved"] {
        let mut p = path.as_os_str().to_os_string();
        p.push(suffix);
        let _ = fs::remove_file(p);
    }
}
