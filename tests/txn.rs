//! Транзакции: границы видимости, откат, занятость блокировок,
//! auto-commit при закрытии.

use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use QuillDB::{Db, DbOptions, Error, OPEN_CREATE, OPEN_READONLY, OPEN_READWRITE};

#[test]
fn rollback_discards_kv_writes() -> Result<()> {
    let path = unique_path("rb");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.kv_store(b"keep", b"committed")?;
        db.commit()?;

        db.kv_store(b"keep", b"doomed")?;
        db.kv_store(b"extra", b"doomed too")?;
        db.rollback()?;

        assert_eq!(db.kv_fetch(b"keep")?.unwrap(), b"committed");
        assert!(db.kv_fetch(b"extra")?.is_none());
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        assert_eq!(db.kv_fetch(b"keep")?.unwrap(), b"committed");
        assert!(db.kv_fetch(b"extra")?.is_none());
    }
    cleanup(&path);
    Ok(())
}

#[test]
fn auto_commit_on_close() -> Result<()> {
    let path = unique_path("auto");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.kv_store(b"k", b"v")?;
        // Без явного commit: закрытие хэндла фиксирует транзакцию
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        assert_eq!(db.kv_fetch(b"k")?.unwrap(), b"v");
    }
    cleanup(&path);
    Ok(())
}

#[test]
fn disabled_auto_commit_rolls_back_on_close() -> Result<()> {
    let path = unique_path("noauto");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.kv_store(b"base", b"1")?;
        db.commit()?;

        db.set_disable_auto_commit(true);
        db.kv_store(b"stray", b"2")?;
        // Закрытие без коммита: запись пропадает
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        assert_eq!(db.kv_fetch(b"base")?.unwrap(), b"1");
        assert!(db.kv_fetch(b"stray")?.is_none());
    }
    cleanup(&path);
    Ok(())
}

#[test]
fn second_writer_gets_busy() -> Result<()> {
    let path = unique_path("busy");
    let mut w1 = Db::open(&path, OPEN_CREATE)?;
    w1.kv_store(b"a", b"1")?;
    w1.commit()?;

    // Открытая транзакция первого писателя держит Reserved
    w1.kv_store(b"a", b"2")?;

    // Второй хэндл открывается (Shared совместим) и видит последний
    // коммит, но писать не может
    let mut w2 = Db::open(&path, OPEN_READWRITE)?;
    assert_eq!(w2.kv_fetch(b"a")?.unwrap(), b"1");
    match w2.kv_store(b"b", b"x") {
        Err(Error::Busy) => {}
        other => panic!("second writer must see Busy, got {other:?}"),
    }
    drop(w2);

    w1.commit()?;
    drop(w1);

    // Свежий хэндл после ухода писателя работает
    let mut w3 = Db::open(&path, OPEN_READWRITE)?;
    assert_eq!(w3.kv_fetch(b"a")?.unwrap(), b"2");
    w3.kv_store(b"b", b"3")?;
    w3.commit()?;
    drop(w3);
    cleanup(&path);
    Ok(())
}

#[test]
fn busy_handler_retries_until_free() -> Result<()> {
    let path = unique_path("handler");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.kv_store(b"seed", b"x")?;
        db.commit()?;
    }

    // Обработчик, который сдаётся после трёх попыток
    let mut w1 = Db::open(&path, OPEN_READWRITE)?;
    w1.kv_store(b"hold", b"1")?;

    let mut attempts = 0u32;
    let mut w2 = Db::open_with(
        &path,
        DbOptions::new().flags(OPEN_READWRITE).busy_handler(Box::new(move || {
            attempts += 1;
            attempts < 3
        })),
    )?;
    match w2.kv_store(b"other", b"2") {
        Err(Error::Busy) => {}
        other => panic!("expected Busy after handler gave up, got {other:?}"),
    }
    drop(w1);
    drop(w2);
    cleanup(&path);
    Ok(())
}

#[test]
fn reader_coexists_with_committed_state() -> Result<()> {
    let path = unique_path("reader");
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.kv_store(b"k", b"committed")?;
        db.commit()?;
    }
    // Читатель видит только закоммиченное
    let mut r = Db::open(&path, OPEN_READONLY)?;
    assert_eq!(r.kv_fetch(b"k")?.unwrap(), b"committed");
    assert!(matches!(r.kv_store(b"k", b"nope"), Err(Error::ReadOnly)));
    drop(r);
    cleanup(&path);
    Ok(())
}

#[test]
fn begin_is_idempotent_and_scoped() -> Result<()> {
    let path = unique_path("begin");
    let mut db = Db::open(&path, OPEN_CREATE)?;
    db.begin()?;
    db.begin()?; // повторный begin — no-op
    db.kv_store(b"a", b"1")?;
    db.commit()?;
    // Коммит без открытой транзакции — no-op
    db.commit()?;
    assert_eq!(db.kv_fetch(b"a")?.unwrap(), b"1");
    drop(db);
    cleanup(&path);
    Ok(())
}

#[test]
fn omit_journaling_still_commits() -> Result<()> {
    let path = unique_path("nojrnl");
    {
        let mut db = Db::open(&path, OPEN_CREATE | QuillDB::OPEN_OMIT_JOURNALING)?;
        db.kv_store(b"k", b"v")?;
        db.commit()?;
        // Журнал не создавался
        let mut j = path.as_os_str().to_os_string();
        j.push("-journal");
        assert!(!PathBuf::from(j).exists());
    }
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        assert_eq!(db.kv_fetch(b"k")?.unwrap(), b"v");
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
    std::env::temp_dir().join(format!("quill-txn-{prefix}-{pid}-{t}.db"))
}

fn cleanup(path: &PathBuf) {
    let _ = fs::remove_file(path);
    for suffix in ["-journal", "-reserved"] {
        let mut p = path.as_os_str().to_os_string();
        p.push(suffix);
        let _ = fs::remove_file(p);
    }
}
