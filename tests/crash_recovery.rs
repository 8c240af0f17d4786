//! Восстановление по журналу отката: «падения» между фазами коммита,
//! идемпотентность, изоляция повреждённых записей журнала.

use anyhow::Result;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};

use QuillDB::pager::{Pager, PagerOpts};
use QuillDB::{Db, OsVfs, OPEN_CREATE, OPEN_READWRITE};

const PS: usize = 4096;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// S3: дубликат (база, журнал), снятый до удаления журнала, при открытии
// проигрывается: журнал исчезает, содержимое — состояние последнего
// завершённого коммита.
#[test]
fn hot_journal_recovery_restores_committed_state() -> Result<()> {
    init_logging();
    let path = unique_path("s3");

    // Коммит №1 — исходное состояние
    {
        let mut db = Db::open(&path, OPEN_CREATE)?;
        db.collection_create("users")?;
        db.put("users", json!({"name": "Alice", "age": 30}))?;
        db.put("users", json!({"name": "Bob"}))?;
        db.commit()?;
    }

    // Транзакция №2 доведена только до конца первой фазы: страницы
    // записаны, журнал синкнут и НЕ удалён — момент падения.
    let crash = unique_path("s3-crash");
    {
        let mut db = Db::open(&path, OPEN_READWRITE)?;
        db.put("users", json!({"name": "Carol"}))?;
        db.commit_phase1_only()?;

        fs::copy(&path, &crash)?;
        fs::copy(journal_of(&path), journal_of(&crash))?;

        db.commit_phase2_only()?;
    }
    assert!(journal_of(&crash).exists(), "crash copy must carry a hot journal");

    // Открытие дубликата: журнал проигрывается и исчезает
    {
        let mut db = Db::open(&crash, OPEN_READWRITE)?;
        assert!(!journal_of(&crash).exists(), "journal must be gone after recovery");
        assert_eq!(db.total_records("users")?, 2);
        assert_eq!(db.last_record_id("users")?, 1);
        assert!(db.fetch_by_id("users", 2)?.is_none(), "Carol must be rolled back");
        let bob = db.fetch_by_id("users", 1)?.unwrap();
        assert_eq!(bob["name"], "Bob");
    }

    cleanup(&path);
    cleanup(&crash);
    Ok(())
}

// Падение до синка журнала: nRec в заголовке ещё нулевой — база
// остаётся в состоянии предыдущего коммита.
#[test]
fn crash_before_journal_sync_keeps_precommit_state() -> Result<()> {
    init_logging();
    let path = unique_path("presync");
    let (p1, p2) = seed_two_pages(&path)?;

    let crash = unique_path("presync-crash");
    {
        let mut pager = open_pager(&path)?;
        // Модификации журналируются, но nRec не финализирован
        rewrite_page(&mut pager, 1, 0xE1)?;
        rewrite_page(&mut pager, 2, 0xE2)?;

        fs::copy(&path, &crash)?;
        fs::copy(journal_of(&path), journal_of(&crash))?;
        pager.rollback()?;
        pager.close();
    }

    let mut pager = open_pager(&crash)?;
    pager.shared_lock()?;
    assert!(!journal_of(&crash).exists());
    assert_eq!(read_page(&mut pager, 1)?, p1, "page 1 must hold the committed image");
    assert_eq!(read_page(&mut pager, 2)?, p2, "page 2 must hold the committed image");
    pager.close();

    cleanup(&path);
    cleanup(&crash);
    Ok(())
}

// Идемпотентность: повторное проигрывание того же журнала не меняет
// результат.
#[test]
fn recovery_is_idempotent() -> Result<()> {
    init_logging();
    let path = unique_path("idem");
    let _ = seed_two_pages(&path)?;

    let crash = unique_path("idem-crash");
    let saved_journal = unique_path("idem-journal-copy");
    {
        let mut pager = open_pager(&path)?;
        rewrite_page(&mut pager, 1, 0xD1)?;
        rewrite_page(&mut pager, 2, 0xD2)?;
        pager.commit_phase1_only()?;
        fs::copy(&path, &crash)?;
        fs::copy(journal_of(&path), journal_of(&crash))?;
        fs::copy(journal_of(&path), &saved_journal)?;
        pager.commit_phase2_only()?;
        pager.close();
    }

    // Первый проход восстановления
    {
        let mut pager = open_pager(&crash)?;
        pager.shared_lock()?;
        pager.close();
    }
    let after_first = fs::read(&crash)?;

    // Подложить тот же журнал и восстановиться ещё раз
    fs::copy(&saved_journal, journal_of(&crash))?;
    {
        let mut pager = open_pager(&crash)?;
        pager.shared_lock()?;
        pager.close();
    }
    let after_second = fs::read(&crash)?;
    assert_eq!(after_first, after_second, "double recovery must be a fixpoint");

    cleanup(&path);
    cleanup(&crash);
    let _ = fs::remove_file(&saved_journal);
    Ok(())
}

// Инвариант 5: бит, испорченный в payload'е записи журнала, гасит только
// эту запись; остальные проигрываются.
#[test]
fn corrupted_journal_record_is_skipped() -> Result<()> {
    init_logging();
    let path = unique_path("cksum");
    let (p1, _p2) = seed_two_pages(&path)?;

    let crash = unique_path("cksum-crash");
    let txn2_p2;
    {
        let mut pager = open_pager(&path)?;
        rewrite_page(&mut pager, 1, 0xC1)?;
        rewrite_page(&mut pager, 2, 0xC2)?;
        txn2_p2 = read_page(&mut pager, 2)?;
        pager.commit_phase1_only()?;
        fs::copy(&path, &crash)?;
        fs::copy(journal_of(&path), journal_of(&crash))?;
        pager.commit_phase2_only()?;
        pager.close();
    }

    // Журнал: [сектор-заголовок][запись pgno=1][запись pgno=2].
    // Портим payload ВТОРОЙ записи (страница 2).
    {
        let jpath = journal_of(&crash);
        let mut raw = fs::read(&jpath)?;
        let sector = 512;
        let rec_sz = 8 + PS + 4;
        let off = sector + rec_sz + 8 + 100; // payload второй записи
        raw[off] ^= 0xFF;
        fs::write(&jpath, raw)?;
    }

    {
        let mut pager = open_pager(&crash)?;
        pager.shared_lock()?;
        assert!(!journal_of(&crash).exists());
        // Страница 1 откатилась к закоммиченному образу
        assert_eq!(read_page(&mut pager, 1)?, p1);
        // Страница 2: запись журнала пропущена, остался образ транзакции
        assert_eq!(read_page(&mut pager, 2)?, txn2_p2);
        pager.close();
    }

    cleanup(&path);
    cleanup(&crash);
    Ok(())
}

// Спил hot-страниц посреди транзакции + откат: журнал остаётся
// авторитетным и восстанавливает всё.
#[test]
fn rollback_after_spill_restores_everything() -> Result<()> {
    init_logging();
    let path = unique_path("spill");

    // Исходное состояние: 8 страниц с известным узором
    let mut originals = Vec::new();
    {
        let mut pager = open_pager_opts(&path, 2)?;
        for i in 0..8u8 {
            let p = pager.new_page()?;
            pager.write(&p)?;
            fill_page(&p, 0x10 + i);
            originals.push(p.borrow().data.clone());
            pager.unref(&p);
        }
        pager.commit()?;
        pager.close();
    }

    // Транзакция с низким порогом спила: страницы переписываются и
    // отпускаются, спил наверняка срабатывает
    {
        let mut pager = open_pager_opts(&path, 2)?;
        for pgno in 1..=8u64 {
            let p = pager.get(pgno)?;
            pager.write(&p)?;
            fill_page(&p, 0xA0 + pgno as u8);
            pager.unref(&p);
        }
        pager.rollback()?;
        pager.close();
    }

    // Всё вернулось к исходным образам
    {
        let mut pager = open_pager(&path)?;
        for (i, want) in originals.iter().enumerate() {
            let got = read_page(&mut pager, (i + 1) as u64)?;
            assert_eq!(&got, want, "page {} must be restored", i + 1);
        }
        pager.close();
    }

    cleanup(&path);
    Ok(())
}

// ---------------- помощники ----------------

fn open_pager(path: &Path) -> Result<Pager> {
    open_pager_opts(path, 127)
}

fn open_pager_opts(path: &Path, spill: usize) -> Result<Pager> {
    let opts = PagerOpts {
        page_size: PS,
        spill_threshold: spill,
        ..Default::default()
    };
    Ok(Pager::new(Box::new(OsVfs), path, opts)?)
}

/// База из двух страниц с известным содержимым; возвращает их образы.
fn seed_two_pages(path: &Path) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut pager = open_pager(path)?;
    let p1 = pager.new_page()?;
    pager.write(&p1)?;
    fill_page(&p1, 0x5A);
    let img1 = p1.borrow().data.clone();
    pager.unref(&p1);

    let p2 = pager.new_page()?;
    pager.write(&p2)?;
    fill_page(&p2, 0x7C);
    let img2 = p2.borrow().data.clone();
    pager.unref(&p2);

    pager.commit()?;
    pager.close();
    Ok((img1, img2))
}

fn rewrite_page(pager: &mut Pager, pgno: u64, byte: u8) -> Result<()> {
    let p = pager.get(pgno)?;
    pager.write(&p)?;
    fill_page(&p, byte);
    pager.unref(&p);
    Ok(())
}

fn read_page(pager: &mut Pager, pgno: u64) -> Result<Vec<u8>> {
    let p = pager.get(pgno)?;
    let data = p.borrow().data.clone();
    pager.unref(&p);
    Ok(data)
}

fn fill_page(p: &QuillDB::pager::page::PageRef, byte: u8) {
    let mut pg = p.borrow_mut();
    for (i, b) in pg.data.iter_mut().enumerate() {
        *b = byte ^ (i as u8);
    }
}

fn journal_of(path: &Path) -> PathBuf {
    let mut j = path.as_os_str().to_os_string();
    j.push("-journal");
    PathBuf::from(j)
}

fn unique_path(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("quill-rec-{prefix}-{pid}-{t}.db"))
}

fn cleanup(path: &Path) {
    let _ = fs::remove_file(path);
    for suffix in ["-journal", "-reserved"] {
        let mut p = path.as_os_str().to_os_string();
        p.push(suffix);
        let _ = fs::remove_file(p);
    }
}
