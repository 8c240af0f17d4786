//! kv/lhash/cursor — курсоры движка.
//!
//! Обход идёт по записям карты бакетов в порядке их добавления; внутри
//! бакета — по цепочке ячеек (master + slaves), свежие впереди. Пустые
//! страницы пропускаются. Курсор кэширует разобранные ячейки текущего
//! бакета; его валидность ограничена ближайшей структурной мутацией,
//! выполненной не через него.

use crate::error::{Error, Result};
use crate::kv::{Consumer, CursorId, SeekMode, StreamCmp};
use crate::pager::Pager;

use super::page::Cell;
use super::LhashKv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CurState {
    Done,
    OnCell,
}

pub(crate) struct LhCursor {
    state: CurState,
    /// Позиция в порядке добавления записей карты.
    map_idx: usize,
    /// Master-страница текущего бакета.
    master: u64,
    cells: Vec<Cell>,
    pos: usize,
}

impl LhCursor {
    fn done() -> Self {
        Self {
            state: CurState::Done,
            map_idx: 0,
            master: 0,
            cells: Vec::new(),
            pos: 0,
        }
    }
}

pub(crate) fn cursor_open(eng: &mut LhashKv) -> CursorId {
    for (i, slot) in eng.cursors.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(LhCursor::done());
            return CursorId(i);
        }
    }
    eng.cursors.push(Some(LhCursor::done()));
    CursorId(eng.cursors.len() - 1)
}

pub(crate) fn cursor_close(eng: &mut LhashKv, cur: CursorId) {
    if let Some(slot) = eng.cursors.get_mut(cur.0) {
        *slot = None;
    }
}

fn ensure_cursor(eng: &LhashKv, cur: CursorId) -> Result<()> {
    match eng.cursors.get(cur.0) {
        Some(Some(_)) => Ok(()),
        _ => Err(Error::Invalid("unknown cursor")),
    }
}

fn current_cell(eng: &LhashKv, cur: CursorId) -> Result<Cell> {
    let c = eng
        .cursors
        .get(cur.0)
        .and_then(|s| s.as_ref())
        .ok_or(Error::Invalid("unknown cursor"))?;
    if c.state != CurState::OnCell || c.pos >= c.cells.len() {
        return Err(Error::Invalid("cursor does not point to a record"));
    }
    Ok(c.cells[c.pos].clone())
}

/// Разобрать бакет в плоский список ячеек (master, затем slaves).
fn load_flat(eng: &LhashKv, pager: &mut Pager, real: u64) -> Result<Vec<Cell>> {
    let group = eng.load_group(pager, real, false)?;
    let mut flat = Vec::new();
    for page in group.pages {
        flat.extend(page.cells);
    }
    Ok(flat)
}

/// Первый непустой бакет начиная с позиции from (вперёд).
fn advance_forward(
    eng: &mut LhashKv,
    pager: &mut Pager,
    cur: CursorId,
    from: usize,
) -> Result<()> {
    let total = eng.map.order().len();
    for i in from..total {
        let Some(real) = eng.map.real_at(i) else { continue };
        let flat = load_flat(eng, pager, real)?;
        if !flat.is_empty() {
            if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
                *slot = LhCursor {
                    state: CurState::OnCell,
                    map_idx: i,
                    master: real,
                    cells: flat,
                    pos: 0,
                };
            }
            return Ok(());
        }
    }
    if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
        *slot = LhCursor::done();
    }
    Err(Error::Eof)
}

/// Первый непустой бакет начиная с позиции from (назад); курсор встаёт
/// на хвост его цепочки.
fn advance_backward(
    eng: &mut LhashKv,
    pager: &mut Pager,
    cur: CursorId,
    from: Option<usize>,
) -> Result<()> {
    let Some(mut i) = from else {
        if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
            *slot = LhCursor::done();
        }
        return Err(Error::Eof);
    };
    loop {
        if let Some(real) = eng.map.real_at(i) {
            let flat = load_flat(eng, pager, real)?;
            if !flat.is_empty() {
                let pos = flat.len() - 1;
                if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
                    *slot = LhCursor {
                        state: CurState::OnCell,
                        map_idx: i,
                        master: real,
                        cells: flat,
                        pos,
                    };
                }
                return Ok(());
            }
        }
        if i == 0 {
            break;
        }
        i -= 1;
    }
    if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
        *slot = LhCursor::done();
    }
    Err(Error::Eof)
}

pub(crate) fn cursor_first(eng: &mut LhashKv, pager: &mut Pager, cur: CursorId) -> Result<()> {
    ensure_cursor(eng, cur)?;
    advance_forward(eng, pager, cur, 0)
}

pub(crate) fn cursor_last(eng: &mut LhashKv, pager: &mut Pager, cur: CursorId) -> Result<()> {
    ensure_cursor(eng, cur)?;
    let total = eng.map.order().len();
    if total == 0 {
        if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
            *slot = LhCursor::done();
        }
        return Err(Error::Eof);
    }
    advance_backward(eng, pager, cur, Some(total - 1))
}

pub(crate) fn cursor_valid(eng: &LhashKv, cur: CursorId) -> bool {
    matches!(
        eng.cursors.get(cur.0).and_then(|s| s.as_ref()),
        Some(c) if c.state == CurState::OnCell && c.pos < c.cells.len()
    )
}

pub(crate) fn cursor_next(eng: &mut LhashKv, pager: &mut Pager, cur: CursorId) -> Result<()> {
    ensure_cursor(eng, cur)?;
    let (state, pos, len, map_idx) = {
        let c = eng.cursors[cur.0].as_ref().unwrap();
        (c.state, c.pos, c.cells.len(), c.map_idx)
    };
    if state != CurState::OnCell {
        return Err(Error::Eof);
    }
    if pos + 1 < len {
        eng.cursors[cur.0].as_mut().unwrap().pos = pos + 1;
        return Ok(());
    }
    advance_forward(eng, pager, cur, map_idx + 1)
}

pub(crate) fn cursor_prev(eng: &mut LhashKv, pager: &mut Pager, cur: CursorId) -> Result<()> {
    ensure_cursor(eng, cur)?;
    let (state, pos, map_idx) = {
        let c = eng.cursors[cur.0].as_ref().unwrap();
        (c.state, c.pos, c.map_idx)
    };
    if state != CurState::OnCell {
        return Err(Error::Eof);
    }
    if pos > 0 {
        eng.cursors[cur.0].as_mut().unwrap().pos = pos - 1;
        return Ok(());
    }
    advance_backward(eng, pager, cur, map_idx.checked_sub(1))
}

pub(crate) fn cursor_seek(
    eng: &mut LhashKv,
    pager: &mut Pager,
    cur: CursorId,
    key: &[u8],
    mode: SeekMode,
) -> Result<()> {
    ensure_cursor(eng, cur)?;
    if mode != SeekMode::Exact {
        // Линейное хеширование не упорядочено: Le/Ge не имеют смысла
        return Err(Error::NotImplemented);
    }
    let hash = (eng.hash)(key);
    let bucket = eng.bucket_of(hash);
    let Some(real) = eng.map.get(bucket) else {
        if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
            *slot = LhCursor::done();
        }
        return Err(Error::NotFound);
    };
    let flat = load_flat(eng, pager, real)?;
    let mut found: Option<usize> = None;
    for (i, cell) in flat.iter().enumerate() {
        if cell.hash != hash || cell.klen as usize != key.len() {
            continue;
        }
        let ok = match &cell.key {
            Some(k) => (eng.cmp)(k, key) == std::cmp::Ordering::Equal,
            None => {
                let mut sc = StreamCmp::new(key, eng.cmp);
                match eng.consume_cell_key(pager, cell, &mut sc) {
                    Ok(()) => sc.matched(),
                    Err(Error::Abort) => false,
                    Err(e) => return Err(e),
                }
            }
        };
        if ok {
            found = Some(i);
            break;
        }
    }
    match found {
        Some(pos) => {
            let map_idx = eng.map.index_of(bucket).unwrap_or(0);
            if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
                *slot = LhCursor {
                    state: CurState::OnCell,
                    map_idx,
                    master: real,
                    cells: flat,
                    pos,
                };
            }
            Ok(())
        }
        None => {
            if let Some(slot) = eng.cursors.get_mut(cur.0).and_then(|s| s.as_mut()) {
                *slot = LhCursor::done();
            }
            Err(Error::NotFound)
        }
    }
}

pub(crate) fn cursor_key_len(eng: &mut LhashKv, _pager: &mut Pager, cur: CursorId) -> Result<usize> {
    Ok(current_cell(eng, cur)?.klen as usize)
}

pub(crate) fn cursor_data_len(eng: &mut LhashKv, _pager: &mut Pager, cur: CursorId) -> Result<u64> {
    Ok(current_cell(eng, cur)?.dlen)
}

pub(crate) fn cursor_key(
    eng: &mut LhashKv,
    pager: &mut Pager,
    cur: CursorId,
    sink: &mut dyn Consumer,
) -> Result<()> {
    let cell = current_cell(eng, cur)?;
    eng.consume_cell_key(pager, &cell, sink)
}

pub(crate) fn cursor_data(
    eng: &mut LhashKv,
    pager: &mut Pager,
    cur: CursorId,
    sink: &mut dyn Consumer,
) -> Result<()> {
    let cell = current_cell(eng, cur)?;
    eng.consume_cell_data(pager, &cell, sink)
}

pub(crate) fn cursor_delete(eng: &mut LhashKv, pager: &mut Pager, cur: CursorId) -> Result<()> {
    let cell = current_cell(eng, cur)?;
    let master = eng.cursors[cur.0].as_ref().unwrap().master;

    let mut group = eng.load_group(pager, master, false)?;
    let mut loc: Option<(usize, usize)> = None;
    'scan: for (pi, page) in group.pages.iter().enumerate() {
        for (ci, c) in page.cells.iter().enumerate() {
            if c.pgno == cell.pgno && c.start == cell.start && c.hash == cell.hash {
                loc = Some((pi, ci));
                break 'scan;
            }
        }
    }
    let Some((pi, ci)) = loc else {
        // Курсор пережил чужую мутацию
        return Err(Error::NotFound);
    };
    eng.record_remove(pager, &mut group, pi, ci)?;

    // Сдвинуть курсор на следующую ячейку
    let (pos, len, map_idx) = {
        let c = eng.cursors[cur.0].as_mut().unwrap();
        c.cells.remove(c.pos);
        (c.pos, c.cells.len(), c.map_idx)
    };
    if pos < len {
        return Ok(());
    }
    match advance_forward(eng, pager, cur, map_idx + 1) {
        Ok(()) => Ok(()),
        Err(Error::Eof) => Ok(()),
        Err(e) => Err(e),
    }
}
