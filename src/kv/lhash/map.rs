//! kv/lhash/map — карта бакетов: логический номер → реальная страница.
//!
//! На диске — цепочка страниц с парами [logical u64][real u64]; первая
//! порция живёт на странице заголовка движка, продолжения — на
//! отдельных страницах формата [next u64][nrec u32][пары ...].
//! В памяти карта целиком: таблица + порядок добавления (по нему ходят
//! курсоры first/last).

use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Состояние текущей (последней) страницы карты: туда дописываются
/// новые записи.
#[derive(Debug, Clone, Copy)]
pub struct MapPageState {
    /// Номер страницы.
    pub num: u64,
    /// Смещение для следующей записи.
    pub ptr: u32,
    /// Записей на этой странице.
    pub nrec: u32,
    /// Следующая страница карты (0 — нет).
    pub next: u64,
}

#[derive(Debug, Default)]
pub struct BucketMap {
    table: HashMap<u64, (u64, usize)>,
    order: Vec<u64>,
}

impl BucketMap {
    pub fn clear(&mut self) {
        self.table.clear();
        self.order.clear();
    }

    #[inline]
    pub fn get(&self, logical: u64) -> Option<u64> {
        self.table.get(&logical).map(|&(real, _)| real)
    }

    /// Позиция бакета в порядке добавления.
    #[inline]
    pub fn index_of(&self, logical: u64) -> Option<usize> {
        self.table.get(&logical).map(|&(_, pos)| pos)
    }

    pub fn insert(&mut self, logical: u64, real: u64) {
        match self.table.get_mut(&logical) {
            Some(slot) => slot.0 = real,
            None => {
                self.table.insert(logical, (real, self.order.len()));
                self.order.push(logical);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Логические бакеты в порядке добавления.
    #[inline]
    pub fn order(&self) -> &[u64] {
        &self.order
    }

    /// Реальная страница по позиции в порядке добавления.
    pub fn real_at(&self, idx: usize) -> Option<u64> {
        self.order.get(idx).and_then(|l| self.get(*l))
    }
}

/// Разобрать порцию записей карты со страницы `raw`.
///
/// При state.ptr == 0 страница — продолжение цепочки: сначала её
/// заголовок [next u64][nrec u32]. Иначе ptr уже указывает на записи
/// (страница заголовка движка). Обновляет state.ptr.
pub fn map_load_page(raw: &[u8], state: &mut MapPageState, map: &mut BucketMap) -> Result<()> {
    let mut off: usize = if state.ptr == 0 {
        if raw.len() < 12 {
            return Err(Error::Corrupt("bucket map page too small"));
        }
        state.next = BigEndian::read_u64(&raw[0..8]);
        state.nrec = BigEndian::read_u32(&raw[8..12]);
        12
    } else {
        state.ptr as usize
    };

    for _ in 0..state.nrec {
        if off + 16 > raw.len() {
            break;
        }
        let logical = BigEndian::read_u64(&raw[off..off + 8]);
        let real = BigEndian::read_u64(&raw[off + 8..off + 16]);
        off += 16;
        map.insert(logical, real);
    }
    state.ptr = off as u32;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_chained_map_page() {
        let mut raw = vec![0u8; 256];
        BigEndian::write_u64(&mut raw[0..8], 99); // next
        BigEndian::write_u32(&mut raw[8..12], 2); // nrec
        BigEndian::write_u64(&mut raw[12..20], 5);
        BigEndian::write_u64(&mut raw[20..28], 50);
        BigEndian::write_u64(&mut raw[28..36], 6);
        BigEndian::write_u64(&mut raw[36..44], 60);

        let mut state = MapPageState {
            num: 2,
            ptr: 0,
            nrec: 0,
            next: 0,
        };
        let mut map = BucketMap::default();
        map_load_page(&raw, &mut state, &mut map).unwrap();

        assert_eq!(state.next, 99);
        assert_eq!(state.nrec, 2);
        assert_eq!(state.ptr, 44);
        assert_eq!(map.get(5), Some(50));
        assert_eq!(map.get(6), Some(60));
        assert_eq!(map.order(), &[5, 6]);
    }

    #[test]
    fn insert_keeps_first_position() {
        let mut map = BucketMap::default();
        map.insert(1, 10);
        map.insert(2, 20);
        map.insert(1, 11); // обновление не дублирует порядок
        assert_eq!(map.order(), &[1, 2]);
        assert_eq!(map.get(1), Some(11));
        assert_eq!(map.real_at(1), Some(20));
    }
}
