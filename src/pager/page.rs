//! pager/page — страница в кэше: буфер, флаги, счётчик ссылок.
//!
//! Страницы раздаются как `PageRef` (Rc<RefCell<..>>); счётчик ссылок
//! pager'а — явный (nref), им управляют Pager::get()/unref(): страница
//! закреплена, пока nref > 0, грязная страница живёт в кэше до коммита.

use std::cell::RefCell;
use std::rc::Rc;

pub const PAGE_DIRTY: u8 = 0x01;
pub const PAGE_NEED_SYNC: u8 = 0x02;
pub const PAGE_DONT_WRITE: u8 = 0x04;
pub const PAGE_IN_JOURNAL: u8 = 0x08;
pub const PAGE_HOT_DIRTY: u8 = 0x10;
pub const PAGE_DONT_MAKE_HOT: u8 = 0x20;

pub type PageRef = Rc<RefCell<Page>>;

pub struct Page {
    pub pgno: u64,
    pub data: Vec<u8>,
    pub(crate) flags: u8,
    pub(crate) nref: u32,
}

impl Page {
    pub(crate) fn new(pgno: u64, page_size: usize) -> PageRef {
        Rc::new(RefCell::new(Page {
            pgno,
            data: vec![0u8; page_size],
            flags: 0,
            nref: 1,
        }))
    }

    #[inline]
    pub(crate) fn is_dirty(&self) -> bool {
        self.flags & PAGE_DIRTY != 0
    }

    #[inline]
    pub(crate) fn set(&mut self, f: u8) {
        self.flags |= f;
    }

    #[inline]
    pub(crate) fn clear(&mut self, f: u8) {
        self.flags &= !f;
    }

    #[inline]
    pub(crate) fn has(&self, f: u8) -> bool {
        self.flags & f != 0
    }
}
