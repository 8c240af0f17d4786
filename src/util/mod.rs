//! util — общие утилиты.
//!
//! Содержит:
//! - dos_pack_time()/dos_unpack_time(): 4-байтный DOS-формат даты/времени
//!   (используется в заголовке базы и заголовках коллекций).
//! - is_power_of_two(): проверка размеров страницы/сектора.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

/// Упаковать момент времени в 4-байтный DOS-формат:
/// [год-1980:7][месяц:4][день:5] << 16 | [час:5][мин:6][сек/2:5].
/// Годы до 1980 сводятся к 1980.
pub fn dos_pack_time(t: &NaiveDateTime) -> u32 {
    let year = (t.year().max(1980) - 1980) as u32 & 0x7F;
    let date = (year << 9) | (t.month() << 5) | t.day();
    let time = (t.hour() << 11) | (t.minute() << 5) | (t.second() / 2);
    (date << 16) | time
}

/// Распаковать DOS-формат обратно в структурное время.
/// Некорректные поля сводятся к ближайшей допустимой дате.
pub fn dos_unpack_time(v: u32) -> NaiveDateTime {
    let date = v >> 16;
    let time = v & 0xFFFF;
    let year = 1980 + ((date >> 9) & 0x7F) as i32;
    let month = ((date >> 5) & 0x0F).clamp(1, 12);
    let day = (date & 0x1F).clamp(1, 31);
    let hour = ((time >> 11) & 0x1F).min(23);
    let minute = ((time >> 5) & 0x3F).min(59);
    let second = ((time & 0x1F) * 2).min(58);

    NaiveDate::from_ymd_opt(year, month, day)
        .or_else(|| NaiveDate::from_ymd_opt(year, month, 28))
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1980, 1, 1).unwrap())
        .and_hms_opt(hour, minute, second)
        .unwrap_or_else(|| {
            NaiveDate::from_ymd_opt(1980, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        })
}

/// Текущее локальное время без смещения (для заголовков).
#[inline]
pub fn now_local() -> NaiveDateTime {
    Local::now().naive_local()
}

#[inline]
pub fn is_power_of_two(v: usize) -> bool {
    v != 0 && (v & (v - 1)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn dos_time_roundtrip() {
        let t = NaiveDate::from_ymd_opt(2024, 11, 5)
            .unwrap()
            .and_hms_opt(13, 37, 42)
            .unwrap();
        let packed = dos_pack_time(&t);
        let back = dos_unpack_time(packed);
        assert_eq!(back.year(), 2024);
        assert_eq!(back.month(), 11);
        assert_eq!(back.day(), 5);
        assert_eq!(back.hour(), 13);
        assert_eq!(back.minute(), 37);
        // DOS хранит секунды с точностью до 2
        assert_eq!(back.second(), 42);
    }

    #[test]
    fn dos_time_clamps_pre_1980() {
        let t = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let back = dos_unpack_time(dos_pack_time(&t));
        assert_eq!(back.year(), 1980);
    }

    #[test]
    fn power_of_two() {
        assert!(is_power_of_two(512));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(4097));
    }
}
