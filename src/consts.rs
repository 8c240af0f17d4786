// Общие (заголовок базы, страница 1, BE)
pub const DB_SIG: &[u8; 7] = b"unqlite";
pub const DB_MAGIC: u32 = 0xDB7C_2712;
// [sig7][magic u32][ctime u32 DOS][sector u32][page u32][kv_len u16][kv name..]
pub const DB_HDR_FIXED_SZ: usize = 7 + 4 + 4 + 4 + 4 + 2;

// Страницы
pub const MIN_PAGE_SIZE: usize = 512;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

// Сектора
pub const MIN_SECTOR_SIZE: usize = 32;
pub const MAX_SECTOR_SIZE: usize = 65536;
pub const DEFAULT_SECTOR_SIZE: usize = 512;

// Журнал отката
pub const JOURNAL_SUFFIX: &str = "-journal";
pub const JOURNAL_MAGIC: [u8; 8] = [0xA6, 0xE8, 0xCD, 0x2B, 0x1C, 0x92, 0xDB, 0x9F];
// Header: [magic8][nRec u32][cksum seed u32][orig pages u64][sector u32][page u32],
// дополняется нулями до размера сектора. Запись: [pgno u64][page bytes][cksum u32].
pub const JOURNAL_HDR_FIXED_SZ: usize = 8 + 4 + 4 + 8 + 4 + 4;
pub const JOURNAL_OFF_NREC: u64 = 8;
// Шаг выборки байтов для контрольной суммы записи журнала
pub const JOURNAL_CKSUM_STEP: usize = 200;

// Pager: порог спила hot-dirty страниц (dirty commit)
pub const DEFAULT_SPILL_THRESHOLD: usize = 127;
// Pager: нижняя граница max_page_cache
pub const MIN_PAGE_CACHE: usize = 256;

// Linear-hash движок (страница 1, после заголовка базы)
pub const LHASH_MAGIC: u32 = 0xFA78_2DCB;
// Пробное слово: hash(probe) пишется в заголовок как отпечаток хеш-функции
pub const LHASH_HASH_PROBE: &[u8] = b"quill@lhash";
// [magic u32][hash fp u32][free list u64][split u64][max_split u64][map next u64][map nrec u32]
pub const LHASH_HDR_SZ: usize = 4 + 4 + 8 + 8 + 8 + 8 + 4;
pub const LHASH_OFF_FREE: usize = 4 + 4;
pub const LHASH_OFF_SPLIT: usize = 4 + 4 + 8;
pub const LHASH_OFF_MAX_SPLIT: usize = 4 + 4 + 8 + 8;
pub const LHASH_OFF_MAP_NEXT: usize = 4 + 4 + 8 + 8 + 8;
pub const LHASH_OFF_MAP_NREC: usize = 4 + 4 + 8 + 8 + 8 + 8;

// Первичная KV-страница: [cell off u16][free off u16][slave u64]
pub const LHASH_PAGE_HDR_SZ: usize = 2 + 2 + 8;
// Ячейка: [hash u32][klen u32][dlen u64][next u16][ovfl u64]
pub const LHASH_CELL_SZ: usize = 4 + 4 + 8 + 2 + 8;
// Overflow-страница: [next u64]; первая страница цепочки дополнительно
// [data page u64][data off u16] перед байтами ключа
pub const LHASH_OVFL_HDR_SZ: usize = 8;
pub const LHASH_OVFL_FIRST_HDR_SZ: usize = 8 + 8 + 2;
// Свободный блок на странице: [next u16][len u16]; блоки короче 4 байт не учитываются
pub const LHASH_MIN_FREE_BLOCK: usize = 4;
// Ключи крупнее этого не держатся в памяти рядом с ячейкой
pub const LHASH_LARGE_KEY: usize = 262_144;

// Рост внутренних хеш-таблиц
pub const MAP_FILL_FACTOR: usize = 3;
pub const MEM_FILL_FACTOR: usize = 4;
pub const TABLE_GROW_CAP: usize = 100_000;
pub const MEM_BUCKET_INIT: usize = 64;

// Коллекции
pub const COLLECTION_MAGIC: u16 = 0x611E;
// [magic u16][last_id u64][total u64][ctime u32 DOS][schema fastjson..]
pub const COLLECTION_HDR_FIXED_SZ: usize = 2 + 8 + 8 + 4;

// fast-JSON
pub const FASTJSON_NEST_LIMIT: usize = 32;

// Имена KV-движков (пишутся в заголовок базы)
pub const KV_NAME_LHASH: &str = "hash";
pub const KV_NAME_MEM: &str = "mem";

// Путь «базы в памяти»
pub const MEMORY_DB_PATH: &str = ":memory:";
