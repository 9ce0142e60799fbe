//! Preload file loader: a tightly packed `{Key:u64, Value:...}` file
//! streamed in fixed-size chunks into a [`super::CuckooTable`] at
//! startup.

use std::fs::File;
use std::io::{BufReader, Read};

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::cache::CuckooTable;
use crate::error::{Error, Result};

/// Number of `{Key, Value}` records read per chunk.
const CHUNK_ITEMS: usize = 256;

/// Streams `path` into `table`, decoding each value with `decode`.
/// `value_size` is the on-disk byte width of one value record. Returns
/// the number of items successfully inserted; an item that the cuckoo
/// table rejects (eviction budget exhausted) is logged and skipped
/// rather than aborting the whole load.
pub fn load_into<V: Copy>(
    path: &str,
    table: &mut CuckooTable<V>,
    value_size: usize,
    decode: impl Fn(&[u8]) -> V,
) -> Result<usize> {
    let file = File::open(path).map_err(|e| Error::Io(format!("preload {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let record_len = 8 + value_size;
    let mut chunk = vec![0u8; record_len * CHUNK_ITEMS];
    let mut loaded = 0usize;

    loop {
        let mut filled = 0usize;
        while filled < chunk.len() {
            match reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(Error::Io(format!("preload {path}: {e}"))),
            }
        }
        if filled == 0 {
            break;
        }
        let whole_records = filled / record_len;
        for i in 0..whole_records {
            let rec = &chunk[i * record_len..(i + 1) * record_len];
            let key = LittleEndian::read_u64(&rec[0..8]);
            let value = decode(&rec[8..8 + value_size]);
            match table.insert(key, value) {
                Ok(()) => loaded += 1,
                Err(err) => warn!(key, %err, "dropping preload item: cache table rejected insert"),
            }
        }
        if filled < chunk.len() {
            break;
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OccupancyMode;
    use std::io::Write;

    #[test]
    fn loads_packed_records() {
        let tmp = tempfile_path();
        {
            let mut f = File::create(&tmp).unwrap();
            for k in 0..4u64 {
                let mut rec = [0u8; 8 + 8];
                LittleEndian::write_u64(&mut rec[0..8], k);
                LittleEndian::write_u64(&mut rec[8..16], k * 100);
                f.write_all(&rec).unwrap();
            }
        }
        let mut table = CuckooTable::new(16, 4, OccupancyMode::PerItem);
        let n = load_into(&tmp, &mut table, 8, |b| LittleEndian::read_u64(b)).unwrap();
        assert_eq!(n, 4);
        assert_eq!(table.lookup(2), Some(200));
        std::fs::remove_file(&tmp).ok();
    }

    fn tempfile_path() -> String {
        format!("{}/dds_preload_test_{}.bin", std::env::temp_dir().display(), std::process::id())
    }
}
