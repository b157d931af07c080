/*!
 * Arrays
 *
 * `SimpleArray` packs `(name, value)` items into one contiguous pack-
 * allocator block: fixed item records grow from the front, name and value
 * bytes from the rear, so the whole structure can be shipped into shared
 * memory or to disk and the last item popped by rewinding both ends.
 *
 * `DynamicArray` is its unbounded sibling: a singly-linked chain inside a
 * serial arena, append-only, iterated in insertion order.
 */

use crate::core::types::MemResult;
use crate::mem::{Arena, ArenaRef, PackAllocator, SerialAllocator};

const ITEM_RECORD: usize = 16;

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn write_u32(bytes: &mut [u8], v: u32) {
    bytes.copy_from_slice(&v.to_le_bytes());
}

pub struct SimpleArray {
    pack: PackAllocator,
    count: usize,
}

impl SimpleArray {
    /// `max_size` bounds records plus payload bytes together.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            pack: PackAllocator::with_capacity(max_size),
            count: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, name: &str, value: &[u8]) -> MemResult<()> {
        let rec = self.pack.alloc_front_unaligned(ITEM_RECORD)?;
        let end_before = self.pack.end_pos();

        let name_off = match self.pack.alloc_from_rear(name.len()) {
            Ok(off) => off,
            Err(e) => {
                // Roll the record back so a failed add leaves no trace.
                let _ = self.pack.set_start_pos(rec);
                return Err(e);
            }
        };
        self.pack.write(name_off, name.as_bytes());

        let val_off = match self.pack.alloc_from_rear(value.len()) {
            Ok(off) => off,
            Err(e) => {
                let _ = self.pack.set_start_pos(rec);
                let _ = self.pack.set_end_pos(Some(end_before));
                return Err(e);
            }
        };
        self.pack.write(val_off, value);

        let mut record = [0u8; ITEM_RECORD];
        write_u32(&mut record[0..4], name_off as u32);
        write_u32(&mut record[4..8], name.len() as u32);
        write_u32(&mut record[8..12], val_off as u32);
        write_u32(&mut record[12..16], value.len() as u32);
        self.pack.write(rec, &record);

        self.count += 1;
        Ok(())
    }

    fn record(&self, index: usize) -> (usize, usize, usize, usize) {
        let rec = self.pack.read(index * ITEM_RECORD, ITEM_RECORD);
        (
            read_u32(&rec[0..4]) as usize,
            read_u32(&rec[4..8]) as usize,
            read_u32(&rec[8..12]) as usize,
            read_u32(&rec[12..16]) as usize,
        )
    }

    #[must_use]
    pub fn item(&self, index: usize) -> Option<(&str, &[u8])> {
        if index >= self.count {
            return None;
        }
        let (noff, nlen, voff, vlen) = self.record(index);
        let name = std::str::from_utf8(self.pack.read(noff, nlen)).unwrap_or("");
        Some((name, self.pack.read(voff, vlen)))
    }

    /// First value stored under `name`.
    #[must_use]
    pub fn search(&self, name: &str) -> Option<&[u8]> {
        (0..self.count).find_map(|i| {
            let (noff, nlen, voff, vlen) = self.record(i);
            (self.pack.read(noff, nlen) == name.as_bytes())
                .then(|| self.pack.read(voff, vlen))
        })
    }

    /// Remove and return the last item by rewinding both allocator ends.
    pub fn pop(&mut self) -> Option<(String, Vec<u8>)> {
        if self.count == 0 {
            return None;
        }
        let last = self.count - 1;
        let (noff, nlen, voff, vlen) = self.record(last);
        let name = String::from_utf8_lossy(self.pack.read(noff, nlen)).into_owned();
        let value = self.pack.read(voff, vlen).to_vec();

        self.count = last;
        let _ = self.pack.set_start_pos(last * ITEM_RECORD);
        if self.count == 0 {
            let _ = self.pack.set_end_pos(None);
        } else {
            let (pnoff, _, pvoff, _) = self.record(self.count - 1);
            let _ = self.pack.set_end_pos(Some(pnoff.min(pvoff)));
        }
        Some((name, value))
    }

    /// Visit items in insertion order; return `true` from the closure to
    /// stop early.
    pub fn iterate(&self, mut f: impl FnMut(&str, &[u8]) -> bool) {
        for i in 0..self.count {
            let (noff, nlen, voff, vlen) = self.record(i);
            let name = std::str::from_utf8(self.pack.read(noff, nlen)).unwrap_or("");
            if f(name, self.pack.read(voff, vlen)) {
                break;
            }
        }
    }

    #[must_use]
    pub fn data_size(&self) -> usize {
        self.pack.data_size()
    }
}

/// Node layout: eight little-endian u32 words.
const NODE_WORDS: usize = 8;
const NODE_SIZE: usize = NODE_WORDS * 4;
const NIL: u32 = u32::MAX;

pub struct DynamicArray {
    arena: SerialAllocator,
    head: Option<ArenaRef>,
    tail: Option<ArenaRef>,
    count: usize,
}

impl DynamicArray {
    #[must_use]
    pub fn new(arena: SerialAllocator) -> Self {
        Self {
            arena,
            head: None,
            tail: None,
            count: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn add(&mut self, name: &str, value: &[u8]) -> MemResult<()> {
        let name_ref = self.arena.alloc_bytes(name.as_bytes())?;
        let val_ref = self.arena.alloc_bytes(value)?;
        let node = self.arena.alloc(NODE_SIZE)?;

        let words: [u32; NODE_WORDS] = [
            NIL,
            NIL,
            name_ref.chunk,
            name_ref.offset,
            name.len() as u32,
            val_ref.chunk,
            val_ref.offset,
            value.len() as u32,
        ];
        let dst = self.arena.bytes_mut(node, NODE_SIZE);
        for (i, w) in words.iter().enumerate() {
            write_u32(&mut dst[i * 4..i * 4 + 4], *w);
        }

        if let Some(tail) = self.tail {
            let t = self.arena.bytes_mut(tail, 8);
            write_u32(&mut t[0..4], node.chunk);
            write_u32(&mut t[4..8], node.offset);
        } else {
            self.head = Some(node);
        }
        self.tail = Some(node);
        self.count += 1;
        Ok(())
    }

    fn node_words(&self, at: ArenaRef) -> [u32; NODE_WORDS] {
        let raw = self.arena.bytes(at, NODE_SIZE);
        let mut words = [0u32; NODE_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            *w = read_u32(&raw[i * 4..i * 4 + 4]);
        }
        words
    }

    #[must_use]
    pub fn search(&self, name: &str) -> Option<&[u8]> {
        let mut cur = self.head;
        while let Some(at) = cur {
            let w = self.node_words(at);
            let node_name = self
                .arena
                .bytes(ArenaRef::new(w[2], w[3]), w[4] as usize);
            if node_name == name.as_bytes() {
                return Some(self.arena.bytes(ArenaRef::new(w[5], w[6]), w[7] as usize));
            }
            cur = (w[0] != NIL || w[1] != NIL).then(|| ArenaRef::new(w[0], w[1]));
        }
        None
    }

    /// Visit items in insertion order; return `true` to stop early.
    pub fn iterate(&self, mut f: impl FnMut(&str, &[u8]) -> bool) {
        let mut cur = self.head;
        while let Some(at) = cur {
            let w = self.node_words(at);
            let name = self.arena.bytes(ArenaRef::new(w[2], w[3]), w[4] as usize);
            let value = self.arena.bytes(ArenaRef::new(w[5], w[6]), w[7] as usize);
            let name = std::str::from_utf8(name).unwrap_or("");
            if f(name, value) {
                break;
            }
            cur = (w[0] != NIL || w[1] != NIL).then(|| ArenaRef::new(w[0], w[1]));
        }
    }

    /// Rewind the arena; every item is dropped at once.
    pub fn clear(&mut self) {
        self.arena.reset();
        self.head = None;
        self.tail = None;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::BufferPools;
    use pretty_assertions::assert_eq;

    #[test]
    fn simple_array_add_search_pop() {
        let mut arr = SimpleArray::new(1024);
        arr.add("alpha", b"1").unwrap();
        arr.add("beta", b"2").unwrap();
        arr.add("gamma", b"3").unwrap();
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.search("beta"), Some(&b"2"[..]));
        assert_eq!(arr.search("delta"), None);

        let (name, value) = arr.pop().unwrap();
        assert_eq!(name, "gamma");
        assert_eq!(value, b"3");
        assert_eq!(arr.len(), 2);

        // Space freed by the pop is reusable.
        arr.add("delta", b"4").unwrap();
        assert_eq!(arr.search("delta"), Some(&b"4"[..]));
    }

    #[test]
    fn simple_array_pop_to_empty_restores_all_space() {
        let mut arr = SimpleArray::new(256);
        arr.add("k", b"v").unwrap();
        arr.pop().unwrap();
        assert_eq!(arr.data_size(), 0);
    }

    #[test]
    fn simple_array_full_is_clean() {
        let mut arr = SimpleArray::new(64);
        // Each add needs 16 record bytes plus payload; the second cannot fit.
        assert!(arr.add("aaaaaaaaaaaaaaaa", b"bbbbbbbbbbbbbbbb").is_ok());
        assert!(arr.add("cccccccccccccccc", b"dddddddddddddddd").is_err());
        assert_eq!(arr.len(), 1);
        assert_eq!(arr.search("cccccccccccccccc"), None);
        // The failed add rolled its record back.
        assert_eq!(arr.data_size(), 16 + 32);
    }

    #[test]
    fn simple_array_iterate_stops_early() {
        let mut arr = SimpleArray::new(1024);
        for name in ["a", "b", "c"] {
            arr.add(name, name.as_bytes()).unwrap();
        }
        let mut seen = Vec::new();
        arr.iterate(|name, _| {
            seen.push(name.to_string());
            name == "b"
        });
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn dynamic_array_grows_without_bound() {
        let arena = SerialAllocator::with_chunk_size(BufferPools::new(), 256).unwrap();
        let mut arr = DynamicArray::new(arena);
        for i in 0..100 {
            arr.add(&format!("key{}", i), format!("val{}", i).as_bytes())
                .unwrap();
        }
        assert_eq!(arr.len(), 100);
        assert_eq!(arr.search("key42"), Some(&b"val42"[..]));

        let mut order = Vec::new();
        arr.iterate(|name, _| {
            order.push(name.to_string());
            false
        });
        assert_eq!(order[0], "key0");
        assert_eq!(order[99], "key99");
    }
}
