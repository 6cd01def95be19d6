//! Slotted heap page.
//!
//! A page is the fixed 8192-byte unit of I/O and caching. On disk it is laid
//! out little-endian as a 36-byte header, a slot directory growing up from
//! `free_start`, and tuple payloads growing down from `free_end`:
//!
//! ```text
//! +-------------------------------+ 0
//! | header (36 bytes)             |
//! +-------------------------------+ 36
//! | slot directory (4 bytes/slot) |
//! +-------------------------------+ free_start
//! |          free space           |
//! +-------------------------------+ free_end
//! | tuple payloads                |
//! +-------------------------------+ 8192
//! ```
//!
//! Header fields: `page_id: u32`, `lsn: u64`, `checksum: u32`, `flags: u16`,
//! `slot_count: u16`, `free_start: u16`, `free_end: u16`, 12 reserved bytes.
//! The CRC32 (IEEE) covers the full page image with the checksum field
//! zeroed. A slot with `length == 0` is dead; its tuple bytes are garbage
//! until [`Page::compact`] rewrites the live tuples.

use crc32fast::Hasher;

use crate::common::{Lsn, PageId, SlotId, PAGE_SIZE};
use crate::error::{DbError, Result};

/// Byte size of the fixed page header.
pub const PAGE_HEADER_SIZE: usize = 36;

/// Byte size of one slot directory entry.
pub const SLOT_SIZE: usize = 4;

/// Largest tuple a fresh page can hold (one slot entry accounted for).
pub const MAX_TUPLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE;

const CHECKSUM_OFFSET: usize = 12;

/// One slot directory entry locating a tuple within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Byte offset of the tuple from the start of the page.
    pub offset: u16,
    /// Tuple length in bytes; `0` marks a dead slot.
    pub length: u16,
}

impl Slot {
    pub fn is_dead(&self) -> bool {
        self.length == 0
    }
}

/// An in-memory slotted page.
///
/// The struct keeps the header fields parsed out and the tuple area as a
/// full-size byte buffer; [`Page::serialize`] produces the byte-exact
/// on-disk image and [`Page::deserialize`] reverses it.
#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: PageId,
    /// LSN of the last WAL record applied to this page.
    pub lsn: Lsn,
    pub flags: u16,
    slots: Vec<Slot>,
    free_end: u16,
    data: Vec<u8>,
    dirty: bool,
}

impl Page {
    /// Creates an empty page.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            lsn: 0,
            flags: 0,
            slots: Vec::new(),
            free_end: PAGE_SIZE as u16,
            data: vec![0u8; PAGE_SIZE],
            dirty: false,
        }
    }

    /// First byte past the slot directory.
    pub fn free_start(&self) -> u16 {
        (PAGE_HEADER_SIZE + self.slots.len() * SLOT_SIZE) as u16
    }

    /// Last byte of the free gap (exclusive); tuples start here.
    pub fn free_end(&self) -> u16 {
        self.free_end
    }

    /// Contiguous free bytes between the slot directory and the tuple area.
    pub fn free_space(&self) -> usize {
        self.free_end as usize - self.free_start() as usize
    }

    /// Bytes in the tuple area occupied by dead slots and shrink holes,
    /// recoverable by [`Page::compact`].
    pub fn reclaimable_space(&self) -> usize {
        let used: usize = self
            .slots
            .iter()
            .filter(|s| !s.is_dead())
            .map(|s| s.length as usize)
            .sum();
        (PAGE_SIZE - self.free_end as usize) - used
    }

    pub fn slot_count(&self) -> u16 {
        self.slots.len() as u16
    }

    pub fn slot(&self, slot: SlotId) -> Option<Slot> {
        self.slots.get(slot as usize).copied()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Whether a tuple of `tuple_size` bytes fits, counting its slot entry.
    pub fn can_fit(&self, tuple_size: usize) -> bool {
        self.free_space() >= tuple_size + SLOT_SIZE
    }

    /// Inserts a tuple, allocating downward from `free_end`, and returns the
    /// new slot number.
    pub fn insert_tuple(&mut self, tuple: &[u8]) -> Result<SlotId> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return Err(DbError::TupleTooLarge {
                size: tuple.len(),
                max: MAX_TUPLE_SIZE,
            });
        }
        if !self.can_fit(tuple.len()) {
            return Err(DbError::NoSpace {
                page_id: self.page_id,
                needed: tuple.len() + SLOT_SIZE,
                free: self.free_space(),
            });
        }

        let offset = self.free_end as usize - tuple.len();
        self.data[offset..offset + tuple.len()].copy_from_slice(tuple);
        self.free_end = offset as u16;
        self.slots.push(Slot {
            offset: offset as u16,
            length: tuple.len() as u16,
        });
        self.dirty = true;
        Ok((self.slots.len() - 1) as SlotId)
    }

    /// Returns the tuple bytes stored in `slot`.
    pub fn get_tuple(&self, slot: SlotId) -> Result<&[u8]> {
        let entry = self.checked_slot(slot)?;
        if entry.is_dead() {
            return Err(DbError::SlotDead {
                page_id: self.page_id,
                slot,
            });
        }
        let start = entry.offset as usize;
        Ok(&self.data[start..start + entry.length as usize])
    }

    /// Overwrites the tuple in `slot` in place.
    ///
    /// The replacement must not be longer than the current tuple; callers
    /// handle `TooLargeForInPlace` by relocating (delete + insert).
    pub fn update_tuple(&mut self, slot: SlotId, tuple: &[u8]) -> Result<()> {
        let entry = self.checked_slot(slot)?;
        if entry.is_dead() {
            return Err(DbError::SlotDead {
                page_id: self.page_id,
                slot,
            });
        }
        if tuple.len() > entry.length as usize {
            return Err(DbError::TooLargeForInPlace {
                page_id: self.page_id,
                slot,
                old: entry.length as usize,
                new: tuple.len(),
            });
        }

        let start = entry.offset as usize;
        self.data[start..start + tuple.len()].copy_from_slice(tuple);
        self.slots[slot as usize].length = tuple.len() as u16;
        self.dirty = true;
        Ok(())
    }

    /// Marks a slot dead. The slot number stays allocated so tuple IDs
    /// pointing at other slots remain stable.
    pub fn delete_tuple(&mut self, slot: SlotId) -> Result<()> {
        let entry = self.checked_slot(slot)?;
        if entry.is_dead() {
            return Err(DbError::SlotDead {
                page_id: self.page_id,
                slot,
            });
        }
        self.slots[slot as usize].length = 0;
        self.dirty = true;
        Ok(())
    }

    /// Re-materializes a tuple at a specific slot number. Recovery and undo
    /// use this to put a tuple back exactly where a WAL record says it was:
    /// a dead slot is revived, and slot numbers past the current directory
    /// are created (as dead padding) up to the target.
    pub fn restore_tuple(&mut self, slot: SlotId, tuple: &[u8]) -> Result<()> {
        if tuple.len() > MAX_TUPLE_SIZE {
            return Err(DbError::TupleTooLarge {
                size: tuple.len(),
                max: MAX_TUPLE_SIZE,
            });
        }

        while (self.slots.len() as u16) < slot {
            if self.free_space() < SLOT_SIZE {
                return Err(DbError::NoSpace {
                    page_id: self.page_id,
                    needed: SLOT_SIZE,
                    free: self.free_space(),
                });
            }
            self.slots.push(Slot {
                offset: 0,
                length: 0,
            });
        }

        let new_slot = slot as usize == self.slots.len();
        if !new_slot && !self.slots[slot as usize].is_dead() {
            return Err(DbError::Internal(format!(
                "restore into live slot {} on page {}",
                slot, self.page_id
            )));
        }

        let needed = tuple.len() + if new_slot { SLOT_SIZE } else { 0 };
        if self.free_space() < needed {
            self.compact();
        }
        if self.free_space() < needed {
            return Err(DbError::NoSpace {
                page_id: self.page_id,
                needed,
                free: self.free_space(),
            });
        }

        let offset = self.free_end as usize - tuple.len();
        self.data[offset..offset + tuple.len()].copy_from_slice(tuple);
        self.free_end = offset as u16;
        let entry = Slot {
            offset: offset as u16,
            length: tuple.len() as u16,
        };
        if new_slot {
            self.slots.push(entry);
        } else {
            self.slots[slot as usize] = entry;
        }
        self.dirty = true;
        Ok(())
    }

    /// Replaces the tuple in a slot with an image of any size that fits the
    /// page, relocating within the page if it grew. Redo of updates uses
    /// this; the normal write path sticks to [`Page::update_tuple`].
    pub fn replace_tuple(&mut self, slot: SlotId, tuple: &[u8]) -> Result<()> {
        let entry = self.checked_slot(slot)?;
        if !entry.is_dead() && tuple.len() <= entry.length as usize {
            return self.update_tuple(slot, tuple);
        }
        if !entry.is_dead() {
            self.slots[slot as usize].length = 0;
        }
        self.restore_tuple(slot, tuple)
    }

    /// Rewrites live tuples back-to-back at the end of the page, reclaiming
    /// holes left by deletes and shrinking updates. Slot numbers and their
    /// tuple contents are preserved; only offsets move.
    pub fn compact(&mut self) {
        let live: Vec<(usize, Vec<u8>)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_dead())
            .map(|(i, s)| {
                let start = s.offset as usize;
                (i, self.data[start..start + s.length as usize].to_vec())
            })
            .collect();

        let mut cursor = PAGE_SIZE;
        for (i, bytes) in live {
            cursor -= bytes.len();
            self.data[cursor..cursor + bytes.len()].copy_from_slice(&bytes);
            self.slots[i].offset = cursor as u16;
        }
        self.free_end = cursor as u16;
        self.dirty = true;
    }

    /// Produces the 8192-byte on-disk image with a valid checksum.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.data.clone();

        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.lsn.to_le_bytes());
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&0u32.to_le_bytes());
        buf[16..18].copy_from_slice(&self.flags.to_le_bytes());
        buf[18..20].copy_from_slice(&(self.slots.len() as u16).to_le_bytes());
        buf[20..22].copy_from_slice(&self.free_start().to_le_bytes());
        buf[22..24].copy_from_slice(&self.free_end.to_le_bytes());
        buf[24..PAGE_HEADER_SIZE].fill(0);

        let mut pos = PAGE_HEADER_SIZE;
        for slot in &self.slots {
            buf[pos..pos + 2].copy_from_slice(&slot.offset.to_le_bytes());
            buf[pos + 2..pos + 4].copy_from_slice(&slot.length.to_le_bytes());
            pos += SLOT_SIZE;
        }

        let checksum = compute_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parses an on-disk image. The checksum is *not* verified here;
    /// callers decide (the heap file verifies on every read from disk).
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(DbError::corruption(format!(
                "page image is {} bytes, expected {}",
                bytes.len(),
                PAGE_SIZE
            )));
        }

        let page_id = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let lsn = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let flags = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
        let slot_count = u16::from_le_bytes(bytes[18..20].try_into().unwrap());
        let free_start = u16::from_le_bytes(bytes[20..22].try_into().unwrap());
        let free_end = u16::from_le_bytes(bytes[22..24].try_into().unwrap());

        let expected_start = PAGE_HEADER_SIZE + slot_count as usize * SLOT_SIZE;
        if free_start as usize != expected_start
            || free_start > free_end
            || free_end as usize > PAGE_SIZE
        {
            return Err(DbError::corruption(format!(
                "page {} header inconsistent: slots={} free_start={} free_end={}",
                page_id, slot_count, free_start, free_end
            )));
        }

        let mut slots = Vec::with_capacity(slot_count as usize);
        let mut pos = PAGE_HEADER_SIZE;
        for i in 0..slot_count {
            let offset = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap());
            let length = u16::from_le_bytes(bytes[pos + 2..pos + 4].try_into().unwrap());
            if length > 0
                && ((offset < free_end) || (offset as usize + length as usize) > PAGE_SIZE)
            {
                return Err(DbError::corruption(format!(
                    "page {} slot {} range [{}, {}) outside tuple area",
                    page_id,
                    i,
                    offset,
                    offset as u32 + length as u32
                )));
            }
            slots.push(Slot { offset, length });
            pos += SLOT_SIZE;
        }

        Ok(Self {
            page_id,
            lsn,
            flags,
            slots,
            free_end,
            data: bytes.to_vec(),
            dirty: false,
        })
    }

    fn checked_slot(&self, slot: SlotId) -> Result<Slot> {
        self.slots
            .get(slot as usize)
            .copied()
            .ok_or(DbError::InvalidSlot {
                page_id: self.page_id,
                slot,
                slot_count: self.slots.len() as u16,
            })
    }
}

/// CRC32 (IEEE) over a page image with the checksum field zeroed.
pub fn compute_checksum(image: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&image[..CHECKSUM_OFFSET]);
    hasher.update(&0u32.to_le_bytes());
    hasher.update(&image[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Verifies the stored checksum of a page image.
pub fn verify_checksum(image: &[u8]) -> bool {
    if image.len() != PAGE_SIZE {
        return false;
    }
    let stored = u32::from_le_bytes(image[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].try_into().unwrap());
    stored == compute_checksum(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut page = Page::new(0);
        let s0 = page.insert_tuple(b"hello").unwrap();
        let s1 = page.insert_tuple(b"world!").unwrap();
        assert_eq!(s0, 0);
        assert_eq!(s1, 1);
        assert_eq!(page.get_tuple(0).unwrap(), b"hello");
        assert_eq!(page.get_tuple(1).unwrap(), b"world!");
        assert!(page.is_dirty());
    }

    #[test]
    fn test_invalid_and_dead_slots() {
        let mut page = Page::new(0);
        page.insert_tuple(b"abc").unwrap();

        assert!(matches!(
            page.get_tuple(5),
            Err(DbError::InvalidSlot { slot: 5, .. })
        ));

        page.delete_tuple(0).unwrap();
        assert!(matches!(page.get_tuple(0), Err(DbError::SlotDead { .. })));
        assert!(matches!(page.delete_tuple(0), Err(DbError::SlotDead { .. })));
    }

    #[test]
    fn test_tuple_too_large() {
        let mut page = Page::new(0);
        let huge = vec![0u8; MAX_TUPLE_SIZE + 1];
        assert!(matches!(
            page.insert_tuple(&huge),
            Err(DbError::TupleTooLarge { .. })
        ));
        // Exactly max fits in an empty page.
        let max = vec![7u8; MAX_TUPLE_SIZE];
        page.insert_tuple(&max).unwrap();
        assert_eq!(page.free_space(), 0);
    }

    #[test]
    fn test_no_space_then_compact_recovers() {
        let mut page = Page::new(0);
        let tuple = vec![1u8; 1000];
        let mut slots = Vec::new();
        loop {
            match page.insert_tuple(&tuple) {
                Ok(s) => slots.push(s),
                Err(DbError::NoSpace { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(slots.len(), 8);

        // Free two tuples; the gap is fragmented until compaction.
        page.delete_tuple(slots[0]).unwrap();
        page.delete_tuple(slots[2]).unwrap();
        assert!(page.reclaimable_space() >= 2000);

        page.compact();
        assert!(page.can_fit(1000));
        let s = page.insert_tuple(&tuple).unwrap();
        assert_eq!(page.get_tuple(s).unwrap(), &tuple[..]);
        // Survivors keep their slot numbers and contents.
        assert_eq!(page.get_tuple(slots[1]).unwrap(), &tuple[..]);
    }

    #[test]
    fn test_update_in_place_and_shrink() {
        let mut page = Page::new(0);
        let slot = page.insert_tuple(b"abcdef").unwrap();

        page.update_tuple(slot, b"xyz").unwrap();
        assert_eq!(page.get_tuple(slot).unwrap(), b"xyz");

        assert!(matches!(
            page.update_tuple(slot, b"too long now"),
            Err(DbError::TooLargeForInPlace { .. })
        ));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut page = Page::new(42);
        page.lsn = 99;
        page.insert_tuple(b"first").unwrap();
        page.insert_tuple(b"second").unwrap();
        page.delete_tuple(0).unwrap();

        let image = page.serialize();
        assert_eq!(image.len(), PAGE_SIZE);
        assert!(verify_checksum(&image));

        let restored = Page::deserialize(&image).unwrap();
        assert_eq!(restored.page_id, 42);
        assert_eq!(restored.lsn, 99);
        assert_eq!(restored.slot_count(), 2);
        assert_eq!(restored.get_tuple(1).unwrap(), b"second");
        assert!(matches!(restored.get_tuple(0), Err(DbError::SlotDead { .. })));
        assert_eq!(restored.free_end(), page.free_end());
    }

    #[test]
    fn test_checksum_detects_flipped_byte() {
        let mut page = Page::new(1);
        page.insert_tuple(b"payload").unwrap();
        let mut image = page.serialize();
        assert!(verify_checksum(&image));

        // Flip one payload byte.
        image[PAGE_SIZE - 3] ^= 0xFF;
        assert!(!verify_checksum(&image));

        // Flip a header byte outside the checksum field.
        image[PAGE_SIZE - 3] ^= 0xFF;
        image[17] ^= 0x01;
        assert!(!verify_checksum(&image));
    }

    #[test]
    fn test_deserialize_rejects_bad_header() {
        let page = Page::new(3);
        let mut image = page.serialize();
        // Claim a slot directory that does not match free_start.
        image[18..20].copy_from_slice(&100u16.to_le_bytes());
        assert!(matches!(
            Page::deserialize(&image),
            Err(DbError::Corruption(_))
        ));
    }

    #[test]
    fn test_restore_tuple_revives_and_pads() {
        let mut page = Page::new(0);
        let s = page.insert_tuple(b"victim").unwrap();
        page.delete_tuple(s).unwrap();

        page.restore_tuple(s, b"victim").unwrap();
        assert_eq!(page.get_tuple(s).unwrap(), b"victim");

        // Restoring at a slot beyond the directory pads with dead slots.
        page.restore_tuple(4, b"far").unwrap();
        assert_eq!(page.slot_count(), 5);
        assert_eq!(page.get_tuple(4).unwrap(), b"far");
        assert!(matches!(page.get_tuple(2), Err(DbError::SlotDead { .. })));

        // Restoring into a live slot is refused.
        assert!(matches!(
            page.restore_tuple(s, b"again"),
            Err(DbError::Internal(_))
        ));
    }

    #[test]
    fn test_replace_tuple_grows_within_page() {
        let mut page = Page::new(0);
        let s = page.insert_tuple(b"tiny").unwrap();
        page.insert_tuple(b"neighbor").unwrap();

        page.replace_tuple(s, b"a considerably longer image").unwrap();
        assert_eq!(page.get_tuple(s).unwrap(), b"a considerably longer image");
        assert_eq!(page.get_tuple(1).unwrap(), b"neighbor");
    }

    #[test]
    fn test_free_start_tracks_slots() {
        let mut page = Page::new(0);
        assert_eq!(page.free_start() as usize, PAGE_HEADER_SIZE);
        page.insert_tuple(b"a").unwrap();
        page.insert_tuple(b"b").unwrap();
        assert_eq!(
            page.free_start() as usize,
            PAGE_HEADER_SIZE + 2 * SLOT_SIZE
        );
        assert!(page.free_start() <= page.free_end());
    }
}
