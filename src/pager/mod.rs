//! An abstraction over the file as a sequence of fixed-size pages. The first
//! 1000 bytes of the file are a reserved metadata header; page 1 is always
//! the head of the on-disk free-page list. Freed pages are recorded there and
//! reused by later allocations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use crate::error::{BrambleError, Result};
use crate::io::{FileIo, StdFileIo};

pub mod freelist;
pub mod metadata;

use freelist::FreeListPage;
use metadata::{Metadata, MAX_CUSTOM_METADATA_SIZE, METADATA_SIZE};

/// Pages are addressed by a 1-based 32-bit id; 0 means "none".
pub type PageId = u32;

pub const MIN_PAGE_SIZE: u16 = 32;
pub const DEFAULT_PAGE_SIZE: u16 = 4096;

/// Page 1 is reserved as the first free-list page for the file's lifetime.
pub const FIRST_FREE_LIST_PAGE: PageId = 1;

pub struct Pager {
    io: Box<dyn FileIo>,
    page_size: u16,
    /// Free-list pages in chain order; index 0 is always page 1.
    free_list: Vec<FreeListPage>,
    /// Free page id -> position of the free-list page recording it.
    free_index: BTreeMap<PageId, usize>,
    /// Highest page id ever created, free or not.
    last_page_id: PageId,
    metadata: Metadata,
}

impl Pager {
    /// Creates or opens the paged file. On create the header and an empty
    /// free-list page are written; on open the recorded page size must match
    /// and the free-list chain is loaded.
    pub fn open(path: impl AsRef<Path>, page_size: u16) -> Result<Self> {
        let io = StdFileIo::open(path)?;
        Self::from_io(Box::new(io), page_size)
    }

    pub fn from_io(io: Box<dyn FileIo>, page_size: u16) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(BrambleError::InvalidConfig(format!(
                "page size must be at least {MIN_PAGE_SIZE}, got {page_size}"
            )));
        }

        let size = io.len()?;
        if size == 0 {
            return Self::create(io, page_size);
        }

        let mut header = vec![0u8; METADATA_SIZE];
        match io.read_at(0, &mut header) {
            Ok(()) => {}
            Err(BrambleError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(BrambleError::Corrupt("metadata header truncated".into()));
            }
            Err(err) => return Err(err),
        }
        let metadata = Metadata::decode(&header)?;
        if metadata.page_size != page_size {
            return Err(BrambleError::Incompatible(format!(
                "file was created with page size {}, but {page_size} was given",
                metadata.page_size
            )));
        }

        let last_page_id = ((size - METADATA_SIZE as u64) / page_size as u64) as PageId;
        let mut pager = Self {
            io,
            page_size,
            free_list: Vec::new(),
            free_index: BTreeMap::new(),
            last_page_id,
            metadata,
        };
        pager.load_free_list()?;
        debug!(
            page_size,
            pages = pager.last_page_id,
            free = pager.free_index.len(),
            "opened paged file"
        );
        Ok(pager)
    }

    fn create(io: Box<dyn FileIo>, page_size: u16) -> Result<Self> {
        let mut pager = Self {
            io,
            page_size,
            free_list: Vec::new(),
            free_index: BTreeMap::new(),
            last_page_id: 0,
            metadata: Metadata::new(page_size),
        };
        pager.write_metadata()?;

        let page_id = pager.allocate()?;
        debug_assert_eq!(page_id, FIRST_FREE_LIST_PAGE);
        let head = FreeListPage::new(page_id);
        pager.write_free_list_page(&head)?;
        pager.free_list.push(head);
        pager.flush()?;
        debug!(page_size, "created paged file");
        Ok(pager)
    }

    fn load_free_list(&mut self) -> Result<()> {
        let mut seen = BTreeSet::new();
        let mut page_id = FIRST_FREE_LIST_PAGE;
        while page_id != 0 {
            if !seen.insert(page_id) {
                return Err(BrambleError::Corrupt(format!(
                    "free-list chain revisits page {page_id}"
                )));
            }
            let data = self.read_page_raw(page_id)?;
            let page = FreeListPage::decode(page_id, &data)?;
            let position = self.free_list.len();
            for &id in &page.ids {
                self.free_index.insert(id, position);
            }
            page_id = page.next;
            self.free_list.push(page);
        }
        Ok(())
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    /// The first page id available to callers; everything before it belongs
    /// to the pager itself.
    pub fn first_page_id(&self) -> PageId {
        FIRST_FREE_LIST_PAGE + 1
    }

    /// Returns a page that is free for use: the smallest recorded free id if
    /// one exists, otherwise a fresh page appended at the end of the file.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some((&id, &position)) = self.free_index.iter().next() {
            self.free_list[position].ids.remove(&id);
            if let Err(err) = self.write_free_list_page_at(position) {
                self.free_list[position].ids.insert(id);
                return Err(err);
            }
            self.free_index.remove(&id);
            return Ok(id);
        }

        let id = self.last_page_id + 1;
        let zeroes = vec![0u8; self.page_size as usize];
        let offset = self.page_offset(id);
        self.io.write_at(offset, &zeroes)?;
        self.last_page_id = id;
        Ok(id)
    }

    /// Marks the page as free for reuse. The id is appended to the tail
    /// free-list page, growing the chain by one page when the tail is full.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        if id == 0 || id > self.last_page_id {
            return Err(BrambleError::NotAllocated(id));
        }
        if self.free_index.contains_key(&id) {
            return Err(BrambleError::AlreadyFree(id));
        }

        let tail = self.free_list.len() - 1;
        if self.free_list[tail].has_room(self.page_size) {
            self.free_list[tail].ids.insert(id);
            if let Err(err) = self.write_free_list_page_at(tail) {
                self.free_list[tail].ids.remove(&id);
                return Err(err);
            }
            self.free_index.insert(id, tail);
            return Ok(());
        }

        let new_page_id = self.allocate()?;
        let mut page = FreeListPage::new(new_page_id);
        page.ids.insert(id);
        self.write_free_list_page(&page)?;

        let tail = self.free_list.len() - 1;
        self.free_list[tail].next = new_page_id;
        if let Err(err) = self.write_free_list_page_at(tail) {
            self.free_list[tail].next = 0;
            return Err(err);
        }
        self.free_list.push(page);
        self.free_index.insert(id, self.free_list.len() - 1);
        Ok(())
    }

    pub fn read(&self, id: PageId) -> Result<Vec<u8>> {
        if id == 0 || id > self.last_page_id || self.free_index.contains_key(&id) {
            return Err(BrambleError::NotAllocated(id));
        }
        self.read_page_raw(id)
    }

    pub fn write(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if id == 0 || id > self.last_page_id || self.free_index.contains_key(&id) {
            return Err(BrambleError::NotAllocated(id));
        }
        if data.len() != self.page_size as usize {
            return Err(BrambleError::LengthMismatch {
                expected: self.page_size as usize,
                actual: data.len(),
            });
        }
        let offset = self.page_offset(id);
        self.io.write_at(offset, data)
    }

    pub fn read_custom_metadata(&self) -> Option<&[u8]> {
        self.metadata.custom.as_deref()
    }

    /// Persists up to 498 bytes of application payload in the reserved
    /// header. An empty payload clears the slot.
    pub fn write_custom_metadata(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > MAX_CUSTOM_METADATA_SIZE {
            return Err(BrambleError::InputTooLarge(format!(
                "custom metadata is {} bytes, the slot holds {MAX_CUSTOM_METADATA_SIZE}",
                data.len()
            )));
        }
        self.metadata.custom = if data.is_empty() {
            None
        } else {
            Some(data.to_vec())
        };
        self.write_metadata()
    }

    /// Truncates trailing free pages. Scanning from the end of the file, a
    /// page is dropped if it is free, or if it is a free-list page left with
    /// no recorded ids after the removals of the same scan. Surviving
    /// free-list pages affected by the scan are rewritten.
    pub fn compact(&mut self) -> Result<()> {
        let mut working = self.free_list.clone();
        let container_positions: HashMap<PageId, usize> = working
            .iter()
            .enumerate()
            .map(|(position, page)| (page.page_id, position))
            .collect();

        let mut removed_containers: BTreeSet<usize> = BTreeSet::new();
        let mut touched: BTreeSet<usize> = BTreeSet::new();
        let mut new_last = self.last_page_id;

        for page_id in (FIRST_FREE_LIST_PAGE + 1..=self.last_page_id).rev() {
            if let Some(&position) = self.free_index.get(&page_id) {
                working[position].ids.remove(&page_id);
                touched.insert(position);
                new_last = page_id - 1;
            } else if let Some(&position) = container_positions.get(&page_id) {
                if !working[position].ids.is_empty() {
                    break;
                }
                let mut previous = position - 1;
                while removed_containers.contains(&previous) {
                    previous -= 1;
                }
                let next = working[position].next;
                working[previous].next = next;
                touched.insert(previous);
                touched.remove(&position);
                removed_containers.insert(position);
                new_last = page_id - 1;
            } else {
                break;
            }
        }

        if new_last == self.last_page_id {
            return Ok(());
        }

        let reclaimed = self.last_page_id - new_last;
        self.io.truncate(
            METADATA_SIZE as u64 + new_last as u64 * self.page_size as u64,
        )?;
        for &position in &touched {
            if !removed_containers.contains(&position) {
                self.write_free_list_page(&working[position])?;
            }
        }

        self.free_list = working
            .into_iter()
            .enumerate()
            .filter(|(position, _)| !removed_containers.contains(position))
            .map(|(_, page)| page)
            .collect();
        self.free_index.clear();
        for (position, page) in self.free_list.iter().enumerate() {
            for &id in &page.ids {
                self.free_index.insert(id, position);
            }
        }
        self.last_page_id = new_last;
        debug!(reclaimed, pages = self.last_page_id, "compacted paged file");
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.io.sync_all()
    }

    pub fn close(mut self) -> Result<()> {
        self.io.sync_all()
    }

    fn page_offset(&self, id: PageId) -> u64 {
        METADATA_SIZE as u64 + (id as u64 - 1) * self.page_size as u64
    }

    fn read_page_raw(&self, id: PageId) -> Result<Vec<u8>> {
        let mut data = vec![0u8; self.page_size as usize];
        self.io.read_at(self.page_offset(id), &mut data)?;
        Ok(data)
    }

    fn write_free_list_page(&mut self, page: &FreeListPage) -> Result<()> {
        let data = page.encode(self.page_size);
        let offset = self.page_offset(page.page_id);
        self.io.write_at(offset, &data)
    }

    fn write_free_list_page_at(&mut self, position: usize) -> Result<()> {
        let data = self.free_list[position].encode(self.page_size);
        let offset = self.page_offset(self.free_list[position].page_id);
        self.io.write_at(offset, &data)
    }

    fn write_metadata(&mut self) -> Result<()> {
        let data = self.metadata.encode();
        self.io.write_at(0, &data)
    }

    #[cfg(test)]
    pub(crate) fn is_free(&self, id: PageId) -> bool {
        self.free_index.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn last_page_id(&self) -> PageId {
        self.last_page_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_pager(path: &Path, page_size: u16) -> Pager {
        Pager::open(path, page_size).expect("open pager")
    }

    fn file_size(path: &Path) -> u64 {
        std::fs::metadata(path).expect("stat").len()
    }

    #[test]
    fn new_file_initializes_header_and_free_list() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let pager = open_pager(&path, 32);
        assert_eq!(pager.last_page_id(), 1);
        drop(pager);
        assert_eq!(file_size(&path), METADATA_SIZE as u64 + 32);

        let reopened = open_pager(&path, 32);
        assert_eq!(reopened.last_page_id(), 1);
    }

    #[test]
    fn allocate_appends_pages_in_order() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        assert_eq!(pager.allocate().unwrap(), 2);
        assert_eq!(pager.allocate().unwrap(), 3);
        assert_eq!(pager.allocate().unwrap(), 4);
    }

    #[test]
    fn allocate_reuses_freed_pages_smallest_first() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        for _ in 0..4 {
            pager.allocate().unwrap();
        }
        pager.free(4).unwrap();
        pager.free(2).unwrap();
        assert_eq!(pager.allocate().unwrap(), 2);
        assert_eq!(pager.allocate().unwrap(), 4);
        assert_eq!(pager.allocate().unwrap(), 6);
    }

    #[test]
    fn free_list_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        {
            let mut pager = open_pager(&path, 32);
            for _ in 0..5 {
                pager.allocate().unwrap();
            }
            pager.free(3).unwrap();
            pager.free(5).unwrap();
            pager.close().unwrap();
        }
        let mut pager = open_pager(&path, 32);
        assert!(pager.is_free(3));
        assert!(pager.is_free(5));
        assert_eq!(pager.allocate().unwrap(), 3);
        assert_eq!(pager.allocate().unwrap(), 5);
    }

    #[test]
    fn free_list_grows_past_one_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let capacity = freelist::free_page_capacity(32) as u32;
        {
            let mut pager = open_pager(&path, 32);
            // enough pages to overflow the first free-list page when freed
            for _ in 0..capacity + 3 {
                pager.allocate().unwrap();
            }
            for id in 2..2 + capacity + 2 {
                pager.free(id).unwrap();
            }
            assert_eq!(pager.free_list.len(), 2);
            pager.close().unwrap();
        }
        let pager = open_pager(&path, 32);
        assert_eq!(pager.free_list.len(), 2);
        // page 2 was recycled as the second free-list page when the first
        // one filled up, so it is no longer free itself
        assert!(!pager.is_free(2));
        for id in 3..2 + capacity + 2 {
            assert!(pager.is_free(id), "page {id} should be free after reopen");
        }
    }

    #[test]
    fn free_after_allocate_round_trips() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        for _ in 0..8 {
            pager.allocate().unwrap();
        }
        for id in [4u32, 7, 2] {
            pager.free(id).unwrap();
        }
        // an allocation never hands out a page that is still marked free
        let id = pager.allocate().unwrap();
        assert!(!pager.is_free(id));
        pager.free(id).unwrap();
        assert!(pager.is_free(id));
    }

    #[test]
    fn double_free_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        pager.allocate().unwrap();
        pager.free(2).unwrap();
        assert!(matches!(pager.free(2), Err(BrambleError::AlreadyFree(2))));
    }

    #[test]
    fn read_and_write_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        {
            let mut pager = open_pager(&path, 32);
            let id = pager.allocate().unwrap();
            pager.write(id, &[7u8; 32]).unwrap();
            pager.close().unwrap();
        }
        let pager = open_pager(&path, 32);
        assert_eq!(pager.read(2).unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn read_of_free_or_missing_page_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        let id = pager.allocate().unwrap();
        pager.free(id).unwrap();
        assert!(matches!(
            pager.read(id),
            Err(BrambleError::NotAllocated(_))
        ));
        assert!(matches!(
            pager.read(99),
            Err(BrambleError::NotAllocated(99))
        ));
        assert!(matches!(pager.read(0), Err(BrambleError::NotAllocated(0))));
    }

    #[test]
    fn write_to_free_page_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        let id = pager.allocate().unwrap();
        pager.free(id).unwrap();
        assert!(matches!(
            pager.write(id, &[0u8; 32]),
            Err(BrambleError::NotAllocated(_))
        ));
    }

    #[test]
    fn write_with_wrong_length_fails() {
        let dir = tempdir().unwrap();
        let mut pager = open_pager(&dir.path().join("pager.data"), 32);
        let id = pager.allocate().unwrap();
        assert!(matches!(
            pager.write(id, &[0u8; 31]),
            Err(BrambleError::LengthMismatch {
                expected: 32,
                actual: 31
            })
        ));
    }

    #[test]
    fn reopen_with_different_page_size_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        open_pager(&path, 32).close().unwrap();
        assert!(matches!(
            Pager::open(&path, 64),
            Err(BrambleError::Incompatible(_))
        ));
    }

    #[test]
    fn tiny_page_size_is_rejected() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Pager::open(dir.path().join("pager.data"), 16),
            Err(BrambleError::InvalidConfig(_))
        ));
    }

    #[test]
    fn custom_metadata_roundtrip_and_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        {
            let mut pager = open_pager(&path, 32);
            assert_eq!(pager.read_custom_metadata(), None);
            pager.write_custom_metadata(b"tree state").unwrap();
            assert_eq!(pager.read_custom_metadata(), Some(&b"tree state"[..]));
            assert!(matches!(
                pager.write_custom_metadata(&[0u8; MAX_CUSTOM_METADATA_SIZE + 1]),
                Err(BrambleError::InputTooLarge(_))
            ));
            pager.close().unwrap();
        }
        let mut pager = open_pager(&path, 32);
        assert_eq!(pager.read_custom_metadata(), Some(&b"tree state"[..]));
        pager.write_custom_metadata(&[]).unwrap();
        assert_eq!(pager.read_custom_metadata(), None);
    }

    #[test]
    fn compact_truncates_trailing_free_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let mut pager = open_pager(&path, 32);
        for _ in 0..6 {
            pager.allocate().unwrap();
        }
        pager.write(2, &[9u8; 32]).unwrap();
        pager.write(3, &[8u8; 32]).unwrap();
        for id in 4..=7 {
            pager.free(id).unwrap();
        }
        pager.compact().unwrap();
        assert_eq!(pager.last_page_id(), 3);
        assert_eq!(pager.read(2).unwrap(), vec![9u8; 32]);
        assert_eq!(pager.read(3).unwrap(), vec![8u8; 32]);
        pager.close().unwrap();
        assert_eq!(file_size(&path), METADATA_SIZE as u64 + 3 * 32);
    }

    #[test]
    fn compact_keeps_free_pages_below_live_ones() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let mut pager = open_pager(&path, 32);
        for _ in 0..4 {
            pager.allocate().unwrap();
        }
        pager.free(3).unwrap();
        pager.write(5, &[1u8; 32]).unwrap();
        pager.compact().unwrap();
        // page 5 is live, so the hole at page 3 must survive
        assert_eq!(pager.last_page_id(), 5);
        assert!(pager.is_free(3));
        assert_eq!(pager.allocate().unwrap(), 3);
    }

    #[test]
    fn compact_drops_emptied_free_list_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let capacity = freelist::free_page_capacity(32) as u32;
        {
            let mut pager = open_pager(&path, 32);
            for _ in 0..capacity + 2 {
                pager.allocate().unwrap();
            }
            // freeing every data page forces a second free-list page
            for id in 2..=capacity + 3 {
                pager.free(id).unwrap();
            }
            assert_eq!(pager.free_list.len(), 2);
            pager.compact().unwrap();
            assert_eq!(pager.last_page_id(), FIRST_FREE_LIST_PAGE);
            assert_eq!(pager.free_list.len(), 1);
            pager.close().unwrap();
        }
        assert_eq!(file_size(&path), METADATA_SIZE as u64 + 32);
        // the compacted file reopens cleanly and allocates fresh pages
        let mut pager = open_pager(&path, 32);
        assert_eq!(pager.allocate().unwrap(), 2);
    }

    #[test]
    fn compact_without_trailing_free_pages_is_a_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.data");
        let mut pager = open_pager(&path, 32);
        for _ in 0..3 {
            pager.allocate().unwrap();
        }
        pager.write(4, &[3u8; 32]).unwrap();
        pager.compact().unwrap();
        assert_eq!(pager.last_page_id(), 4);
        pager.close().unwrap();
        assert_eq!(file_size(&path), METADATA_SIZE as u64 + 4 * 32);
    }
}
