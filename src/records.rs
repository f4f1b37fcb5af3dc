//! Variable-length records stored as singly linked chains of pages. A record
//! is identified by the id of its head page. The head page carries the next
//! page id, the total record length, and the first payload slice;
//! continuation pages carry the next page id and further payload.

use crate::codec::read_u32;
use crate::error::{BrambleError, Result};
use crate::pager::{PageId, Pager};

/// A record id is the page id of the record's head page.
pub type RecordId = u32;

pub const MAX_RECORD_SIZE: u64 = u32::MAX as u64;

/// Head page: next id (4 bytes + 4 reserved), record length (4 bytes + 4
/// reserved), then payload.
const HEAD_HEADER_SIZE: usize = 16;
/// Continuation page: next id (4 bytes + 4 reserved), then payload.
const CONT_HEADER_SIZE: usize = 8;

const RECORD_LEN_OFFSET: usize = 8;

pub struct Records {
    pager: Pager,
}

impl Records {
    pub fn new(pager: Pager) -> Self {
        Self { pager }
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut Pager {
        &mut self.pager
    }

    /// The id of the first record a caller can rely on, whether or not it
    /// has been created yet; a stable anchor for bootstrap data.
    pub fn first_record_id(&self) -> RecordId {
        self.pager.first_page_id()
    }

    /// Allocates a new empty record and returns its id. The head page is
    /// zeroed so a recycled page does not masquerade as an existing chain.
    pub fn create(&mut self) -> Result<RecordId> {
        let id = self.pager.allocate()?;
        let zeroes = vec![0u8; self.pager.page_size() as usize];
        self.pager.write(id, &zeroes)?;
        Ok(id)
    }

    /// Rewrites the record to hold exactly `data`, reusing the existing page
    /// chain: pages are appended when the payload outgrows the chain and
    /// freed when it shrinks.
    pub fn write(&mut self, id: RecordId, data: &[u8]) -> Result<()> {
        if data.len() as u64 > MAX_RECORD_SIZE {
            return Err(BrambleError::InputTooLarge(format!(
                "record is {} bytes, the maximum is {MAX_RECORD_SIZE}",
                data.len()
            )));
        }
        let page_size = self.pager.page_size() as usize;
        let head_capacity = page_size - HEAD_HEADER_SIZE;
        let cont_capacity = page_size - CONT_HEADER_SIZE;

        let mut page = self.pager.read(id)?;
        let mut next_id = next_record_id(&page)?;

        // once the remaining payload fits, the rest of the old chain is freed
        let mut freeing = data.len() <= head_capacity;
        let head_slice = data.len().min(head_capacity);
        if freeing {
            clear_next_record_id(&mut page);
        }
        set_record_len(&mut page, data.len() as u32);
        page[HEAD_HEADER_SIZE..HEAD_HEADER_SIZE + head_slice].copy_from_slice(&data[..head_slice]);
        let mut written = head_slice;

        let mut new_page_id = 0;
        if next_id == 0 && written < data.len() {
            new_page_id = self.pager.allocate()?;
            set_next_record_id(&mut page, new_page_id);
        }
        self.pager.write(id, &page)?;

        while next_id != 0 {
            let page_id = next_id;
            let mut page = self.pager.read(page_id)?;
            next_id = next_record_id(&page)?;

            if freeing {
                self.pager.free(page_id)?;
                continue;
            }

            if written < data.len() {
                let slice = (data.len() - written).min(cont_capacity);
                page[CONT_HEADER_SIZE..CONT_HEADER_SIZE + slice]
                    .copy_from_slice(&data[written..written + slice]);
                written += slice;
            }

            freeing = written >= data.len();
            if freeing {
                clear_next_record_id(&mut page);
            }
            if next_id == 0 && written < data.len() {
                new_page_id = self.pager.allocate()?;
                set_next_record_id(&mut page, new_page_id);
            }
            self.pager.write(page_id, &page)?;
        }

        while written < data.len() {
            let page_id = new_page_id;
            let mut page = vec![0u8; page_size];

            let slice = (data.len() - written).min(cont_capacity);
            page[CONT_HEADER_SIZE..CONT_HEADER_SIZE + slice]
                .copy_from_slice(&data[written..written + slice]);
            written += slice;

            if written < data.len() {
                new_page_id = self.pager.allocate()?;
                set_next_record_id(&mut page, new_page_id);
            }
            self.pager.write(page_id, &page)?;
        }

        Ok(())
    }

    /// Reads the whole record: exactly the length recorded in the head page.
    pub fn read(&self, id: RecordId) -> Result<Vec<u8>> {
        let page_size = self.pager.page_size() as usize;
        let head_capacity = page_size - HEAD_HEADER_SIZE;
        let cont_capacity = page_size - CONT_HEADER_SIZE;

        let page = self.pager.read(id)?;
        let length = record_len(&page)? as usize;
        let mut data = vec![0u8; length];

        let head_slice = length.min(head_capacity);
        data[..head_slice].copy_from_slice(&page[HEAD_HEADER_SIZE..HEAD_HEADER_SIZE + head_slice]);
        let mut written = head_slice;
        let mut next_id = next_record_id(&page)?;

        while next_id != 0 {
            let page = self.pager.read(next_id)?;
            let slice = (length - written).min(cont_capacity);
            data[written..written + slice]
                .copy_from_slice(&page[CONT_HEADER_SIZE..CONT_HEADER_SIZE + slice]);
            written += slice;
            next_id = next_record_id(&page)?;
        }

        Ok(data)
    }

    /// Frees every page of the record's chain.
    pub fn free(&mut self, id: RecordId) -> Result<()> {
        let mut next_id = id;
        while next_id != 0 {
            let page_id = next_id;
            let page = self.pager.read(page_id)?;
            next_id = next_record_id(&page)?;
            self.pager.free(page_id)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.pager.flush()
    }

    pub fn close(self) -> Result<()> {
        self.pager.close()
    }
}

fn next_record_id(page: &[u8]) -> Result<PageId> {
    read_u32(page, 0)
}

fn set_next_record_id(page: &mut [u8], next_id: PageId) {
    page[0..4].copy_from_slice(&next_id.to_be_bytes());
    page[4..CONT_HEADER_SIZE].fill(0);
}

fn clear_next_record_id(page: &mut [u8]) {
    page[0..CONT_HEADER_SIZE].fill(0);
}

fn record_len(page: &[u8]) -> Result<u32> {
    read_u32(page, RECORD_LEN_OFFSET)
}

fn set_record_len(page: &mut [u8], length: u32) {
    page[RECORD_LEN_OFFSET..RECORD_LEN_OFFSET + 4].copy_from_slice(&length.to_be_bytes());
    page[RECORD_LEN_OFFSET + 4..HEAD_HEADER_SIZE].fill(0);
}
