//! Mapping arbitrary addresses to the pages that own them
//!
//! Regions are whole page reservations, kept in an ordered map by
//! base address. A small direct-mapped cache remembers page-sized
//! chunks of the address space known to hold no region at all, so
//! that the common case of a non-pointer word found while scanning
//! is rejected without touching the map.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ptr::NonNull;

use super::address::{Address, BLINK_PAGE_SIZE_LOG2};
use super::header::ObjectHeader;
use super::lob::LargeObjectPage;
use super::page::NormalPage;

/// Entries in the negative cache
pub const NEGATIVE_CACHE_SIZE: usize = 1024;

/// A non-owning reference to a page registered with the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRef {
    Normal(NonNull<NormalPage>),
    Large(NonNull<LargeObjectPage>),
}

impl PageRef {
    pub fn normal(page: &NormalPage) -> Self {
        PageRef::Normal(NonNull::from(page))
    }

    pub fn large(page: &LargeObjectPage) -> Self {
        PageRef::Large(NonNull::from(page))
    }

    /// The allocated object containing `address`, if any
    ///
    /// # Safety
    ///
    /// The page must still be registered, i.e. not yet released.
    pub unsafe fn find_header<'a>(&self, address: Address) -> Option<&'a mut ObjectHeader> {
        match self {
            PageRef::Normal(page) => page.as_ref().find_header_from_address(address),
            PageRef::Large(page) => {
                let page = page.as_ref();
                if page.contains(address) && !page.object_header().is_dead() {
                    Some(page.object_header())
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    end: Address,
    page: PageRef,
}

/// Direct-mapped cache of chunks known to be outside every region
///
/// Only ever answers "definitely not managed". A miss proves nothing.
pub struct NegativeCache {
    /// Chunk number plus one, zero when empty
    entries: Box<[Cell<usize>]>,
}

impl Default for NegativeCache {
    fn default() -> Self {
        NegativeCache::new()
    }
}

impl NegativeCache {
    pub fn new() -> Self {
        NegativeCache {
            entries: (0..NEGATIVE_CACHE_SIZE).map(|_| Cell::new(0)).collect(),
        }
    }

    fn chunk(address: Address) -> usize {
        address.as_usize() >> BLINK_PAGE_SIZE_LOG2
    }

    fn slot(chunk: usize) -> usize {
        chunk & (NEGATIVE_CACHE_SIZE - 1)
    }

    pub fn contains(&self, address: Address) -> bool {
        let chunk = Self::chunk(address);
        self.entries[Self::slot(chunk)].get() == chunk + 1
    }

    pub fn insert(&self, address: Address) {
        let chunk = Self::chunk(address);
        self.entries[Self::slot(chunk)].set(chunk + 1);
    }

    pub fn flush(&self) {
        for entry in self.entries.iter() {
            entry.set(0);
        }
    }
}

#[derive(Default)]
pub struct AddressClassifier {
    regions: BTreeMap<Address, Region>,
    negative_cache: NegativeCache,
}

impl AddressClassifier {
    pub fn new() -> Self {
        AddressClassifier::default()
    }

    /// Register the reservation `[base, end)` as belonging to `page`
    pub fn add_region(&mut self, base: Address, end: Address, page: PageRef) {
        debug_assert!(self.region_containing(base).is_none());
        self.regions.insert(base, Region { end, page });
        // Chunks overlapping the new region may be cached as empty
        self.negative_cache.flush();
        log::trace!("region {:?}..{:?} added", base, end);
    }

    pub fn remove_region(&mut self, base: Address) {
        if self.regions.remove(&base).is_none() {
            log::warn!("removing unknown region at {:?}", base);
        }
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    fn region_containing(&self, address: Address) -> Option<&Region> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| address < region.end)
    }

    /// Whether any region intersects the chunk containing `address`
    fn chunk_is_unmanaged(&self, address: Address) -> bool {
        let chunk_start = address.page_base();
        let chunk_end = chunk_start.add(1 << BLINK_PAGE_SIZE_LOG2);
        match self.regions.range(..chunk_end).next_back() {
            Some((_, region)) => region.end <= chunk_start,
            None => true,
        }
    }

    /// The page whose reservation contains `address`, if any
    pub fn classify(&self, address: Address) -> Option<PageRef> {
        if self.negative_cache.contains(address) {
            return None;
        }
        match self.region_containing(address) {
            Some(region) => Some(region.page),
            None => {
                if self.chunk_is_unmanaged(address) {
                    self.negative_cache.insert(address);
                }
                None
            }
        }
    }

    /// Whether the negative cache alone rejects `address`
    pub fn is_cached_unmanaged(&self, address: Address) -> bool {
        self.negative_cache.contains(address)
    }

    pub fn regions(&self) -> impl Iterator<Item = (Address, Address, PageRef)> + '_ {
        self.regions
            .iter()
            .map(|(base, region)| (*base, region.end, region.page))
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::memory::address::BLINK_PAGE_SIZE;
    use crate::memory::block::PageMemory;

    #[test]
    pub fn test_classify_and_negative_cache() {
        let page = NormalPage::new(PageMemory::allocate_normal().unwrap(), 0, 1);
        let mut classifier = AddressClassifier::new();
        classifier.add_region(page.base(), page.memory().end(), PageRef::normal(&page));

        let inside = page.payload_start().add(100);
        assert_eq!(classifier.classify(inside), Some(PageRef::normal(&page)));
        assert!(!classifier.is_cached_unmanaged(inside));

        let outside = Address::new(0x1000);
        assert_eq!(classifier.classify(outside), None);
        assert!(classifier.is_cached_unmanaged(outside));
        // a second lookup is answered from the cache
        assert_eq!(classifier.classify(outside), None);

        classifier.remove_region(page.base());
        assert_eq!(classifier.classify(inside), None);
        assert!(classifier.is_cached_unmanaged(inside));
    }

    #[test]
    pub fn test_cache_never_covers_a_region() {
        let pages: Vec<_> = (0..8)
            .map(|_| NormalPage::new(PageMemory::allocate_normal().unwrap(), 0, 1))
            .collect();
        let mut classifier = AddressClassifier::new();
        for page in &pages {
            classifier.add_region(page.base(), page.memory().end(), PageRef::normal(page));
        }

        // probe a spread of addresses around and between the pages
        let lowest = pages.iter().map(|p| p.base()).min().unwrap();
        for step in 0..4096 {
            let probe = lowest.sub(BLINK_PAGE_SIZE * 4).add(step * 1000);
            classifier.classify(probe);
        }

        for page in &pages {
            let mut address = page.base();
            while address < page.memory().end() {
                assert!(!classifier.is_cached_unmanaged(address));
                assert!(classifier.classify(address).is_some());
                address = address.add(4096);
            }
        }
    }

    #[test]
    pub fn test_adding_region_flushes_cache() {
        let classifier_page = PageMemory::allocate_normal().unwrap();
        let base = classifier_page.base();
        drop(classifier_page);

        let mut classifier = AddressClassifier::new();
        assert_eq!(classifier.classify(base), None);
        assert!(classifier.is_cached_unmanaged(base));

        let page = NormalPage::new(PageMemory::allocate_normal().unwrap(), 0, 1);
        classifier.add_region(page.base(), page.memory().end(), PageRef::normal(&page));
        assert!(!classifier.is_cached_unmanaged(base));
    }
}
