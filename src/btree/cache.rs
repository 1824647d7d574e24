use std::hash::Hash;

use lru::LruCache;

/// Recency-ordered page cache.
///
/// Pages are owned by the cache and handed out by reference. Every touch
/// moves a page to the most-recent end; eviction walks from the other end.
/// The cache never evicts on its own: the engine decides when and how many
/// pages to write back, so the underlying [`LruCache`] is unbounded.
pub struct PageCache<K: Hash + Eq + Copy, P> {
    pages: LruCache<K, P>,
}

impl<K: Hash + Eq + Copy, P> PageCache<K, P> {
    pub fn new() -> Self {
        Self {
            pages: LruCache::unbounded(),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.pages.contains(id)
    }

    /// Look up a page and mark it most recently used
    pub fn get(&mut self, id: &K) -> Option<&P> {
        self.pages.get(id)
    }

    /// Mutable lookup that marks the page most recently used
    pub fn get_mut(&mut self, id: &K) -> Option<&mut P> {
        self.pages.get_mut(id)
    }

    /// Look up a page without touching its recency
    pub fn peek(&self, id: &K) -> Option<&P> {
        self.pages.peek(id)
    }

    pub fn peek_mut(&mut self, id: &K) -> Option<&mut P> {
        self.pages.peek_mut(id)
    }

    /// Insert as most recently used, returning any page it displaced
    pub fn put(&mut self, id: K, page: P) -> Option<P> {
        self.pages.put(id, page)
    }

    pub fn remove(&mut self, id: &K) -> Option<P> {
        self.pages.pop(id)
    }

    pub fn move_to_end(&mut self, id: &K) {
        self.pages.promote(id);
    }

    /// Every cached ID, least recently used first
    pub fn ids_oldest_first(&self) -> Vec<K> {
        self.pages.iter().rev().map(|(id, _)| *id).collect()
    }

    /// Up to `count` IDs from the cold end
    pub fn oldest(&self, count: usize) -> Vec<K> {
        self.pages.iter().rev().take(count).map(|(id, _)| *id).collect()
    }

    /// IDs of the pages matching `pred`, least recently used first
    pub fn ids_where(&self, pred: impl Fn(&P) -> bool) -> Vec<K> {
        self.pages
            .iter()
            .rev()
            .filter(|(_, page)| pred(page))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn pop_oldest(&mut self) -> Option<(K, P)> {
        self.pages.pop_lru()
    }
}

impl<K: Hash + Eq + Copy, P> Default for PageCache<K, P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(ids: &[u32]) -> PageCache<u32, String> {
        let mut cache = PageCache::new();
        for id in ids {
            cache.put(*id, format!("page {id}"));
        }
        cache
    }

    #[test]
    fn test_insertion_order_is_recency_order() {
        let cache = filled(&[1, 2, 3, 4]);
        assert_eq!(cache.ids_oldest_first(), vec![1, 2, 3, 4]);
        assert_eq!(cache.oldest(2), vec![1, 2]);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_get_touches_peek_does_not() {
        let mut cache = filled(&[1, 2, 3]);
        assert!(cache.peek(&1).is_some());
        assert_eq!(cache.ids_oldest_first(), vec![1, 2, 3]);

        assert_eq!(cache.get(&1).map(String::as_str), Some("page 1"));
        assert_eq!(cache.ids_oldest_first(), vec![2, 3, 1]);

        cache.move_to_end(&2);
        assert_eq!(cache.ids_oldest_first(), vec![3, 1, 2]);
    }

    #[test]
    fn test_grows_without_evicting() {
        let cache = filled(&(0..5000).collect::<Vec<_>>());
        assert_eq!(cache.len(), 5000);
        assert!(cache.contains(&0));
    }

    #[test]
    fn test_remove_and_pop_oldest() {
        let mut cache = filled(&[1, 2, 3]);
        assert_eq!(cache.remove(&2).as_deref(), Some("page 2"));
        assert!(!cache.contains(&2));
        assert_eq!(cache.pop_oldest().map(|(id, _)| id), Some(1));
        assert_eq!(cache.ids_oldest_first(), vec![3]);
    }

    #[test]
    fn test_ids_where() {
        let mut cache = filled(&[1, 2, 3, 4]);
        if let Some(page) = cache.peek_mut(&3) {
            page.push('*');
        }
        assert_eq!(cache.ids_where(|p| p.ends_with('*')), vec![3]);
    }
}
