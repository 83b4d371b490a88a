use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::store::lsm::sstable::TableEntry;
use crate::Error;

/// A sorted source of entries fed into a merge.
pub type EntryIterator<'a> = Box<dyn Iterator<Item = Result<TableEntry>> + Send + 'a>;

pub struct HeapEntry<'a> {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    /// Position of the source in the merge; lower is newer.
    pub source: usize,
    pub iterator: EntryIterator<'a>,
}

impl std::fmt::Debug for HeapEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("source", &self.source)
            .finish()
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry<'_> {}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry<'_> {
    // BinaryHeap pops the greatest entry: smallest key first, and for equal
    // keys the newest source.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.source.cmp(&self.source),
            ordering => ordering.reverse(),
        }
    }
}

/// K-way merge of sorted sources. Yields each key once, taking the value
/// from the newest source that holds it. Tombstones are passed through.
#[derive(Debug)]
pub struct MergeIterator<'a> {
    heap: BinaryHeap<HeapEntry<'a>>,
    latest_key: Option<Vec<u8>>,
    failed: Option<Error>,
}

impl<'a> MergeIterator<'a> {
    /// `iterators` are ordered newest first.
    pub fn new(iterators: Vec<EntryIterator<'a>>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::new(),
            latest_key: None,
            failed: None,
        };
        for (source, iterator) in iterators.into_iter().enumerate() {
            merge.advance(source, iterator);
        }
        merge
    }

    fn advance(&mut self, source: usize, mut iterator: EntryIterator<'a>) {
        match iterator.next() {
            Some(Ok((key, value))) => self.heap.push(HeapEntry {
                key,
                value,
                source,
                iterator,
            }),
            Some(Err(err)) => {
                if self.failed.is_none() {
                    self.failed = Some(err);
                }
            }
            None => {}
        }
    }
}

impl Iterator for MergeIterator<'_> {
    type Item = Result<TableEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(err) = self.failed.take() {
                self.heap.clear();
                return Some(Err(err));
            }

            let entry = self.heap.pop()?;
            let HeapEntry {
                key,
                value,
                source,
                iterator,
            } = entry;
            self.advance(source, iterator);

            if self.latest_key.as_ref() == Some(&key) {
                continue;
            }
            self.latest_key = Some(key.clone());
            return Some(Ok((key, value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(entries: &[(&str, Option<&str>)]) -> EntryIterator<'static> {
        let owned: Vec<Result<TableEntry>> = entries
            .iter()
            .map(|(k, v)| Ok((k.as_bytes().to_vec(), v.map(|v| v.as_bytes().to_vec()))))
            .collect();
        Box::new(owned.into_iter())
    }

    fn collect(merge: MergeIterator<'_>) -> Vec<(String, Option<String>)> {
        merge
            .map(|r| {
                let (k, v) = r.unwrap();
                (
                    String::from_utf8(k).unwrap(),
                    v.map(|v| String::from_utf8(v).unwrap()),
                )
            })
            .collect()
    }

    #[test]
    fn test_newest_source_wins() {
        let newest = source(&[("b", Some("new")), ("d", None)]);
        let middle = source(&[("a", Some("1")), ("b", Some("mid")), ("d", Some("4"))]);
        let oldest = source(&[("b", Some("old")), ("c", Some("3"))]);

        let merged = collect(MergeIterator::new(vec![newest, middle, oldest]));
        assert_eq!(
            merged,
            vec![
                ("a".to_string(), Some("1".to_string())),
                ("b".to_string(), Some("new".to_string())),
                ("c".to_string(), Some("3".to_string())),
                ("d".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_empty_sources() {
        let merged = collect(MergeIterator::new(vec![source(&[]), source(&[("x", Some("1"))])]));
        assert_eq!(merged, vec![("x".to_string(), Some("1".to_string()))]);
        assert!(MergeIterator::new(Vec::new()).next().is_none());
    }

    #[test]
    fn test_source_error_is_surfaced() {
        let failing: EntryIterator<'static> = Box::new(
            vec![
                Ok((b"a".to_vec(), Some(b"1".to_vec()))),
                Err(Error::Format("bad page".to_string())),
            ]
            .into_iter(),
        );
        let mut merge = MergeIterator::new(vec![failing, source(&[("b", Some("2"))])]);

        assert!(merge.next().unwrap().is_ok());
        assert!(matches!(merge.next(), Some(Err(Error::Format(_)))));
        assert!(merge.next().is_none());
    }
}
