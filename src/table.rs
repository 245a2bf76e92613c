use std::ops::Index;

/// An ordered key/value table with case-insensitive lookup.
///
/// Keeps insertion order, which matters for header emission: duplicates
/// are joined in receipt order, not hash order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table<T> {
    pub elements: Vec<(String, T)>,
}

impl<T> Index<usize> for Table<T> {
    type Output = (String, T);
    fn index(&self, idx: usize) -> &(String, T) {
        &self.elements[idx]
    }
}

impl<'a, T> IntoIterator for &'a Table<T> {
    type Item = &'a (String, T);
    type IntoIter = std::slice::Iter<'a, (String, T)>;

    fn into_iter(self) -> std::slice::Iter<'a, (String, T)> {
        self.elements.iter()
    }
}

impl<T> IntoIterator for Table<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> std::vec::IntoIter<(String, T)> {
        self.elements.into_iter()
    }
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
        }
    }

    pub fn with_capacity(size: usize) -> Self {
        Self {
            elements: Vec::with_capacity(size),
        }
    }

    /// Add a new (key, item) pair to the table.
    pub fn add(&mut self, key: String, item: T) {
        self.elements.push((key, item));
    }

    /// First pair whose key matches the given one, ignoring ASCII case.
    pub fn get_nocase(&self, key: &str) -> Option<&(String, T)> {
        self.elements
            .iter()
            .find(|x| x.0.eq_ignore_ascii_case(key))
    }

    /// Mutable variant of [`get_nocase`](Self::get_nocase).
    pub fn get_nocase_mut(&mut self, key: &str) -> Option<&mut (String, T)> {
        self.elements
            .iter_mut()
            .find(|x| x.0.eq_ignore_ascii_case(key))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (String, T)> {
        self.elements.iter()
    }

    pub fn size(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
