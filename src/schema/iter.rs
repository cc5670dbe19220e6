use crate::schema::decoded::{Decoded, Hex};
use crate::schema::key::Key;
use std::collections::HashMap;

/// An iterator over the keys authorized for a role, skipping key IDs with no matching entry
/// in the key map.
pub(crate) struct KeysIter<'a> {
    pub(crate) keyids_iter: std::slice::Iter<'a, Decoded<Hex>>,
    pub(crate) keys: &'a HashMap<Decoded<Hex>, Key>,
}

impl<'a> Iterator for KeysIter<'a> {
    type Item = &'a Key;

    fn next(&mut self) -> Option<Self::Item> {
        self.keyids_iter.by_ref().find_map(|id| self.keys.get(id))
    }
}
