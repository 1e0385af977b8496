mod indexed_map;
mod map;

use std::{borrow::Cow, cmp::Ordering, mem};

use anyhow::{bail, Context, Result};
use bincode::Options;
use rocksdb::{Direction, IteratorMode, OptimisticTransactionDB, Transaction};
use serde::{Deserialize, Serialize};

pub use self::{
    indexed_map::IndexedMap,
    map::{Map, MapIterator},
};
use crate::types::FromKeyValue;

/// A write turned down because of what is stored, as opposed to a failure of
/// the database.
#[derive(Debug, thiserror::Error)]
pub(crate) enum Refused {
    #[error("key already exists")]
    KeyExists,
    #[error("entry changed")]
    EntryChanged,
    #[error("no such ID")]
    NoSuchId,
}

/// Whether a failed commit lost an optimistic-concurrency race and should be
/// retried.
pub(crate) fn is_conflict(e: &rocksdb::Error) -> bool {
    matches!(
        e.kind(),
        rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TryAgain
    )
}

/// Runs `op` in a fresh transaction until it commits without conflict.
///
/// # Errors
///
/// Returns the first error `op` returns, or an error if the commit fails for a
/// reason other than a conflict.
pub(crate) fn with_transaction<T, E, F>(db: &OptimisticTransactionDB, mut op: F) -> Result<T, E>
where
    F: FnMut(&Transaction<'_, OptimisticTransactionDB>) -> Result<T, E>,
    E: From<anyhow::Error>,
{
    loop {
        let txn = db.transaction();
        let out = op(&txn)?;
        match txn.commit() {
            Ok(()) => return Ok(out),
            Err(e) if is_conflict(&e) => {
                tracing::debug!("transaction conflict, retrying: {e}");
            }
            Err(e) => return Err(anyhow::Error::from(e).context("failed to commit").into()),
        }
    }
}

#[derive(Deserialize, Serialize)]
enum KeyIndexEntry {
    Key(Vec<u8>),
    /// A free slot; holds the next free slot.
    Free(u32),
}

/// The ID-to-key table of an `IndexedMap`, stored under the empty key.
#[derive(Default, Deserialize, Serialize)]
pub struct KeyIndex {
    keys: Vec<KeyIndexEntry>,
    available: u32,
}

impl KeyIndex {
    fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self> {
        bincode::DefaultOptions::new()
            .deserialize_from(bytes.as_ref())
            .context("invalid serialized form")
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::DefaultOptions::new()
            .serialize(self)
            .context("failed to serialize index")
    }

    fn count(&self) -> usize {
        self.keys
            .iter()
            .filter(|entry| matches!(entry, KeyIndexEntry::Key(_)))
            .count()
    }

    fn get(&self, id: u32) -> Result<Option<&[u8]>> {
        let i = usize::try_from(id).context("index out of range")?;
        Ok(match self.keys.get(i) {
            Some(KeyIndexEntry::Key(key)) => Some(key),
            Some(KeyIndexEntry::Free(_)) | None => None,
        })
    }

    /// Inserts a new key and returns its ID, reusing a freed slot if any.
    fn insert(&mut self, key: &[u8]) -> Result<u32> {
        let id = self.available;
        let len = u32::try_from(self.keys.len()).context("corrupt index")?;
        match len.cmp(&id) {
            Ordering::Equal => {
                if id == u32::MAX {
                    bail!("index is full");
                }
                self.keys.push(KeyIndexEntry::Key(key.to_vec()));
                self.available += 1;
            }
            Ordering::Greater => {
                let i = usize::try_from(id).context("too many keys")?;
                self.available = match self.keys.get(i) {
                    Some(KeyIndexEntry::Free(next)) => *next,
                    _ => bail!("corrupt index"),
                };
                self.keys[i] = KeyIndexEntry::Key(key.to_vec());
            }
            Ordering::Less => bail!("corrupt index"),
        }
        Ok(id)
    }

    fn remove(&mut self, id: u32) -> Result<Vec<u8>> {
        let i = usize::try_from(id).context("index out of range")?;
        let key = match self.keys.get_mut(i) {
            Some(KeyIndexEntry::Key(key)) => mem::take(key),
            Some(KeyIndexEntry::Free(_)) | None => return Err(Refused::NoSuchId.into()),
        };
        self.keys[i] = KeyIndexEntry::Free(self.available);
        self.available = id;
        Ok(key)
    }

    fn update(&mut self, id: u32, key: &[u8]) -> Result<Vec<u8>> {
        let i = usize::try_from(id).context("index out of range")?;
        match self.keys.get_mut(i) {
            Some(KeyIndexEntry::Key(old)) => Ok(mem::replace(old, key.to_vec())),
            Some(KeyIndexEntry::Free(_)) | None => Err(Refused::NoSuchId.into()),
        }
    }
}

pub trait Indexable
where
    Self: Sized,
{
    fn key(&self) -> Cow<'_, [u8]>;
    fn index(&self) -> u32;
    fn value(&self) -> Vec<u8>;
    fn set_index(&mut self, index: u32);
}

pub trait IndexedMapUpdate {
    type Entry;

    /// Returns the key of the updated entry, if the update changes it.
    fn key(&self) -> Option<Cow<'_, [u8]>>;

    /// Applies the changes to the value.
    ///
    /// # Errors
    ///
    /// Returns an error if the changes are invalid.
    fn apply(&self, value: Self::Entry) -> Result<Self::Entry>;

    /// Verifies that the values to change match with the current entry.
    fn verify(&self, value: &Self::Entry) -> bool;
}

pub trait Indexed {
    fn db(&self) -> &OptimisticTransactionDB;
    fn cf(&self) -> &rocksdb::ColumnFamily;

    /// Returns the index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is corrupt or the database operation fails.
    fn index(&self) -> Result<KeyIndex> {
        let Some(value) = self.db().get_cf(self.cf(), []).context("database error")? else {
            return Ok(KeyIndex::default());
        };
        KeyIndex::from_bytes(value).context("invalid index in database")
    }

    /// Returns the index, marking it for update in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is corrupt or the database operation fails.
    fn index_in_transaction(
        &self,
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<KeyIndex> {
        let Some(value) = txn
            .get_for_update_cf(self.cf(), [], crate::EXCLUSIVE)
            .context("database error")?
        else {
            return Ok(KeyIndex::default());
        };
        KeyIndex::from_bytes(value).context("invalid index in database")
    }

    /// Returns the number of entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    fn count(&self) -> Result<usize> {
        Ok(self.index()?.count())
    }

    /// Gets the entry with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is invalid or the entry cannot be read.
    fn get_by_id<T: FromKeyValue>(&self, id: u32) -> Result<Option<T>> {
        let index = self.index()?;
        let Some(key) = index.get(id)? else {
            return Ok(None);
        };
        self.db()
            .get_cf(self.cf(), key)
            .context("cannot read entry")?
            .map(|value| T::from_key_value(key, &value))
            .transpose()
    }

    /// Inserts a new entry and returns its ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is empty, already exists, or the database
    /// operation fails.
    fn insert<T: Indexable>(&self, mut entry: T) -> Result<u32> {
        if entry.key().is_empty() {
            bail!("key shouldn't be empty");
        }
        with_transaction(self.db(), |txn| {
            let mut index = self.index_in_transaction(txn)?;
            let id = index.insert(&entry.key()).context("cannot insert key")?;
            entry.set_index(id);
            if txn
                .get_for_update_cf(self.cf(), entry.key(), crate::EXCLUSIVE)
                .context("cannot read from database")?
                .is_some()
            {
                return Err(Refused::KeyExists.into());
            }
            txn.put_cf(self.cf(), [], index.to_bytes()?)
                .context("failed to update database index")?;
            txn.put_cf(self.cf(), entry.key(), entry.value())
                .context("failed to write new entry")?;
            Ok(id)
        })
    }

    /// Removes the entry with the given ID and returns its key.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is invalid or the database operation fails.
    fn remove(&self, id: u32) -> Result<Vec<u8>> {
        with_transaction(self.db(), |txn| {
            let mut index = self
                .index_in_transaction(txn)
                .context("cannot read index")?;
            let key = index.remove(id).context("cannot remove key")?;
            if key.is_empty() {
                bail!("corrupt index");
            }
            txn.put_cf(self.cf(), [], index.to_bytes()?)
                .context("failed to update database index")?;
            txn.delete_cf(self.cf(), &key)
                .context("failed to remove entry")?;
            Ok(key)
        })
    }

    /// Updates the entry with the given ID from `old` to `new`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is invalid, the stored entry doesn't match
    /// `old`, the new key is taken, or the database operation fails.
    fn update<O, V>(&self, id: u32, old: &O, new: &V) -> Result<()>
    where
        O: IndexedMapUpdate,
        O::Entry: Indexable + FromKeyValue,
        V: IndexedMapUpdate<Entry = O::Entry>,
    {
        with_transaction(self.db(), |txn| {
            let mut index = self
                .index_in_transaction(txn)
                .context("cannot read index")?;
            let Some(key) = index.get(id)?.map(<[u8]>::to_vec) else {
                return Err(Refused::NoSuchId.into());
            };
            let Some(value) = txn
                .get_for_update_cf(self.cf(), &key, crate::EXCLUSIVE)
                .context("cannot read entry")?
            else {
                bail!("corrupt index");
            };
            let entry =
                O::Entry::from_key_value(&key, &value).context("invalid entry in database")?;
            if !old.verify(&entry) {
                return Err(Refused::EntryChanged.into());
            }
            let updated = new.apply(entry).context("invalid update")?;
            let new_key = updated.key().into_owned();
            if new_key != key {
                if txn
                    .get_for_update_cf(self.cf(), &new_key, crate::EXCLUSIVE)
                    .context("cannot read from database")?
                    .is_some()
                {
                    return Err(Refused::KeyExists.into());
                }
                index.update(id, &new_key).context("cannot update index")?;
                txn.delete_cf(self.cf(), &key)
                    .context("failed to delete old entry")?;
                txn.put_cf(self.cf(), [], index.to_bytes()?)
                    .context("failed to update database index")?;
            }
            txn.put_cf(self.cf(), &new_key, updated.value())
                .context("failed to write updated entry")?;
            Ok(())
        })
    }

    /// Returns an iterator over the raw entries, skipping the index.
    fn raw_iter(&self, direction: Direction) -> IndexedMapIterator<'_> {
        let mode = match direction {
            Direction::Forward => IteratorMode::From(&[0], Direction::Forward),
            Direction::Reverse => IteratorMode::End,
        };
        IndexedMapIterator {
            inner: self.db().iterator_cf(self.cf(), mode),
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct IndexedMapIterator<'i> {
    inner: rocksdb::DBIteratorWithThreadMode<'i, OptimisticTransactionDB>,
}

impl Iterator for IndexedMapIterator<'_> {
    type Item = Result<(Box<[u8]>, Box<[u8]>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next()? {
            Ok((key, _)) if key.is_empty() => None,
            Ok(item) => Some(Ok(item)),
            Err(e) => Some(Err(e.into())),
        }
    }
}
