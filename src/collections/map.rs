use anyhow::{anyhow, Context, Result};
use rocksdb::{Direction, IteratorMode, OptimisticTransactionDB, Transaction};

/// A plain key-value map backed by one column family.
#[derive(Clone)]
pub struct Map<'a> {
    pub(crate) db: &'a OptimisticTransactionDB,
    pub(crate) cf: &'a rocksdb::ColumnFamily,
}

impl<'a> Map<'a> {
    pub(crate) fn open(db: &'a OptimisticTransactionDB, name: &str) -> Option<Self> {
        db.cf_handle(name).map(|cf| Self { db, cf })
    }

    /// Gets a value corresponding to the given key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get_cf(self.cf, key)
            .map_err(|e| anyhow!("database error: {e}"))
    }

    /// Gets a value in `txn`, marking the key so that a concurrent write to it
    /// makes `txn` fail on commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_for_update(
        &self,
        key: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<Option<Vec<u8>>> {
        txn.get_for_update_cf(self.cf, key, crate::EXCLUSIVE)
            .context("database read error")
    }

    /// Puts a key-value pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.cf, key, value)
            .map_err(|e| anyhow!("database error: {e}"))
    }

    /// Puts a key-value pair in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put_with_transaction(
        &self,
        key: &[u8],
        value: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        txn.put_cf(self.cf, key, value)
            .context("failed to write entry")
    }

    /// Inserts a new key-value pair in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the key already exists or the database operation
    /// fails.
    pub fn insert_with_transaction(
        &self,
        key: &[u8],
        value: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        if self.get_for_update(key, txn)?.is_some() {
            anyhow::bail!("key already exists");
        }
        self.put_with_transaction(key, value, txn)
    }

    /// Deletes a key-value pair in `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete_with_transaction(
        &self,
        key: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<()> {
        txn.delete_cf(self.cf, key)
            .context("failed to delete entry")
    }

    /// Deletes every key starting with `prefix` in `txn` and returns how many
    /// were deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete_prefix_with_transaction(
        &self,
        prefix: &[u8],
        txn: &Transaction<'_, OptimisticTransactionDB>,
    ) -> Result<usize> {
        let mut deleted = 0;
        for item in self.prefix_iterator(prefix) {
            let (key, _) = item?;
            self.delete_with_transaction(&key, txn)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    pub(crate) fn inner_iterator(&self, mode: IteratorMode) -> MapIterator<'a> {
        MapIterator {
            inner: self.db.iterator_cf(self.cf, mode),
            prefix: None,
        }
    }

    /// Iterates over the entries whose keys start with `prefix`, beginning at
    /// `from` if given.
    pub(crate) fn inner_prefix_iterator(
        &self,
        direction: Direction,
        from: Option<&[u8]>,
        prefix: &[u8],
    ) -> MapIterator<'a> {
        let upper;
        let start = match (from, direction) {
            (Some(from), _) => from,
            (None, Direction::Forward) => prefix,
            (None, Direction::Reverse) => {
                upper = prefix_upper_bound(prefix);
                &upper
            }
        };
        MapIterator {
            inner: self
                .db
                .iterator_cf(self.cf, IteratorMode::From(start, direction)),
            prefix: Some(prefix.to_vec()),
        }
    }

    fn prefix_iterator(&self, prefix: &[u8]) -> MapIterator<'a> {
        self.inner_prefix_iterator(Direction::Forward, None, prefix)
    }
}

/// A key greater than every key starting with `prefix`; keys in this crate
/// never extend a prefix by more than 32 bytes.
fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut upper = prefix.to_vec();
    upper.extend([u8::MAX; 32]);
    upper
}

#[allow(clippy::module_name_repetitions)]
pub struct MapIterator<'i> {
    inner: rocksdb::DBIteratorWithThreadMode<'i, OptimisticTransactionDB>,
    prefix: Option<Vec<u8>>,
}

impl Iterator for MapIterator<'_> {
    type Item = Result<(Box<[u8]>, Box<[u8]>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (key, value) = match self.inner.next()? {
            Ok(item) => item,
            Err(e) => return Some(Err(e.into())),
        };
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix) {
                return None;
            }
        }
        Some(Ok((key, value)))
    }
}
