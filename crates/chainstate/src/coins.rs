//! UTXO set backed by the storage trait, with a write-back cache in front.

use std::collections::HashMap;

use utxod_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::TxOut;
use utxod_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const OUTPOINT_KEY_LEN: usize = 36;

/// An unspent output together with where it was created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub out: TxOut,
    pub height: i32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(out: TxOut, height: i32, is_coinbase: bool) -> Self {
        Self {
            out,
            height,
            is_coinbase,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(9 + self.out.encoded_size());
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        utxod_primitives::encoding::decode(bytes)
    }
}

impl Encodable for Coin {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        let code = ((self.height.max(0) as u64) << 1) | u64::from(self.is_coinbase);
        encoder.write_varint(code);
        self.out.consensus_encode(encoder);
    }
}

impl Decodable for Coin {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let code = decoder.read_varint()?;
        let height = i32::try_from(code >> 1)
            .map_err(|_| DecodeError::InvalidData("coin height out of range"))?;
        let out = TxOut::consensus_decode(decoder)?;
        Ok(Self {
            out,
            height,
            is_coinbase: (code & 1) == 1,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Persistent coins, one record per outpoint in [`Column::Utxo`].
pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        let key = OutPointKey::new(outpoint);
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => Ok(Some(
                Coin::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, coin: &Coin) {
        let key = OutPointKey::new(outpoint);
        batch.put(Column::Utxo, key.as_bytes(), coin.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        let key = OutPointKey::new(outpoint);
        batch.delete(Column::Utxo, key.as_bytes());
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    /// `None` marks a spent coin that still has to be deleted from the store.
    coin: Option<Coin>,
    dirty: bool,
}

/// Write-back view over a [`UtxoSet`].
///
/// Mutations between [`CoinsCache::begin`] and [`CoinsCache::commit`] are
/// journaled so a failed block can be rolled back with
/// [`CoinsCache::rollback`].
pub struct CoinsCache<S> {
    base: UtxoSet<S>,
    entries: HashMap<OutPoint, CacheEntry>,
    journal: Option<HashMap<OutPoint, Option<CacheEntry>>>,
}

impl<S: KeyValueStore> CoinsCache<S> {
    pub fn new(base: UtxoSet<S>) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            journal: None,
        }
    }

    pub fn get(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        self.load(outpoint)?;
        Ok(self
            .entries
            .get(outpoint)
            .and_then(|entry| entry.coin.clone()))
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        self.load(outpoint)?;
        Ok(self
            .entries
            .get(outpoint)
            .is_some_and(|entry| entry.coin.is_some()))
    }

    /// Remove a coin, returning it if it was present.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        self.load(outpoint)?;
        let previous = self
            .entries
            .get(outpoint)
            .and_then(|entry| entry.coin.clone());
        if previous.is_some() {
            self.record(outpoint);
            self.entries.insert(
                outpoint.clone(),
                CacheEntry {
                    coin: None,
                    dirty: true,
                },
            );
        }
        Ok(previous)
    }

    /// Insert a coin unconditionally; returns whether one was overwritten.
    pub fn add(&mut self, outpoint: &OutPoint, coin: Coin) -> Result<bool, StoreError> {
        let existed = self.have_coin(outpoint)?;
        self.record(outpoint);
        self.entries.insert(
            outpoint.clone(),
            CacheEntry {
                coin: Some(coin),
                dirty: true,
            },
        );
        Ok(existed)
    }

    pub fn begin(&mut self) {
        self.journal = Some(HashMap::new());
    }

    pub fn commit(&mut self) {
        self.journal = None;
    }

    pub fn rollback(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for (outpoint, previous) in journal {
            match previous {
                Some(entry) => {
                    self.entries.insert(outpoint, entry);
                }
                None => {
                    self.entries.remove(&outpoint);
                }
            }
        }
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.values().filter(|entry| entry.dirty).count()
    }

    /// Queue every dirty entry into `batch`. The cache is left as is until
    /// [`CoinsCache::mark_flushed`] confirms the batch reached the store.
    pub fn write_into(&self, batch: &mut WriteBatch) -> usize {
        let mut written = 0usize;
        for (outpoint, entry) in &self.entries {
            if !entry.dirty {
                continue;
            }
            match &entry.coin {
                Some(coin) => self.base.put(batch, outpoint, coin),
                None => self.base.delete(batch, outpoint),
            }
            written += 1;
        }
        written
    }

    /// Drop the cached copies once the batch from
    /// [`CoinsCache::write_into`] has been committed.
    pub fn mark_flushed(&mut self) {
        self.entries.clear();
        self.journal = None;
    }

    fn load(&mut self, outpoint: &OutPoint) -> Result<(), StoreError> {
        if self.entries.contains_key(outpoint) {
            return Ok(());
        }
        let coin = self.base.get(outpoint)?;
        self.entries.insert(
            outpoint.clone(),
            CacheEntry { coin, dirty: false },
        );
        Ok(())
    }

    fn record(&mut self, outpoint: &OutPoint) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if journal.contains_key(outpoint) {
            return;
        }
        journal.insert(outpoint.clone(), self.entries.get(outpoint).cloned());
    }
}
