//! Transaction-log linkage for cached buffers.
//!
//! A buffer joined to a [`Transaction`] carries one [`BufLogItem`] per
//! transaction that touched it. Disk-backed targets would write logged
//! buffers through a journal; memory-backed targets have nothing to make
//! durable and only ever strip the linkage again.

use crate::buf::{Buf, BufKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::trace;
use xstage_types::TxnId;

bitflags::bitflags! {
    /// Per-transaction state of a buffer log item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BliFlags: u32 {
        /// Buffer contents changed in this transaction.
        const DIRTY = 0x01;
        /// Written in order with the log, but contents are not logged.
        const ORDERED = 0x02;
        /// Buffer was invalidated in this transaction.
        const STALE = 0x04;
    }
}

/// Keys of the buffers joined to one transaction.
type Membership = Mutex<Vec<BufKey>>;

/// Link between one buffer and one transaction.
///
/// The item holds a weak handle on its transaction's membership list, so
/// whoever strips the item from the buffer can also unlink the buffer from
/// the transaction.
#[derive(Debug, Clone)]
pub struct BufLogItem {
    pub txn: TxnId,
    pub flags: BliFlags,
    /// The log item itself, not just the buffer, needs committing.
    pub item_dirty: bool,
    membership: Weak<Membership>,
}

impl BufLogItem {
    fn new(txn: TxnId, membership: Weak<Membership>) -> Self {
        Self {
            txn,
            flags: BliFlags::empty(),
            item_dirty: false,
            membership,
        }
    }

    /// Forget everything this item was going to log.
    pub fn clear(&mut self) {
        self.flags = BliFlags::empty();
        self.item_dirty = false;
    }

    /// Drop the owning transaction's reference to the buffer at `key`.
    ///
    /// Returns false if the transaction is already gone.
    fn unlink(&self, key: BufKey) -> bool {
        let Some(membership) = self.membership.upgrade() else {
            return false;
        };
        membership.lock().retain(|joined| *joined != key);
        true
    }
}

/// Snapshot of a transaction's membership, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnSummary {
    pub id: TxnId,
    pub joined: Vec<BufKey>,
}

/// A unit of change over a set of buffers.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    joined: Arc<Membership>,
}

impl Transaction {
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            joined: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Keys of the buffers currently joined.
    #[must_use]
    pub fn joined(&self) -> Vec<BufKey> {
        self.joined.lock().clone()
    }

    #[must_use]
    pub fn summary(&self) -> TxnSummary {
        TxnSummary {
            id: self.id,
            joined: self.joined(),
        }
    }

    /// Attach `buf` to this transaction if it is not already.
    pub fn join<S>(&mut self, buf: &Buf<S>) {
        self.with_item(buf, |_| ());
    }

    /// Record that `buf` changed in this transaction.
    pub fn log_buf<S>(&mut self, buf: &Buf<S>) {
        self.with_item(buf, |item| {
            item.flags.insert(BliFlags::DIRTY);
            item.item_dirty = true;
        });
    }

    /// Order `buf` with the log without logging its contents.
    pub fn ordered_buf<S>(&mut self, buf: &Buf<S>) {
        self.with_item(buf, |item| {
            item.flags.insert(BliFlags::ORDERED);
            item.item_dirty = true;
        });
    }

    /// Invalidate `buf`: it becomes stale and its logged changes are dropped.
    pub fn binval<S>(&mut self, buf: &Buf<S>) {
        buf.mark_stale();
        self.with_item(buf, |item| {
            item.flags.remove(BliFlags::DIRTY | BliFlags::ORDERED);
            item.flags.insert(BliFlags::STALE);
            item.item_dirty = true;
        });
    }

    /// Remove this transaction's log item from `buf`.
    ///
    /// Returns false if the buffer was not joined.
    pub fn bdetach<S>(&mut self, buf: &Buf<S>) -> bool {
        let id = self.id;
        let removed = buf.with_log_items(|items| {
            let before = items.len();
            items.retain(|item| item.txn != id);
            before != items.len()
        });
        if removed {
            let key = buf.key();
            self.joined.lock().retain(|joined| *joined != key);
        }
        removed
    }

    fn with_item<S, R>(&mut self, buf: &Buf<S>, f: impl FnOnce(&mut BufLogItem) -> R) -> R {
        let id = self.id;
        let key = buf.key();
        let membership = Arc::downgrade(&self.joined);
        let (joined, out) = buf.with_log_items(|items| {
            let index = items.iter().position(|item| item.txn == id);
            let (index, joined) = match index {
                Some(index) => (index, false),
                None => {
                    items.push(BufLogItem::new(id, membership));
                    (items.len() - 1, true)
                }
            };
            (joined, f(&mut items[index]))
        });
        if joined {
            self.joined.lock().push(key);
            trace!(target: "xstage::buf", event = "txn_join", txn = id.0, block = key.block.0);
        }
        out
    }
}

/// Strip every log item from `buf` and unlink it from each transaction that
/// had joined it, `txn` included. Returns how many items were removed.
///
/// Items are cleared in place and then drained, repeating until none
/// remain, since several transactions may reference one buffer.
pub fn detach_all<S>(txn: &mut Transaction, buf: &Buf<S>) -> usize {
    let key = buf.key();
    let mut detached = 0;
    loop {
        let items = buf.with_log_items(|items| {
            for item in items.iter_mut() {
                item.clear();
            }
            std::mem::take(items)
        });
        if items.is_empty() {
            break;
        }
        for item in &items {
            if !item.unlink(key) {
                trace!(
                    target: "xstage::buf",
                    event = "txn_gone",
                    txn = item.txn.0,
                    block = key.block.0
                );
            }
        }
        detached += items.len();
    }
    if detached > 0 {
        trace!(
            target: "xstage::buf",
            event = "txn_detach_all",
            txn = txn.id.0,
            block = key.block.0,
            detached
        );
    }
    detached
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{BlockStorage, BufFlags};
    use xstage_types::BlockNumber;

    #[derive(Debug)]
    struct VecStorage(Vec<u8>);

    impl BlockStorage for VecStorage {
        fn as_slice(&self) -> &[u8] {
            &self.0
        }

        fn as_mut_slice(&mut self) -> &mut [u8] {
            &mut self.0
        }
    }

    fn buf(block: u64) -> Buf<VecStorage> {
        Buf::new(BufKey::new(BlockNumber(block), 8), VecStorage(vec![0; 8]), None)
    }

    #[test]
    fn join_is_idempotent() {
        let mut txn = Transaction::new(TxnId(1));
        let b = buf(1);
        txn.join(&b);
        txn.join(&b);
        assert_eq!(b.log_item_count(), 1);
        assert_eq!(txn.joined(), vec![b.key()]);
    }

    #[test]
    fn log_buf_marks_item_dirty() {
        let mut txn = Transaction::new(TxnId(2));
        let b = buf(2);
        txn.log_buf(&b);
        let items = b.take_log_items();
        assert_eq!(items.len(), 1);
        assert!(items[0].flags.contains(BliFlags::DIRTY));
        assert!(items[0].item_dirty);
    }

    #[test]
    fn binval_marks_buffer_stale_and_drops_dirty() {
        let mut txn = Transaction::new(TxnId(3));
        let b = buf(3);
        txn.log_buf(&b);
        txn.binval(&b);
        assert!(b.flags().contains(BufFlags::STALE));
        let items = b.take_log_items();
        assert_eq!(items[0].flags, BliFlags::STALE);
    }

    #[test]
    fn bdetach_removes_only_own_item() {
        let mut t1 = Transaction::new(TxnId(10));
        let mut t2 = Transaction::new(TxnId(11));
        let b = buf(4);
        t1.join(&b);
        t2.log_buf(&b);
        assert!(t1.bdetach(&b));
        assert!(!t1.bdetach(&b));
        assert_eq!(b.log_item_count(), 1);
        assert!(t1.joined().is_empty());
        assert_eq!(t2.joined(), vec![b.key()]);
    }

    #[test]
    fn detach_all_unlinks_every_joined_transaction() {
        let mut t1 = Transaction::new(TxnId(20));
        let mut t2 = Transaction::new(TxnId(21));
        let b = buf(5);
        let other = buf(6);
        t1.log_buf(&b);
        t1.ordered_buf(&b);
        t2.binval(&b);
        t2.log_buf(&other);
        assert_eq!(b.log_item_count(), 2);

        assert_eq!(detach_all(&mut t1, &b), 2);
        assert_eq!(b.log_item_count(), 0);
        assert!(t1.joined().is_empty());
        assert_eq!(t2.joined(), vec![other.key()]);
        assert_eq!(detach_all(&mut t1, &b), 0);

        // A fresh join after the drain starts from a clean item.
        t2.join(&b);
        let items = b.take_log_items();
        assert_eq!(items.len(), 1);
        assert!(items[0].flags.is_empty());
        assert!(!items[0].item_dirty);
    }

    #[test]
    fn detach_all_survives_dropped_transaction() {
        let mut t1 = Transaction::new(TxnId(30));
        let b = buf(7);
        {
            let mut gone = Transaction::new(TxnId(31));
            gone.log_buf(&b);
        }
        t1.join(&b);
        assert_eq!(detach_all(&mut t1, &b), 2);
        assert!(t1.joined().is_empty());
    }

    #[test]
    fn clear_drops_all_pending_state() {
        let mut txn = Transaction::new(TxnId(1));
        let b = buf(8);
        txn.log_buf(&b);
        let mut item = b.take_log_items().remove(0);
        item.flags = BliFlags::all();
        item.clear();
        assert!(item.flags.is_empty());
        assert!(!item.item_dirty);
    }
}
