//! Glue between the update log and the yrs document.
//!
//! The log only ever holds v1-encoded updates. Everything here is
//! synchronous: a yrs transaction must never be held across an await.

use tokio::sync::mpsc::UnboundedSender;
use yrs::updates::decoder::Decode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::error::{PersistenceError, Result};
use crate::storage::UpdateEntry;

/// Apply stored entries to `doc` in one transaction tagged with `origin`.
///
/// Every entry is decoded before anything is applied, so a corrupt entry
/// leaves the document untouched.
pub fn apply_fragments(doc: &Doc, entries: &[UpdateEntry], origin: &Origin) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let mut decoded = Vec::with_capacity(entries.len());
    for entry in entries {
        let update =
            Update::decode_v1(&entry.payload).map_err(|e| PersistenceError::CorruptFragment {
                key: entry.key,
                reason: e.to_string(),
            })?;
        decoded.push((entry.key, update));
    }

    let mut txn = doc.transact_mut_with(origin.clone());
    for (key, update) in decoded {
        txn.apply_update(update)
            .map_err(|e| PersistenceError::CorruptFragment {
                key,
                reason: format!("{e:?}"),
            })?;
    }
    Ok(())
}

/// Encode the whole document as a single update.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    doc.transact()
        .encode_state_as_update_v1(&StateVector::default())
}

/// Encode what `doc` holds beyond the stored `entries`, if anything.
///
/// The stored log is replayed into a scratch document; `doc`'s full state
/// is applied on top and only a change to the scratch state counts as
/// content. A document with an empty state vector short-circuits.
pub fn encode_unstored(doc: &Doc, entries: &[UpdateEntry]) -> Result<Option<Vec<u8>>> {
    let local = {
        let txn = doc.transact();
        if txn.state_vector() == StateVector::default() {
            return Ok(None);
        }
        txn.encode_state_as_update_v1(&StateVector::default())
    };

    let stored = Doc::new();
    let scratch = Origin::from("logos-persistence:scratch");
    apply_fragments(&stored, entries, &scratch)?;
    let (stored_sv, stored_state) = {
        let txn = stored.transact();
        (
            txn.state_vector(),
            txn.encode_state_as_update_v1(&StateVector::default()),
        )
    };

    apply_fragments(&stored, &[UpdateEntry { key: 0, payload: local }], &scratch)?;
    let txn = stored.transact();
    if txn.encode_state_as_update_v1(&StateVector::default()) == stored_state {
        return Ok(None);
    }
    Ok(Some(txn.encode_state_as_update_v1(&stored_sv)))
}

/// Merge fragments into one update equivalent to applying all of them.
pub fn merge_fragments<B: AsRef<[u8]>>(fragments: &[B]) -> Result<Vec<u8>> {
    match fragments {
        [] => Ok(Vec::new()),
        [single] => Ok(single.as_ref().to_vec()),
        many => {
            let refs: Vec<&[u8]> = many.iter().map(|f| f.as_ref()).collect();
            yrs::merge_updates_v1(&refs).map_err(|e| PersistenceError::CorruptFragment {
                key: 0,
                reason: e.to_string(),
            })
        }
    }
}

/// Forward every update committed by someone other than `origin`.
///
/// The returned subscription must be kept alive; dropping it unregisters
/// the observer.
pub fn observe_local_edits(
    doc: &Doc,
    origin: &Origin,
    edits: UnboundedSender<Vec<u8>>,
) -> Result<Subscription> {
    let own = origin.clone();
    doc.observe_update_v1(move |txn, event| {
        if txn.origin() == Some(&own) {
            return;
        }
        log::trace!("Observed local edit ({} bytes)", event.update.len());
        // Receiver gone means the provider is shutting down
        let _ = edits.send(event.update.clone());
    })
    .map_err(|e| PersistenceError::Observer(format!("{e:?}")))
}
