//! Per-tenant, per-document-type numbering.
//!
//! The sequence row is read under an exclusive lock, so two units allocating for
//! the same type serialize on it and can never hand out the same number. An
//! allocation rolls back with the rest of its unit.

use tally_shared::types::{DocumentId, DocumentTypeId, TenantId};
use tracing::debug;

use super::error::LedgerError;
use super::types::{DocumentStatus, DocumentTypeSequence, DocumentTypeSettings};
use crate::store::{LedgerTx, StoreError};

/// Document number allocator.
pub struct SequenceAllocator;

impl SequenceAllocator {
    /// Locks the sequence row of a type, creating an auto-numbered row on first use.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the row cannot be read or created.
    pub async fn lock_or_init<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<DocumentTypeSequence, LedgerError> {
        if let Some(sequence) = tx.lock_sequence(tenant_id, doc_type_id).await? {
            return Ok(sequence);
        }
        let sequence = DocumentTypeSequence::new(tenant_id, doc_type_id);
        match tx.insert_sequence(&sequence).await {
            Ok(()) => Ok(sequence),
            // A concurrent unit created the row first.
            Err(StoreError::UniqueViolation(_)) => tx
                .lock_sequence(tenant_id, doc_type_id)
                .await?
                .ok_or_else(|| {
                    LedgerError::Internal(format!("sequence for {doc_type_id} vanished"))
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Hands out the next number of an auto-numbered type.
    ///
    /// # Errors
    ///
    /// Returns `ManualNumberRequired` for manual types, or a storage error.
    pub async fn allocate<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
    ) -> Result<i64, LedgerError> {
        let mut sequence = Self::lock_or_init(tx, tenant_id, doc_type_id).await?;
        Self::next_number(tx, &mut sequence, None).await
    }

    /// Resolves the number of a new document against an already locked sequence row.
    ///
    /// Auto types allocate and reject a supplied number; manual types require one
    /// and claim it.
    ///
    /// # Errors
    ///
    /// Returns `ManualNumberRequired`, `ManualNumberNotAllowed`, `SequenceConflict`,
    /// or a storage error.
    pub async fn next_number<T: LedgerTx>(
        tx: &mut T,
        sequence: &mut DocumentTypeSequence,
        supplied: Option<i64>,
    ) -> Result<i64, LedgerError> {
        match (sequence.manual_numbering, supplied) {
            (false, Some(_)) => Err(LedgerError::ManualNumberNotAllowed(sequence.doc_type_id)),
            (true, None) => Err(LedgerError::ManualNumberRequired(sequence.doc_type_id)),
            (true, Some(number)) => Self::claim_manual(tx, sequence, number).await,
            (false, None) => {
                sequence.current_number += 1;
                tx.update_sequence(sequence).await?;
                debug!(
                    doc_type_id = %sequence.doc_type_id,
                    number = sequence.current_number,
                    "allocated document number"
                );
                Ok(sequence.current_number)
            }
        }
    }

    /// Claims a caller-supplied number for a manual-numbering type.
    ///
    /// The number is free when no ACTIVE document of the type holds it. The
    /// counter is raised to the claimed number when it is higher.
    ///
    /// # Errors
    ///
    /// Returns `InvalidQuantity` for non-positive numbers, `SequenceConflict` if the
    /// number is taken, or a storage error.
    pub async fn claim_manual<T: LedgerTx>(
        tx: &mut T,
        sequence: &mut DocumentTypeSequence,
        number: i64,
    ) -> Result<i64, LedgerError> {
        if number <= 0 {
            return Err(LedgerError::InvalidQuantity(format!(
                "document numbers start at 1, got {number}"
            )));
        }
        Self::ensure_free(tx, sequence.tenant_id, sequence.doc_type_id, number, None).await?;
        if number > sequence.current_number {
            sequence.current_number = number;
            tx.update_sequence(sequence).await?;
        }
        Ok(number)
    }

    /// Fails with `SequenceConflict` if an ACTIVE document other than `except` holds `number`.
    ///
    /// # Errors
    ///
    /// Returns `SequenceConflict`, or a storage error.
    pub async fn ensure_free<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        number: i64,
        except: Option<DocumentId>,
    ) -> Result<(), LedgerError> {
        let holders = tx.documents_with_number(tenant_id, doc_type_id, number).await?;
        let taken = holders
            .iter()
            .any(|(id, status)| *status == DocumentStatus::Active && Some(*id) != except);
        if taken {
            return Err(LedgerError::SequenceConflict {
                doc_type_id,
                number,
            });
        }
        Ok(())
    }

    /// Steps the counter back when the deleted document held the most recent number.
    ///
    /// Returns true if the counter moved. Any other gap is left in place.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn release_if_last<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        number: i64,
    ) -> Result<bool, LedgerError> {
        let Some(mut sequence) = tx.lock_sequence(tenant_id, doc_type_id).await? else {
            return Ok(false);
        };
        if sequence.current_number != number {
            return Ok(false);
        }
        sequence.current_number -= 1;
        tx.update_sequence(&sequence).await?;
        debug!(%doc_type_id, number, "released last document number");
        Ok(true)
    }

    /// Sets numbering mode and collaborator flags, leaving the counter untouched.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn configure<T: LedgerTx>(
        tx: &mut T,
        tenant_id: TenantId,
        doc_type_id: DocumentTypeId,
        settings: DocumentTypeSettings,
    ) -> Result<DocumentTypeSequence, LedgerError> {
        let mut sequence = Self::lock_or_init(tx, tenant_id, doc_type_id).await?;
        sequence.manual_numbering = settings.manual_numbering;
        sequence.inventory_effect = settings.inventory_effect;
        sequence.counterparty_ledger = settings.counterparty_ledger;
        tx.update_sequence(&sequence).await?;
        Ok(sequence)
    }
}
