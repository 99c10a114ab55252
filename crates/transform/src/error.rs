//! Stable error classification for the transformer.
//!
//! Modeled on the host codebase's `ErrorMetadata` pattern: a small struct
//! carrying a machine-matchable code plus a human message, attached to an
//! [`anyhow::Error`] chain via `.context(..)`. Every fallible function in
//! this crate returns `anyhow::Result<T>`; callers that need to branch on
//! the error kind call [`TransformError::downcast`] on the returned error.

use std::borrow::Cow;

/// The stable error kinds from spec §7, in the same order as the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformErrorCode {
    SchemaMissing,
    UnknownRootClass,
    EndpointSelfReference,
    DanglingReference,
    DuplicateCodeSpec,
    SequenceOverflow,
    StatementFailure,
    TriggerRestoreFailure,
}

impl TransformErrorCode {
    /// Whether this kind is fatal to the whole transform by default. Only
    /// `DanglingReference` is conditionally non-fatal, governed by
    /// `DanglingReferencesBehavior`; `DuplicateCodeSpec` is never an error at
    /// all (reused silently) and is only classified here for completeness.
    pub fn is_fatal(self) -> bool {
        !matches!(self, TransformErrorCode::DuplicateCodeSpec)
    }
}

#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct TransformError {
    pub code: TransformErrorCode,
    /// Short, stable tag. Safe to match on in tests.
    pub short_msg: Cow<'static, str>,
    /// Developer-facing description.
    pub msg: Cow<'static, str>,
}

impl TransformError {
    pub fn new(
        code: TransformErrorCode,
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn schema_missing(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(TransformErrorCode::SchemaMissing, "SchemaMissing", msg)
    }

    pub fn unknown_root_class(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(TransformErrorCode::UnknownRootClass, "UnknownRootClass", msg)
    }

    pub fn endpoint_self_reference(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            TransformErrorCode::EndpointSelfReference,
            "EndpointSelfReference",
            msg,
        )
    }

    pub fn dangling_reference(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(TransformErrorCode::DanglingReference, "DanglingReference", msg)
    }

    pub fn sequence_overflow(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(TransformErrorCode::SequenceOverflow, "SequenceOverflow", msg)
    }

    pub fn statement_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(TransformErrorCode::StatementFailure, "StatementFailure", msg)
    }

    pub fn trigger_restore_failure(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::new(
            TransformErrorCode::TriggerRestoreFailure,
            "TriggerRestoreFailure",
            msg,
        )
    }

    /// Pull a `TransformError` back out of an `anyhow::Error` chain, if one
    /// was attached via `.context(..)`.
    pub fn downcast(err: &anyhow::Error) -> Option<&TransformError> {
        err.chain().find_map(|cause| cause.downcast_ref::<TransformError>())
    }
}

/// Every `rusqlite` failure is wrapped as a `StatementFailure` so callers
/// never need to match on the underlying driver's error type.
pub fn wrap_statement_error(err: rusqlite::Error, sql_desc: &str) -> anyhow::Error {
    anyhow::Error::new(err).context(TransformError::statement_failure(format!(
        "statement failed: {sql_desc}"
    )))
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    #[test]
    fn downcast_finds_context() {
        let base: anyhow::Result<()> = Err(anyhow::anyhow!("boom"));
        let wrapped = base
            .context(TransformError::dangling_reference("missing element 0x51"))
            .unwrap_err();
        let found = TransformError::downcast(&wrapped).expect("context attached");
        assert_eq!(found.code, TransformErrorCode::DanglingReference);
    }
}
