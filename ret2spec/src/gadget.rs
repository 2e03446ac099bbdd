//! The secret-dependent access.

use crate::cache::force_read;
use crate::oracle::Oracle;

/// Reads one secret byte and touches the matching oracle slot.
///
/// This only ever runs speculatively: it sits behind a branch that is
/// architecturally never taken. It must not have any effect other than the
/// cache footprint of the oracle read.
#[derive(Clone, Copy)]
pub struct SecretAccess<'a> {
    oracle: &'a Oracle,
    secret: &'a [u8],
    offset: usize,
}
impl <'a> SecretAccess<'a> {
    pub fn new(oracle: &'a Oracle, secret: &'a [u8], offset: usize) -> Self {
        Self { oracle, secret, offset }
    }

    pub fn offset(&self) -> usize { self.offset }

    #[inline(always)]
    pub fn access(&self) {
        if let Some(&byte) = self.secret.get(self.offset) {
            unsafe { force_read(self.oracle.slot_ptr(byte)); }
        }
    }
}
