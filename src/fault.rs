//! Fault handler configuration and the result of a declared fault.
use hashbrown::HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::FaultHandlerCode;

use crate::ConditionCode;

/// Maps fault condition codes to the action which is taken when the fault is declared.
///
/// Condition codes without an explicit entry resolve to [FaultHandlerCode::NoticeOfCancellation].
/// The map is seeded from the local entity configuration and copied into every transaction, where
/// it can be overridden by the put request and by the options of a received Metadata PDU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FaultHandlerMap {
    handlers: HashMap<ConditionCode, FaultHandlerCode>,
}

impl FaultHandlerMap {
    pub fn with_handler(mut self, code: ConditionCode, action: FaultHandlerCode) -> Self {
        self.set(code, action);
        self
    }

    /// Returns [false] if the condition code is not a fault. The last call for a condition code
    /// wins.
    pub fn set(&mut self, code: ConditionCode, action: FaultHandlerCode) -> bool {
        if !code.is_fault() {
            return false;
        }
        self.handlers.insert(code, action);
        true
    }

    pub fn get(&self, code: ConditionCode) -> FaultHandlerCode {
        self.handlers
            .get(&code)
            .copied()
            .unwrap_or(FaultHandlerCode::NoticeOfCancellation)
    }

    pub fn apply_overrides<'a>(
        &mut self,
        overrides: impl IntoIterator<Item = &'a (ConditionCode, FaultHandlerCode)>,
    ) {
        for (code, action) in overrides {
            if !self.set(*code, *action) {
                log::warn!("ignoring fault handler override for non-fault {:?}", code);
            }
        }
    }
}

/// A declared fault which stops the procedure that detected it. The transaction executes the
/// carried action once the procedure has unwound.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Notice of suspension. Never raised by unacknowledged transactions at the receiving entity,
    /// which can not be suspended.
    Suspension(ConditionCode),
    Cancellation(ConditionCode),
    Abandonment(ConditionCode),
}

impl FaultOutcome {
    pub fn condition_code(&self) -> ConditionCode {
        match self {
            FaultOutcome::Suspension(code) => *code,
            FaultOutcome::Cancellation(code) => *code,
            FaultOutcome::Abandonment(code) => *code,
        }
    }
}

/// Result of every multi-step protocol procedure.
pub type Flow = core::ops::ControlFlow<FaultOutcome>;
