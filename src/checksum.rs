//! Checksum algorithms selectable by the [ChecksumType] of a transaction.
//!
//! [RunningChecksum] accumulates a checksum while file data is being sent. The modular checksum
//! is offset based and can be fed in any order, the CRC variants must be fed in file order.
use crc::{Crc, Digest};
use spacepackets::cfdp::ChecksumType;

use crate::{CRC_32, CRC_32C};

static CRC_32_ALGO: Crc<u32> = CRC_32;
static CRC_32C_ALGO: Crc<u32> = CRC_32C;

/// Returns whether the engine can calculate checksums of the given type.
pub fn checksum_type_supported(checksum_type: ChecksumType) -> bool {
    matches!(
        checksum_type,
        ChecksumType::Modular
            | ChecksumType::Crc32
            | ChecksumType::Crc32C
            | ChecksumType::NullChecksum
    )
}

/// Resolves the raw checksum type field of a Metadata PDU to a supported [ChecksumType].
pub fn supported_checksum_type(raw: u8) -> Option<ChecksumType> {
    ChecksumType::try_from(raw)
        .ok()
        .filter(|checksum_type| checksum_type_supported(*checksum_type))
}

#[derive(Clone)]
enum Accumulator {
    Modular(u32),
    Crc(Digest<'static, u32>),
    Null,
}

#[derive(Clone)]
pub struct RunningChecksum {
    checksum_type: ChecksumType,
    acc: Accumulator,
}

impl core::fmt::Debug for RunningChecksum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunningChecksum")
            .field("checksum_type", &self.checksum_type)
            .field("value", &self.value())
            .finish()
    }
}

impl RunningChecksum {
    /// Returns [None] for unsupported checksum types.
    pub fn new(checksum_type: ChecksumType) -> Option<Self> {
        let acc = match checksum_type {
            ChecksumType::Modular => Accumulator::Modular(0),
            ChecksumType::Crc32 => Accumulator::Crc(CRC_32_ALGO.digest()),
            ChecksumType::Crc32C => Accumulator::Crc(CRC_32C_ALGO.digest()),
            ChecksumType::NullChecksum => Accumulator::Null,
            _ => return None,
        };
        Some(Self { checksum_type, acc })
    }

    /// Falls back to the null checksum for unsupported checksum types.
    pub fn new_or_null(checksum_type: ChecksumType) -> Self {
        Self::new(checksum_type).unwrap_or(Self {
            checksum_type: ChecksumType::NullChecksum,
            acc: Accumulator::Null,
        })
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    pub fn update(&mut self, offset: u64, data: &[u8]) {
        match &mut self.acc {
            Accumulator::Modular(sum) => {
                for (idx, byte) in data.iter().enumerate() {
                    let pos = (offset + idx as u64) % 4;
                    *sum = sum.wrapping_add((*byte as u32) << (8 * (3 - pos)));
                }
            }
            Accumulator::Crc(digest) => digest.update(data),
            Accumulator::Null => (),
        }
    }

    pub fn value(&self) -> u32 {
        match &self.acc {
            Accumulator::Modular(sum) => *sum,
            Accumulator::Crc(digest) => digest.clone().finalize(),
            Accumulator::Null => 0,
        }
    }
}
