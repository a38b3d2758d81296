// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use crate::{
    api::read_u16,
    errors::{NtfsError, NtfsResult},
};

/// Verifies and undoes the update sequence protection of a FILE or INDX
/// record in place.
///
/// The first entry of the update sequence array is the sequence number every
/// protected block must end with; the following entries hold the original
/// trailing bytes of each block. Nothing is written unless every block
/// carries the sequence number.
pub fn apply_fixup(data: &mut [u8], stride: usize) -> NtfsResult<()> {
    let usa_offset = read_u16(data, 4).ok_or(NtfsError::BadRecordHeader {
        details: "record too short for an update sequence array",
    })? as usize;
    let usa_count = read_u16(data, 6).ok_or(NtfsError::BadRecordHeader {
        details: "record too short for an update sequence array",
    })? as usize;

    if usa_count == 0 || stride < 2 {
        return Err(NtfsError::BadRecordHeader {
            details: "empty update sequence array",
        });
    }
    if usa_offset + usa_count * 2 > data.len() {
        return Err(NtfsError::BadRecordHeader {
            details: "update sequence array outside record",
        });
    }
    if (usa_count - 1) * stride > data.len() {
        return Err(NtfsError::BadRecordHeader {
            details: "update sequence array covers more than the record",
        });
    }

    let expected = [data[usa_offset], data[usa_offset + 1]];

    for block in 1..usa_count {
        let tail = block * stride - 2;
        if data[tail..tail + 2] != expected {
            return Err(NtfsError::CorruptionError {
                details: format!(
                    "block {} ends with {:#06x}, expected {:#06x}",
                    block - 1,
                    u16::from_le_bytes([data[tail], data[tail + 1]]),
                    u16::from_le_bytes(expected)
                ),
            });
        }
    }

    for block in 1..usa_count {
        let tail = block * stride - 2;
        let saved = usa_offset + block * 2;
        data.copy_within(saved..saved + 2, tail);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Record of `size` bytes protected every `stride` bytes, USA at 0x30 with
    // sequence number 0x0007. Returns the original block tails.
    fn protect(size: usize, stride: usize) -> (Vec<u8>, Vec<[u8; 2]>) {
        let blocks = size / stride;
        let mut data: Vec<u8> = (0..size as u32).map(|i| (i % 200) as u8).collect();
        data[4..6].copy_from_slice(&0x30u16.to_le_bytes());
        data[6..8].copy_from_slice(&(blocks as u16 + 1).to_le_bytes());
        data[0x30..0x32].copy_from_slice(&7u16.to_le_bytes());

        let mut tails = Vec::new();
        for block in 1..=blocks {
            let tail = block * stride - 2;
            let saved = [data[tail], data[tail + 1]];
            data[0x30 + block * 2..0x32 + block * 2].copy_from_slice(&saved);
            data[tail..tail + 2].copy_from_slice(&7u16.to_le_bytes());
            tails.push(saved);
        }

        (data, tails)
    }

    fn protected_record() -> (Vec<u8>, [u8; 2], [u8; 2]) {
        let (data, tails) = protect(1024, 512);
        (data, tails[0], tails[1])
    }

    #[test]
    fn restores_trailing_bytes() {
        let (mut data, first, second) = protected_record();

        apply_fixup(&mut data, 512).unwrap();

        assert_eq!(data[510..512], first);
        assert_eq!(data[1022..1024], second);
    }

    #[test]
    fn mismatch_is_corruption_and_leaves_record_untouched() {
        let (mut data, _, _) = protected_record();
        data[1022] = 0x99;
        let before = data.clone();

        let result = apply_fixup(&mut data, 512);

        assert!(matches!(result, Err(NtfsError::CorruptionError { .. })));
        assert_eq!(data, before);
    }

    #[test]
    fn array_outside_record_is_a_bad_header() {
        let (mut data, _, _) = protected_record();
        data[4..6].copy_from_slice(&1020u16.to_le_bytes());
        assert!(matches!(
            apply_fixup(&mut data, 512),
            Err(NtfsError::BadRecordHeader { .. })
        ));

        let (mut data, _, _) = protected_record();
        data[6..8].copy_from_slice(&4u16.to_le_bytes());
        assert!(matches!(
            apply_fixup(&mut data, 512),
            Err(NtfsError::BadRecordHeader { .. })
        ));
    }

    #[test]
    fn single_entry_array_protects_nothing() {
        let (mut data, _, _) = protected_record();
        data[6..8].copy_from_slice(&1u16.to_le_bytes());
        let before = data.clone();

        apply_fixup(&mut data, 512).unwrap();
        assert_eq!(data, before);
    }

    #[test]
    fn large_record_with_eight_blocks() {
        let (mut data, tails) = protect(4096, 512);
        assert_eq!(read_u16(&data, 6), Some(9));

        apply_fixup(&mut data, 512).unwrap();

        for (i, saved) in tails.iter().enumerate() {
            let tail = (i + 1) * 512 - 2;
            assert_eq!(&data[tail..tail + 2], saved, "block {}", i);
        }
    }

    #[test]
    fn large_record_with_a_bad_last_block_is_untouched() {
        let (mut data, _) = protect(4096, 512);
        data[4094] ^= 0xFF;
        let before = data.clone();

        let result = apply_fixup(&mut data, 512);

        assert!(matches!(result, Err(NtfsError::CorruptionError { .. })));
        assert_eq!(data, before);
    }

    #[test]
    fn record_on_large_sectors() {
        let (mut data, tails) = protect(8192, 4096);

        apply_fixup(&mut data, 4096).unwrap();

        assert_eq!(data[4094..4096], tails[0]);
        assert_eq!(data[8190..8192], tails[1]);
        // The 512 byte boundaries are ordinary data with this stride.
        assert_eq!(data[510], (510 % 200) as u8);
    }
}
