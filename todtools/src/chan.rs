//! Timing channel names and channel bitmasks
//!
//! Channels are named `C0` through `C9`; a trailing `M` marks a manual
//! channel and is ignored. In a mask, bit `n` is channel `n`.

use bit_iter::BitIter;

/// Number of timing channels on a device
pub const CHANNELS: u8 = 10;

/// Channel number for a channel name like `C1`, `c3` or `C2M`
pub fn chan2id(chan: &str) -> Option<u8> {
    let upper = chan.trim().to_ascii_uppercase();
    let stripped = upper.trim_end_matches('M').trim_start_matches('C');
    match stripped.parse::<u8>() {
        Ok(n) if n < CHANNELS => Some(n),
        _ => None,
    }
}

/// Channel name for a channel number, `C?` when out of range
pub fn id2chan(id: u8) -> String {
    if id < CHANNELS {
        format!("C{}", id)
    } else {
        String::from("C?")
    }
}

/// Mask with the bit of every timing channel in `chs` set
pub fn chans_to_mask(chs: &[u8]) -> u16 {
    chs.iter()
        .filter(|&&c| c < CHANNELS)
        .fold(0, |m, &c| m | 1 << c)
}

/// Timing channels set in `m`, lowest first
pub fn mask_to_chans(m: u16) -> Vec<u8> {
    BitIter::from(m)
        .map(|b| b as u8)
        .filter(|&c| c < CHANNELS)
        .collect()
}

/// Single channel updates on a channel mask
pub trait BitOps {
    fn set(&mut self, chan: usize);
    fn clear(&mut self, chan: usize);
    fn check(self, chan: usize) -> bool;
}

impl BitOps for u16 {
    #[inline]
    fn set(&mut self, chan: usize) {
        *self |= 1 << chan;
    }

    #[inline]
    fn clear(&mut self, chan: usize) {
        *self &= !(1 << chan);
    }

    #[inline]
    fn check(self, chan: usize) -> bool {
        self & (1 << chan) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_masks() {
        assert_eq!(0b01, chans_to_mask(&[0]));
        assert_eq!(0b10, chans_to_mask(&[1]));
        assert_eq!(0b11, chans_to_mask(&[0, 1]));
        assert_eq!(0x200, chans_to_mask(&[9]));
        assert_eq!(0, chans_to_mask(&[10, 15]));
    }

    #[test]
    fn masks_roundtrip_over_timing_channels() {
        for pat in 0..(1u16 << CHANNELS) {
            let chs = mask_to_chans(pat);
            assert!(chs.iter().all(|&c| c < CHANNELS));
            assert_eq!(pat, chans_to_mask(&chs));
        }
    }

    #[test]
    fn single_channel_updates() {
        let mut m: u16 = 0;
        m.set(3);
        m.set(0);
        assert_eq!(vec![0, 3], mask_to_chans(m));
        assert!(m.check(3));
        assert!(!m.check(1));
        m.clear(3);
        m.clear(5);
        assert_eq!(0b1, m);
        // channels beyond the device are dropped
        assert_eq!(vec![0], mask_to_chans(m | 1 << 12));
    }
}
