// $UpCase table and filename collation

use std::cmp::Ordering;

pub const UPCASE_ENTRIES: usize = 0x10000;

/// Uppercase mapping for every UTF-16 code unit.
#[derive(Clone)]
pub struct UpcaseTable {
    table: Vec<u16>,
}

impl std::fmt::Debug for UpcaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpcaseTable").finish_non_exhaustive()
    }
}

impl UpcaseTable {
    /// Identity table.
    pub fn identity() -> Self {
        UpcaseTable {
            table: (0..UPCASE_ENTRIES).map(|i| i as u16).collect(),
        }
    }

    /// Identity overlaid with the little-endian entries in `data`.
    /// Returns the index of the first zero entry above 0 if there is one.
    pub fn from_le_bytes(data: &[u8]) -> Result<Self, usize> {
        let mut upcase = Self::identity();
        for (i, pair) in data.chunks_exact(2).take(UPCASE_ENTRIES).enumerate() {
            upcase.table[i] = u16::from_le_bytes([pair[0], pair[1]]);
        }
        match upcase.table.iter().skip(1).position(|&u| u == 0) {
            Some(pos) => Err(pos + 1),
            None => Ok(upcase),
        }
    }

    /// Simple ASCII-only table, handy for synthetic volumes.
    pub fn ascii() -> Self {
        let mut upcase = Self::identity();
        for c in b'a'..=b'z' {
            upcase.table[c as usize] = c.to_ascii_uppercase() as u16;
        }
        upcase
    }

    #[inline]
    pub fn upcase(&self, unit: u16) -> u16 {
        self.table[unit as usize]
    }

    /// Uppercase a name for lookups. Supplementary-plane characters are kept.
    pub fn upcase_str(&self, name: &str) -> Vec<u16> {
        name.encode_utf16().map(|u| self.upcase(u)).collect()
    }

    /// Collate an already uppercased `left` against an on-disk `right`.
    pub fn compare(&self, left: &[u16], right: &[u16]) -> Ordering {
        for (&l, &r) in left.iter().zip(right) {
            if l != r {
                let r = self.upcase(r);
                if l != r {
                    return l.cmp(&r);
                }
            }
        }
        left.len().cmp(&right.len())
    }

    /// Little-endian table image, as stored in the $UpCase data stream.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.table.iter().flat_map(|u| u.to_le_bytes()).collect()
    }
}
