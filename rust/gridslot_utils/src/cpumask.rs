// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A fixed-width core bitset used for every placement decision in the
//! governor.
//!
//! Cpumask
//! -------
//!
//! A Cpumask is a BitVec of u64's whose width is fixed when the mask is
//! created, normally to the number of possible CPU ids on the host. Every
//! operation between two masks is performed over the width of the left hand
//! side, so masks derived from the same topology can be freely combined.
//!
//!```
//!     use gridslot_utils::Cpumask;
//!     let mut mask = Cpumask::new(8);
//!     mask.set_cpu(0).unwrap();
//!     mask.set_cpu(1).unwrap();
//!     mask.set_cpu(2).unwrap();
//!     mask.set_cpu(6).unwrap();
//!     assert_eq!(mask.weight(), 4);
//!     assert_eq!(mask.to_cpulist(), "0-2,6");
//!     assert_eq!(mask.to_core_list(), "0,1,2,6");
//!```
//!
//! Masks can also be parsed from the kernel's cpulist format ("0-3,8,10-11")
//! or from a hexadecimal string, with "none" and "all" as special values.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("Invalid CPU {} passed, max {}", cpu, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty Cpumask spanning @nr_cpus CPU ids.
    pub fn new(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpus],
        }
    }

    /// Build a Cpumask with every one of its @nr_cpus bits set.
    pub fn full(nr_cpus: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; nr_cpus],
        }
    }

    /// Build a Cpumask object from a hexadecimal string.
    pub fn from_str(cpumask: &str, nr_cpus: usize) -> Result<Cpumask> {
        match cpumask {
            "none" => return Ok(Self::new(nr_cpus)),
            "all" => return Ok(Self::full(nr_cpus)),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace(['_', ','], "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Self::new(nr_cpus);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let cpu = index * 8 + lsb;
                if cpu >= nr_cpus {
                    bail!(
                        concat!(
                            "Found cpu ({}) in cpumask ({}) which is larger",
                            " than the number of cpus on the machine ({})"
                        ),
                        cpu,
                        cpumask,
                        nr_cpus
                    );
                }
                mask.mask.set(cpu, true);
            }
        }

        Ok(mask)
    }

    /// Build a Cpumask from a kernel cpulist such as "0-3,8,10-11". An empty
    /// list yields an empty mask.
    pub fn from_cpulist(cpulist: &str, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    /// Build a Cpumask from an iterator of CPU ids.
    pub fn from_cpus<I: IntoIterator<Item = usize>>(cpus: I, nr_cpus: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpus);
        for cpu in cpus {
            mask.set_cpu(cpu)?;
        }
        Ok(mask)
    }

    /// Return a slice of u64's whose bits reflect the Cpumask.
    pub fn as_raw_slice(&self) -> &[u64] {
        self.mask.as_raw_slice()
    }

    /// Set all bits in the Cpumask to 1
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Returns an error if the specified CPU exceeds
    /// the size of the Cpumask.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit from the Cpumask. Returns an error if the specified CPU
    /// exceeds the size of the Cpumask.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set in the Cpumask. If the CPU
    /// exceeds the width of the mask, false is returned.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set in the Cpumask.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if the Cpumask has no bit set, false otherwise.
    pub fn is_empty(&self) -> bool {
        self.mask.not_any()
    }

    /// The width of the cpumask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    fn resized(&self, other: &Cpumask) -> BitVec<u64, Lsb0> {
        let mut bits = other.mask.clone();
        bits.resize(self.mask.len(), false);
        bits
    }

    /// Create a Cpumask that is the negation of the current Cpumask.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Create a Cpumask that is the AND of the current Cpumask and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= self.resized(other);
        new
    }

    /// Create a Cpumask that is the OR of the current Cpumask and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= self.resized(other);
        new
    }

    /// Create a Cpumask with the bits of @other removed from the current one.
    pub fn and_not(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= !self.resized(other);
        new
    }

    /// Whether the two masks share at least one bit.
    pub fn intersects(&self, other: &Cpumask) -> bool {
        !self.and(other).is_empty()
    }

    /// Whether every bit of @other is also set in this mask.
    pub fn contains(&self, other: &Cpumask) -> bool {
        other.and_not(self).is_empty()
    }

    /// Build a mask holding the @count lowest set bits of this mask, or None
    /// if fewer than @count bits are set.
    pub fn first_n(&self, count: usize) -> Option<Cpumask> {
        if self.weight() < count {
            return None;
        }
        let mut picked = Cpumask::new(self.len());
        for cpu in self.iter().take(count) {
            picked.mask.set(cpu, true);
        }
        Some(picked)
    }

    /// Iterate over each element of a Cpumask, and return the indices with bits
    /// set.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    /// Comma separated list of every set CPU id ("0,1,2,6"), the format handed
    /// to payload launchers and affinity tooling.
    pub fn to_core_list(&self) -> String {
        self.iter()
            .map(|cpu| cpu.to_string())
            .collect::<Vec<String>>()
            .join(",")
    }

    /// Compressed kernel cpulist ("0-2,6").
    pub fn to_cpulist(&self) -> String {
        let mut groups = Vec::new();
        let mut range: Option<(usize, usize)> = None;
        for cpu in self.iter() {
            range = match range {
                Some((start, end)) if end + 1 == cpu => Some((start, cpu)),
                Some(prev) => {
                    groups.push(prev);
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(last) = range {
            groups.push(last);
        }

        groups
            .iter()
            .map(|&(start, end)| {
                if start == end {
                    format!("{start}")
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect::<Vec<String>>()
            .join(",")
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.mask.len().div_ceil(32).max(1));

        // Print the highest 32bit. Trim digits beyond the mask width.
        let width = match self.mask.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        let top = masks.pop().unwrap_or(0);
        match case {
            'X' => write!(f, "{:0width$X}", top, width = width)?,
            _ => write!(f, "{:0width$x}", top, width = width)?,
        }

        // The rest in descending order.
        for submask in masks.iter().rev() {
            match case {
                'X' => write!(f, ",{submask:08X}")?,
                _ => write!(f, ",{submask:08x}")?,
            }
        }
        Ok(())
    }
}

/// Parse a kernel cpulist ("0-3,8,10-11") into the list of CPU ids it names.
pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0').trim();
    let mut cpu_ids = vec![];
    if cpulist.is_empty() {
        return Ok(cpu_ids);
    }
    for group in cpulist.split(',') {
        let (min, max) = parse_cpulist_group(group)?;
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

/// Parse a single "a-b" or "a" element of a cpulist.
pub fn parse_cpulist_group(group: &str) -> Result<(usize, usize)> {
    let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
        Ok((x, y)) => (x, y),
        Err(_) => match sscanf!(group.trim(), "{usize}") {
            Ok(x) => (x, x),
            Err(_) => {
                bail!("Failed to parse cpulist {}", group.trim());
            }
        },
    };
    if min > max {
        bail!("Invalid cpulist range {}", group.trim());
    }
    Ok((min, max))
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for Cpumask {
    fn bitand_assign(&mut self, rhs: &Self) {
        let bits = self.resized(rhs);
        self.mask &= bits;
    }
}

impl BitOrAssign<&Self> for Cpumask {
    fn bitor_assign(&mut self, rhs: &Self) {
        let bits = self.resized(rhs);
        self.mask |= bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpulist_round_trip_formats() {
        let mask = Cpumask::from_cpulist("0-2,4,6-7", 8).unwrap();
        assert_eq!(mask.weight(), 6);
        assert_eq!(mask.to_cpulist(), "0-2,4,6-7");
        assert_eq!(mask.to_core_list(), "0,1,2,4,6,7");
    }

    #[test]
    fn test_cpulist_out_of_range() {
        assert!(Cpumask::from_cpulist("0-8", 8).is_err());
        assert!(read_cpulist("3-1").is_err());
        assert!(read_cpulist("a-b").is_err());
    }

    #[test]
    fn test_empty_cpulist() {
        let mask = Cpumask::from_cpulist("", 4).unwrap();
        assert!(mask.is_empty());
        assert_eq!(mask.to_cpulist(), "");
    }

    #[test]
    fn test_hex_parsing() {
        let mask = Cpumask::from_str("0xf0", 8).unwrap();
        assert_eq!(mask.to_cpulist(), "4-7");
        assert!(Cpumask::from_str("0x100", 8).is_err());
        assert!(Cpumask::from_str("all", 8).unwrap().weight() == 8);
        assert!(Cpumask::from_str("none", 8).unwrap().is_empty());
    }

    #[test]
    fn test_set_operations() {
        let a = Cpumask::from_cpulist("0-3", 8).unwrap();
        let b = Cpumask::from_cpulist("2-5", 8).unwrap();
        assert_eq!(a.and(&b).to_cpulist(), "2-3");
        assert_eq!(a.or(&b).to_cpulist(), "0-5");
        assert_eq!(a.and_not(&b).to_cpulist(), "0-1");
        assert!(a.intersects(&b));
        assert!(a.or(&b).contains(&a));
        assert!(!a.contains(&b));
        assert_eq!(a.not().to_cpulist(), "4-7");
    }

    #[test]
    fn test_first_n() {
        let mask = Cpumask::from_cpulist("1,3,5,7", 8).unwrap();
        assert_eq!(mask.first_n(2).unwrap().to_cpulist(), "1,3");
        assert!(mask.first_n(5).is_none());
        assert!(mask.first_n(0).unwrap().is_empty());
    }

    #[test]
    fn test_display_hex() {
        let mask = Cpumask::from_cpulist("0-3", 8).unwrap();
        assert_eq!(format!("{}", mask), "0f");
        let wide = Cpumask::from_cpulist("0,32", 40).unwrap();
        assert_eq!(format!("{:x}", wide), "01,00000001");
    }
}
