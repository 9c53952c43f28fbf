//! Target device name allocation per disk bus family

use crate::DeviceBus;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn target_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(hd|sd|vd)([a-z]+)$").expect("valid device regex"))
}

/// Hands out the next free target name for each bus.
///
/// Each bus keeps its own counter starting after the highest letter already
/// in use, so `vdb` being taken means the next virtio disk is `vdc`.
#[derive(Debug, Clone, Default)]
pub struct DeviceNameAllocator {
    next: HashMap<DeviceBus, usize>,
}

impl DeviceNameAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an allocator from the target names of existing disks
    pub fn from_targets<'a, I>(targets: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut allocator = Self::new();
        for target in targets {
            allocator.reserve(target);
        }
        allocator
    }

    /// Mark a target name as used. Names outside the known families are ignored.
    pub fn reserve(&mut self, target: &str) {
        let Some(caps) = target_regex().captures(target.trim()) else {
            return;
        };
        let bus = match &caps[1] {
            "hd" => DeviceBus::Ide,
            "sd" => DeviceBus::Scsi,
            _ => DeviceBus::Virtio,
        };
        let index = suffix_to_index(&caps[2]);
        let next = self.next.entry(bus).or_insert(0);
        if index + 1 > *next {
            *next = index + 1;
        }
    }

    /// Allocate the next target name on `bus`
    pub fn next(&mut self, bus: DeviceBus) -> String {
        let next = self.next.entry(bus).or_insert(0);
        let name = format!("{}{}", bus.device_prefix(), index_to_suffix(*next));
        *next += 1;
        name
    }
}

/// `a` -> 0, `z` -> 25, `aa` -> 26
fn suffix_to_index(suffix: &str) -> usize {
    let mut index = 0usize;
    for c in suffix.bytes() {
        index = index * 26 + (c - b'a') as usize + 1;
    }
    index - 1
}

fn index_to_suffix(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'a' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}
