//! Strongly typed, ordered installer flags.
//!
//! Flag values are collected per name and serialized once, at the
//! orchestrator boundary. Emission order matters: the installer treats the
//! first `--disk` as the primary boot disk, so values come out in exactly
//! the order they were composed.

use std::path::PathBuf;

/// Ordered mapping of flag name to one or more values. An empty value
/// serializes as a bare `--flag`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstallFlagSet {
    entries: Vec<(String, Vec<String>)>,
}

impl InstallFlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the values of `flag`, keeping its original position if it
    /// was already set.
    pub fn set(&mut self, flag: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| name == flag) {
            Some((_, values)) => *values = vec![value],
            None => self.entries.push((flag.to_string(), vec![value])),
        }
    }

    /// Append a value under `flag`, creating the entry at the end if it
    /// does not exist yet.
    pub fn push(&mut self, flag: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| name == flag) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((flag.to_string(), vec![value])),
        }
    }

    pub fn get(&self, flag: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(name, _)| name == flag)
            .map(|(_, values)| values.as_slice())
    }

    /// Serialize to command-line arguments, preserving insertion order and
    /// per-flag value order.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, values) in &self.entries {
            for value in values {
                args.push(format!("--{flag}"));
                if !value.is_empty() {
                    args.push(value.clone());
                }
            }
        }
        args
    }
}

/// A composed virt-install invocation, ready for execution.
#[derive(Debug, Clone)]
pub struct VirtInstallPlan {
    /// Positional switches preceding the flag set.
    pub base_args: Vec<String>,
    pub flags: InstallFlagSet,
    /// Capture stdout to this file instead of installing directly
    /// (`--print-xml` runs).
    pub capture_xml_to: Option<PathBuf>,
    pub post: Option<PostInstall>,
}

/// Work that happens after virt-install exits.
#[derive(Debug, Clone)]
pub enum PostInstall {
    /// Patch the captured domain XML with an Ignition fw_cfg stanza, then
    /// define and start the domain.
    DefineWithIgnition {
        xml_path: PathBuf,
        ignition_path: PathBuf,
        vm_name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_preserves_insertion_order() {
        let mut flags = InstallFlagSet::new();
        flags.set("connect", "qemu:///system");
        flags.set("name", "db0.example.net");
        flags.set("ram", "2048");
        let args = flags.to_args();
        assert_eq!(
            args,
            vec!["--connect", "qemu:///system", "--name", "db0.example.net", "--ram", "2048"]
        );
    }

    #[test]
    fn repeated_values_emit_in_composed_order() {
        let mut flags = InstallFlagSet::new();
        flags.push("disk", "vol=vms/db0.example.net.qcow2,cache=none,bus=virtio");
        flags.push("disk", "/vms/db0.example.net-seed.img,cache=none,bus=virtio");
        let args = flags.to_args();
        assert_eq!(args[0], "--disk");
        assert!(args[1].starts_with("vol=vms/"));
        assert_eq!(args[2], "--disk");
        assert!(args[3].ends_with("-seed.img,cache=none,bus=virtio"));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut flags = InstallFlagSet::new();
        flags.set("disk", "first");
        flags.set("boot", "hd");
        flags.set("disk", "replaced");
        assert_eq!(flags.get("disk").unwrap(), &["replaced".to_string()]);
        // "disk" keeps its position ahead of "boot"
        assert_eq!(flags.to_args(), vec!["--disk", "replaced", "--boot", "hd"]);
    }

    #[test]
    fn empty_value_emits_bare_flag() {
        let mut flags = InstallFlagSet::new();
        flags.set("import", "");
        flags.set("print-xml", "");
        assert_eq!(flags.to_args(), vec!["--import", "--print-xml"]);
    }
}
