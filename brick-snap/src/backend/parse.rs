//! Parsers for native tool output.
//!
//! Each function takes the captured stdout of one command shape so it can be
//! tested against literal output.

use crate::error::{Result, SnapshotError};

/// Trimmed first line of `stdout`, or `None` if it is empty.
fn first_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
}

/// `lvs --noheadings -o pool_lv <device>`: the thin pool name, if any.
///
/// A regular (thick) LV prints a blank line.
pub fn thin_pool(stdout: &str) -> Option<String> {
    first_line(stdout).map(str::to_string)
}

/// `lvs --noheadings -o vg_name <device>`: the volume group name.
pub fn volume_group(stdout: &str) -> Result<String> {
    first_line(stdout)
        .map(str::to_string)
        .ok_or_else(|| SnapshotError::parse("lvs", "empty volume group name"))
}

/// `zfs list -Ho name <device>`: the dataset name.
pub fn dataset_name(stdout: &str) -> Result<String> {
    first_line(stdout)
        .map(str::to_string)
        .ok_or_else(|| SnapshotError::parse("zfs list", "empty dataset name"))
}

/// Whether a `--help` text mentions `flag` on any line.
pub fn help_mentions(help: &str, flag: &str) -> bool {
    help.lines().any(|line| line.contains(flag))
}

/// One line of `lvs --noheadings -o vg_name,data_percent,lv_size --separator :`.
///
/// Trailing fields may be missing; whatever is present is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LvsDetails {
    pub vg_name: Option<String>,
    pub data_percent: Option<String>,
    pub lv_size: Option<String>,
}

impl LvsDetails {
    pub fn parse(line: &str) -> Self {
        let mut fields = line
            .trim_end_matches(['\n', '\r'])
            .split(':')
            .map(str::trim)
            .map(|field| (!field.is_empty()).then(|| field.to_string()));

        Self {
            vg_name: fields.next().flatten(),
            data_percent: fields.next().flatten(),
            lv_size: fields.next().flatten(),
        }
    }
}

/// Whether the comma separated `opts` contain the option `name`, either
/// bare or as `name=value`.
pub fn has_mount_option(opts: &str, name: &str) -> bool {
    opts.split(',')
        .map(str::trim)
        .any(|opt| opt == name || opt.split_once('=').is_some_and(|(key, _)| key == name))
}

/// Value of the `name=value` option in `opts`.
pub fn mount_option_value<'a>(opts: &'a str, name: &str) -> Option<&'a str> {
    opts.split(',').map(str::trim).find_map(|opt| {
        opt.split_once('=')
            .filter(|(key, _)| *key == name)
            .map(|(_, value)| value)
    })
}
