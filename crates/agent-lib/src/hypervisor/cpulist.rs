//! Kernel cpuset-list parsing and formatting
//!
//! cpuset interface files express core sets in list format ("0-2,5,7-8").
//! Pin masks are handled internally as boolean vectors indexed by core id,
//! so both directions are needed.

use crate::error::HypervisorError;

/// Parse a cpuset list string into a boolean mask of `host_cores` entries.
///
/// An empty string means no restriction, which maps to all cores allowed.
pub fn parse_cpu_list(list: &str, host_cores: usize) -> Result<Vec<bool>, HypervisorError> {
    let list = list.trim();
    if list.is_empty() {
        return Ok(vec![true; host_cores]);
    }

    let mut mask = vec![false; host_cores];
    for part in list.split(',') {
        let part = part.trim();
        let (start, end) = match part.split_once('-') {
            Some((a, b)) => (parse_core_id(a)?, parse_core_id(b)?),
            None => {
                let id = parse_core_id(part)?;
                (id, id)
            }
        };
        if start > end {
            return Err(HypervisorError::parse(
                "cpu list",
                format!("descending range '{part}'"),
            ));
        }
        for core in start..=end {
            if core >= host_cores {
                return Err(HypervisorError::CpuOutOfRange {
                    cpu: core,
                    host_cores,
                });
            }
            mask[core] = true;
        }
    }
    Ok(mask)
}

/// Format a boolean mask back into kernel list format.
///
/// Adjacent cores collapse into ranges; an all-false mask formats as the
/// empty string.
pub fn format_cpu_list(mask: &[bool]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut run_start: Option<usize> = None;

    for core in 0..=mask.len() {
        let set = core < mask.len() && mask[core];
        match (run_start, set) {
            (None, true) => run_start = Some(core),
            (Some(start), false) => {
                let end = core - 1;
                if start == end {
                    parts.push(start.to_string());
                } else {
                    parts.push(format!("{start}-{end}"));
                }
                run_start = None;
            }
            _ => {}
        }
    }
    parts.join(",")
}

fn parse_core_id(token: &str) -> Result<usize, HypervisorError> {
    token
        .trim()
        .parse()
        .map_err(|_| HypervisorError::parse("cpu list", format!("bad core id '{token}'")))
}
