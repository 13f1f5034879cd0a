//! Memory accounting for the run report.
//!
//! The heavy allocations live in the external remap/blend subprocesses, so
//! the interesting number is the resident set of this process plus its
//! whole subprocess subtree. Read straight from `/proc`; on platforms
//! without it the sampler reports zero rather than failing the stitch.

use std::path::Path;

fn rss_of(pid: u32) -> u64 {
	let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
		return 0;
	};
	for line in status.lines() {
		if let Some(rest) = line.strip_prefix("VmRSS:") {
			let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
			return kb * 1024;
		}
	}
	0
}

fn children_of(pid: u32) -> Vec<u32> {
	let mut children = Vec::new();
	let task_dir = format!("/proc/{pid}/task");
	let Ok(tasks) = std::fs::read_dir(&task_dir) else {
		return children;
	};
	for task in tasks.flatten() {
		let path = task.path().join("children");
		if let Ok(list) = std::fs::read_to_string(&path) {
			children.extend(list.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
		}
	}
	children
}

fn subtree_rss(pid: u32) -> u64 {
	let mut total = rss_of(pid);
	for child in children_of(pid) {
		total += subtree_rss(child);
	}
	total
}

/// Resident set of this process and every live descendant, in bytes.
pub fn self_subtree_rss() -> u64 {
	subtree_rss(std::process::id())
}

/// Whether `/proc` style sampling is available at all.
pub fn available() -> bool {
	Path::new("/proc/self/status").exists()
}
