//! Parent/child forest over a snapshot.
//!
//! A record is a root when its parent is missing from the snapshot, is the
//! record itself, or when following parents leads back to the record. The
//! last case cannot happen on a consistent process table but a snapshot taken
//! during pid reuse can produce one; every member of such a cycle becomes a
//! root so the linking below is always acyclic.

use std::collections::HashMap;

use crate::types::{ProcessRecord, Snapshot, TreeNode};

struct Forest<'a> {
    records: &'a [ProcessRecord],
    roots: Vec<usize>,
    children: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    New,
    OnPath,
    Done,
}

impl<'a> Forest<'a> {
    fn new(snapshot: &'a Snapshot) -> Self {
        let records = snapshot.records();
        let index: HashMap<u32, usize> = records
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.pid, idx))
            .collect();

        let parent: Vec<Option<usize>> = records
            .iter()
            .map(|r| {
                r.parent_pid
                    .filter(|ppid| *ppid != r.pid)
                    .and_then(|ppid| index.get(&ppid).copied())
            })
            .collect();

        let mut is_root: Vec<bool> = parent.iter().map(Option::is_none).collect();
        let mut visit = vec![Visit::New; records.len()];
        let mut path = Vec::new();

        for start in 0..records.len() {
            if visit[start] != Visit::New {
                continue;
            }
            path.clear();
            let mut cur = start;
            loop {
                match visit[cur] {
                    Visit::Done => break,
                    Visit::OnPath => {
                        if let Some(pos) = path.iter().position(|&idx| idx == cur) {
                            for &member in &path[pos..] {
                                is_root[member] = true;
                            }
                        }
                        break;
                    }
                    Visit::New => {
                        visit[cur] = Visit::OnPath;
                        path.push(cur);
                        match parent[cur] {
                            Some(p) => cur = p,
                            None => break,
                        }
                    }
                }
            }
            for &idx in &path {
                visit[idx] = Visit::Done;
            }
        }

        let mut roots = Vec::new();
        let mut children = vec![Vec::new(); records.len()];
        // records are pid-ordered, so both lists come out ascending
        for (idx, parent) in parent.iter().enumerate() {
            match *parent {
                Some(p) if !is_root[idx] => children[p].push(idx),
                _ => roots.push(idx),
            }
        }

        Self {
            records,
            roots,
            children,
        }
    }

    fn node(&self, idx: usize, depth: usize) -> TreeNode {
        TreeNode {
            record: self.records[idx].clone(),
            depth,
            children: self.children[idx]
                .iter()
                .map(|&child| self.node(child, depth + 1))
                .collect(),
        }
    }
}

/// Root nodes in pid order; every record of the snapshot appears exactly once.
pub fn build(snapshot: &Snapshot) -> Vec<TreeNode> {
    let forest = Forest::new(snapshot);
    forest
        .roots
        .iter()
        .map(|&idx| forest.node(idx, 0))
        .collect()
}

/// The tree below `pid`, with `pid` at depth 0.
pub fn subtree(snapshot: &Snapshot, pid: u32) -> Option<TreeNode> {
    let idx = snapshot.records().iter().position(|r| r.pid == pid)?;
    Some(Forest::new(snapshot).node(idx, 0))
}
