use colored::*;
use procpanel::TreeNode;

pub fn print_forest(roots: &[TreeNode]) {
    for root in roots {
        println!("{} {}", root.record.pid.to_string().bold(), root.record.name);
        print_children(&root.children, "");
    }
}

fn print_children(children: &[TreeNode], prefix: &str) {
    for (idx, child) in children.iter().enumerate() {
        let last = idx + 1 == children.len();
        let branch = if last { "└─ " } else { "├─ " };
        println!(
            "{}{}{} {}",
            prefix,
            branch.dimmed(),
            child.record.pid,
            child.record.name
        );
        let next = format!("{prefix}{}", if last { "   " } else { "│  " });
        print_children(&child.children, &next);
    }
}
