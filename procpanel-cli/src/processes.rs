use chrono::{DateTime, Local};
use colored::*;
use procpanel::{Page, ProcessDetail, ProcessRecord, ProcessStatus, SignalAck};

fn status_color(status: ProcessStatus) -> Color {
    match status {
        ProcessStatus::Running => Color::Green,
        ProcessStatus::Sleeping => Color::Blue,
        ProcessStatus::Stopped => Color::Yellow,
        ProcessStatus::Zombie => Color::Red,
        ProcessStatus::Unknown => Color::White,
    }
}

pub fn print_page(page: &Page) {
    println!(
        "{:<8} {:<8} {:<12} {:<9} {:>6} {:>9} {:<19} CMD",
        "PID", "PPID", "USER", "STATUS", "CPU%", "RSS", "STARTED"
    );

    for p in &page.items {
        println!(
            "{:<8} {:<8} {:<12} {} {:>6.1} {:>9} {:<19} {}",
            p.pid,
            format_ppid(p.parent_pid),
            truncate(p.username.as_deref().unwrap_or("-"), 12),
            format!("{:<9}", p.status).color(status_color(p.status)),
            p.cpu_percent,
            format_bytes(p.memory_bytes),
            format_start(p.start_time),
            display_command(p)
        );
    }

    let pages = page.total.div_ceil(page.limit.max(1)).max(1);
    println!(
        "{}",
        format!(
            "page {} of {} ({} matching)",
            page.page, pages, page.total
        )
        .dimmed()
    );
}

pub fn print_detail(detail: &ProcessDetail) {
    let r = &detail.record;
    println!("{} {}", "Process".bold(), r.pid.to_string().bold().cyan());
    field("Name", &r.name);
    field("Status", &r.status.to_string().color(status_color(r.status)).to_string());
    field("User", &format_owner(r));
    field("Parent", &format_relative(detail.parent.as_ref(), r.parent_pid));
    field("Started", &format_start(r.start_time));
    field("CPU%", &format!("{:.1}", r.cpu_percent));
    field("RSS", &format_bytes(r.memory_bytes));
    field("Virtual", &format_bytes(r.virtual_memory_bytes));
    field(
        "Disk I/O",
        &format!(
            "read {} / written {}",
            format_bytes(r.disk_read_bytes),
            format_bytes(r.disk_written_bytes)
        ),
    );
    let x = &detail.extras;
    field("Mem%", &format_opt(x.memory_percent.map(|p| format!("{p:.1}"))));
    field("Exe", r.exe.as_deref().unwrap_or("-"));
    field("Cwd", x.cwd.as_deref().unwrap_or("-"));
    field("Terminal", x.terminal.as_deref().unwrap_or("-"));
    field("Nice", &format_opt(x.nice));
    field("Threads", &format_opt(x.num_threads));
    field("Open fds", &format_opt(x.open_fds));
    field(
        "UIDs",
        &format_opt(x.uids.map(|u| format!("{} {} {} {}", u.real, u.effective, u.saved, u.filesystem))),
    );
    field(
        "GIDs",
        &format_opt(x.gids.map(|g| format!("{} {} {} {}", g.real, g.effective, g.saved, g.filesystem))),
    );
    field(
        "CPU time",
        &format_opt(x.cpu_times.map(|t| format!("user {:.2}s / system {:.2}s", t.user, t.system))),
    );
    field(
        "Command",
        &if x.command_line.is_empty() {
            display_command(r)
        } else {
            x.command_line.join(" ")
        },
    );
    field("Env vars", &x.environment.len().to_string());

    if !x.open_files.is_empty() {
        println!("{}", "Open files".bold());
        for path in &x.open_files {
            println!("  {path}");
        }
    }
    if !x.connections.is_empty() {
        println!("{}", "Connections".bold());
        for c in &x.connections {
            println!(
                "  {:<5} {:<24} {:<24} {}",
                c.protocol,
                c.local_address.to_string(),
                c.remote_address.to_string(),
                c.state
            );
        }
    }
    if !detail.children.is_empty() {
        println!("{}", "Children".bold());
        for child in &detail.children {
            println!("  {:<8} {}", child.pid, child.name);
        }
    }
    if !r.unknown_fields.is_empty() {
        let names: Vec<String> = r
            .unknown_fields
            .iter()
            .filter_map(|f| serde_json::to_value(f).ok())
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
        println!("{}", format!("unreadable: {}", names.join(", ")).yellow());
    }
}

pub fn print_ack(ack: &SignalAck) {
    println!(
        "{} {} -> {} ({})",
        "sent".green(),
        ack.signal,
        ack.pid,
        ack.name
    );
}

fn field(label: &str, value: &str) {
    println!("  {:<10} {}", format!("{label}:").dimmed(), value);
}

fn format_ppid(ppid: Option<u32>) -> String {
    ppid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
}

fn format_owner(r: &ProcessRecord) -> String {
    match (&r.username, r.uid) {
        (Some(name), Some(uid)) => format!("{name} ({uid})"),
        (Some(name), None) => name.clone(),
        _ => "-".to_string(),
    }
}

fn format_relative(parent: Option<&ProcessRecord>, ppid: Option<u32>) -> String {
    match (parent, ppid) {
        (Some(p), _) => format!("{} ({})", p.pid, p.name),
        (None, Some(ppid)) => ppid.to_string(),
        (None, None) => "-".to_string(),
    }
}

fn format_opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn display_command(r: &ProcessRecord) -> String {
    if r.command.is_empty() {
        format!("[{}]", r.name)
    } else {
        r.command.clone()
    }
}

pub fn format_start(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}~")
    }
}
