//! Progress display module
//!
//! Renders engine snapshots in the terminal. The display never talks to
//! torrents directly; it only formats what a snapshot reports.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::download::TorrentState;
use crate::stats::{EngineSnapshot, PortMappingStatus, TorrentSnapshot};

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed to human readable string
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec as u64))
}

/// Format duration to human readable string
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Calculate ETA based on download speed and remaining bytes
pub fn calculate_eta(done: u64, total: u64, speed: f64) -> Option<Duration> {
    if speed <= 0.0 || done >= total {
        return None;
    }

    let remaining = total.saturating_sub(done) as f64;
    Some(Duration::from_secs_f64(remaining / speed))
}

fn state_label(state: TorrentState) -> &'static str {
    match state {
        TorrentState::Stopped => "stopped",
        TorrentState::Hashing => "hashing",
        TorrentState::Downloading => "downloading",
        TorrentState::Seeding => "seeding",
        TorrentState::Error => "error",
    }
}

fn progress_bar(progress: f64, width: usize) -> String {
    let filled = ((progress.clamp(0.0, 1.0) * width as f64) as usize).min(width);
    "=".repeat(filled) + &" ".repeat(width - filled)
}

/// One line per torrent
pub fn render_torrent(torrent: &TorrentSnapshot) -> String {
    let mut line = format!(
        "{} [{}] {:.1}% {} | {} / {} | ↓ {} | ↑ {} | Peers: {}",
        torrent.name,
        progress_bar(torrent.progress, 30),
        torrent.progress * 100.0,
        state_label(torrent.state),
        format_bytes(torrent.verified_bytes),
        format_bytes(torrent.total_size),
        format_speed(torrent.download_rate),
        format_speed(torrent.upload_rate),
        torrent.peers.len(),
    );

    match torrent.state {
        TorrentState::Downloading => {
            let eta = calculate_eta(torrent.verified_bytes, torrent.total_size, torrent.download_rate)
                .map(format_duration)
                .unwrap_or_else(|| "∞".to_string());
            line.push_str(&format!(" | ETA: {}", eta));
            if torrent.endgame {
                line.push_str(" | endgame");
            }
        }
        TorrentState::Error => {
            line.push_str(&format!(" | {}", torrent.error.as_deref().unwrap_or("unknown error")));
        }
        _ => {}
    }
    line
}

/// Summary line, then each torrent with its recent events indented below
pub fn render_engine(snapshot: &EngineSnapshot) -> String {
    let port = match (snapshot.listen_port, &snapshot.port_mapping) {
        (None, _) => "not listening".to_string(),
        (Some(port), PortMappingStatus::Succeeded { external_port }) => format!("port {} (mapped {})", port, external_port),
        (Some(port), _) => format!("port {}", port),
    };

    let mut out = format!(
        "↓ {} | ↑ {} | Connections: {}/{} | Disk r {} w {} | Cache {} / {} | {}",
        format_speed(snapshot.download_rate),
        format_speed(snapshot.upload_rate),
        snapshot.open_connections,
        snapshot.max_connections,
        format_speed(snapshot.disk_read_rate),
        format_speed(snapshot.disk_write_rate),
        format_bytes(snapshot.cache_used as u64),
        format_bytes(snapshot.cache_capacity as u64),
        port,
    );
    for torrent in &snapshot.torrents {
        out.push('\n');
        out.push_str(&render_torrent(torrent));
        for event in &torrent.recent_events {
            out.push_str("\n    ");
            out.push_str(event);
        }
    }
    out
}

/// Progress display for CLI
pub struct ProgressDisplay {
    start_time: Instant,
    /// Quiet mode (no progress output)
    quiet: bool,
    /// Lines printed by the previous update, overwritten by the next one
    prev_lines: usize,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
            prev_lines: 0,
        }
    }

    /// Redraw the progress block in place
    pub fn update(&mut self, snapshot: &EngineSnapshot) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let text = render_engine(snapshot);
        let mut stdout = io::stdout().lock();
        if self.prev_lines > 0 {
            write!(stdout, "\x1b[{}F", self.prev_lines)?;
        }
        for line in text.lines() {
            writeln!(stdout, "\x1b[2K{}", line)?;
        }
        self.prev_lines = text.lines().count();
        stdout.flush()
    }

    /// Print the final totals
    pub fn print_summary(&self, snapshot: &EngineSnapshot) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let mut stdout = io::stdout().lock();
        writeln!(stdout)?;
        writeln!(stdout, "Session Summary:")?;
        for torrent in &snapshot.torrents {
            writeln!(
                stdout,
                "  {}: {} ({:.1}%), downloaded {}, uploaded {}",
                torrent.name,
                state_label(torrent.state),
                torrent.progress * 100.0,
                format_bytes(torrent.downloaded),
                format_bytes(torrent.uploaded),
            )?;
        }
        writeln!(stdout, "  Elapsed Time: {}", format_duration(self.elapsed()))?;
        stdout.flush()
    }

    /// Get the elapsed time since start
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
